//! Runtime configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    /// Trace id stamped on every event.
    pub trace_id: String,
    /// Record an event for every cache hit and miss.
    pub record_cache_events: bool,
    /// Maximum number of retained events.
    pub event_capacity: usize,
    /// Compact every cache after each collection.
    pub prune_after_collect: bool,
    /// Allocations since the last collection that make
    /// [`MemoConfig::should_collect`] true. Zero disables the check.
    pub collection_pressure_objects: u64,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            trace_id: "memo".to_string(),
            record_cache_events: true,
            event_capacity: 4096,
            prune_after_collect: true,
            collection_pressure_objects: 10_000,
        }
    }
}

impl MemoConfig {
    /// Configuration for tests and replay: fixed trace id, every event kept.
    pub fn deterministic() -> Self {
        Self {
            trace_id: "memo-deterministic".to_string(),
            record_cache_events: true,
            event_capacity: 65_536,
            prune_after_collect: true,
            collection_pressure_objects: 0,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|err| ConfigError::Parse {
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trace_id.trim().is_empty() {
            return Err(ConfigError::EmptyTraceId);
        }
        Ok(())
    }

    pub fn should_collect(&self, allocations_since_collect: u64) -> bool {
        self.collection_pressure_objects > 0
            && allocations_since_collect >= self.collection_pressure_objects
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("config parse error: {message}")]
    Parse { message: String },
    #[error("trace_id must not be empty")]
    EmptyTraceId,
}

impl ConfigError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "FE-MEMO-0801",
            Self::EmptyTraceId => "FE-MEMO-0802",
        }
    }
}
