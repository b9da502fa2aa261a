//! Structured event log for memoization activity.
//!
//! Every component appends [`MemoEvent`] records with a monotonic sequence
//! number. The log is bounded: once full, the oldest records are dropped and
//! counted.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::scope::SiteId;

pub const COMPONENT_RESOLVER: &str = "resolver";
pub const COMPONENT_ANALYZER: &str = "capture_analyzer";
pub const COMPONENT_CACHE: &str = "ephemeron_cache";
pub const COMPONENT_REGISTRY: &str = "cache_registry";
pub const COMPONENT_HEAP: &str = "heap";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoEvent {
    pub seq: u64,
    pub trace_id: String,
    pub component: String,
    pub event: String,
    pub outcome: String,
    /// Stable error code, empty on success.
    pub error_code: String,
    pub site: Option<SiteId>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    trace_id: String,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
    events: VecDeque<MemoEvent>,
}

impl EventLog {
    pub fn new(trace_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            trace_id: trace_id.into(),
            capacity,
            next_seq: 0,
            dropped: 0,
            events: VecDeque::new(),
        }
    }

    pub fn emit(
        &mut self,
        component: &str,
        event: impl Into<String>,
        outcome: impl Into<String>,
        error_code: impl Into<String>,
        site: Option<SiteId>,
        detail: impl Into<String>,
    ) {
        let record = MemoEvent {
            seq: self.next_seq,
            trace_id: self.trace_id.clone(),
            component: component.to_string(),
            event: event.into(),
            outcome: outcome.into(),
            error_code: error_code.into(),
            site,
            detail: detail.into(),
        };
        self.next_seq = self.next_seq.saturating_add(1);
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(record);
    }

    /// Shorthand for a successful event.
    pub fn ok(&mut self, component: &str, event: &str, site: Option<SiteId>, detail: impl Into<String>) {
        self.emit(component, event, "ok", "", site, detail);
    }

    pub fn events(&self) -> impl Iterator<Item = &MemoEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn last(&self) -> Option<&MemoEvent> {
        self.events.back()
    }

    /// Events of one component and kind, oldest first.
    pub fn matching<'a>(&'a self, component: &'a str, event: &'a str) -> impl Iterator<Item = &'a MemoEvent> + 'a {
        self.events
            .iter()
            .filter(move |e| e.component == component && e.event == event)
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// One JSON object per line.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }
}
