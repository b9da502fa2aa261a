#![forbid(unsafe_code)]

//! Capture-keyed memoization of nested function definitions.
//!
//! A definition site annotated as memoized yields the same function
//! instance every time control reaches it with the same captured values.
//! Captures are computed statically by the [`analyzer`]; each reach builds a
//! [`key::KeyTuple`] and looks it up in the site's
//! [`cache::CompositeEphemeronCache`]. Object components of a key are held
//! weakly, so a cache entry never keeps its key objects (or the instance)
//! alive on its own.
//!
//! [`runtime::Runtime`] ties the pieces to a small evaluator for testing
//! and embedding.

pub mod analyzer;
pub mod ast;
pub mod cache;
pub mod config;
pub mod events;
pub mod heap;
pub mod key;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod scope;
pub mod value;

pub use analyzer::{AnalysisError, CaptureMode, CaptureSpec};
pub use cache::{CacheError, CompositeEphemeronCache};
pub use config::MemoConfig;
pub use heap::{EphemeronHost, GcObjectId, Heap};
pub use key::{KeyComponent, KeyTuple, build_key};
pub use registry::CacheRegistry;
pub use runtime::{MemoError, Runtime, RuntimeError};
pub use value::Value;
