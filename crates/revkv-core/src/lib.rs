// ABOUTME: Core data model for revkv, shared by the event log, the KV store, and dialects.
// ABOUTME: Defines key-value events, the raw row decode contract, errors, and the Dialect trait.

pub mod dialect;
pub mod error;
pub mod kv;
pub mod row;

pub use dialect::Dialect;
pub use error::Error;
pub use kv::{Event, KeyValue};
pub use row::{Row, rows_to_events};

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
