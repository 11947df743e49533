//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Errors that can occur while ingesting, reconciling, or applying events.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Apply error for '{event_type}': {reason}")]
    Apply { event_type: String, reason: String },

    #[error("No applier registered for event type '{0}'")]
    MissingApplier(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Source {0} has a cycle in flight")]
    SourceBusy(String),

    #[error("Invalid status transition for {src}: expected {expected}, found {found}")]
    InvalidTransition {
        src: String,
        expected: String,
        found: String,
    },

    #[error("Cursor invariant violated for {src}: {reason}")]
    InvariantViolation { src: String, reason: String },

    #[error("Refusing to roll back to block {requested}: history is finalized through block {finalized}")]
    FinalizedRollback { requested: u64, finalized: u64 },

    #[error("{0}")]
    Other(String),
}

impl IngestError {
    /// Returns `true` if retrying the same call may succeed (transient I/O).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}
