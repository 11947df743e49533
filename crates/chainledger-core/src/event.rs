//! Event rows — raw logs as delivered by the source and their persisted form.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::source::SourceId;

// ─── RawLog ──────────────────────────────────────────────────────────────────

/// A raw log as returned by the raw log source for one scanned range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    /// Block containing the log.
    pub block_number: u64,
    /// Position of the log within its block.
    pub log_index: u64,
    /// Transaction that emitted the log.
    pub transaction_hash: String,
    /// Canonical identifier (hash) of the containing block as reported at
    /// fetch time. Recorded alongside the event for reorg detection.
    pub block_identifier: String,
    /// Indexed topics.
    pub topics: Vec<String>,
    /// Unindexed data payload.
    pub data: String,
}

impl RawLog {
    /// The raw payload as stored in [`IndexedEvent::event_data`].
    pub fn payload(&self) -> Value {
        json!({ "topics": self.topics, "data": self.data })
    }
}

// ─── PersistOutcome ──────────────────────────────────────────────────────────

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// First observation; a new row was stored.
    Inserted,
    /// Either uniqueness key already matched a stored row; nothing changed.
    Duplicate,
}

// ─── IndexedEvent ────────────────────────────────────────────────────────────

/// One stored row per observed log.
///
/// Identity is twofold — `(transaction_hash, log_index, event_type)` and
/// `(block_number, log_index)` — both scoped to the owning source stream.
/// Re-inserting under either key is a no-op, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedEvent {
    pub source: SourceId,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: String,
    /// Canonical block identifier at first observation.
    pub block_identifier: String,
    /// Raw payload (topics + data).
    pub event_data: Value,
    /// Decoded payload, produced by the source's applier.
    pub parsed_data: Value,
    /// Confirmation depth at the last finalization pass. Derived from the
    /// chain head, not ground truth.
    pub confirmations: u64,
    pub is_finalized: bool,
    pub is_processed: bool,
    /// Last apply failure, if any.
    pub processing_error: Option<String>,
    pub retry_attempts: u32,
    /// Unix timestamp of first observation.
    pub observed_at: i64,
    /// Unix timestamp of the successful apply.
    pub processed_at: Option<i64>,
}

impl IndexedEvent {
    /// Build the row for a log's first observation.
    pub fn from_raw(source: &SourceId, raw: &RawLog, parsed_data: Value) -> Self {
        Self {
            source: source.clone(),
            block_number: raw.block_number,
            log_index: raw.log_index,
            transaction_hash: raw.transaction_hash.clone(),
            block_identifier: raw.block_identifier.clone(),
            event_data: raw.payload(),
            parsed_data,
            confirmations: 0,
            is_finalized: false,
            is_processed: false,
            processing_error: None,
            retry_attempts: 0,
            observed_at: Utc::now().timestamp(),
            processed_at: None,
        }
    }

    /// Ordering key within a stream.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
