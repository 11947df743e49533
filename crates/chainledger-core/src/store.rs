//! Storage traits — durable state rows and idempotent event rows — plus the
//! in-memory backend used by tests and ephemeral pipelines.
//!
//! Durable backends (`SqliteStorage`, `PostgresStorage`) live in
//! `chainledger-storage` and implement the same two traits.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::error::IngestError;
use crate::event::{IndexedEvent, PersistOutcome};
use crate::source::SourceId;
use crate::state::{IndexingState, SourceStatus};

// ─── StateStore ──────────────────────────────────────────────────────────────

/// Durable store for per-source indexing state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state row for a source, `None` if never registered.
    async fn load(&self, source: &SourceId) -> Result<Option<IndexingState>, IngestError>;

    /// Upsert the full state row, keyed by `state.source`.
    async fn save(&self, state: &IndexingState) -> Result<(), IngestError>;

    /// Atomically move `source` from `from` to `to`.
    ///
    /// Returns `false` if the stored status was not `from` — some other cycle
    /// (or an operator action) holds the source. This is the test-and-set
    /// underpinning per-source mutual exclusion.
    async fn transition(
        &self,
        source: &SourceId,
        from: SourceStatus,
        to: SourceStatus,
    ) -> Result<bool, IngestError>;

    /// Delete the state row (resetting an indexer).
    async fn delete(&self, source: &SourceId) -> Result<(), IngestError>;
}

// ─── EventStore ──────────────────────────────────────────────────────────────

/// Durable, uniquely-keyed store for observed events.
///
/// This is the idempotency boundary: replays, retried RPC calls, and
/// restart-induced re-scans land here and collapse into single rows.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Idempotent insert. If either uniqueness key —
    /// `(transaction_hash, log_index, event_type)` or
    /// `(block_number, log_index)`, both scoped to the source stream —
    /// already matches a stored row, returns [`PersistOutcome::Duplicate`]
    /// and leaves the existing row untouched.
    async fn persist(&self, event: &IndexedEvent) -> Result<PersistOutcome, IngestError>;

    /// Flip an event to finalized with its current confirmation depth.
    async fn mark_finalized(
        &self,
        source: &SourceId,
        block_number: u64,
        log_index: u64,
        confirmations: u64,
    ) -> Result<(), IngestError>;

    /// Flip an event to processed, stamping the apply time.
    async fn mark_processed(
        &self,
        source: &SourceId,
        block_number: u64,
        log_index: u64,
        processed_at: i64,
    ) -> Result<(), IngestError>;

    /// Record an apply failure; increments and returns `retry_attempts`.
    async fn record_failure(
        &self,
        source: &SourceId,
        block_number: u64,
        log_index: u64,
        message: &str,
    ) -> Result<u32, IngestError>;

    /// Unfinalized events at or below `max_block`, in `(block, log)` order.
    async fn unfinalized_at_or_below(
        &self,
        source: &SourceId,
        max_block: u64,
    ) -> Result<Vec<IndexedEvent>, IngestError>;

    /// Finalized, unprocessed events with retry budget remaining, in
    /// `(block, log)` order.
    async fn pending(
        &self,
        source: &SourceId,
        max_retry_attempts: u32,
    ) -> Result<Vec<IndexedEvent>, IngestError>;

    /// Lowest block containing any unprocessed event.
    async fn first_unprocessed_block(
        &self,
        source: &SourceId,
    ) -> Result<Option<u64>, IngestError>;

    /// Delete unfinalized events with `block_number ≥ from_block`; returns
    /// the number of rows removed. Finalized rows are never touched.
    async fn delete_unfinalized_from(
        &self,
        source: &SourceId,
        from_block: u64,
    ) -> Result<u64, IngestError>;

    /// Record the canonical identifier of a block whose logs were stored.
    /// Upsert; re-recording the same height overwrites.
    async fn record_block_identifier(
        &self,
        source: &SourceId,
        block_number: u64,
        identifier: &str,
    ) -> Result<(), IngestError>;

    /// Stored identifiers for heights in `[from_block, to_block]`, ascending.
    async fn block_identifiers_in(
        &self,
        source: &SourceId,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<(u64, String)>, IngestError>;

    /// Drop recorded identifiers at `block_number ≥ from_block`.
    async fn delete_block_identifiers_from(
        &self,
        source: &SourceId,
        from_block: u64,
    ) -> Result<(), IngestError>;

    /// Event rows currently stored for a source.
    async fn event_count(&self, source: &SourceId) -> Result<u64, IngestError>;
}

// ─── In-memory backend (tests / ephemeral pipelines) ─────────────────────────

#[derive(Default)]
struct StreamData {
    /// Rows keyed by `(block_number, log_index)` — iteration order is the
    /// processing order.
    events: BTreeMap<(u64, u64), IndexedEvent>,
    /// The transaction-scoped uniqueness key: `(transaction_hash, log_index)`
    /// (the event type is fixed per stream).
    tx_keys: HashSet<(String, u64)>,
    /// Canonical block identifiers recorded at first store.
    identifiers: BTreeMap<u64, String>,
}

/// In-memory store implementing both traits.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<SourceId, IndexingState>>,
    streams: Mutex<HashMap<SourceId, StreamData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stream<T>(
        &self,
        source: &SourceId,
        f: impl FnOnce(&mut StreamData) -> Result<T, IngestError>,
    ) -> Result<T, IngestError> {
        let mut streams = self.streams.lock().unwrap();
        f(streams.entry(source.clone()).or_default())
    }

    fn missing(source: &SourceId, block_number: u64, log_index: u64) -> IngestError {
        IngestError::Storage(format!(
            "no event at {block_number}/{log_index} for {source}"
        ))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, source: &SourceId) -> Result<Option<IndexingState>, IngestError> {
        Ok(self.states.lock().unwrap().get(source).cloned())
    }

    async fn save(&self, state: &IndexingState) -> Result<(), IngestError> {
        self.states
            .lock()
            .unwrap()
            .insert(state.source.clone(), state.clone());
        Ok(())
    }

    async fn transition(
        &self,
        source: &SourceId,
        from: SourceStatus,
        to: SourceStatus,
    ) -> Result<bool, IngestError> {
        let mut states = self.states.lock().unwrap();
        match states.get_mut(source) {
            Some(state) if state.status == from => {
                state.status = to;
                state.touch();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, source: &SourceId) -> Result<(), IngestError> {
        self.states.lock().unwrap().remove(source);
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn persist(&self, event: &IndexedEvent) -> Result<PersistOutcome, IngestError> {
        self.with_stream(&event.source, |data| {
            let position = event.position();
            let tx_key = (event.transaction_hash.clone(), event.log_index);
            if data.events.contains_key(&position) || data.tx_keys.contains(&tx_key) {
                return Ok(PersistOutcome::Duplicate);
            }
            data.tx_keys.insert(tx_key);
            data.events.insert(position, event.clone());
            Ok(PersistOutcome::Inserted)
        })
    }

    async fn mark_finalized(
        &self,
        source: &SourceId,
        block_number: u64,
        log_index: u64,
        confirmations: u64,
    ) -> Result<(), IngestError> {
        self.with_stream(source, |data| {
            let event = data
                .events
                .get_mut(&(block_number, log_index))
                .ok_or_else(|| Self::missing(source, block_number, log_index))?;
            event.confirmations = confirmations;
            event.is_finalized = true;
            Ok(())
        })
    }

    async fn mark_processed(
        &self,
        source: &SourceId,
        block_number: u64,
        log_index: u64,
        processed_at: i64,
    ) -> Result<(), IngestError> {
        self.with_stream(source, |data| {
            let event = data
                .events
                .get_mut(&(block_number, log_index))
                .ok_or_else(|| Self::missing(source, block_number, log_index))?;
            event.is_processed = true;
            event.processed_at = Some(processed_at);
            event.processing_error = None;
            Ok(())
        })
    }

    async fn record_failure(
        &self,
        source: &SourceId,
        block_number: u64,
        log_index: u64,
        message: &str,
    ) -> Result<u32, IngestError> {
        self.with_stream(source, |data| {
            let event = data
                .events
                .get_mut(&(block_number, log_index))
                .ok_or_else(|| Self::missing(source, block_number, log_index))?;
            event.retry_attempts += 1;
            event.processing_error = Some(message.to_string());
            Ok(event.retry_attempts)
        })
    }

    async fn unfinalized_at_or_below(
        &self,
        source: &SourceId,
        max_block: u64,
    ) -> Result<Vec<IndexedEvent>, IngestError> {
        self.with_stream(source, |data| {
            Ok(data
                .events
                .values()
                .filter(|e| !e.is_finalized && e.block_number <= max_block)
                .cloned()
                .collect())
        })
    }

    async fn pending(
        &self,
        source: &SourceId,
        max_retry_attempts: u32,
    ) -> Result<Vec<IndexedEvent>, IngestError> {
        self.with_stream(source, |data| {
            Ok(data
                .events
                .values()
                .filter(|e| e.is_finalized && !e.is_processed && e.retry_attempts < max_retry_attempts)
                .cloned()
                .collect())
        })
    }

    async fn first_unprocessed_block(
        &self,
        source: &SourceId,
    ) -> Result<Option<u64>, IngestError> {
        self.with_stream(source, |data| {
            Ok(data
                .events
                .values()
                .find(|e| !e.is_processed)
                .map(|e| e.block_number))
        })
    }

    async fn delete_unfinalized_from(
        &self,
        source: &SourceId,
        from_block: u64,
    ) -> Result<u64, IngestError> {
        self.with_stream(source, |data| {
            let doomed: Vec<((u64, u64), (String, u64))> = data
                .events
                .iter()
                .filter(|(position, e)| position.0 >= from_block && !e.is_finalized)
                .map(|(position, e)| (*position, (e.transaction_hash.clone(), e.log_index)))
                .collect();
            for (position, tx_key) in &doomed {
                data.events.remove(position);
                data.tx_keys.remove(tx_key);
            }
            Ok(doomed.len() as u64)
        })
    }

    async fn record_block_identifier(
        &self,
        source: &SourceId,
        block_number: u64,
        identifier: &str,
    ) -> Result<(), IngestError> {
        self.with_stream(source, |data| {
            data.identifiers.insert(block_number, identifier.to_string());
            Ok(())
        })
    }

    async fn block_identifiers_in(
        &self,
        source: &SourceId,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<(u64, String)>, IngestError> {
        self.with_stream(source, |data| {
            Ok(data
                .identifiers
                .range(from_block..=to_block)
                .map(|(number, id)| (*number, id.clone()))
                .collect())
        })
    }

    async fn delete_block_identifiers_from(
        &self,
        source: &SourceId,
        from_block: u64,
    ) -> Result<(), IngestError> {
        self.with_stream(source, |data| {
            data.identifiers.split_off(&from_block);
            Ok(())
        })
    }

    async fn event_count(&self, source: &SourceId) -> Result<u64, IngestError> {
        self.with_stream(source, |data| Ok(data.events.len() as u64))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
