//! Event processor — applies finalized events exactly once, in stream order.
//!
//! Exactly-once is the product of three local invariants: persistence is
//! idempotent (one row per event identity), an event is only applied while
//! `is_processed = false`, and the processed cursor only advances over a
//! contiguous prefix of applied events. Nothing here requires coordination
//! beyond the source's own cycle exclusivity.
//!
//! The apply / `mark_processed` pair is never interleaved with another cycle.
//! Across a process crash between the two steps the pair degrades to
//! at-least-once, so an applier that cannot share the event store's
//! transaction must be idempotent per event identity.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::apply::EventApplier;
use crate::error::IngestError;
use crate::state::IndexingState;
use crate::store::EventStore;

// ─── BatchOutcome ────────────────────────────────────────────────────────────

/// An event that ran out of retry budget.
#[derive(Debug, Clone)]
pub struct ExhaustedEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub error: String,
}

/// Result of one processing pass.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Highest block with every event at or below it applied — the value to
    /// commit, never the last attempted block.
    pub processed_through: u64,
    /// Events applied this pass.
    pub applied: u64,
    /// Events that failed this pass (and will be retried).
    pub failed: u64,
    /// Set when an event exhausted its retry budget; the source must
    /// fail-stop.
    pub exhausted: Option<ExhaustedEvent>,
}

// ─── EventProcessor ──────────────────────────────────────────────────────────

/// Applies pending events through the source's applier.
#[derive(Clone)]
pub struct EventProcessor {
    events: Arc<dyn EventStore>,
}

impl EventProcessor {
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self { events }
    }

    /// Apply every eligible event for `state.source` in
    /// `(block_number, log_index)` order.
    ///
    /// Eligible means finalized, unprocessed, and under the retry budget. A
    /// failing event is recorded and left unprocessed for the next pass;
    /// later events are still attempted, but `processed_through` never
    /// advances past the first gap. An event hitting its last allowed
    /// attempt stops the pass and is surfaced via `exhausted`.
    pub async fn process_batch(
        &self,
        applier: &dyn EventApplier,
        state: &IndexingState,
    ) -> Result<BatchOutcome, IngestError> {
        let source = &state.source;
        let pending = self
            .events
            .pending(source, state.max_retry_attempts)
            .await?;

        let mut applied = 0u64;
        let mut failed = 0u64;
        let mut exhausted = None;

        for event in &pending {
            match applier.apply(event).await {
                Ok(()) => {
                    self.events
                        .mark_processed(
                            source,
                            event.block_number,
                            event.log_index,
                            Utc::now().timestamp(),
                        )
                        .await?;
                    applied += 1;
                }
                Err(err) => {
                    let attempts = self
                        .events
                        .record_failure(
                            source,
                            event.block_number,
                            event.log_index,
                            &err.to_string(),
                        )
                        .await?;
                    failed += 1;
                    warn!(
                        source = %source,
                        block_number = event.block_number,
                        log_index = event.log_index,
                        attempts,
                        error = %err,
                        "Apply failed"
                    );
                    if attempts >= state.max_retry_attempts {
                        exhausted = Some(ExhaustedEvent {
                            block_number: event.block_number,
                            log_index: event.log_index,
                            error: err.to_string(),
                        });
                        break;
                    }
                }
            }
        }

        let processed_through = match self.events.first_unprocessed_block(source).await? {
            Some(gap) => gap.saturating_sub(1).max(state.last_processed_block),
            None => state.last_scanned_block,
        };

        if applied > 0 || failed > 0 {
            debug!(
                source = %source,
                applied,
                failed,
                processed_through,
                "Processing pass complete"
            );
        }
        Ok(BatchOutcome {
            processed_through,
            applied,
            failed,
            exhausted,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::EventApplier;
    use crate::event::{IndexedEvent, RawLog};
    use crate::source::SourceId;
    use crate::state::SourceConfig;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn source() -> SourceId {
        SourceId::new("ethereum", "0xa0b8", "Transfer")
    }

    /// Records apply order; fails every apply for positions in `poisoned`.
    #[derive(Default)]
    struct RecordingApplier {
        order: Mutex<Vec<(u64, u64)>>,
        poisoned: Mutex<HashSet<(u64, u64)>>,
    }

    impl RecordingApplier {
        fn poison(&self, block: u64, index: u64) {
            self.poisoned.lock().unwrap().insert((block, index));
        }
    }

    #[async_trait]
    impl EventApplier for RecordingApplier {
        fn event_type(&self) -> &str {
            "Transfer"
        }

        async fn apply(&self, event: &IndexedEvent) -> Result<(), IngestError> {
            if self.poisoned.lock().unwrap().contains(&event.position()) {
                return Err(IngestError::Apply {
                    event_type: "Transfer".into(),
                    reason: "poisoned".into(),
                });
            }
            self.order.lock().unwrap().push(event.position());
            Ok(())
        }
    }

    async fn seed_finalized(store: &MemoryStore, positions: &[(u64, u64)]) {
        for (block, index) in positions {
            let raw = RawLog {
                block_number: *block,
                log_index: *index,
                transaction_hash: format!("0xt{block}_{index}"),
                block_identifier: format!("0xblk{block}"),
                topics: vec![],
                data: String::new(),
            };
            store
                .persist(&IndexedEvent::from_raw(&source(), &raw, Value::Null))
                .await
                .unwrap();
            store.mark_finalized(&source(), *block, *index, 12).await.unwrap();
        }
    }

    fn state_scanned_through(block: u64) -> IndexingState {
        let mut state = IndexingState::new(source(), &SourceConfig::default());
        state.last_scanned_block = block;
        state.last_processed_block = 0;
        state.last_finalized_block = block;
        state
    }

    #[tokio::test]
    async fn applies_in_stream_order() {
        let store = Arc::new(MemoryStore::new());
        // Insert out of order on purpose.
        seed_finalized(&store, &[(100, 1), (100, 0), (99, 3)]).await;
        let applier = RecordingApplier::default();
        let processor = EventProcessor::new(store.clone());

        let outcome = processor
            .process_batch(&applier, &state_scanned_through(100))
            .await
            .unwrap();

        assert_eq!(outcome.applied, 3);
        assert_eq!(outcome.processed_through, 100);
        assert_eq!(
            *applier.order.lock().unwrap(),
            vec![(99, 3), (100, 0), (100, 1)]
        );
    }

    #[tokio::test]
    async fn gap_holds_the_cursor_back() {
        let store = Arc::new(MemoryStore::new());
        seed_finalized(&store, &[(100, 0), (101, 0)]).await;
        let applier = RecordingApplier::default();
        applier.poison(100, 0);
        let processor = EventProcessor::new(store.clone());

        let outcome = processor
            .process_batch(&applier, &state_scanned_through(101))
            .await
            .unwrap();

        // 101 was applied, but the failed event at 100 caps the cursor at 99.
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.processed_through, 99);
        assert!(outcome.exhausted.is_none());
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_is_surfaced() {
        let store = Arc::new(MemoryStore::new());
        seed_finalized(&store, &[(100, 0)]).await;
        let applier = RecordingApplier::default();
        applier.poison(100, 0);
        let processor = EventProcessor::new(store.clone());
        let state = state_scanned_through(100);

        for pass in 1..=2u32 {
            let outcome = processor.process_batch(&applier, &state).await.unwrap();
            assert!(outcome.exhausted.is_none(), "pass {pass} should still retry");
        }
        let outcome = processor.process_batch(&applier, &state).await.unwrap();
        let exhausted = outcome.exhausted.expect("third failure exhausts the budget");
        assert_eq!((exhausted.block_number, exhausted.log_index), (100, 0));

        // The event is now out of the automatic retry set.
        let outcome = processor.process_batch(&applier, &state).await.unwrap();
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.processed_through, 99);
    }

    #[tokio::test]
    async fn recovered_event_unblocks_the_prefix() {
        let store = Arc::new(MemoryStore::new());
        seed_finalized(&store, &[(100, 0), (101, 0)]).await;
        let applier = RecordingApplier::default();
        applier.poison(100, 0);
        let processor = EventProcessor::new(store.clone());
        let state = state_scanned_through(101);

        let outcome = processor.process_batch(&applier, &state).await.unwrap();
        assert_eq!(outcome.processed_through, 99);

        // The transient cause clears; the retry applies and the prefix heals.
        applier.poisoned.lock().unwrap().clear();
        let outcome = processor.process_batch(&applier, &state).await.unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.processed_through, 101);
    }

    #[tokio::test]
    async fn empty_batch_advances_to_scan_cursor() {
        let store = Arc::new(MemoryStore::new());
        let applier = RecordingApplier::default();
        let processor = EventProcessor::new(store.clone());

        let outcome = processor
            .process_batch(&applier, &state_scanned_through(500))
            .await
            .unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.processed_through, 500);
    }

    #[tokio::test]
    async fn unfinalized_events_cap_the_cursor() {
        let store = Arc::new(MemoryStore::new());
        seed_finalized(&store, &[(100, 0)]).await;
        // An unfinalized straggler at 105.
        let raw = RawLog {
            block_number: 105,
            log_index: 0,
            transaction_hash: "0xt105".into(),
            block_identifier: "0xblk105".into(),
            topics: vec![],
            data: String::new(),
        };
        store
            .persist(&IndexedEvent::from_raw(&source(), &raw, Value::Null))
            .await
            .unwrap();

        let applier = RecordingApplier::default();
        let processor = EventProcessor::new(store.clone());
        let outcome = processor
            .process_batch(&applier, &state_scanned_through(110))
            .await
            .unwrap();

        // 100 applied; the unfinalized event at 105 holds the cursor at 104.
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.processed_through, 104);
    }
}
