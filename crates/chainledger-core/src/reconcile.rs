//! Reconciliation — invalidate and replay non-finalized history.
//!
//! Used after a detected reorg and for operator-triggered manual replays; the
//! procedure is identical. Rolled-back ranges are re-fetched and re-applied
//! by the normal scan cycle, and idempotent persistence guarantees the replay
//! converges on the same rows as indexing the corrected chain from scratch.

use std::sync::Arc;
use tracing::info;

use crate::error::IngestError;
use crate::state::{IndexingState, SourceStatus};
use crate::store::{EventStore, StateStore};

/// What a reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// First invalidated block.
    pub from_block: u64,
    /// Where the cursors now sit.
    pub rolled_back_to: u64,
    /// Unfinalized event rows removed.
    pub deleted_events: u64,
}

/// Invalidates stored history from a divergence point and rewinds the
/// cursors so the scan cycle replays the range.
#[derive(Clone)]
pub struct Reconciler {
    states: Arc<dyn StateStore>,
    events: Arc<dyn EventStore>,
}

impl Reconciler {
    pub fn new(states: Arc<dyn StateStore>, events: Arc<dyn EventStore>) -> Self {
        Self { states, events }
    }

    /// Roll the source back to just below `from_block`.
    ///
    /// Refuses to touch finalized history: `from_block` at or below
    /// `last_finalized_block` is a fatal misconfiguration, rejected without
    /// changing anything. On success the source is back at `Idle` with both
    /// cursors at `max(from_block − 1, last_finalized_block)` and every
    /// unfinalized event row at `block_number ≥ from_block` deleted.
    pub async fn reconcile(
        &self,
        state: &mut IndexingState,
        from_block: u64,
    ) -> Result<ReconcileReport, IngestError> {
        if from_block <= state.last_finalized_block {
            return Err(IngestError::FinalizedRollback {
                requested: from_block,
                finalized: state.last_finalized_block,
            });
        }

        let deleted = self
            .events
            .delete_unfinalized_from(&state.source, from_block)
            .await?;
        self.events
            .delete_block_identifiers_from(&state.source, from_block)
            .await?;

        let target = (from_block - 1).max(state.last_finalized_block);
        state.last_scanned_block = state.last_scanned_block.min(target);
        state.last_processed_block = state.last_processed_block.min(target);
        state.total_event_count = state.total_event_count.saturating_sub(deleted);
        state.status = SourceStatus::Idle;
        state.touch();
        self.states.save(state).await?;

        info!(
            source = %state.source,
            from_block,
            rolled_back_to = target,
            deleted_events = deleted,
            "Source reconciled"
        );
        Ok(ReconcileReport {
            from_block,
            rolled_back_to: target,
            deleted_events: deleted,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
