//! Confirmation tracking — finalization of events that have sunk deep enough
//! below the chain head.
//!
//! Finalization is the sole reorg-safety mechanism for applied events: the
//! processor only ever touches finalized rows, and the reconciler never rolls
//! them back. `confirmations_required` must therefore exceed the deepest
//! realistic reorg on the source chain.

use tracing::debug;

use crate::error::IngestError;
use crate::source::SourceId;
use crate::store::EventStore;

/// Recomputes confirmation depths and flips events past the horizon to
/// finalized. Runs once per cycle, before the processor, so an event is never
/// applied in the same pass that finalized it.
#[derive(Debug, Default)]
pub struct ConfirmationTracker;

impl ConfirmationTracker {
    pub fn new() -> Self {
        Self
    }

    /// Finalize every unfinalized event at `block_number ≤ head − required`,
    /// stamping `confirmations = head − block_number`. Returns the number of
    /// events finalized.
    pub async fn run(
        &self,
        store: &dyn EventStore,
        source: &SourceId,
        head_block: u64,
        confirmations_required: u64,
    ) -> Result<u64, IngestError> {
        let Some(threshold) = head_block.checked_sub(confirmations_required) else {
            return Ok(0);
        };
        let events = store.unfinalized_at_or_below(source, threshold).await?;
        for event in &events {
            store
                .mark_finalized(
                    source,
                    event.block_number,
                    event.log_index,
                    head_block - event.block_number,
                )
                .await?;
        }
        if !events.is_empty() {
            debug!(
                source = %source,
                head_block,
                finalized = events.len(),
                "Finalized events below confirmation horizon"
            );
        }
        Ok(events.len() as u64)
    }

    /// The finalization horizon implied by `head_block`, clamped to what has
    /// actually been scanned. `None` while the chain is shallower than the
    /// required depth.
    pub fn horizon(
        head_block: u64,
        confirmations_required: u64,
        last_scanned_block: u64,
    ) -> Option<u64> {
        head_block
            .checked_sub(confirmations_required)
            .map(|h| h.min(last_scanned_block))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
