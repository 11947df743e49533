//! Checkpoint manager — owns the per-source cursor fields and the status
//! state machine that serializes scan/process cycles.
//!
//! A cycle runs `acquire → commit_scan → commit_process`; each step both
//! advances cursors and moves the status machine
//! (`Idle → Scanning → Processing → Idle`). On restart, the cursors resume
//! the source exactly where it left off.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::source::SourceId;
use crate::state::{IndexingState, SourceConfig, SourceStatus};
use crate::store::StateStore;

// ─── ScanRange ───────────────────────────────────────────────────────────────

/// An inclusive block range to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    pub from: u64,
    pub to: u64,
}

impl ScanRange {
    /// Number of blocks covered; construction guarantees `from ≤ to`.
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }
}

// ─── CycleToken ──────────────────────────────────────────────────────────────

/// Proof of an exclusively held scan/process cycle for one source.
///
/// Produced only by [`CheckpointManager::acquire`]; holding it means the
/// status machine is past `Idle` and no other cycle can start. The embedded
/// state is the only copy mutated during the cycle.
pub struct CycleToken {
    pub state: IndexingState,
}

// ─── CheckpointManager ───────────────────────────────────────────────────────

/// Guards every transition of a source's [`IndexingState`].
///
/// Cursor fields are monotonically non-decreasing through this manager; the
/// only rollback path is the reconciler.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn StateStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Load the state row, creating it from `config` on first contact.
    pub async fn ensure(
        &self,
        source: &SourceId,
        config: &SourceConfig,
    ) -> Result<IndexingState, IngestError> {
        if let Some(state) = self.store.load(source).await? {
            return Ok(state);
        }
        let state = IndexingState::new(source.clone(), config);
        self.store.save(&state).await?;
        info!(source = %source, start_block = config.start_block, "Source registered");
        Ok(state)
    }

    /// Try to start a cycle: atomically `Idle → Scanning`.
    ///
    /// Returns `None` when the source is busy, fail-stopped, or mid-reset —
    /// anything but `Idle`.
    pub async fn acquire(&self, source: &SourceId) -> Result<Option<CycleToken>, IngestError> {
        if !self
            .store
            .transition(source, SourceStatus::Idle, SourceStatus::Scanning)
            .await?
        {
            return Ok(None);
        }
        let state = self
            .store
            .load(source)
            .await?
            .ok_or_else(|| IngestError::UnknownSource(source.to_string()))?;
        debug!(source = %source, "Cycle acquired");
        Ok(Some(CycleToken { state }))
    }

    /// The next range to scan given the current head, `None` when caught up.
    pub fn next_scan_range(&self, state: &IndexingState, head_block: u64) -> Option<ScanRange> {
        let from = state.last_scanned_block + 1;
        if from > head_block {
            return None;
        }
        let to = (from + state.block_range_per_batch - 1).min(head_block);
        Some(ScanRange { from, to })
    }

    /// Record that logs through `to` are fetched and stored:
    /// `Scanning → Processing`.
    pub async fn commit_scan(&self, token: &mut CycleToken, to: u64) -> Result<(), IngestError> {
        let state = &mut token.state;
        self.expect_status(state, SourceStatus::Scanning)?;
        if to < state.last_scanned_block {
            return Err(IngestError::InvariantViolation {
                src: state.source.to_string(),
                reason: format!(
                    "scan cursor would move backward ({} -> {to})",
                    state.last_scanned_block
                ),
            });
        }
        state.last_scanned_block = to;
        state.status = SourceStatus::Processing;
        state.touch();
        self.store.save(state).await
    }

    /// Record that every event through `processed_through` is applied:
    /// `Processing → Idle`.
    pub async fn commit_process(
        &self,
        token: &mut CycleToken,
        processed_through: u64,
    ) -> Result<(), IngestError> {
        let state = &mut token.state;
        self.expect_status(state, SourceStatus::Processing)?;
        if processed_through > state.last_scanned_block {
            return Err(IngestError::InvariantViolation {
                src: state.source.to_string(),
                reason: format!(
                    "processed cursor {processed_through} would pass scan cursor {}",
                    state.last_scanned_block
                ),
            });
        }
        state.last_processed_block = state.last_processed_block.max(processed_through);
        state.status = SourceStatus::Idle;
        state.touch();
        self.store.save(state).await
    }

    /// Abort a cycle after a transient failure: status back to `Idle`,
    /// cursors and counters untouched. The next cycle re-derives the same
    /// scan range and idempotent persistence absorbs any partial batch.
    /// The token is dead afterwards.
    pub async fn release(&self, token: &mut CycleToken) -> Result<(), IngestError> {
        token.state.status = SourceStatus::Idle;
        token.state.touch();
        debug!(source = %token.state.source, "Cycle released");
        self.store.save(&token.state).await
    }

    /// Fail-stop the source. Nothing runs again until an operator [`reset`].
    /// The token is dead afterwards.
    ///
    /// [`reset`]: CheckpointManager::reset
    pub async fn fail(&self, token: &mut CycleToken, message: &str) -> Result<(), IngestError> {
        token.state.status = SourceStatus::Error;
        token.state.error_message = Some(message.to_string());
        token.state.touch();
        warn!(source = %token.state.source, message, "Source fail-stopped");
        self.store.save(&token.state).await
    }

    /// Operator reset: force `Idle` and clear the error. Never moves cursors.
    ///
    /// Also the recovery path for a process killed mid-cycle, which leaves
    /// the durable status stuck at `Scanning`/`Processing`.
    pub async fn reset(&self, source: &SourceId) -> Result<(), IngestError> {
        let mut state = self
            .store
            .load(source)
            .await?
            .ok_or_else(|| IngestError::UnknownSource(source.to_string()))?;
        state.status = SourceStatus::Idle;
        state.error_message = None;
        state.touch();
        info!(source = %source, "Source reset to idle");
        self.store.save(&state).await
    }

    fn expect_status(
        &self,
        state: &IndexingState,
        expected: SourceStatus,
    ) -> Result<(), IngestError> {
        if state.status != expected {
            return Err(IngestError::InvalidTransition {
                src: state.source.to_string(),
                expected: expected.to_string(),
                found: state.status.to_string(),
            });
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
