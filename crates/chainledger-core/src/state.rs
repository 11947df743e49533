//! Per-source indexing state — the durable checkpoint record and its
//! status state machine.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::source::SourceId;

// ─── SourceStatus ────────────────────────────────────────────────────────────

/// Runtime status of a source.
///
/// Doubles as the per-source mutual-exclusion flag: a scan/process cycle may
/// only start by atomically moving `Idle → Scanning`, so at most one cycle is
/// ever in flight for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStatus {
    /// No cycle in flight; eligible for `acquire`.
    Idle,
    /// Fetching and persisting logs for the next block range.
    Scanning,
    /// Applying finalized events.
    Processing,
    /// Fail-stopped; requires an explicit operator reset.
    Error,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Processing => "processing",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "scanning" => Ok(Self::Scanning),
            "processing" => Ok(Self::Processing),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown source status '{other}'")),
        }
    }
}

// ─── SourceConfig ────────────────────────────────────────────────────────────

/// Tunables applied when a source's state row is first created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// First block to scan.
    pub start_block: u64,
    /// Blocks fetched per scan batch.
    pub block_range_per_batch: u64,
    /// Confirmation depth at which an event becomes finalized (immutable).
    /// Must exceed the deepest realistic reorg on the source chain.
    pub confirmations_required: u64,
    /// Apply attempts per event before it is permanently failed.
    pub max_retry_attempts: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            start_block: 1,
            block_range_per_batch: 5000,
            confirmations_required: 12,
            max_retry_attempts: 3,
        }
    }
}

// ─── IndexingState ───────────────────────────────────────────────────────────

/// One durable state row per source.
///
/// Invariants: `last_processed_block ≤ last_scanned_block` and
/// `last_finalized_block ≤ last_scanned_block`. Cursors only move backward
/// through the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingState {
    pub source: SourceId,
    /// Highest block whose logs have been fetched and stored (may include
    /// unfinalized events).
    pub last_scanned_block: u64,
    /// Highest block through which every event has been applied.
    pub last_processed_block: u64,
    /// Highest block known to have reached `confirmations_required`.
    pub last_finalized_block: u64,
    pub status: SourceStatus,
    pub error_message: Option<String>,
    /// Event rows currently stored for this source.
    pub total_event_count: u64,
    /// Events applied exactly once.
    pub processed_event_count: u64,
    /// Events that exhausted their retry budget.
    pub failed_event_count: u64,
    pub block_range_per_batch: u64,
    pub confirmations_required: u64,
    pub max_retry_attempts: u32,
    /// Unix timestamp of the last save.
    pub updated_at: i64,
}

impl IndexingState {
    /// Fresh state for a source: all cursors sit just below the configured
    /// start block so the first scan range begins at `start_block`.
    pub fn new(source: SourceId, config: &SourceConfig) -> Self {
        let base = config.start_block.saturating_sub(1);
        Self {
            source,
            last_scanned_block: base,
            last_processed_block: base,
            last_finalized_block: base,
            status: SourceStatus::Idle,
            error_message: None,
            total_event_count: 0,
            processed_event_count: 0,
            failed_event_count: 0,
            block_range_per_batch: config.block_range_per_batch,
            confirmations_required: config.confirmations_required,
            max_retry_attempts: config.max_retry_attempts,
            updated_at: Utc::now().timestamp(),
        }
    }

    /// Refresh `updated_at`; call before every save.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().timestamp();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
