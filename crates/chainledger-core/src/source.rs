//! Source identity and the raw-log-source boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::event::RawLog;

// ─── SourceId ────────────────────────────────────────────────────────────────

/// Identifies one independent indexing stream: one event type of one contract
/// on one chain.
///
/// Every state row, event row, and worker is keyed by this tuple; streams with
/// different keys share nothing and run in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    /// Chain slug (e.g. `"ethereum"`).
    pub chain_id: String,
    /// Contract address emitting the events (`0x…`).
    pub contract_address: String,
    /// Event type indexed from the contract (e.g. `"Transfer"`).
    pub event_type: String,
}

impl SourceId {
    pub fn new(
        chain_id: impl Into<String>,
        contract_address: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            contract_address: contract_address.into(),
            event_type: event_type.into(),
        }
    }

    /// The log filter this stream scans with.
    pub fn filter(&self) -> LogFilter {
        LogFilter {
            address: self.contract_address.clone(),
            event_type: self.event_type.clone(),
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.contract_address, self.event_type)
    }
}

// ─── LogFilter ───────────────────────────────────────────────────────────────

/// Filter for which logs a source scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFilter {
    /// Contract address to match (case-insensitive).
    pub address: String,
    /// Event type to match.
    pub event_type: String,
}

impl LogFilter {
    /// Returns `true` if a log from `address` with `event_type` matches.
    pub fn matches(&self, address: &str, event_type: &str) -> bool {
        self.address.eq_ignore_ascii_case(address) && self.event_type == event_type
    }
}

// ─── LogSource ───────────────────────────────────────────────────────────────

/// The raw-log-source collaborator: delivers logs for a block range and the
/// current canonical view of the chain.
///
/// Delivery is at-least-once — the engine's idempotent persistence absorbs
/// replays, retried RPC calls, and restart-induced re-scans.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Current chain head block number.
    async fn head_block(&self) -> Result<u64, IngestError>;

    /// All logs in `[from, to]` matching `filter`.
    async fn logs(&self, from: u64, to: u64, filter: &LogFilter)
        -> Result<Vec<RawLog>, IngestError>;

    /// Canonical identifier (hash) of the block at `number`, `None` if the
    /// height does not exist on the canonical chain.
    async fn block_identifier(&self, number: u64) -> Result<Option<String>, IngestError>;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_display() {
        let source = SourceId::new("ethereum", "0xAbC", "Transfer");
        assert_eq!(source.to_string(), "ethereum:0xAbC:Transfer");
    }

    #[test]
    fn filter_matches_case_insensitive_address() {
        let filter = SourceId::new("ethereum", "0xAbCdEf", "Transfer").filter();
        assert!(filter.matches("0xabcdef", "Transfer"));
        assert!(!filter.matches("0x111111", "Transfer"));
        assert!(!filter.matches("0xabcdef", "Approval"));
    }
}
