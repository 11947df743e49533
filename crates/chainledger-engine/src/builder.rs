//! Fluent builder API for source workers.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainledger_engine::WorkerBuilder;
//! use chainledger_core::source::SourceId;
//!
//! let (source_config, worker_config) = WorkerBuilder::new()
//!     .source(SourceId::new("ethereum", "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", "Transfer"))
//!     .start_block(19_000_000)
//!     .confirmations_required(12)
//!     .block_range_per_batch(5000)
//!     .build_config();
//! ```

use std::sync::Arc;

use chainledger_core::apply::ApplierRegistry;
use chainledger_core::error::IngestError;
use chainledger_core::source::{LogSource, SourceId};
use chainledger_core::state::SourceConfig;
use chainledger_core::store::{EventStore, StateStore};

use crate::worker::{SourceWorker, WorkerConfig};

/// Fluent builder for [`SourceWorker`].
#[derive(Default)]
pub struct WorkerBuilder {
    source: Option<SourceId>,
    source_config: SourceConfig,
    worker_config: WorkerConfig,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            source_config: SourceConfig::default(),
            worker_config: WorkerConfig::default(),
        }
    }

    /// Set the source stream to index (required).
    pub fn source(mut self, source: SourceId) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the first block to scan.
    pub fn start_block(mut self, block: u64) -> Self {
        self.source_config.start_block = block;
        self
    }

    /// Set the number of blocks fetched per scan batch.
    pub fn block_range_per_batch(mut self, blocks: u64) -> Self {
        self.source_config.block_range_per_batch = blocks;
        self
    }

    /// Set the confirmation depth at which events finalize.
    /// Typical values: 12 (Ethereum PoS), 64 (Ethereum safe), 1 (fast chains).
    pub fn confirmations_required(mut self, confirmations: u64) -> Self {
        self.source_config.confirmations_required = confirmations;
        self
    }

    /// Set the apply attempts per event before it is permanently failed.
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.source_config.max_retry_attempts = attempts;
        self
    }

    /// Set the sleep between cycles in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.worker_config.poll_interval_ms = ms;
        self
    }

    /// Set the in-cycle retries per RPC call.
    pub fn rpc_retry_attempts(mut self, attempts: usize) -> Self {
        self.worker_config.rpc_retry_attempts = attempts;
        self
    }

    /// Set the base backoff delay in milliseconds.
    pub fn rpc_retry_base_ms(mut self, ms: u64) -> Self {
        self.worker_config.rpc_retry_base_ms = ms;
        self
    }

    /// Build just the configs (for inspection or custom wiring).
    pub fn build_config(self) -> (SourceConfig, WorkerConfig) {
        (self.source_config, self.worker_config)
    }

    /// Build the worker, resolving the source's applier from `registry`.
    ///
    /// Fails with [`IngestError::MissingApplier`] when no applier is
    /// registered for the source's event type — the dispatch table is fixed
    /// at startup.
    pub fn build(
        self,
        chain: Arc<dyn LogSource>,
        states: Arc<dyn StateStore>,
        events: Arc<dyn EventStore>,
        registry: &ApplierRegistry,
    ) -> Result<SourceWorker, IngestError> {
        let source = self
            .source
            .ok_or_else(|| IngestError::Other("worker builder requires a source".into()))?;
        let applier = registry.resolve(&source.event_type)?;
        Ok(SourceWorker::new(
            source,
            self.source_config,
            self.worker_config,
            chain,
            states,
            events,
            applier,
        ))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainledger_core::apply::EventApplier;
    use chainledger_core::event::{IndexedEvent, RawLog};
    use chainledger_core::source::LogFilter;
    use chainledger_core::store::MemoryStore;
    use async_trait::async_trait;

    #[test]
    fn builder_defaults() {
        let (source_cfg, worker_cfg) = WorkerBuilder::new().build_config();
        assert_eq!(source_cfg.block_range_per_batch, 5000);
        assert_eq!(source_cfg.confirmations_required, 12);
        assert_eq!(source_cfg.max_retry_attempts, 3);
        assert_eq!(worker_cfg.poll_interval_ms, 2000);
    }

    #[test]
    fn builder_custom() {
        let (source_cfg, worker_cfg) = WorkerBuilder::new()
            .start_block(50_000_000)
            .block_range_per_batch(500)
            .confirmations_required(32)
            .max_retry_attempts(5)
            .poll_interval_ms(250)
            .build_config();

        assert_eq!(source_cfg.start_block, 50_000_000);
        assert_eq!(source_cfg.block_range_per_batch, 500);
        assert_eq!(source_cfg.confirmations_required, 32);
        assert_eq!(source_cfg.max_retry_attempts, 5);
        assert_eq!(worker_cfg.poll_interval_ms, 250);
    }

    struct NullChain;

    #[async_trait]
    impl LogSource for NullChain {
        async fn head_block(&self) -> Result<u64, IngestError> {
            Ok(0)
        }
        async fn logs(
            &self,
            _from: u64,
            _to: u64,
            _filter: &LogFilter,
        ) -> Result<Vec<RawLog>, IngestError> {
            Ok(vec![])
        }
        async fn block_identifier(&self, _number: u64) -> Result<Option<String>, IngestError> {
            Ok(None)
        }
    }

    struct Noop;

    #[async_trait]
    impl EventApplier for Noop {
        fn event_type(&self) -> &str {
            "Transfer"
        }
        async fn apply(&self, _event: &IndexedEvent) -> Result<(), IngestError> {
            Ok(())
        }
    }

    #[test]
    fn build_rejects_unregistered_event_type() {
        let store = Arc::new(MemoryStore::new());
        let registry = ApplierRegistry::new();

        let err = WorkerBuilder::new()
            .source(SourceId::new("ethereum", "0xa", "ClaimCreated"))
            .build(Arc::new(NullChain), store.clone(), store, &registry)
            .unwrap_err();
        assert!(matches!(err, IngestError::MissingApplier(_)));
    }

    #[test]
    fn build_resolves_the_applier_at_startup() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = ApplierRegistry::new();
        registry.register(Arc::new(Noop));

        assert!(WorkerBuilder::new()
            .source(SourceId::new("ethereum", "0xa", "Transfer"))
            .build(Arc::new(NullChain), store.clone(), store, &registry)
            .is_ok());
    }
}
