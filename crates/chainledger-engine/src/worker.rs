//! The per-source worker — runs the ingestion cycle:
//! scan → detect reorg → reconcile if needed → track confirmations → process.
//!
//! One worker per source, independent of every other source. Within a worker
//! the cycle is strictly sequential; the checkpoint manager's status
//! compare-and-set guarantees no two cycles for the same source overlap, even
//! across processes sharing a durable store.
//!
//! Transient RPC failures are retried in place with exponential backoff; if
//! the budget runs out mid-cycle the cycle is released (status back to
//! `Idle`, cursors untouched) and the next cycle re-derives the same work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};

use chainledger_core::apply::EventApplier;
use chainledger_core::checkpoint::{CheckpointManager, CycleToken};
use chainledger_core::confirm::ConfirmationTracker;
use chainledger_core::error::IngestError;
use chainledger_core::event::{IndexedEvent, PersistOutcome};
use chainledger_core::processor::EventProcessor;
use chainledger_core::reconcile::Reconciler;
use chainledger_core::reorg::ReorgDetector;
use chainledger_core::source::{LogSource, SourceId};
use chainledger_core::state::SourceConfig;
use chainledger_core::store::{EventStore, StateStore};

// ─── WorkerConfig ────────────────────────────────────────────────────────────

/// Engine-level knobs, beyond the per-source tunables persisted in
/// `IndexingState`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between cycles (milliseconds).
    pub poll_interval_ms: u64,
    /// In-cycle retries per RPC call before the cycle is released.
    pub rpc_retry_attempts: usize,
    /// Base delay for the exponential backoff (milliseconds).
    pub rpc_retry_base_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            rpc_retry_attempts: 4,
            rpc_retry_base_ms: 10,
        }
    }
}

// ─── CycleOutcome ────────────────────────────────────────────────────────────

/// Counters from a completed cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    /// The range scanned this cycle, if any blocks were available.
    pub scanned: Option<(u64, u64)>,
    pub inserted: u64,
    pub duplicates: u64,
    pub finalized: u64,
    pub applied: u64,
    pub processed_through: u64,
}

/// What a single cycle did.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Another cycle (or an operator action) holds the source.
    Busy,
    /// A reorg was detected and the source reconciled; the next cycle
    /// re-fetches the invalidated range.
    Reorged {
        divergence_block: u64,
        rolled_back_to: u64,
    },
    /// A normal pass.
    Completed(CycleStats),
    /// An event exhausted its retry budget; the source is fail-stopped.
    Failed { block_number: u64, log_index: u64 },
}

// ─── SourceWorker ────────────────────────────────────────────────────────────

/// Drives one source through repeated ingestion cycles.
pub struct SourceWorker {
    source: SourceId,
    source_config: SourceConfig,
    config: WorkerConfig,
    chain: Arc<dyn LogSource>,
    events: Arc<dyn EventStore>,
    applier: Arc<dyn EventApplier>,
    checkpoint: CheckpointManager,
    detector: ReorgDetector,
    tracker: ConfirmationTracker,
    reconciler: Reconciler,
    processor: EventProcessor,
    stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for SourceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceWorker")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl SourceWorker {
    pub fn new(
        source: SourceId,
        source_config: SourceConfig,
        config: WorkerConfig,
        chain: Arc<dyn LogSource>,
        states: Arc<dyn StateStore>,
        events: Arc<dyn EventStore>,
        applier: Arc<dyn EventApplier>,
    ) -> Self {
        Self {
            source,
            source_config,
            config,
            chain,
            checkpoint: CheckpointManager::new(states.clone()),
            detector: ReorgDetector::new(),
            tracker: ConfirmationTracker::new(),
            reconciler: Reconciler::new(states, events.clone()),
            processor: EventProcessor::new(events.clone()),
            events,
            applier,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked at the top of every loop iteration; flip it to pause the
    /// worker between cycles. In-flight persistence is never interrupted.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run cycles until stopped or a fatal error.
    ///
    /// Transient failures are logged and absorbed — the loop continues at the
    /// next poll tick. A fail-stopped source keeps polling but every cycle
    /// comes back [`CycleOutcome::Busy`] until an operator reset.
    pub async fn run(&self) -> Result<(), IngestError> {
        info!(source = %self.source, "Worker started");
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!(source = %self.source, "Worker stopped");
                return Ok(());
            }
            match self.cycle().await {
                Ok(CycleOutcome::Completed(stats)) => {
                    if let Some((from, to)) = stats.scanned {
                        debug!(
                            source = %self.source,
                            from,
                            to,
                            inserted = stats.inserted,
                            applied = stats.applied,
                            processed_through = stats.processed_through,
                            "Cycle complete"
                        );
                    }
                }
                Ok(_) => {}
                Err(err) if err.is_transient() => {
                    warn!(source = %self.source, error = %err, "Transient failure; retrying next cycle");
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// One full ingestion cycle.
    pub async fn cycle(&self) -> Result<CycleOutcome, IngestError> {
        self.checkpoint.ensure(&self.source, &self.source_config).await?;

        // Head is fetched before acquiring the cycle so a flaky RPC never
        // leaves the status machine out of `Idle`.
        let head = self.with_retry(|| self.chain.head_block()).await?;

        let Some(mut token) = self.checkpoint.acquire(&self.source).await? else {
            return Ok(CycleOutcome::Busy);
        };

        match self.drive(&mut token, head).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_transient() => {
                self.checkpoint.release(&mut token).await?;
                Err(err)
            }
            Err(err) => {
                if let Err(save_err) = self.checkpoint.fail(&mut token, &err.to_string()).await {
                    warn!(source = %self.source, error = %save_err, "Could not record fail-stop");
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        token: &mut CycleToken,
        head: u64,
    ) -> Result<CycleOutcome, IngestError> {
        // Verify stored unfinalized history is still canonical before
        // touching anything.
        if let Some(divergence) = self
            .detector
            .detect(self.chain.as_ref(), self.events.as_ref(), &token.state)
            .await?
        {
            let report = self
                .reconciler
                .reconcile(&mut token.state, divergence)
                .await?;
            return Ok(CycleOutcome::Reorged {
                divergence_block: divergence,
                rolled_back_to: report.rolled_back_to,
            });
        }

        let mut stats = CycleStats::default();
        let range = self.checkpoint.next_scan_range(&token.state, head);
        let scan_to = range.map(|r| r.to).unwrap_or(token.state.last_scanned_block);

        if let Some(range) = range {
            let filter = self.source.filter();
            let logs = self
                .with_retry(|| self.chain.logs(range.from, range.to, &filter))
                .await?;

            for raw in &logs {
                self.events
                    .record_block_identifier(&self.source, raw.block_number, &raw.block_identifier)
                    .await?;
                let parsed = self.applier.decode(raw)?;
                let event = IndexedEvent::from_raw(&self.source, raw, parsed);
                match self.events.persist(&event).await? {
                    PersistOutcome::Inserted => stats.inserted += 1,
                    PersistOutcome::Duplicate => stats.duplicates += 1,
                }
            }
            stats.scanned = Some((range.from, range.to));
            token.state.total_event_count += stats.inserted;
        }
        self.checkpoint.commit_scan(token, scan_to).await?;

        // Finalization always runs a full cycle ahead of application.
        stats.finalized = self
            .tracker
            .run(
                self.events.as_ref(),
                &self.source,
                head,
                token.state.confirmations_required,
            )
            .await?;
        if let Some(horizon) = ConfirmationTracker::horizon(
            head,
            token.state.confirmations_required,
            token.state.last_scanned_block,
        ) {
            token.state.last_finalized_block = token.state.last_finalized_block.max(horizon);
        }

        let batch = self
            .processor
            .process_batch(self.applier.as_ref(), &token.state)
            .await?;
        stats.applied = batch.applied;
        stats.processed_through = batch.processed_through;
        token.state.processed_event_count += batch.applied;

        if let Some(exhausted) = batch.exhausted {
            token.state.failed_event_count += 1;
            let message = format!(
                "event at block {} log {} exhausted its retry budget: {}",
                exhausted.block_number, exhausted.log_index, exhausted.error
            );
            self.checkpoint.fail(token, &message).await?;
            return Ok(CycleOutcome::Failed {
                block_number: exhausted.block_number,
                log_index: exhausted.log_index,
            });
        }

        self.checkpoint
            .commit_process(token, batch.processed_through)
            .await?;
        Ok(CycleOutcome::Completed(stats))
    }

    /// Retry a transient-capable RPC call with jittered exponential backoff.
    /// Backoff lives here, in the caller — the core components never sleep.
    async fn with_retry<A, T>(&self, action: A) -> Result<T, IngestError>
    where
        A: tokio_retry::Action<Item = T, Error = IngestError>,
    {
        let strategy = ExponentialBackoff::from_millis(self.config.rpc_retry_base_ms)
            .map(jitter)
            .take(self.config.rpc_retry_attempts);
        RetryIf::spawn(strategy, action, IngestError::is_transient).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkerBuilder;
    use chainledger_core::apply::ApplierRegistry;
    use chainledger_core::event::RawLog;
    use chainledger_core::source::LogFilter;
    use chainledger_core::state::SourceStatus;
    use chainledger_core::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    fn source() -> SourceId {
        SourceId::new("ethereum", "0xa0b8", "Transfer")
    }

    // ── Scripted chain ────────────────────────────────────────────────────────

    /// A mock chain: a head, per-height identifiers, and a flat log list.
    /// `reorg(from)` replaces identifiers and drops logs from `from` upward,
    /// as if a competing fork became canonical.
    #[derive(Default)]
    struct MockChain {
        head: Mutex<u64>,
        overrides: Mutex<HashMap<u64, String>>,
        logs: Mutex<Vec<RawLog>>,
        fail_logs: AtomicBool,
    }

    impl MockChain {
        fn new(head: u64) -> Arc<Self> {
            let chain = Arc::new(Self::default());
            chain.set_head(head);
            chain
        }

        fn set_head(&self, head: u64) {
            *self.head.lock().unwrap() = head;
        }

        fn identifier(&self, block: u64) -> String {
            self.overrides
                .lock()
                .unwrap()
                .get(&block)
                .cloned()
                .unwrap_or_else(|| format!("0xblk{block}"))
        }

        fn add_log(&self, block: u64, index: u64, account: &str, amount: i64) {
            self.logs.lock().unwrap().push(RawLog {
                block_number: block,
                log_index: index,
                transaction_hash: format!("0xtx{block}_{index}"),
                block_identifier: self.identifier(block),
                topics: vec![account.to_string()],
                data: amount.to_string(),
            });
        }

        fn reorg(&self, from: u64) {
            let head = *self.head.lock().unwrap();
            let mut overrides = self.overrides.lock().unwrap();
            for block in from..=head {
                overrides.insert(block, format!("0xblk{block}b"));
            }
            self.logs.lock().unwrap().retain(|l| l.block_number < from);
        }
    }

    #[async_trait]
    impl LogSource for MockChain {
        async fn head_block(&self) -> Result<u64, IngestError> {
            Ok(*self.head.lock().unwrap())
        }

        async fn logs(
            &self,
            from: u64,
            to: u64,
            _filter: &LogFilter,
        ) -> Result<Vec<RawLog>, IngestError> {
            if self.fail_logs.load(Ordering::Relaxed) {
                return Err(IngestError::Rpc("connection reset".into()));
            }
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|l| l.block_number >= from && l.block_number <= to)
                .cloned()
                .collect())
        }

        async fn block_identifier(&self, number: u64) -> Result<Option<String>, IngestError> {
            if number > *self.head.lock().unwrap() {
                return Ok(None);
            }
            Ok(Some(self.identifier(number)))
        }
    }

    // ── Balance applier ───────────────────────────────────────────────────────

    /// Credits `topics[0]` with `data` — a tiny running aggregate where apply
    /// order and apply count both matter.
    #[derive(Default)]
    struct BalanceApplier {
        balances: Mutex<HashMap<String, i64>>,
        applied: Mutex<Vec<(u64, u64)>>,
        poisoned: Mutex<HashSet<(u64, u64)>>,
    }

    impl BalanceApplier {
        fn balances(&self) -> HashMap<String, i64> {
            self.balances.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventApplier for BalanceApplier {
        fn event_type(&self) -> &str {
            "Transfer"
        }

        async fn apply(&self, event: &IndexedEvent) -> Result<(), IngestError> {
            let position = event.position();
            if self.poisoned.lock().unwrap().contains(&position) {
                return Err(IngestError::Apply {
                    event_type: "Transfer".into(),
                    reason: "poisoned".into(),
                });
            }
            let account = event.parsed_data["topics"][0]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let amount: i64 = event.parsed_data["data"]
                .as_str()
                .unwrap_or("0")
                .parse()
                .unwrap_or(0);
            *self.balances.lock().unwrap().entry(account).or_insert(0) += amount;
            self.applied.lock().unwrap().push(position);
            Ok(())
        }
    }

    fn build_worker(
        chain: Arc<MockChain>,
        store: Arc<MemoryStore>,
        applier: Arc<BalanceApplier>,
        start_block: u64,
    ) -> SourceWorker {
        let mut registry = ApplierRegistry::new();
        registry.register(applier);
        WorkerBuilder::new()
            .source(source())
            .start_block(start_block)
            .block_range_per_batch(50)
            .confirmations_required(12)
            .max_retry_attempts(3)
            .rpc_retry_attempts(1)
            .rpc_retry_base_ms(1)
            .build(chain, store.clone(), store, &registry)
            .unwrap()
    }

    async fn drain(worker: &SourceWorker) {
        // Cycle until a pass neither scans nor applies anything.
        loop {
            match worker.cycle().await.unwrap() {
                CycleOutcome::Completed(stats)
                    if stats.scanned.is_none() && stats.applied == 0 =>
                {
                    return;
                }
                _ => {}
            }
        }
    }

    // ── Tests ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pipeline_applies_finalized_events_in_order() {
        let chain = MockChain::new(120);
        chain.add_log(100, 1, "a", 5);
        chain.add_log(100, 0, "b", 7);
        chain.add_log(101, 0, "a", 3);
        let store = Arc::new(MemoryStore::new());
        let applier = Arc::new(BalanceApplier::default());
        let worker = build_worker(chain, store.clone(), applier.clone(), 95);

        let outcome = worker.cycle().await.unwrap();
        let CycleOutcome::Completed(stats) = outcome else {
            panic!("expected a completed cycle");
        };
        assert_eq!(stats.scanned, Some((95, 120)));
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.finalized, 3); // horizon 108 covers blocks 100–101
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.processed_through, 120);

        assert_eq!(
            *applier.applied.lock().unwrap(),
            vec![(100, 0), (100, 1), (101, 0)]
        );
        assert_eq!(applier.balances()["a"], 8);
        assert_eq!(applier.balances()["b"], 7);

        let state = store.load(&source()).await.unwrap().unwrap();
        assert_eq!(state.last_scanned_block, 120);
        assert_eq!(state.last_processed_block, 120);
        assert_eq!(state.last_finalized_block, 108);
        assert_eq!(state.status, SourceStatus::Idle);
        assert_eq!(state.total_event_count, 3);
        assert_eq!(state.processed_event_count, 3);
    }

    #[tokio::test]
    async fn restart_resumes_without_duplicates() {
        let chain = MockChain::new(120);
        chain.add_log(100, 0, "a", 5);
        let store = Arc::new(MemoryStore::new());
        let applier = Arc::new(BalanceApplier::default());

        let worker = build_worker(chain.clone(), store.clone(), applier.clone(), 95);
        worker.cycle().await.unwrap();
        assert_eq!(store.load(&source()).await.unwrap().unwrap().last_processed_block, 120);

        // "Restart": a fresh worker over the same durable store and chain.
        let restarted = build_worker(chain.clone(), store.clone(), applier.clone(), 95);
        let CycleOutcome::Completed(stats) = restarted.cycle().await.unwrap() else {
            panic!("expected a completed cycle");
        };
        // Nothing new below the head: no rescan, no rows, no reapply.
        assert!(stats.scanned.is_none());
        assert_eq!(store.event_count(&source()).await.unwrap(), 1);
        assert_eq!(applier.applied.lock().unwrap().len(), 1);

        // New blocks resume from 121, never re-fetching ≤ 120.
        chain.set_head(125);
        chain.add_log(121, 0, "a", 2);
        let CycleOutcome::Completed(stats) = restarted.cycle().await.unwrap() else {
            panic!("expected a completed cycle");
        };
        assert_eq!(stats.scanned, Some((121, 125)));
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.applied, 0); // 121 is only 4 deep, unfinalized
        assert_eq!(store.event_count(&source()).await.unwrap(), 2);
        assert_eq!(applier.balances()["a"], 5);
    }

    #[tokio::test]
    async fn reorg_reconciles_and_replays_deterministically() {
        let chain = MockChain::new(108);
        chain.add_log(95, 0, "a", 5);
        chain.add_log(97, 0, "b", 7);
        chain.add_log(98, 0, "a", 3);
        chain.add_log(100, 0, "b", 1);
        chain.add_log(105, 0, "a", 2);
        let store = Arc::new(MemoryStore::new());
        let applier = Arc::new(BalanceApplier::default());
        let worker = build_worker(chain.clone(), store.clone(), applier.clone(), 90);

        worker.cycle().await.unwrap();
        let state = store.load(&source()).await.unwrap().unwrap();
        // Horizon 96: only block 95 finalized and applied.
        assert_eq!(state.last_finalized_block, 96);
        assert_eq!(state.last_processed_block, 96);
        assert_eq!(applier.balances()["a"], 5);

        // The chain reorgs at 98 and then extends to 120 with different logs.
        chain.reorg(98);
        chain.add_log(98, 0, "a", 10);
        chain.add_log(99, 0, "c", 4);
        chain.set_head(120);

        let outcome = worker.cycle().await.unwrap();
        let CycleOutcome::Reorged {
            divergence_block,
            rolled_back_to,
        } = outcome
        else {
            panic!("expected a reorg cycle");
        };
        assert_eq!(divergence_block, 98);
        assert_eq!(rolled_back_to, 97);

        drain(&worker).await;

        // Same final state as indexing the corrected chain from scratch.
        let fresh_store = Arc::new(MemoryStore::new());
        let fresh_applier = Arc::new(BalanceApplier::default());
        let fresh = build_worker(chain.clone(), fresh_store.clone(), fresh_applier.clone(), 90);
        drain(&fresh).await;

        assert_eq!(applier.balances(), fresh_applier.balances());
        assert_eq!(
            store.event_count(&source()).await.unwrap(),
            fresh_store.event_count(&source()).await.unwrap()
        );
        // The finalized event below the divergence was applied exactly once.
        let applied = applier.applied.lock().unwrap();
        assert_eq!(applied.iter().filter(|p| **p == (95, 0)).count(), 1);
    }

    #[tokio::test]
    async fn retry_exhaustion_fail_stops_the_source() {
        let chain = MockChain::new(120);
        chain.add_log(100, 0, "a", 5);
        let store = Arc::new(MemoryStore::new());
        let applier = Arc::new(BalanceApplier::default());
        applier.poisoned.lock().unwrap().insert((100, 0));
        let worker = build_worker(chain, store.clone(), applier.clone(), 95);

        // Attempts 1 and 2: failed but retryable; the cursor is held at 99.
        for _ in 0..2 {
            let CycleOutcome::Completed(stats) = worker.cycle().await.unwrap() else {
                panic!("expected a completed cycle");
            };
            assert_eq!(stats.processed_through, 99);
        }
        // Attempt 3 exhausts the budget.
        let outcome = worker.cycle().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                block_number: 100,
                log_index: 0
            }
        ));

        let state = store.load(&source()).await.unwrap().unwrap();
        assert_eq!(state.status, SourceStatus::Error);
        assert_eq!(state.failed_event_count, 1);
        assert!(state.error_message.as_deref().unwrap().contains("block 100"));
        // Everything stalls until an operator reset.
        assert!(matches!(worker.cycle().await.unwrap(), CycleOutcome::Busy));

        // After a reset the source cycles again, with the permanently failed
        // event excluded and still pinning the processed cursor.
        CheckpointManager::new(store.clone()).reset(&source()).await.unwrap();
        let CycleOutcome::Completed(stats) = worker.cycle().await.unwrap() else {
            panic!("expected a completed cycle");
        };
        assert_eq!(stats.processed_through, 99);
        let state = store.load(&source()).await.unwrap().unwrap();
        assert_eq!(state.last_processed_block, 99);
    }

    #[tokio::test]
    async fn transient_log_failure_releases_the_cycle() {
        let chain = MockChain::new(120);
        chain.add_log(100, 0, "a", 5);
        chain.fail_logs.store(true, Ordering::Relaxed);
        let store = Arc::new(MemoryStore::new());
        let applier = Arc::new(BalanceApplier::default());
        let worker = build_worker(chain.clone(), store.clone(), applier.clone(), 95);

        let err = worker.cycle().await.unwrap_err();
        assert!(err.is_transient());

        // Cursors untouched, status back to idle, no partial rows.
        let state = store.load(&source()).await.unwrap().unwrap();
        assert_eq!(state.status, SourceStatus::Idle);
        assert_eq!(state.last_scanned_block, 94);
        assert_eq!(store.event_count(&source()).await.unwrap(), 0);

        // Recovery is automatic once the RPC heals.
        chain.fail_logs.store(false, Ordering::Relaxed);
        let CycleOutcome::Completed(stats) = worker.cycle().await.unwrap() else {
            panic!("expected a completed cycle");
        };
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.applied, 1);
    }

    #[tokio::test]
    async fn held_source_reports_busy() {
        let chain = MockChain::new(120);
        let store = Arc::new(MemoryStore::new());
        let applier = Arc::new(BalanceApplier::default());
        let worker = build_worker(chain, store.clone(), applier, 95);

        // Simulate another holder of the cycle.
        let checkpoint = CheckpointManager::new(store.clone());
        checkpoint
            .ensure(&source(), &SourceConfig { start_block: 95, ..Default::default() })
            .await
            .unwrap();
        let _held = checkpoint.acquire(&source()).await.unwrap().unwrap();

        assert!(matches!(worker.cycle().await.unwrap(), CycleOutcome::Busy));
    }
}
