//! Administrative surface — read-only status plus operator actions.
//!
//! This is the only interface downstream consumers (REST layer, scoring
//! services) get: snapshots and explicitly guarded operations. Nothing here
//! (or anywhere else outside the engine) writes event or state rows directly.

use std::sync::Arc;

use chainledger_core::checkpoint::CheckpointManager;
use chainledger_core::error::IngestError;
use chainledger_core::reconcile::{ReconcileReport, Reconciler};
use chainledger_core::source::SourceId;
use chainledger_core::state::IndexingState;
use chainledger_core::store::{EventStore, StateStore};

/// Administrative handle over a shared store pair.
#[derive(Clone)]
pub struct AdminApi {
    states: Arc<dyn StateStore>,
    events: Arc<dyn EventStore>,
    checkpoint: CheckpointManager,
    reconciler: Reconciler,
}

impl AdminApi {
    pub fn new(states: Arc<dyn StateStore>, events: Arc<dyn EventStore>) -> Self {
        Self {
            checkpoint: CheckpointManager::new(states.clone()),
            reconciler: Reconciler::new(states.clone(), events.clone()),
            states,
            events,
        }
    }

    /// Snapshot of a source's indexing state.
    pub async fn indexing_status(&self, source: &SourceId) -> Result<IndexingState, IngestError> {
        self.states
            .load(source)
            .await?
            .ok_or_else(|| IngestError::UnknownSource(source.to_string()))
    }

    /// Highest block through which every event has been applied.
    pub async fn last_processed_block(&self, source: &SourceId) -> Result<u64, IngestError> {
        Ok(self.indexing_status(source).await?.last_processed_block)
    }

    /// Event rows currently stored for a source.
    pub async fn event_count(&self, source: &SourceId) -> Result<u64, IngestError> {
        self.events.event_count(source).await
    }

    /// Operator-triggered replay from `from_block`.
    ///
    /// Identical procedure to reorg reconciliation, guarded by the same cycle
    /// exclusivity: fails with [`IngestError::SourceBusy`] while a cycle is
    /// in flight and with [`IngestError::FinalizedRollback`] when the range
    /// reaches into finalized history.
    pub async fn trigger_replay(
        &self,
        source: &SourceId,
        from_block: u64,
    ) -> Result<ReconcileReport, IngestError> {
        let Some(mut token) = self.checkpoint.acquire(source).await? else {
            return Err(IngestError::SourceBusy(source.to_string()));
        };
        match self.reconciler.reconcile(&mut token.state, from_block).await {
            Ok(report) => Ok(report), // reconcile returned the source to idle
            Err(err) => {
                self.checkpoint.release(&mut token).await?;
                Err(err)
            }
        }
    }

    /// Clear an `Error` (or crash-stuck) status back to `Idle`.
    pub async fn reset(&self, source: &SourceId) -> Result<(), IngestError> {
        self.checkpoint.reset(source).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainledger_core::event::{IndexedEvent, RawLog};
    use chainledger_core::state::{SourceConfig, SourceStatus};
    use chainledger_core::store::MemoryStore;
    use serde_json::Value;

    fn source() -> SourceId {
        SourceId::new("ethereum", "0xa0b8", "Transfer")
    }

    fn admin_over(store: Arc<MemoryStore>) -> AdminApi {
        AdminApi::new(store.clone(), store)
    }

    async fn seed(store: &Arc<MemoryStore>) {
        let mut state = IndexingState::new(source(), &SourceConfig::default());
        state.last_scanned_block = 105;
        state.last_processed_block = 96;
        state.last_finalized_block = 96;
        store.save(&state).await.unwrap();

        for block in 97u64..=105 {
            let raw = RawLog {
                block_number: block,
                log_index: 0,
                transaction_hash: format!("0xt{block}"),
                block_identifier: format!("0xblk{block}"),
                topics: vec![],
                data: String::new(),
            };
            store
                .persist(&IndexedEvent::from_raw(&source(), &raw, Value::Null))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn status_snapshot_and_cursor() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let admin = admin_over(store);

        let status = admin.indexing_status(&source()).await.unwrap();
        assert_eq!(status.last_scanned_block, 105);
        assert_eq!(admin.last_processed_block(&source()).await.unwrap(), 96);
        assert_eq!(admin.event_count(&source()).await.unwrap(), 9);

        let unknown = SourceId::new("polygon", "0xdead", "Transfer");
        assert!(matches!(
            admin.indexing_status(&unknown).await.unwrap_err(),
            IngestError::UnknownSource(_)
        ));
    }

    #[tokio::test]
    async fn replay_rolls_back_and_returns_idle() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let admin = admin_over(store.clone());

        let report = admin.trigger_replay(&source(), 100).await.unwrap();
        assert_eq!(report.rolled_back_to, 99);
        assert_eq!(report.deleted_events, 6); // 100..=105

        let status = admin.indexing_status(&source()).await.unwrap();
        assert_eq!(status.last_scanned_block, 99);
        assert_eq!(status.status, SourceStatus::Idle);
    }

    #[tokio::test]
    async fn replay_refuses_finalized_history_and_releases() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let admin = admin_over(store.clone());

        let err = admin.trigger_replay(&source(), 96).await.unwrap_err();
        assert!(matches!(err, IngestError::FinalizedRollback { .. }));

        // The failed replay must not leave the source held.
        let status = admin.indexing_status(&source()).await.unwrap();
        assert_eq!(status.status, SourceStatus::Idle);
        assert_eq!(status.last_scanned_block, 105);
    }

    #[tokio::test]
    async fn replay_requires_an_idle_source() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        store
            .transition(&source(), SourceStatus::Idle, SourceStatus::Scanning)
            .await
            .unwrap();
        let admin = admin_over(store);

        assert!(matches!(
            admin.trigger_replay(&source(), 100).await.unwrap_err(),
            IngestError::SourceBusy(_)
        ));
    }

    #[tokio::test]
    async fn reset_clears_an_errored_source() {
        let store = Arc::new(MemoryStore::new());
        let mut state = IndexingState::new(source(), &SourceConfig::default());
        state.status = SourceStatus::Error;
        state.error_message = Some("apply exhausted".into());
        store.save(&state).await.unwrap();
        let admin = admin_over(store);

        admin.reset(&source()).await.unwrap();
        let status = admin.indexing_status(&source()).await.unwrap();
        assert_eq!(status.status, SourceStatus::Idle);
        assert!(status.error_message.is_none());
    }
}
