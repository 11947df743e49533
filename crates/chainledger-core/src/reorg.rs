//! Reorg detection — stored canonical identifiers vs the chain's current ones.
//!
//! When a block's logs are first stored, the engine records the canonical
//! identifier the source reported for that block. A later cycle re-asks the
//! source for the same heights; the lowest height whose identifier changed is
//! the divergence point. Finalized heights are immutable by construction and
//! never re-verified, which bounds the comparison to at most
//! `confirmations_required` blocks in normal operation.

use tracing::warn;

use crate::error::IngestError;
use crate::source::LogSource;
use crate::state::IndexingState;
use crate::store::EventStore;

/// Finds the divergence point between stored and canonical chain history.
#[derive(Debug, Default)]
pub struct ReorgDetector;

impl ReorgDetector {
    pub fn new() -> Self {
        Self
    }

    /// Compare stored identifiers in `(last_finalized, last_scanned]` against
    /// the source's current view. Returns the lowest diverging height, or
    /// `None` while stored history is still canonical.
    pub async fn detect(
        &self,
        chain: &dyn LogSource,
        store: &dyn EventStore,
        state: &IndexingState,
    ) -> Result<Option<u64>, IngestError> {
        if state.last_scanned_block <= state.last_finalized_block {
            return Ok(None);
        }
        let stored = store
            .block_identifiers_in(
                &state.source,
                state.last_finalized_block + 1,
                state.last_scanned_block,
            )
            .await?;

        for (block_number, stored_id) in stored {
            let canonical = chain.block_identifier(block_number).await?;
            match canonical {
                Some(ref id) if *id == stored_id => continue,
                _ => {
                    warn!(
                        source = %state.source,
                        block_number,
                        stored = %stored_id,
                        canonical = canonical.as_deref().unwrap_or("<missing>"),
                        "Reorg detected"
                    );
                    return Ok(Some(block_number));
                }
            }
        }
        Ok(None)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawLog;
    use crate::source::{LogFilter, SourceId};
    use crate::state::SourceConfig;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ScriptedChain {
        identifiers: Mutex<HashMap<u64, String>>,
    }

    impl ScriptedChain {
        fn new(entries: &[(u64, &str)]) -> Self {
            Self {
                identifiers: Mutex::new(
                    entries.iter().map(|(n, id)| (*n, id.to_string())).collect(),
                ),
            }
        }

        fn rewrite(&self, block: u64, id: &str) {
            self.identifiers.lock().unwrap().insert(block, id.to_string());
        }
    }

    #[async_trait]
    impl LogSource for ScriptedChain {
        async fn head_block(&self) -> Result<u64, IngestError> {
            Ok(*self.identifiers.lock().unwrap().keys().max().unwrap_or(&0))
        }

        async fn logs(
            &self,
            _from: u64,
            _to: u64,
            _filter: &LogFilter,
        ) -> Result<Vec<RawLog>, IngestError> {
            Ok(vec![])
        }

        async fn block_identifier(&self, number: u64) -> Result<Option<String>, IngestError> {
            Ok(self.identifiers.lock().unwrap().get(&number).cloned())
        }
    }

    fn source() -> SourceId {
        SourceId::new("ethereum", "0xa0b8", "Transfer")
    }

    fn state_with(finalized: u64, scanned: u64) -> IndexingState {
        let mut state = IndexingState::new(source(), &SourceConfig::default());
        state.last_finalized_block = finalized;
        state.last_scanned_block = scanned;
        state
    }

    #[tokio::test]
    async fn canonical_history_yields_none() {
        let store = MemoryStore::new();
        let chain = ScriptedChain::new(&[(98, "0xblk98"), (99, "0xblk99"), (100, "0xblk100")]);
        for block in 98u64..=100 {
            store
                .record_block_identifier(&source(), block, &format!("0xblk{block}"))
                .await
                .unwrap();
        }
        let state = state_with(97, 100);

        let detector = ReorgDetector::new();
        assert_eq!(detector.detect(&chain, &store, &state).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lowest_mismatch_wins() {
        let store = MemoryStore::new();
        let chain = ScriptedChain::new(&[(98, "0xblk98"), (99, "0xblk99"), (100, "0xblk100")]);
        for block in 98u64..=100 {
            store
                .record_block_identifier(&source(), block, &format!("0xblk{block}"))
                .await
                .unwrap();
        }
        // The chain replaced blocks 99 and 100.
        chain.rewrite(99, "0xblk99b");
        chain.rewrite(100, "0xblk100b");
        let state = state_with(97, 100);

        let detector = ReorgDetector::new();
        assert_eq!(
            detector.detect(&chain, &store, &state).await.unwrap(),
            Some(99)
        );
    }

    #[tokio::test]
    async fn finalized_heights_are_not_reverified() {
        let store = MemoryStore::new();
        // Stored identifier at 98 disagrees with the chain, but 98 is
        // finalized — the detector must not look at it.
        let chain = ScriptedChain::new(&[(98, "0xevil"), (99, "0xblk99")]);
        store.record_block_identifier(&source(), 98, "0xblk98").await.unwrap();
        store.record_block_identifier(&source(), 99, "0xblk99").await.unwrap();
        let state = state_with(98, 99);

        let detector = ReorgDetector::new();
        assert_eq!(detector.detect(&chain, &store, &state).await.unwrap(), None);
    }

    #[tokio::test]
    async fn vanished_height_counts_as_divergence() {
        let store = MemoryStore::new();
        let chain = ScriptedChain::new(&[(99, "0xblk99")]);
        store.record_block_identifier(&source(), 99, "0xblk99").await.unwrap();
        store.record_block_identifier(&source(), 100, "0xblk100").await.unwrap();
        let state = state_with(98, 100);

        let detector = ReorgDetector::new();
        assert_eq!(
            detector.detect(&chain, &store, &state).await.unwrap(),
            Some(100)
        );
    }
}
