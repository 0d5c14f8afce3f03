//! Chain reorganization detection and recovery.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::IndexerResult;
use crate::metrics::{record_reorg_detected, record_transactions_removed};
use crate::ports::{ChainApi, FetchDirection, HeightRange, ReorgPurge, Repositories};

use super::plugin_batch_processor::PluginBatchProcessorService;

/// Compares recent stored key blocks with the chain and rolls back on
/// divergence.
pub struct ReorgService {
    chain: Arc<dyn ChainApi>,
    repositories: Arc<dyn Repositories>,
    processor: Arc<PluginBatchProcessorService>,
    reorg_depth: u64,
}

impl ReorgService {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        repositories: Arc<dyn Repositories>,
        processor: Arc<PluginBatchProcessorService>,
        reorg_depth: u64,
    ) -> Self {
        Self {
            chain,
            repositories,
            processor,
            reorg_depth,
        }
    }

    /// Heights compared against the chain for a given tip.
    pub fn scan_window(&self, tip: u64, last_synced_height: u64) -> Option<HeightRange> {
        let from = tip.saturating_sub(self.reorg_depth).max(1);
        let to = tip.min(last_synced_height);
        HeightRange::new(from, to).ok()
    }

    /// Lowest height whose stored key block differs from the chain.
    #[instrument(skip(self))]
    pub async fn find_divergence(&self, tip: u64) -> IndexerResult<Option<u64>> {
        let Some(state) = self.repositories.sync_state().get().await? else {
            return Ok(None);
        };
        let Some(window) = self.scan_window(tip, state.last_synced_height) else {
            return Ok(None);
        };

        let local = self.repositories.blocks().key_block_hashes(window).await?;
        if local.is_empty() {
            return Ok(None);
        }

        let mut remote = std::collections::BTreeMap::new();
        let mut next: Option<String> = None;
        loop {
            let page = self
                .chain
                .key_blocks(window, FetchDirection::Forward, next.as_deref())
                .await?;
            remote.extend(page.data.into_iter().map(|kb| (kb.height, kb.hash)));
            match page.next {
                Some(cursor) => next = Some(cursor),
                None => break,
            }
        }

        Ok(local
            .iter()
            .find(|(height, hash)| remote.get(*height) != Some(*hash))
            .map(|(height, _)| *height))
    }

    /// Detect and recover from a reorg. Returns whether one occurred.
    ///
    /// The purge and frontier rewind run in one store transaction; a failure
    /// rolls everything back and propagates. Plugins are notified after
    /// commit and their failures are only logged.
    #[instrument(skip(self))]
    pub async fn check_and_handle(&self, tip: u64) -> IndexerResult<bool> {
        let Some(divergence) = self.find_divergence(tip).await? else {
            debug!("No divergence in reorg window");
            return Ok(false);
        };

        warn!(divergence, tip, "🔄 Reorg detected");
        record_reorg_detected();

        let purge: ReorgPurge = self
            .repositories
            .purge_from_height_atomic(divergence)
            .await?;
        record_transactions_removed(purge.removed_hashes.len() as u64);

        info!(
            divergence,
            transactions = purge.removed_hashes.len(),
            key_blocks = purge.key_blocks_deleted,
            micro_blocks = purge.micro_blocks_deleted,
            plugins = purge.plugins_rewound,
            "🔄 Reorg handled"
        );

        self.processor.handle_reorg(&purge.removed_hashes).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::{PluginSyncState, SyncState};
    use crate::ports::Plugin;
    use crate::services::plugin_failed_transaction::PluginFailedTransactionService;
    use crate::services::plugin_registry::PluginRegistryService;
    use crate::testing::{InMemoryRepositories, MockChain, RecordingPlugin};

    struct Harness {
        chain: Arc<MockChain>,
        repos: Arc<InMemoryRepositories>,
        plugin: Arc<RecordingPlugin>,
        service: ReorgService,
    }

    /// Store mirroring heights 0..=tip of a fresh chain.
    async fn synced_harness(tip: u64, depth: u64) -> Harness {
        let chain = Arc::new(MockChain::generate(tip, 2));
        let repos = Arc::new(InMemoryRepositories::new());
        for h in 0..=tip {
            repos.insert_key_blocks(&[chain.key_block_at(h).unwrap()]);
            repos.insert_transactions(&chain.transactions_at(h));
        }
        repos.seed_sync_state(SyncState {
            last_synced_height: tip,
            tip_height: tip,
            backward_synced_height: Some(0),
            live_synced_height: Some(tip),
            indexer_head_height: Some(tip),
            ..SyncState::empty()
        });

        let plugin = Arc::new(RecordingPlugin::new("rec", 1));
        let registry =
            Arc::new(PluginRegistryService::new(vec![plugin.clone() as Arc<dyn Plugin>]).unwrap());
        repos.seed_plugin_state(PluginSyncState {
            plugin_name: "rec".into(),
            version: 1,
            last_synced_height: tip,
            backward_synced_height: Some(0),
            live_synced_height: Some(tip),
            start_from_height: 0,
            updated_at: Utc::now(),
        });
        let failed = Arc::new(PluginFailedTransactionService::new(repos.clone(), registry.clone()));
        let processor = Arc::new(PluginBatchProcessorService::new(repos.clone(), registry, failed));
        let service = ReorgService::new(chain.clone(), repos.clone(), processor, depth);
        Harness {
            chain,
            repos,
            plugin,
            service,
        }
    }

    #[test]
    fn scan_window_is_clamped_to_genesis_and_last_synced() {
        let chain = Arc::new(MockChain::generate(0, 0));
        let repos = Arc::new(InMemoryRepositories::new());
        let registry = Arc::new(PluginRegistryService::new(vec![]).unwrap());
        let failed = Arc::new(PluginFailedTransactionService::new(repos.clone(), registry.clone()));
        let processor = Arc::new(PluginBatchProcessorService::new(repos.clone(), registry, failed));
        let service = ReorgService::new(chain, repos, processor, 100);

        assert_eq!(service.scan_window(50, 50), Some(HeightRange { from: 1, to: 50 }));
        assert_eq!(service.scan_window(1_000, 950), Some(HeightRange { from: 900, to: 950 }));
        assert_eq!(service.scan_window(1_000, 800), None);
    }

    #[tokio::test]
    async fn identical_chains_report_no_reorg() {
        let h = synced_harness(30, 10).await;
        assert!(!h.service.check_and_handle(30).await.unwrap());
        assert!(h.plugin.reorg_calls().is_empty());
    }

    // Test critique: après un reorg, aucune ligne de l'ancienne chaîne ne subsiste au-dessus de d
    #[tokio::test]
    async fn divergence_purges_old_chain_and_notifies_exact_removed_set() {
        let h = synced_harness(30, 10).await;
        h.chain.reorg_from(25, "_fork");

        let mut expected: Vec<String> = (25..=30)
            .flat_map(|height| (0..2).map(move |j| format!("th_{height}_{j}")))
            .collect();
        expected.sort();

        assert!(h.service.check_and_handle(30).await.unwrap());

        assert!(h.repos.all_transactions().iter().all(|tx| tx.block_height < 25));
        assert!(h.repos.key_block_at(25).is_none());
        assert!(h.repos.key_block_at(24).is_some());

        let state = h.repos.sync_state_snapshot().unwrap();
        assert_eq!(state.last_synced_height, 24);
        assert_eq!(state.live_synced_height, Some(24));
        assert_eq!(state.indexer_head_height, Some(24));
        assert_eq!(state.backward_synced_height, Some(0));

        let plugin_state = h.repos.plugin_state("rec").unwrap();
        assert_eq!(plugin_state.last_synced_height, 24);
        assert_eq!(plugin_state.live_synced_height, Some(24));

        let calls = h.plugin.reorg_calls();
        assert_eq!(calls.len(), 1);
        let mut removed = calls[0].clone();
        removed.sort();
        assert_eq!(removed, expected);
    }

    #[tokio::test]
    async fn divergence_below_window_is_not_seen() {
        let h = synced_harness(30, 3).await;
        h.chain.reorg_from(20, "_deep");
        // Seules les hauteurs 27..=30 sont comparées, et elles diffèrent toutes
        assert_eq!(h.service.find_divergence(30).await.unwrap(), Some(27));
    }

    #[tokio::test]
    async fn purge_failure_rolls_back_and_propagates() {
        let h = synced_harness(30, 10).await;
        h.chain.reorg_from(28, "_fork");
        h.repos.fail_next_purge();

        assert!(h.service.check_and_handle(30).await.is_err());
        assert_eq!(h.repos.all_transactions().len(), 62);
        assert!(h.plugin.reorg_calls().is_empty());

        // Le tick suivant réessaie et réussit
        assert!(h.service.check_and_handle(30).await.unwrap());
    }
}
