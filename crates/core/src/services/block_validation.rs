//! Periodic revalidation of the most recent heights.
//!
//! Every `validation_interval` the last `reorg_depth` heights are fetched
//! again and upserted. Transactions stored locally but no longer served by
//! the chain are deleted and reported to plugins as removed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{IndexerError, IndexerResult};
use crate::metrics::record_transactions_removed;
use crate::models::SyncDirection;
use crate::ports::{ChainApi, FetchDirection, HeightRange, Repositories};

use super::block_sync::{BlockSyncService, RangeSyncOptions, WritePath};
use super::plugin_batch_processor::PluginBatchProcessorService;

/// Outcome of one validation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub window: Option<HeightRange>,
    pub heights_checked: u64,
    pub heights_failed: u64,
    /// Local transactions the chain no longer serves.
    pub stale_removed: Vec<String>,
    pub transactions_replayed: u64,
}

/// Re-syncs the recent window and prunes stale transactions.
pub struct BlockValidationService {
    chain: Arc<dyn ChainApi>,
    repositories: Arc<dyn Repositories>,
    block_sync: Arc<BlockSyncService>,
    processor: Arc<PluginBatchProcessorService>,
    depth: u64,
    guard: Semaphore,
}

impl BlockValidationService {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        repositories: Arc<dyn Repositories>,
        block_sync: Arc<BlockSyncService>,
        processor: Arc<PluginBatchProcessorService>,
        depth: u64,
    ) -> Self {
        Self {
            chain,
            repositories,
            block_sync,
            processor,
            depth,
            guard: Semaphore::new(1),
        }
    }

    /// Heights revalidated for a given tip.
    pub fn window(&self, tip: u64) -> Option<HeightRange> {
        if self.depth == 0 {
            return None;
        }
        let from = tip.saturating_sub(self.depth - 1);
        HeightRange::new(from, tip).ok()
    }

    /// Revalidate the window below the current tip.
    #[instrument(skip(self))]
    pub async fn validate(&self) -> IndexerResult<ValidationReport> {
        let Ok(_permit) = self.guard.try_acquire() else {
            debug!("Validation already running, skipping");
            return Err(IndexerError::AlreadyRunning);
        };

        let tip = self.chain.tip_height().await?;
        let Some(window) = self.window(tip) else {
            return Ok(ValidationReport::default());
        };

        let mut report = ValidationReport {
            window: Some(window),
            ..Default::default()
        };
        for height in window.from..=window.to {
            report.heights_checked += 1;
            if let Err(e) = self.validate_height(height, &mut report).await {
                report.heights_failed += 1;
                error!(height, error = ?e, "❌ Height revalidation failed");
            }
        }

        if report.stale_removed.is_empty() {
            debug!(window = %window, "Recent window is consistent");
        } else {
            info!(
                window = %window,
                removed = report.stale_removed.len(),
                "🧹 Stale transactions pruned"
            );
        }
        Ok(report)
    }

    async fn validate_height(&self, height: u64, report: &mut ValidationReport) -> IndexerResult<()> {
        let store = self.repositories.transactions();
        let local = store.hashes_at_height(height).await?;

        let synced = self
            .block_sync
            .sync_range(
                HeightRange::single(height),
                RangeSyncOptions {
                    fetch: FetchDirection::Forward,
                    write: WritePath::Upsert {
                        emit_created: false,
                    },
                    dispatch: None,
                },
            )
            .await?;

        let fresh: HashSet<&str> = synced.transactions.iter().map(|tx| tx.hash.as_str()).collect();
        let stale: Vec<String> = local
            .into_iter()
            .filter(|hash| !fresh.contains(hash.as_str()))
            .collect();

        if !stale.is_empty() {
            warn!(height, count = stale.len(), "⚠️  Local transactions missing upstream");
            let removed = store.delete_transactions(&stale).await?;
            record_transactions_removed(removed);
            self.processor.handle_reorg(&stale).await;
            report.stale_removed.extend(stale);
        }

        self.processor
            .process(&synced.transactions, SyncDirection::Backward)
            .await;
        report.transactions_replayed += synced.transactions.len() as u64;
        Ok(())
    }

    /// Validate every `interval` until shutdown.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> IndexerResult<()> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                return Err(IndexerError::ShutdownRequested);
            }
            match self.validate().await {
                Ok(_) | Err(IndexerError::AlreadyRunning) => {}
                Err(e) => error!(error = ?e, "❌ Validation pass failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::events::TransactionEvents;
    use crate::ports::Plugin;
    use crate::services::plugin_failed_transaction::PluginFailedTransactionService;
    use crate::services::plugin_registry::PluginRegistryService;
    use crate::testing::{InMemoryRepositories, MockChain, RecordingPlugin, spend_tx};

    struct Harness {
        chain: Arc<MockChain>,
        repos: Arc<InMemoryRepositories>,
        plugin: Arc<RecordingPlugin>,
        service: BlockValidationService,
    }

    async fn harness(tip: u64, depth: u64) -> Harness {
        harness_with(tip, depth, RecordingPlugin::new("rec", 1)).await
    }

    async fn harness_with(tip: u64, depth: u64, plugin: RecordingPlugin) -> Harness {
        let chain = Arc::new(MockChain::generate(tip, 2));
        let repos = Arc::new(InMemoryRepositories::new());
        for h in 0..=tip {
            repos.insert_key_blocks(&[chain.key_block_at(h).unwrap()]);
            repos.insert_transactions(&chain.transactions_at(h));
        }
        let plugin = Arc::new(plugin);
        let registry =
            Arc::new(PluginRegistryService::new(vec![plugin.clone() as Arc<dyn Plugin>]).unwrap());
        registry.bootstrap(repos.as_ref()).await.unwrap();
        let failed = Arc::new(PluginFailedTransactionService::new(repos.clone(), registry.clone()));
        let processor = Arc::new(PluginBatchProcessorService::new(repos.clone(), registry, failed));
        let block_sync = Arc::new(BlockSyncService::new(
            chain.clone(),
            repos.clone(),
            processor.clone(),
            TransactionEvents::default(),
        ));
        let service =
            BlockValidationService::new(chain.clone(), repos.clone(), block_sync, processor, depth);
        Harness {
            chain,
            repos,
            plugin,
            service,
        }
    }

    #[tokio::test]
    async fn window_covers_last_depth_heights() {
        let h = harness(0, 10).await;
        assert_eq!(h.service.window(50), Some(HeightRange { from: 41, to: 50 }));
        assert_eq!(h.service.window(3), Some(HeightRange { from: 0, to: 3 }));
    }

    // Test critique: une transaction locale absente en amont est supprimée et signalée
    #[tokio::test]
    async fn transaction_missing_upstream_is_pruned_and_reported() {
        let h = harness(20, 5).await;
        let mut served = h.chain.transactions_at(18);
        served.retain(|tx| tx.hash != "th_18_1");
        served.push(spend_tx("th_18_new", 18, "ak_x", "ak_y"));
        h.chain.set_transactions(18, served);

        let report = h.service.validate().await.unwrap();

        assert_eq!(report.window, Some(HeightRange { from: 16, to: 20 }));
        assert_eq!(report.stale_removed, vec!["th_18_1".to_string()]);
        assert_eq!(report.heights_failed, 0);
        assert!(h.repos.transaction("th_18_1").is_none());
        assert!(h.repos.transaction("th_18_new").is_some());
        assert_eq!(h.plugin.reorg_calls(), vec![vec!["th_18_1".to_string()]]);
    }

    #[tokio::test]
    async fn every_fresh_transaction_is_replayed_backward() {
        let h = harness(20, 3).await;

        let report = h.service.validate().await.unwrap();

        assert_eq!(report.transactions_replayed, 6);
        assert!(report.stale_removed.is_empty());
        assert!(h.plugin.batches().iter().all(|(d, _)| *d == SyncDirection::Backward));
        assert_eq!(h.plugin.processed_hashes().len(), 6);
    }

    // Test critique: une deuxième passe ne relance pas les décodeurs
    #[tokio::test]
    async fn repeated_pass_does_not_decode_again() {
        let h = harness_with(20, 3, RecordingPlugin::new("rec", 1).with_decoder()).await;

        h.service.validate().await.unwrap();
        let decoded = h.plugin.decode_calls();
        assert_eq!(decoded, 6);

        h.service.validate().await.unwrap();
        assert_eq!(h.plugin.decode_calls(), decoded);
        assert_eq!(h.plugin.processed_hashes().len(), 12);
    }

    #[tokio::test]
    async fn failing_height_does_not_abort_window() {
        let h = harness(20, 4).await;
        h.chain.fail_transactions_at(18);

        let report = h.service.validate().await.unwrap();

        assert_eq!(report.heights_checked, 4);
        assert_eq!(report.heights_failed, 1);
        assert_eq!(report.transactions_replayed, 6);
    }

    #[tokio::test]
    async fn overlapping_pass_is_rejected() {
        let h = harness(5, 3).await;
        let _held = h.service.guard.try_acquire().unwrap();
        assert!(matches!(h.service.validate().await, Err(IndexerError::AlreadyRunning)));
    }
}
