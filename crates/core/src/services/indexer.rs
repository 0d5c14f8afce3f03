//! Backward indexer - walks the chain from the tip down to genesis.
//!
//! One tick runs the state machine
//! `ReorgCheck → FetchTip → ComputeMode → FetchRange → PersistRange → AdvanceFrontier`.
//! Before the backward step, the head gap (heights above the indexer head,
//! e.g. produced while the process was down or rewound by a reorg) is
//! refilled forward.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{DomainError, IndexerError, IndexerResult};
use crate::metrics::{TickTimer, set_bulk_mode, set_sync_height};
use crate::models::{SyncDirection, SyncState};
use crate::ports::{ChainApi, FetchDirection, HeightRange, Repositories};

use super::block_sync::{BlockSyncService, RangeSyncOptions, WritePath};
use super::plugin_batch_processor::PluginBatchProcessorService;
use super::reorg::ReorgService;

// =============================================================================
// Planning
// =============================================================================

/// Backward sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Far from genesis: large ranges, several in parallel.
    Bulk,
    /// Close to genesis: one small range at a time.
    Normal,
}

/// Work selected for one backward step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub mode: SyncMode,
    pub batch_blocks: u64,
    pub workers: usize,
    /// Disjoint ranges, highest first.
    pub ranges: Vec<HeightRange>,
}

impl SyncPlan {
    /// Lowest height covered by the plan.
    pub fn lowest(&self) -> Option<u64> {
        self.ranges.iter().map(|r| r.from).min()
    }

    /// Frontier stored once every range succeeded: `start - 1`, or `0`
    /// when genesis was part of the plan.
    pub fn next_frontier(&self) -> Option<u64> {
        self.lowest().map(|start| start.saturating_sub(1))
    }
}

/// Plan the next backward step from `backward_synced_height` down.
///
/// The frontier is the highest height not yet backfilled, so the plan ends
/// at it. Height 1 never starts a range: genesis is folded into the lowest
/// range so that a frontier of `0` always means genesis is mirrored.
/// Returns `None` once the frontier is `0`.
pub fn plan_backward(config: &SyncConfig, backward_synced_height: u64) -> Option<SyncPlan> {
    if backward_synced_height == 0 {
        return None;
    }
    let remaining = backward_synced_height;
    let end = backward_synced_height;

    let (mode, batch_blocks, workers) = if remaining > config.bulk_mode_threshold {
        (
            SyncMode::Bulk,
            config.bulk_batch_blocks,
            config.bulk_parallel_workers,
        )
    } else {
        (SyncMode::Normal, config.normal_batch_blocks, 1)
    };

    let span = batch_blocks.saturating_mul(workers as u64);
    let start = end.saturating_sub(span.saturating_sub(1));
    let mut ranges = HeightRange { from: start, to: end }.split_descending(batch_blocks);
    if let Some(lowest) = ranges.last_mut()
        && lowest.from == 1
    {
        lowest.from = 0;
    }

    Some(SyncPlan {
        mode,
        batch_blocks,
        workers,
        ranges,
    })
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still running.
    Skipped,
    /// Backfill already reached genesis.
    Complete,
    /// The backward frontier moved to `backward_synced_height`.
    Progressed { backward_synced_height: u64 },
}

impl TickOutcome {
    /// Whether backward work remains, so the next tick should start now.
    pub fn has_more_work(&self) -> bool {
        matches!(self, Self::Progressed { backward_synced_height } if *backward_synced_height > 0)
    }
}

// =============================================================================
// IndexerService
// =============================================================================

/// Backward sync loop.
///
/// # Frontiers
///
/// `backward_synced_height` is the highest height the backfill still owes:
/// every height above it up to `indexer_head_height` is in the store. On
/// first run both are seeded at the tip and the backfill walks down until
/// the frontier is `0`, genesis included.
pub struct IndexerService {
    config: SyncConfig,
    chain: Arc<dyn ChainApi>,
    repositories: Arc<dyn Repositories>,
    block_sync: Arc<BlockSyncService>,
    reorg: Arc<ReorgService>,
    processor: Arc<PluginBatchProcessorService>,
    guard: Semaphore,
}

impl IndexerService {
    pub fn new(
        config: SyncConfig,
        chain: Arc<dyn ChainApi>,
        repositories: Arc<dyn Repositories>,
        block_sync: Arc<BlockSyncService>,
        reorg: Arc<ReorgService>,
        processor: Arc<PluginBatchProcessorService>,
    ) -> Self {
        Self {
            config,
            chain,
            repositories,
            block_sync,
            reorg,
            processor,
            guard: Semaphore::new(1),
        }
    }

    /// Run ticks until shutdown.
    ///
    /// A tick that leaves backward work starts the next one immediately;
    /// otherwise the loop waits `sync_interval`. Tick errors are logged and
    /// retried from the persisted frontier on the next tick.
    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) -> IndexerResult<()> {
        info!("⏪ Starting backward indexer");

        loop {
            if *shutdown_rx.borrow() {
                debug!("Shutdown requested");
                return Err(IndexerError::ShutdownRequested);
            }

            let more_work = match self.tick().await {
                Ok(outcome) => outcome.has_more_work(),
                Err(e) => {
                    error!(error = ?e, "❌ Backward tick failed");
                    false
                }
            };
            if more_work {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.sync_interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Err(IndexerError::ShutdownRequested);
                    }
                }
            }
        }
    }

    /// Run one tick. Overlapping calls are skipped.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> IndexerResult<TickOutcome> {
        let Ok(_permit) = self.guard.try_acquire() else {
            debug!("Backward tick already running, skipping");
            return Ok(TickOutcome::Skipped);
        };
        let _timer = TickTimer::new();

        let tip = self.chain.tip_height().await?;
        self.ensure_state(tip).await?;

        // ReorgCheck
        self.reorg.check_and_handle(tip).await?;

        // FetchTip
        self.repositories.sync_state().raise_tip(tip).await?;
        set_sync_height("tip", tip);
        let state = self.load_state().await?;

        self.fill_head_gap(&state, tip).await?;

        let backward = state.backward_synced_height.unwrap_or(tip);
        let Some(plan) = plan_backward(&self.config, backward) else {
            if state.is_bulk_mode {
                self.switch_mode(false).await?;
                info!("🔀 Backfill complete, leaving bulk mode");
            }
            debug!("Backfill complete");
            return Ok(TickOutcome::Complete);
        };

        // ComputeMode
        let bulk = plan.mode == SyncMode::Bulk;
        if bulk != state.is_bulk_mode {
            self.switch_mode(bulk).await?;
            info!(mode = ?plan.mode, remaining = backward, "🔀 Backward mode changed");
        }

        // FetchRange + PersistRange
        match plan.mode {
            SyncMode::Bulk => self.sync_wave(&plan).await?,
            SyncMode::Normal => self.sync_sequential(&plan).await?,
        }

        // AdvanceFrontier
        let frontier = plan
            .next_frontier()
            .ok_or_else(|| IndexerError::Internal("empty backward plan".into()))?;
        self.repositories.sync_state().lower_backward(frontier).await?;
        set_sync_height("backward", frontier);
        info!(
            backward = frontier,
            mode = ?plan.mode,
            "⏪ Backward frontier advanced"
        );

        Ok(TickOutcome::Progressed {
            backward_synced_height: frontier,
        })
    }

    async fn switch_mode(&self, bulk: bool) -> IndexerResult<()> {
        self.repositories.sync_state().set_bulk_mode(bulk).await?;
        self.processor.invalidate_cache();
        set_bulk_mode(bulk);
        Ok(())
    }

    /// Create the sync state on first run and fill unset frontiers.
    async fn ensure_state(&self, tip: u64) -> IndexerResult<()> {
        let store = self.repositories.sync_state();
        let state = match store.get().await? {
            Some(state) => state,
            None => {
                info!(tip, "🆕 First run, seeding frontiers at the tip");
                store
                    .init(&SyncState {
                        tip_height: tip,
                        backward_synced_height: Some(tip),
                        live_synced_height: Some(tip),
                        indexer_head_height: Some(tip),
                        ..SyncState::empty()
                    })
                    .await?
            }
        };

        if state.backward_synced_height.is_none() {
            store.lower_backward(tip).await?;
        }
        if state.indexer_head_height.is_none() {
            store.raise_indexer_head(tip).await?;
        }
        if state.live_synced_height.is_none() {
            store.raise_live(tip).await?;
        }
        Ok(())
    }

    async fn load_state(&self) -> IndexerResult<SyncState> {
        self.repositories
            .sync_state()
            .get()
            .await?
            .ok_or_else(|| DomainError::SyncStateMissing.into())
    }

    /// Sync `indexer_head + 1 ..= tip` forward, advancing the head after each
    /// range.
    async fn fill_head_gap(&self, state: &SyncState, tip: u64) -> IndexerResult<()> {
        let head = state.indexer_head_height.unwrap_or(tip);
        if tip <= head {
            return Ok(());
        }

        let gap = HeightRange {
            from: head + 1,
            to: tip,
        };
        info!(from = gap.from, to = gap.to, "⏩ Filling head gap");

        let mut ranges = gap.split_descending(self.config.normal_batch_blocks);
        ranges.reverse();
        for range in ranges {
            self.block_sync
                .sync_range(
                    range,
                    RangeSyncOptions {
                        fetch: FetchDirection::Forward,
                        write: WritePath::Upsert { emit_created: true },
                        dispatch: Some(SyncDirection::Backward),
                    },
                )
                .await?;
            let store = self.repositories.sync_state();
            store.raise_indexer_head(range.to).await?;
            store.raise_last_synced(range.to).await?;
            set_sync_height("indexer_head", range.to);
        }
        Ok(())
    }

    /// Normal mode: ranges one after the other, upsert path.
    async fn sync_sequential(&self, plan: &SyncPlan) -> IndexerResult<()> {
        for range in &plan.ranges {
            self.block_sync
                .sync_range(
                    *range,
                    RangeSyncOptions {
                        fetch: FetchDirection::Backward,
                        write: WritePath::Upsert { emit_created: true },
                        dispatch: Some(SyncDirection::Backward),
                    },
                )
                .await?;
            self.repositories
                .sync_state()
                .raise_last_synced(range.to)
                .await?;
        }
        Ok(())
    }

    /// Bulk mode: one wave of parallel ranges, bulk path. One failing range
    /// fails the wave and the frontier stays put.
    async fn sync_wave(&self, plan: &SyncPlan) -> IndexerResult<()> {
        let options = RangeSyncOptions {
            fetch: FetchDirection::Backward,
            write: WritePath::Bulk,
            dispatch: Some(SyncDirection::Backward),
        };

        let results = try_join_all(
            plan.ranges
                .iter()
                .map(|range| self.block_sync.sync_range(*range, options)),
        )
        .await
        .inspect_err(|e| warn!(error = %e, ranges = plan.ranges.len(), "⚠️  Bulk wave failed"))?;

        let written: u64 = results.iter().map(|r| r.written).sum();
        let duplicates: u64 = results.iter().map(|r| r.duplicates).sum();
        debug!(written, duplicates, ranges = results.len(), "Bulk wave persisted");

        if let Some(highest) = plan.ranges.iter().map(|r| r.to).max() {
            self.repositories
                .sync_state()
                .raise_last_synced(highest)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::events::TransactionEvents;
    use crate::ports::Plugin;
    use crate::services::plugin_failed_transaction::PluginFailedTransactionService;
    use crate::services::plugin_registry::PluginRegistryService;
    use crate::testing::{InMemoryRepositories, MockChain, RecordingPlugin};

    struct Harness {
        chain: Arc<MockChain>,
        repos: Arc<InMemoryRepositories>,
        plugin: Arc<RecordingPlugin>,
        indexer: IndexerService,
    }

    async fn harness(chain: MockChain, config: SyncConfig) -> Harness {
        let chain = Arc::new(chain);
        let repos = Arc::new(InMemoryRepositories::new());
        let plugin = Arc::new(RecordingPlugin::new("rec", 1));
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
        let reorg = Arc::new(ReorgService::new(
            chain.clone(),
            repos.clone(),
            processor.clone(),
            config.reorg_depth,
        ));
        let indexer = IndexerService::new(
            config,
            chain.clone(),
            repos.clone(),
            block_sync,
            reorg,
            processor,
        );
        Harness {
            chain,
            repos,
            plugin,
            indexer,
        }
    }

    fn small_config() -> SyncConfig {
        SyncConfig {
            reorg_depth: 10,
            normal_batch_blocks: 10,
            bulk_batch_blocks: 25,
            bulk_parallel_workers: 2,
            bulk_mode_threshold: 40,
            sync_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    // Test critique: seuil 100, reste 5000 → mode bulk avec la taille et la largeur configurées
    #[test]
    fn far_from_genesis_plans_bulk_with_configured_width() {
        let config = SyncConfig {
            bulk_mode_threshold: 100,
            bulk_batch_blocks: 1000,
            bulk_parallel_workers: 4,
            ..Default::default()
        };

        let plan = plan_backward(&config, 5000).unwrap();

        assert_eq!(plan.mode, SyncMode::Bulk);
        assert_eq!(plan.batch_blocks, 1000);
        assert_eq!(plan.workers, 4);
        assert_eq!(
            plan.ranges,
            vec![
                HeightRange { from: 4001, to: 5000 },
                HeightRange { from: 3001, to: 4000 },
                HeightRange { from: 2001, to: 3000 },
                HeightRange { from: 1001, to: 2000 },
            ]
        );
        assert!(plan.ranges.iter().all(|r| r.len() == 1000));
        assert_eq!(plan.next_frontier(), Some(1000));
    }

    #[test]
    fn close_to_genesis_plans_one_normal_range() {
        let config = SyncConfig::default();
        let plan = plan_backward(&config, 50).unwrap();

        assert_eq!(plan.mode, SyncMode::Normal);
        assert_eq!(plan.ranges, vec![HeightRange { from: 0, to: 50 }]);
        assert_eq!(plan.next_frontier(), Some(0));
        assert!(plan_backward(&config, 0).is_none());
    }

    // Test critique: la frontière stockée vaut début de plage - 1
    #[test]
    fn frontier_moves_to_range_start_minus_one() {
        let config = SyncConfig {
            normal_batch_blocks: 10,
            ..Default::default()
        };

        let plan = plan_backward(&config, 31).unwrap();

        assert_eq!(plan.ranges, vec![HeightRange { from: 22, to: 31 }]);
        assert_eq!(plan.next_frontier(), Some(21));
    }

    #[test]
    fn genesis_is_folded_into_the_last_range() {
        let config = SyncConfig {
            normal_batch_blocks: 10,
            ..Default::default()
        };

        let plan = plan_backward(&config, 10).unwrap();

        // Jamais de plage commençant à 1 : la genèse serait oubliée
        assert_eq!(plan.ranges, vec![HeightRange { from: 0, to: 10 }]);
        assert_eq!(plan.next_frontier(), Some(0));
    }

    #[tokio::test]
    async fn first_tick_seeds_frontiers_and_syncs_below_tip() {
        let h = harness(MockChain::generate(30, 1), small_config()).await;

        let outcome = h.indexer.tick().await.unwrap();

        assert_eq!(
            outcome,
            TickOutcome::Progressed {
                backward_synced_height: 20
            }
        );
        let state = h.repos.sync_state_snapshot().unwrap();
        assert_eq!(state.tip_height, 30);
        assert_eq!(state.indexer_head_height, Some(30));
        assert_eq!(state.live_synced_height, Some(30));
        assert_eq!(state.backward_synced_height, Some(20));
        assert!(h.repos.transaction("th_21_0").is_some());
        assert!(h.repos.transaction("th_20_0").is_none());
        assert_eq!(state.last_synced_height, 30);
        assert!(!state.is_bulk_mode);
        assert_eq!(h.repos.all_transactions().len(), 10);
    }

    // Test critique: la frontière arrière ne fait que descendre, jusqu'à 0
    #[tokio::test]
    async fn backward_frontier_is_non_increasing_until_complete() {
        let h = harness(MockChain::generate(120, 1), small_config()).await;
        let mut previous = u64::MAX;

        loop {
            let outcome = h.indexer.tick().await.unwrap();
            let backward = h.repos.sync_state_snapshot().unwrap().backward_synced_height.unwrap();
            assert!(backward <= previous);
            previous = backward;
            if !outcome.has_more_work() {
                break;
            }
        }

        assert_eq!(previous, 0);
        assert_eq!(h.repos.all_transactions().len(), 121);
        assert_eq!(h.indexer.tick().await.unwrap(), TickOutcome::Complete);
        assert_eq!(h.plugin.processed_hashes().len(), 121);
    }

    #[tokio::test]
    async fn bulk_wave_requests_configured_ranges_and_persists_mode() {
        let h = harness(MockChain::generate(200, 1), small_config()).await;

        h.indexer.tick().await.unwrap();

        let state = h.repos.sync_state_snapshot().unwrap();
        assert!(state.is_bulk_mode);
        assert_eq!(state.backward_synced_height, Some(150));
        let mut calls = h.chain.transaction_calls();
        calls.sort_by_key(|r| r.from);
        assert_eq!(
            calls,
            vec![HeightRange { from: 151, to: 175 }, HeightRange { from: 176, to: 200 }]
        );
    }

    #[tokio::test]
    async fn failing_range_leaves_frontier_untouched() {
        let h = harness(MockChain::generate(200, 1), small_config()).await;
        h.chain.fail_transactions_at(160);

        assert!(h.indexer.tick().await.is_err());
        assert_eq!(
            h.repos.sync_state_snapshot().unwrap().backward_synced_height,
            Some(200)
        );

        h.chain.heal();
        h.indexer.tick().await.unwrap();
        assert_eq!(
            h.repos.sync_state_snapshot().unwrap().backward_synced_height,
            Some(150)
        );
    }

    // Test critique: un backfill terminé en mode bulk quitte le mode bulk
    #[tokio::test]
    async fn completed_backfill_clears_bulk_mode() {
        let config = SyncConfig {
            bulk_mode_threshold: 0,
            ..small_config()
        };
        let h = harness(MockChain::generate(60, 1), config).await;

        while h.indexer.tick().await.unwrap().has_more_work() {}
        assert!(h.repos.sync_state_snapshot().unwrap().is_bulk_mode);

        assert_eq!(h.indexer.tick().await.unwrap(), TickOutcome::Complete);
        let state = h.repos.sync_state_snapshot().unwrap();
        assert!(!state.is_bulk_mode);
        assert!(state.backward_complete());
        assert_eq!(h.repos.all_transactions().len(), 61);
    }

    #[tokio::test]
    async fn new_blocks_above_head_are_filled_forward() {
        let h = harness(MockChain::generate(30, 1), small_config()).await;
        h.indexer.tick().await.unwrap();

        h.chain.extend_to(34);
        h.indexer.tick().await.unwrap();

        let state = h.repos.sync_state_snapshot().unwrap();
        assert_eq!(state.indexer_head_height, Some(34));
        assert_eq!(state.tip_height, 34);
        assert!(h.repos.key_block_at(34).is_some());
        assert!(h.repos.transaction("th_33_0").is_some());
    }

    // Test critique: après un reorg, le trou au-dessus de la tête est recomblé
    #[tokio::test]
    async fn reorg_rewind_is_refilled_by_head_gap() {
        let h = harness(MockChain::generate(30, 1), small_config()).await;
        h.indexer.tick().await.unwrap();

        h.chain.reorg_from(27, "_fork");
        h.indexer.tick().await.unwrap();

        let state = h.repos.sync_state_snapshot().unwrap();
        assert_eq!(state.indexer_head_height, Some(30));
        assert_eq!(h.repos.key_block_at(28).unwrap().hash, "kh_28_fork");
        assert!(h.repos.transaction("th_28_0").is_none());
        assert!(h.repos.transaction("th_28_0_fork").is_some());
        assert_eq!(h.plugin.reorg_calls().len(), 1);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let h = harness(MockChain::generate(5, 1), small_config()).await;
        let _held = h.indexer.guard.try_acquire().unwrap();

        assert_eq!(h.indexer.tick().await.unwrap(), TickOutcome::Skipped);
        assert!(h.repos.sync_state_snapshot().is_none());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(MockChain::generate(5, 1), small_config()).await;
        let (tx, rx) = tokio::sync::watch::channel(false);

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };
        let (result, _) = tokio::join!(h.indexer.run(rx), stopper);

        assert!(matches!(result, Err(IndexerError::ShutdownRequested)));
        assert_eq!(
            h.repos.sync_state_snapshot().unwrap().backward_synced_height,
            Some(0)
        );
    }
}
