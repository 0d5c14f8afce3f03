//! Version-upgrade backfill.
//!
//! After a plugin bumps its version, an operator can replay every stored
//! transaction matching the plugin's structural queries through it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{IndexerError, IndexerResult, PluginError};
use crate::models::{SyncDirection, TxCursor};
use crate::ports::{Plugin, Repositories, TransactionQuery};

use super::plugin_failed_transaction::PluginFailedTransactionService;
use super::plugin_registry::PluginRegistryService;

/// Counts of one upgrade backfill.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Stored transactions matching the upgrade queries.
    pub matched: u64,
    /// Delivered successfully.
    pub processed: u64,
    /// Recorded as dead letters.
    pub failed: u64,
}

/// Replays stored history into a single plugin.
pub struct PluginUpgradeService {
    repositories: Arc<dyn Repositories>,
    registry: Arc<PluginRegistryService>,
    failed: Arc<PluginFailedTransactionService>,
    batch_size: usize,
    running: Mutex<HashSet<String>>,
}

impl PluginUpgradeService {
    pub fn new(
        repositories: Arc<dyn Repositories>,
        registry: Arc<PluginRegistryService>,
        failed: Arc<PluginFailedTransactionService>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            repositories,
            registry,
            failed,
            batch_size: config.upgrade_batch_size.max(1),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Queries walked for `plugin`, bounded below by its start height.
    pub fn queries_for(plugin: &dyn Plugin) -> Vec<TransactionQuery> {
        plugin
            .update_queries()
            .into_iter()
            .map(|mut query| {
                query.height_gte = Some(query.height_gte.unwrap_or(plugin.start_from_height()));
                query
            })
            .collect()
    }

    /// Walk the stored transactions matching the plugin's upgrade queries in
    /// cursor order and deliver them with direction `Upgrade`.
    ///
    /// A failing batch is dead-lettered and the walk continues. A second
    /// call for the same plugin while one runs returns `AlreadyRunning`.
    #[instrument(skip(self))]
    pub async fn run_upgrade(&self, plugin_name: &str) -> IndexerResult<UpgradeReport> {
        let plugin = self
            .registry
            .get(plugin_name)
            .ok_or_else(|| PluginError::NotRegistered(plugin_name.to_string()))?
            .clone();
        let _running = RunningGuard::acquire(&self.running, plugin_name)?;

        let queries = Self::queries_for(plugin.as_ref());
        if queries.is_empty() {
            warn!(plugin = plugin_name, "⚠️  Plugin declares no upgrade query, nothing to replay");
            return Ok(UpgradeReport::default());
        }

        info!(plugin = plugin_name, version = plugin.version(), queries = queries.len(), "⬆️  Upgrade backfill started");

        let mut report = UpgradeReport::default();
        for (index, query) in queries.iter().enumerate() {
            self.walk_query(plugin.as_ref(), query, &queries[..index], &mut report)
                .await?;
        }

        info!(
            plugin = plugin_name,
            matched = report.matched,
            processed = report.processed,
            failed = report.failed,
            "⬆️  Upgrade backfill finished"
        );
        Ok(report)
    }

    /// Walk one query. Rows matching an `earlier` query were already
    /// delivered by that walk and are skipped.
    async fn walk_query(
        &self,
        plugin: &dyn Plugin,
        query: &TransactionQuery,
        earlier: &[TransactionQuery],
        report: &mut UpgradeReport,
    ) -> IndexerResult<()> {
        let mut cursor: Option<TxCursor> = None;

        loop {
            let page = self
                .repositories
                .transactions()
                .find_transactions(query, cursor.as_ref(), self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.cursor());
            let full_page = page.len() == self.batch_size;

            let batch: Vec<_> = page
                .into_iter()
                .filter(|tx| !earlier.iter().any(|q| q.matches(tx)))
                .collect();
            if !batch.is_empty() {
                report.matched += batch.len() as u64;
                match plugin.process_batch(&batch, SyncDirection::Upgrade).await {
                    Ok(()) => report.processed += batch.len() as u64,
                    Err(e) => {
                        warn!(plugin = plugin.name(), error = %e, count = batch.len(), "⚠️  Upgrade batch failed");
                        self.failed
                            .record_failures(plugin.name(), plugin.version(), &batch, &e)
                            .await?;
                        report.failed += batch.len() as u64;
                    }
                }
            }

            if !full_page {
                break;
            }
        }

        debug!(plugin = plugin.name(), ?query, "Upgrade query walked");
        Ok(())
    }
}

/// Marks a plugin as upgrading until dropped.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    name: String,
}

impl<'a> RunningGuard<'a> {
    fn acquire(running: &'a Mutex<HashSet<String>>, name: &str) -> IndexerResult<Self> {
        let mut set = running
            .lock()
            .map_err(|_| IndexerError::Internal("upgrade registry poisoned".into()))?;
        if !set.insert(name.to_string()) {
            return Err(IndexerError::AlreadyRunning);
        }
        Ok(Self {
            running,
            name: name.to_string(),
        })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.running.lock() {
            set.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PluginFilter;
    use crate::testing::{InMemoryRepositories, RecordingPlugin, contract_call_tx, spend_tx};

    fn setup(plugin: Arc<RecordingPlugin>, batch_size: usize) -> (Arc<InMemoryRepositories>, PluginUpgradeService) {
        let repos = Arc::new(InMemoryRepositories::new());
        let registry =
            Arc::new(PluginRegistryService::new(vec![plugin as Arc<dyn Plugin>]).unwrap());
        let failed = Arc::new(PluginFailedTransactionService::new(repos.clone(), registry.clone()));
        let config = SyncConfig {
            upgrade_batch_size: batch_size,
            ..Default::default()
        };
        let service = PluginUpgradeService::new(repos.clone(), registry, failed, &config);
        (repos, service)
    }

    fn dex_plugin() -> RecordingPlugin {
        RecordingPlugin::new("dex", 2).with_filters(vec![
            PluginFilter::tx_type("ContractCallTx").with_contract_ids(["ct_dex"]),
        ])
    }

    // Test critique: le chemin structurel retrouve les transactions que le fan-out ignore
    #[tokio::test]
    async fn structural_queries_replay_matching_history_in_cursor_order() {
        let plugin = Arc::new(dex_plugin());
        let (repos, service) = setup(plugin.clone(), 2);
        repos.insert_transactions(&[
            contract_call_tx("th_c", 30, "ct_dex", "swap"),
            contract_call_tx("th_a", 10, "ct_dex", "swap"),
            contract_call_tx("th_other", 15, "ct_nft", "mint"),
            spend_tx("th_spend", 12, "ak_a", "ak_b"),
            contract_call_tx("th_b", 20, "ct_dex", "add_liquidity"),
        ]);

        let report = service.run_upgrade("dex").await.unwrap();

        assert_eq!(
            report,
            UpgradeReport {
                matched: 3,
                processed: 3,
                failed: 0
            }
        );
        assert_eq!(plugin.processed_hashes(), vec!["th_a", "th_b", "th_c"]);
        assert!(plugin.batches().iter().all(|(d, _)| *d == SyncDirection::Upgrade));
        // Taille de lot 2: deux appels
        assert_eq!(plugin.attempts(), 2);
    }

    // Test critique: requêtes qui se chevauchent, chaque transaction livrée une seule fois
    #[tokio::test]
    async fn overlapping_queries_deliver_each_transaction_once() {
        let plugin = Arc::new(RecordingPlugin::new("dex", 2).with_filters(vec![
            PluginFilter::tx_type("ContractCallTx").with_contract_ids(["ct_dex"]),
            PluginFilter::tx_type("ContractCallTx").with_functions(["swap"]),
        ]));
        let (repos, service) = setup(plugin.clone(), 1);
        repos.insert_transactions(&[
            contract_call_tx("th_a", 10, "ct_dex", "swap"),
            contract_call_tx("th_n", 15, "ct_nft", "swap"),
            contract_call_tx("th_b", 20, "ct_dex", "add_liquidity"),
        ]);

        let report = service.run_upgrade("dex").await.unwrap();

        assert_eq!(report.matched, 3);
        assert_eq!(report.processed, 3);
        assert_eq!(plugin.processed_hashes(), vec!["th_a", "th_b", "th_n"]);
    }

    #[tokio::test]
    async fn start_height_bounds_the_walk() {
        let plugin = Arc::new(dex_plugin().with_start(20));
        let (repos, service) = setup(plugin.clone(), 10);
        repos.insert_transactions(&[
            contract_call_tx("th_a", 10, "ct_dex", "swap"),
            contract_call_tx("th_b", 20, "ct_dex", "swap"),
        ]);

        let report = service.run_upgrade("dex").await.unwrap();

        assert_eq!(report.matched, 1);
        assert_eq!(plugin.processed_hashes(), vec!["th_b"]);
    }

    #[tokio::test]
    async fn failing_batches_are_dead_lettered_and_walk_continues() {
        let plugin = Arc::new(dex_plugin().failing());
        let (repos, service) = setup(plugin.clone(), 1);
        repos.insert_transactions(&[
            contract_call_tx("th_a", 10, "ct_dex", "swap"),
            contract_call_tx("th_b", 20, "ct_dex", "swap"),
        ]);

        let report = service.run_upgrade("dex").await.unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(plugin.attempts(), 2);
        let letters = repos.dead_letters("dex");
        assert_eq!(letters.len(), 2);
        assert!(letters.iter().all(|l| l.version == 2));
    }

    #[tokio::test]
    async fn predicate_only_plugin_has_nothing_to_replay() {
        let plugin = Arc::new(RecordingPlugin::new("rec", 1));
        let (repos, service) = setup(plugin.clone(), 10);
        repos.insert_transactions(&[spend_tx("th_a", 1, "ak_a", "ak_b")]);

        assert_eq!(service.run_upgrade("rec").await.unwrap(), UpgradeReport::default());
        assert_eq!(plugin.attempts(), 0);
    }

    #[tokio::test]
    async fn unknown_or_busy_plugin_is_rejected() {
        let (_, service) = setup(Arc::new(dex_plugin()), 10);
        assert!(matches!(
            service.run_upgrade("nft").await,
            Err(IndexerError::Plugin(PluginError::NotRegistered(_)))
        ));

        let _guard = RunningGuard::acquire(&service.running, "dex").unwrap();
        assert!(matches!(service.run_upgrade("dex").await, Err(IndexerError::AlreadyRunning)));
    }
}
