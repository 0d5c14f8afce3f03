//! Plugin dead letters and version replay.
//!
//! A failed plugin batch is recorded per (plugin, transaction) at the
//! plugin's version. When a plugin ships a new version, failures recorded
//! at older versions are replayed against it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{IndexerError, IndexerResult, PluginError};
use crate::metrics::record_dead_letters;
use crate::models::{PluginFailedTransaction, SyncDirection, Transaction};
use crate::ports::Repositories;

use super::plugin_registry::{PluginRegistryService, VersionChange};

/// Dead letters replayed per `process_batch` call.
pub const RETRY_CHUNK_SIZE: usize = 50;

/// Outcome of a replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    /// Dead letters loaded for replay.
    pub attempted: u64,
    /// Replayed successfully and deleted.
    pub recovered: u64,
    /// Still failing, moved to the new version.
    pub still_failing: u64,
    /// Transaction no longer stored; dead letter deleted.
    pub missing: u64,
}

impl RetryReport {
    fn merge(&mut self, other: RetryReport) {
        self.attempted += other.attempted;
        self.recovered += other.recovered;
        self.still_failing += other.still_failing;
        self.missing += other.missing;
    }
}

/// Records plugin failures and replays them.
pub struct PluginFailedTransactionService {
    repositories: Arc<dyn Repositories>,
    registry: Arc<PluginRegistryService>,
    guard: Semaphore,
}

impl PluginFailedTransactionService {
    pub fn new(repositories: Arc<dyn Repositories>, registry: Arc<PluginRegistryService>) -> Self {
        Self {
            repositories,
            registry,
            guard: Semaphore::new(1),
        }
    }

    /// Record one dead letter per transaction at `version`.
    pub async fn record_failures(
        &self,
        plugin_name: &str,
        version: u32,
        txs: &[Transaction],
        error: &PluginError,
    ) -> IndexerResult<()> {
        let now = Utc::now();
        let message = error.to_string();
        let trace = format!("{error:?}");
        let records: Vec<PluginFailedTransaction> = txs
            .iter()
            .map(|tx| PluginFailedTransaction {
                plugin_name: plugin_name.to_string(),
                tx_hash: tx.hash.clone(),
                version,
                error_message: message.clone(),
                error_trace: Some(trace.clone()),
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.repositories
            .failed_transactions()
            .upsert(&records)
            .await?;
        record_dead_letters(plugin_name, records.len() as u64);
        Ok(())
    }

    /// Record a single failed transaction at the plugin's current version.
    pub async fn record_failure(
        &self,
        plugin_name: &str,
        tx: &Transaction,
        error: &PluginError,
    ) -> IndexerResult<()> {
        let plugin = self
            .registry
            .get(plugin_name)
            .ok_or_else(|| PluginError::NotRegistered(plugin_name.to_string()))?;
        self.record_failures(plugin_name, plugin.version(), std::slice::from_ref(tx), error)
            .await
    }

    /// Replay failures recorded at `old_version` through the plugin,
    /// direction `Upgrade`, in chunks of [`RETRY_CHUNK_SIZE`].
    #[instrument(skip(self))]
    pub async fn retry_failed_transactions(
        &self,
        plugin_name: &str,
        old_version: u32,
        new_version: u32,
    ) -> IndexerResult<RetryReport> {
        let plugin = self
            .registry
            .get(plugin_name)
            .ok_or_else(|| PluginError::NotRegistered(plugin_name.to_string()))?
            .clone();
        let store = self.repositories.failed_transactions();
        let failures = store.list_by_version(plugin_name, old_version).await?;

        let mut report = RetryReport {
            attempted: failures.len() as u64,
            ..Default::default()
        };

        for chunk in failures.chunks(RETRY_CHUNK_SIZE) {
            let hashes: Vec<String> = chunk.iter().map(|f| f.tx_hash.clone()).collect();
            let txs = self.repositories.transactions().get_transactions(&hashes).await?;

            let found: HashSet<&str> = txs.iter().map(|tx| tx.hash.as_str()).collect();
            let missing: Vec<String> = hashes
                .iter()
                .filter(|h| !found.contains(h.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                report.missing += store.delete(plugin_name, &missing).await?;
            }
            if txs.is_empty() {
                continue;
            }

            let replayed: Vec<String> = txs.iter().map(|tx| tx.hash.clone()).collect();
            match plugin.process_batch(&txs, SyncDirection::Upgrade).await {
                Ok(()) => {
                    report.recovered += store.delete(plugin_name, &replayed).await?;
                }
                Err(e) => {
                    warn!(plugin = plugin_name, error = %e, count = replayed.len(), "⚠️  Replay failed");
                    report.still_failing += store
                        .bump_version(plugin_name, &replayed, new_version, &e.to_string())
                        .await?;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                plugin = plugin_name,
                old_version,
                new_version,
                recovered = report.recovered,
                still_failing = report.still_failing,
                missing = report.missing,
                "🔁 Dead letters replayed"
            );
        }
        Ok(report)
    }

    /// Replay the old-version failures of plugins whose version changed at
    /// bootstrap.
    pub async fn replay_version_changes(&self, changes: &[VersionChange]) -> IndexerResult<RetryReport> {
        let mut report = RetryReport::default();
        for change in changes {
            report.merge(
                self.retry_failed_transactions(
                    &change.plugin_name,
                    change.old_version,
                    change.new_version,
                )
                .await?,
            );
        }
        Ok(report)
    }

    /// Replay every dead letter recorded at a version other than the
    /// plugin's declared one.
    #[instrument(skip(self))]
    pub async fn check_and_retry_version_mismatches(&self) -> IndexerResult<RetryReport> {
        let Ok(_permit) = self.guard.try_acquire() else {
            debug!("Dead-letter check already running, skipping");
            return Err(IndexerError::AlreadyRunning);
        };

        let mut report = RetryReport::default();
        for plugin in self.registry.plugins() {
            let current = plugin.version();
            let versions = self
                .repositories
                .failed_transactions()
                .versions(plugin.name())
                .await?;
            for stale in versions.into_iter().filter(|v| *v != current) {
                report.merge(
                    self.retry_failed_transactions(plugin.name(), stale, current)
                        .await?,
                );
            }
        }
        Ok(report)
    }

    /// Run the version check every `interval` until shutdown.
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
            match self.check_and_retry_version_mismatches().await {
                Ok(_) | Err(IndexerError::AlreadyRunning) => {}
                Err(e) => error!(error = ?e, "❌ Dead-letter check failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Plugin;
    use crate::testing::{InMemoryRepositories, RecordingPlugin, spend_tx};

    fn setup(plugin: Arc<RecordingPlugin>) -> (Arc<InMemoryRepositories>, PluginFailedTransactionService) {
        let repos = Arc::new(InMemoryRepositories::new());
        let registry =
            Arc::new(PluginRegistryService::new(vec![plugin as Arc<dyn Plugin>]).unwrap());
        let service = PluginFailedTransactionService::new(repos.clone(), registry);
        (repos, service)
    }

    fn txs(count: usize) -> Vec<Transaction> {
        (0..count)
            .map(|i| spend_tx(&format!("th_{i}"), i as u64, "ak_a", "ak_b"))
            .collect()
    }

    #[tokio::test]
    async fn failures_are_recorded_per_transaction_and_version() {
        let plugin = Arc::new(RecordingPlugin::new("dex", 3));
        let (repos, service) = setup(plugin);
        let batch = txs(4);

        service
            .record_failures("dex", 3, &batch, &PluginError::processing("dex", "boom"))
            .await
            .unwrap();
        // Un second échec sur la même transaction écrase la ligne existante
        service
            .record_failure("dex", &batch[0], &PluginError::processing("dex", "again"))
            .await
            .unwrap();

        let letters = repos.dead_letters("dex");
        assert_eq!(letters.len(), 4);
        assert!(letters.iter().all(|l| l.version == 3));
        assert!(letters.iter().any(|l| l.error_message.contains("again")));
    }

    #[tokio::test]
    async fn successful_replay_deletes_and_missing_rows_are_dropped() {
        let plugin = Arc::new(RecordingPlugin::new("dex", 2));
        let (repos, service) = setup(plugin.clone());
        let batch = txs(120);
        repos.insert_transactions(&batch[..100]);
        service
            .record_failures("dex", 1, &batch, &PluginError::processing("dex", "v1 bug"))
            .await
            .unwrap();

        let report = service.retry_failed_transactions("dex", 1, 2).await.unwrap();

        assert_eq!(report.attempted, 120);
        assert_eq!(report.recovered, 100);
        assert_eq!(report.missing, 20);
        assert!(repos.dead_letters("dex").is_empty());
        // 120 lettres en morceaux de 50: trois appels au plugin
        assert_eq!(plugin.attempts(), 3);
        assert_eq!(plugin.processed_hashes().len(), 100);
        assert!(plugin.batches().iter().all(|(d, _)| *d == SyncDirection::Upgrade));
    }

    // Test critique: un rejeu en échec fait passer les lettres à la nouvelle version
    #[tokio::test]
    async fn failed_replay_bumps_to_new_version() {
        let plugin = Arc::new(RecordingPlugin::new("dex", 2).failing());
        let (repos, service) = setup(plugin);
        let batch = txs(3);
        repos.insert_transactions(&batch);
        service
            .record_failures("dex", 1, &batch, &PluginError::processing("dex", "v1 bug"))
            .await
            .unwrap();

        let report = service.retry_failed_transactions("dex", 1, 2).await.unwrap();

        assert_eq!(report.still_failing, 3);
        let letters = repos.dead_letters("dex");
        assert!(letters.iter().all(|l| l.version == 2));
        assert!(letters.iter().all(|l| l.error_message.contains("injected failure")));
    }

    #[tokio::test]
    async fn version_check_only_replays_stale_versions() {
        let plugin = Arc::new(RecordingPlugin::new("dex", 2));
        let (repos, service) = setup(plugin.clone());
        let batch = txs(2);
        repos.insert_transactions(&batch);
        service
            .record_failures("dex", 1, &batch[..1], &PluginError::processing("dex", "old"))
            .await
            .unwrap();
        service
            .record_failures("dex", 2, &batch[1..], &PluginError::processing("dex", "current"))
            .await
            .unwrap();

        let report = service.check_and_retry_version_mismatches().await.unwrap();

        assert_eq!(report.recovered, 1);
        let letters = repos.dead_letters("dex");
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].tx_hash, "th_1");
        assert_eq!(plugin.processed_hashes(), vec!["th_0".to_string()]);
    }

    #[tokio::test]
    async fn unknown_plugin_is_rejected() {
        let (_, service) = setup(Arc::new(RecordingPlugin::new("dex", 1)));
        let result = service.retry_failed_transactions("nft", 1, 2).await;
        assert!(matches!(
            result,
            Err(IndexerError::Plugin(PluginError::NotRegistered(_)))
        ));
    }
}
