//! Plugin fan-out.
//!
//! Every persisted batch is delivered to all plugins concurrently. A plugin
//! failure never reaches its siblings or the caller: it becomes dead letters
//! and the plugin's frontier stays where it was.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tracing::{debug, instrument, trace, warn};

use crate::error::IndexerResult;
use crate::metrics::record_plugin_batch;
use crate::models::{PluginSyncState, SidecarKind, SyncDirection, Transaction, VersionedEntry};
use crate::ports::{Plugin, Repositories, matches_any_predicate};

use super::plugin_failed_transaction::PluginFailedTransactionService;
use super::plugin_registry::PluginRegistryService;

/// Result of delivering one batch to one plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The plugin has no sync state yet.
    Skipped,
    /// No transaction matched the plugin's filters.
    NoMatch,
    /// `process_batch` succeeded for this many transactions.
    Processed(usize),
    /// `process_batch` failed; this many dead letters were recorded.
    Failed(usize),
}

impl DeliveryOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::NoMatch => "no_match",
            Self::Processed(_) => "success",
            Self::Failed(_) => "failure",
        }
    }
}

/// Per-plugin outcomes of one fan-out call.
#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    pub outcomes: Vec<(String, DeliveryOutcome)>,
}

impl BatchReport {
    pub fn outcome(&self, plugin_name: &str) -> Option<DeliveryOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == plugin_name)
            .map(|(_, outcome)| *outcome)
    }
}

/// Delivers persisted batches to every plugin.
pub struct PluginBatchProcessorService {
    repositories: Arc<dyn Repositories>,
    registry: Arc<PluginRegistryService>,
    failed: Arc<PluginFailedTransactionService>,
    cache: RwLock<HashMap<String, PluginSyncState>>,
}

impl PluginBatchProcessorService {
    pub fn new(
        repositories: Arc<dyn Repositories>,
        registry: Arc<PluginRegistryService>,
        failed: Arc<PluginFailedTransactionService>,
    ) -> Self {
        Self {
            repositories,
            registry,
            failed,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistryService> {
        &self.registry
    }

    /// Drop every cached plugin sync state.
    pub fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Deliver `txs` to every plugin and wait for all of them.
    #[instrument(skip_all, fields(count = txs.len(), direction = %direction))]
    pub async fn process(&self, txs: &[Transaction], direction: SyncDirection) -> BatchReport {
        if txs.is_empty() || self.registry.is_empty() {
            return BatchReport::default();
        }

        let outcomes = join_all(
            self.registry
                .plugins()
                .iter()
                .map(|plugin| self.deliver(plugin.clone(), txs, direction)),
        )
        .await;

        BatchReport {
            outcomes: self
                .registry
                .plugins()
                .iter()
                .map(|p| p.name().to_string())
                .zip(outcomes)
                .collect(),
        }
    }

    /// Notify every plugin of removed transactions. Failures are logged.
    #[instrument(skip_all, fields(count = removed_hashes.len()))]
    pub async fn handle_reorg(&self, removed_hashes: &[String]) {
        let results = join_all(
            self.registry
                .plugins()
                .iter()
                .map(|plugin| async move { (plugin.name(), plugin.on_reorg(removed_hashes).await) }),
        )
        .await;

        for (name, result) in results {
            if let Err(e) = result {
                warn!(plugin = name, error = %e, "⚠️  Plugin reorg hook failed");
            }
        }
    }

    async fn deliver(
        &self,
        plugin: Arc<dyn Plugin>,
        txs: &[Transaction],
        direction: SyncDirection,
    ) -> DeliveryOutcome {
        let name = plugin.name();

        let state = match self.sync_state(name).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                trace!(plugin = name, "No sync state, skipping");
                return self.finish(name, DeliveryOutcome::Skipped);
            }
            Err(e) => {
                warn!(plugin = name, error = ?e, "⚠️  Could not load plugin sync state, skipping");
                return self.finish(name, DeliveryOutcome::Skipped);
            }
        };

        let filters = plugin.filters();
        let mut matched: Vec<Transaction> = txs
            .iter()
            .filter(|tx| matches_any_predicate(&filters, tx))
            .cloned()
            .collect();
        if matched.is_empty() {
            return self.finish(name, DeliveryOutcome::NoMatch);
        }

        self.decode(plugin.as_ref(), &mut matched).await;

        match plugin.process_batch(&matched, direction).await {
            Ok(()) => {
                let max_height = matched.iter().map(|tx| tx.block_height).max().unwrap_or(0);
                match self
                    .repositories
                    .plugin_sync_state()
                    .record_progress(name, direction, max_height)
                    .await
                {
                    Ok(Some(updated)) => self.cache_state(updated),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(plugin = name, error = ?e, "⚠️  Could not record plugin progress");
                    }
                }
                debug!(
                    plugin = name,
                    count = matched.len(),
                    max_height,
                    previous = state.last_synced_height,
                    "Plugin batch processed"
                );
                self.finish(name, DeliveryOutcome::Processed(matched.len()))
            }
            Err(e) => {
                warn!(plugin = name, error = %e, count = matched.len(), "⚠️  Plugin batch failed");
                if let Err(record_err) = self
                    .failed
                    .record_failures(name, plugin.version(), &matched, &e)
                    .await
                {
                    warn!(plugin = name, error = ?record_err, "⚠️  Could not record dead letters");
                }
                self.finish(name, DeliveryOutcome::Failed(matched.len()))
            }
        }
    }

    /// Run decode hooks, skipping sidecars already stored at the plugin's
    /// version.
    ///
    /// Batches fetched from the chain carry no sidecars, so the stored rows
    /// are the reference. A stored entry at the current version is copied
    /// onto the in-flight transaction instead of being decoded again.
    async fn decode(&self, plugin: &dyn Plugin, txs: &mut [Transaction]) {
        let name = plugin.name();
        let version = plugin.version();
        let stored = self.stored_transactions(name, txs).await;

        for tx in txs.iter_mut() {
            for kind in [SidecarKind::Data, SidecarKind::Logs] {
                if tx
                    .sidecar(kind)
                    .get(name)
                    .is_some_and(|entry| entry.version == version)
                {
                    continue;
                }
                let current = stored
                    .get(&tx.hash)
                    .and_then(|row| row.sidecar(kind).get(name))
                    .filter(|entry| entry.version == version)
                    .cloned();
                if let Some(entry) = current {
                    tx.sidecar_mut(kind).insert(name.to_string(), entry);
                    continue;
                }

                let decoded = match kind {
                    SidecarKind::Data => plugin.decode_data(tx).await,
                    SidecarKind::Logs => plugin.decode_logs(tx).await,
                };
                let value = match decoded {
                    Ok(Some(value)) => value,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(plugin = name, tx = %tx.hash, sidecar = kind.column(), error = %e, "⚠️  Decode failed");
                        continue;
                    }
                };

                let entry = VersionedEntry {
                    version,
                    data: value,
                };
                if let Err(e) = self
                    .repositories
                    .transactions()
                    .set_sidecar_entry(&tx.hash, kind, name, &entry)
                    .await
                {
                    warn!(plugin = name, tx = %tx.hash, error = ?e, "⚠️  Could not persist decoded sidecar");
                }
                tx.sidecar_mut(kind).insert(name.to_string(), entry);
            }
        }
    }

    async fn stored_transactions(
        &self,
        name: &str,
        txs: &[Transaction],
    ) -> HashMap<String, Transaction> {
        let hashes: Vec<String> = txs.iter().map(|tx| tx.hash.clone()).collect();
        match self.repositories.transactions().get_transactions(&hashes).await {
            Ok(rows) => rows.into_iter().map(|tx| (tx.hash.clone(), tx)).collect(),
            Err(e) => {
                warn!(plugin = name, error = ?e, "⚠️  Could not load stored sidecars, decoding all");
                HashMap::new()
            }
        }
    }

    async fn sync_state(&self, name: &str) -> IndexerResult<Option<PluginSyncState>> {
        if let Some(state) = self.cache.read().ok().and_then(|c| c.get(name).cloned()) {
            return Ok(Some(state));
        }
        let state = self.repositories.plugin_sync_state().get(name).await?;
        if let Some(state) = &state {
            self.cache_state(state.clone());
        }
        Ok(state)
    }

    fn cache_state(&self, state: PluginSyncState) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(state.plugin_name.clone(), state);
        }
    }

    fn finish(&self, name: &str, outcome: DeliveryOutcome) -> DeliveryOutcome {
        record_plugin_batch(name, outcome.label());
        outcome
    }
}
