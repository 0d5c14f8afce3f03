//! Plugin registry and startup bootstrap.
//!
//! The registry is built once, before any loop starts, from an explicit
//! list of plugin instances. Bootstrap reconciles each plugin's stored sync
//! state with the version it declares.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::error::{DomainError, DomainResult, IndexerResult};
use crate::models::PluginSyncState;
use crate::ports::{Plugin, PluginFilter, Repositories, TransactionQuery};

/// A plugin whose declared version differs from its stored one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionChange {
    pub plugin_name: String,
    pub old_version: u32,
    pub new_version: u32,
}

/// What [`PluginRegistryService::bootstrap`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Plugins seen for the first time.
    pub created: Vec<String>,
    /// Plugins reset for a full resync.
    pub version_changes: Vec<VersionChange>,
    /// Plugins whose frontiers were filled from `last_synced_height`.
    pub backfilled: Vec<String>,
}

/// Filters of one plugin, for introspection.
#[derive(Debug, Clone)]
pub struct PluginFilterSummary {
    pub plugin_name: String,
    /// Filters evaluated by the fan-out path.
    pub predicate_filters: usize,
    /// Catch-up queries used by upgrade backfills.
    pub update_queries: Vec<TransactionQuery>,
}

/// Registry of plugin instances, ordered as registered.
pub struct PluginRegistryService {
    plugins: Vec<Arc<dyn Plugin>>,
    by_name: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistryService {
    /// Build the registry. Duplicate names are a configuration error.
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> DomainResult<Self> {
        let mut by_name = HashMap::with_capacity(plugins.len());
        for plugin in &plugins {
            if by_name
                .insert(plugin.name().to_string(), plugin.clone())
                .is_some()
            {
                return Err(DomainError::DuplicatePlugin(plugin.name().to_string()));
            }
        }
        Ok(Self { plugins, by_name })
    }

    /// Get a plugin by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.by_name.get(name)
    }

    /// All plugins in registration order.
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Registered plugin names.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Aggregate filter introspection.
    pub fn filter_summaries(&self) -> Vec<PluginFilterSummary> {
        self.plugins
            .iter()
            .map(|plugin| PluginFilterSummary {
                plugin_name: plugin.name().to_string(),
                predicate_filters: plugin
                    .filters()
                    .iter()
                    .filter(|f| f.predicate.is_some())
                    .count(),
                update_queries: plugin.update_queries(),
            })
            .collect()
    }

    /// Reconcile stored plugin sync states with the registered plugins.
    ///
    /// - no row: create one at `start_from_height - 1`, frontiers unset
    /// - version differs: reset to `start_from_height - 1`, frontiers unset,
    ///   store the new version
    /// - same version, a frontier unset: fill it from `last_synced_height`
    #[instrument(skip_all, fields(plugins = self.plugins.len()))]
    pub async fn bootstrap(&self, repositories: &dyn Repositories) -> IndexerResult<BootstrapReport> {
        let mut report = BootstrapReport::default();
        let store = repositories.plugin_sync_state();

        for plugin in &self.plugins {
            let name = plugin.name();
            let start = plugin.start_from_height();
            let seed = PluginSyncState::seed_height(start);

            if structural_only(&plugin.filters()) {
                warn!(
                    plugin = name,
                    "⚠️  Plugin only has structural filters, it will receive nothing from live or backward sync"
                );
            }

            match store.get(name).await? {
                None => {
                    store
                        .save(&PluginSyncState {
                            plugin_name: name.to_string(),
                            version: plugin.version(),
                            last_synced_height: seed,
                            backward_synced_height: None,
                            live_synced_height: None,
                            start_from_height: start,
                            updated_at: Utc::now(),
                        })
                        .await?;
                    info!(plugin = name, start, "🧩 Plugin registered");
                    report.created.push(name.to_string());
                }
                Some(state) if state.version != plugin.version() => {
                    store
                        .save(&PluginSyncState {
                            version: plugin.version(),
                            last_synced_height: seed,
                            backward_synced_height: None,
                            live_synced_height: None,
                            start_from_height: start,
                            updated_at: Utc::now(),
                            ..state.clone()
                        })
                        .await?;
                    info!(
                        plugin = name,
                        old_version = state.version,
                        new_version = plugin.version(),
                        "🧩 Plugin version changed, full resync"
                    );
                    report.version_changes.push(VersionChange {
                        plugin_name: name.to_string(),
                        old_version: state.version,
                        new_version: plugin.version(),
                    });
                }
                Some(state)
                    if state.backward_synced_height.is_none()
                        || state.live_synced_height.is_none() =>
                {
                    let last = state.last_synced_height;
                    store
                        .save(&PluginSyncState {
                            backward_synced_height: state.backward_synced_height.or(Some(last)),
                            live_synced_height: state.live_synced_height.or(Some(last)),
                            start_from_height: start,
                            updated_at: Utc::now(),
                            ..state
                        })
                        .await?;
                    debug!(plugin = name, last, "Plugin frontiers filled from legacy height");
                    report.backfilled.push(name.to_string());
                }
                Some(_) => {
                    debug!(plugin = name, "Plugin state up to date");
                }
            }
        }

        Ok(report)
    }
}

/// Filters of a plugin that the fan-out path can never match.
pub fn structural_only(filters: &[PluginFilter]) -> bool {
    !filters.is_empty() && filters.iter().all(|f| f.predicate.is_none())
}
