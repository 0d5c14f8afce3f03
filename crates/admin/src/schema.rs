//! Administrative GraphQL schema.
//!
//! Exposes sync health, per-plugin state and the version-upgrade trigger.

use std::sync::Arc;

use async_graphql::{
    Context, EmptySubscription, Enum, Object, Result, Schema, SimpleObject,
};
use chrono::{DateTime, Utc};
use tracing::info;

use aesync_core::ports::{Repositories, TransactionQuery};
use aesync_core::services::{
    HealthReport, HealthService, HealthStatus, PluginRegistryService, PluginUpgradeService,
    UpgradeReport,
};

/// Maximum query depth. Introspection needs ~13.
pub const MAX_QUERY_DEPTH: usize = 15;

/// Maximum query complexity score.
pub const MAX_QUERY_COMPLEXITY: usize = 500;

/// Services the schema resolves against.
#[derive(Clone)]
pub struct AdminContext {
    pub repositories: Arc<dyn Repositories>,
    pub health: Arc<HealthService>,
    pub registry: Arc<PluginRegistryService>,
    pub upgrades: Arc<PluginUpgradeService>,
}

pub type AdminSchema = Schema<AdminQuery, AdminMutation, EmptySubscription>;

/// Build the admin schema with depth and complexity limits.
pub fn build_schema(context: AdminContext) -> AdminSchema {
    Schema::build(AdminQuery, AdminMutation, EmptySubscription)
        .data(context)
        .limit_depth(MAX_QUERY_DEPTH)
        .limit_complexity(MAX_QUERY_COMPLEXITY)
        .finish()
}

// -----------------------------------------------------------------------------
// Query
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct AdminQuery;

#[Object]
impl AdminQuery {
    /// Sync progress and overall status.
    async fn sync_health<'ctx>(&self, ctx: &Context<'ctx>) -> Result<SyncHealth> {
        let admin = ctx.data::<AdminContext>()?;
        let report = admin.health.report().await?;
        Ok(report.into())
    }

    /// Registered plugins with their stored sync state and filters.
    async fn plugins<'ctx>(&self, ctx: &Context<'ctx>) -> Result<Vec<PluginInfo>> {
        let admin = ctx.data::<AdminContext>()?;
        let summaries = admin.registry.filter_summaries();

        let mut plugins = Vec::with_capacity(summaries.len());
        for (plugin, summary) in admin.registry.plugins().iter().zip(summaries) {
            let name = plugin.name();
            let state = admin.repositories.plugin_sync_state().get(name).await?;
            let dead_letters = admin.repositories.failed_transactions().count(name).await?;

            plugins.push(PluginInfo {
                name: name.to_string(),
                version: plugin.version(),
                start_from_height: plugin.start_from_height(),
                stored_version: state.as_ref().map(|s| s.version),
                last_synced_height: state.as_ref().map(|s| s.last_synced_height),
                backward_synced_height: state.as_ref().and_then(|s| s.backward_synced_height),
                live_synced_height: state.as_ref().and_then(|s| s.live_synced_height),
                updated_at: state.as_ref().map(|s| s.updated_at),
                dead_letters,
                predicate_filters: summary.predicate_filters as u32,
                update_queries: summary.update_queries.into_iter().map(Into::into).collect(),
            });
        }
        Ok(plugins)
    }
}

// -----------------------------------------------------------------------------
// Mutation
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct AdminMutation;

#[Object]
impl AdminMutation {
    /// Replay stored history matching the plugin's update queries.
    ///
    /// Resolves when the backfill is done. Fails if the plugin is unknown or
    /// an upgrade of it is already running.
    async fn run_plugin_upgrade<'ctx>(&self, ctx: &Context<'ctx>, name: String) -> Result<UpgradeResult> {
        let admin = ctx.data::<AdminContext>()?;
        info!(plugin = %name, "🔁 Plugin upgrade requested");
        let report = admin.upgrades.run_upgrade(&name).await?;
        Ok(UpgradeResult::new(name, report))
    }
}

// -----------------------------------------------------------------------------
// Output types
// -----------------------------------------------------------------------------

#[derive(Enum, Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyncStatus {
    Healthy,
    Warning,
    Critical,
}

impl From<HealthStatus> for SyncStatus {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => Self::Healthy,
            HealthStatus::Warning => Self::Warning,
            HealthStatus::Critical => Self::Critical,
        }
    }
}

#[derive(SimpleObject, Debug)]
pub struct SyncHealth {
    pub status: SyncStatus,
    pub tip_height: u64,
    pub backward_synced_height: Option<u64>,
    pub live_synced_height: Option<u64>,
    pub indexer_head_height: Option<u64>,
    pub backward_progress: f64,
    pub live_progress: f64,
    pub live_lag: u64,
    pub is_bulk_mode: bool,
    pub live_active: bool,
}

impl From<HealthReport> for SyncHealth {
    fn from(r: HealthReport) -> Self {
        Self {
            status: r.status.into(),
            tip_height: r.tip_height,
            backward_synced_height: r.backward_synced_height,
            live_synced_height: r.live_synced_height,
            indexer_head_height: r.indexer_head_height,
            backward_progress: r.backward_progress,
            live_progress: r.live_progress,
            live_lag: r.live_lag,
            is_bulk_mode: r.is_bulk_mode,
            live_active: r.live_active,
        }
    }
}

#[derive(SimpleObject, Debug)]
pub struct PluginInfo {
    pub name: String,
    /// Version declared by the running code.
    pub version: u32,
    pub start_from_height: u64,
    /// Version recorded in the plugin's sync state.
    pub stored_version: Option<u32>,
    pub last_synced_height: Option<u64>,
    pub backward_synced_height: Option<u64>,
    pub live_synced_height: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub dead_letters: u64,
    pub predicate_filters: u32,
    pub update_queries: Vec<QueryInfo>,
}

#[derive(SimpleObject, Debug)]
pub struct QueryInfo {
    pub tx_types: Vec<String>,
    pub contract_ids: Vec<String>,
    pub functions: Vec<String>,
    pub height_gte: Option<u64>,
    pub height_lte: Option<u64>,
}

impl From<TransactionQuery> for QueryInfo {
    fn from(q: TransactionQuery) -> Self {
        Self {
            tx_types: q.tx_types,
            contract_ids: q.contract_ids,
            functions: q.functions,
            height_gte: q.height_gte,
            height_lte: q.height_lte,
        }
    }
}

#[derive(SimpleObject, Debug)]
pub struct UpgradeResult {
    pub plugin: String,
    pub matched: u64,
    pub processed: u64,
    pub failed: u64,
}

impl UpgradeResult {
    fn new(plugin: String, report: UpgradeReport) -> Self {
        Self {
            plugin,
            matched: report.matched,
            processed: report.processed,
            failed: report.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use aesync_core::config::SyncConfig;
    use aesync_core::models::SyncState;
    use aesync_core::ports::{Plugin, PluginFilter};
    use aesync_core::services::{LiveActivity, PluginFailedTransactionService};
    use aesync_core::testing::{InMemoryRepositories, RecordingPlugin, spend_tx};
    use serde_json::json;

    fn schema(repos: Arc<InMemoryRepositories>, plugin: Arc<RecordingPlugin>) -> AdminSchema {
        let config = SyncConfig::default();
        let repositories: Arc<dyn Repositories> = repos;
        let plugins: Vec<Arc<dyn Plugin>> = vec![plugin];
        let registry = Arc::new(PluginRegistryService::new(plugins).unwrap());
        let failed = Arc::new(PluginFailedTransactionService::new(
            repositories.clone(),
            registry.clone(),
        ));
        build_schema(AdminContext {
            health: Arc::new(HealthService::new(
                repositories.clone(),
                LiveActivity::default(),
                &config,
            )),
            upgrades: Arc::new(PluginUpgradeService::new(
                repositories.clone(),
                registry.clone(),
                failed,
                &config,
            )),
            registry,
            repositories,
        })
    }

    fn spend_plugin() -> Arc<RecordingPlugin> {
        Arc::new(RecordingPlugin::new("transfers", 2).with_filters(vec![PluginFilter {
            tx_type: Some("SpendTx".into()),
            ..PluginFilter::predicate(|tx| tx.tx_type == "SpendTx")
        }]))
    }

    #[tokio::test]
    async fn test_sync_health_query() {
        let repos = Arc::new(InMemoryRepositories::new());
        repos.seed_sync_state(SyncState {
            tip_height: 200,
            backward_synced_height: Some(50),
            live_synced_height: Some(198),
            ..SyncState::empty()
        });

        let response = schema(repos, spend_plugin())
            .execute("{ syncHealth { status tipHeight liveLag backwardProgress liveActive } }")
            .await;

        assert!(response.errors.is_empty(), "{:?}", response.errors);
        let data = response.data.into_json().unwrap();
        assert_eq!(
            data,
            json!({"syncHealth": {
                "status": "WARNING",
                "tipHeight": 200,
                "liveLag": 2,
                "backwardProgress": 75.0,
                "liveActive": false
            }})
        );
    }

    #[tokio::test]
    async fn test_plugins_query_lists_state_and_filters() {
        let repos = Arc::new(InMemoryRepositories::new());
        let schema = schema(repos.clone(), spend_plugin());

        let response = schema
            .execute("{ plugins { name version storedVersion deadLetters predicateFilters updateQueries { txTypes } } }")
            .await;

        assert!(response.errors.is_empty(), "{:?}", response.errors);
        let data = response.data.into_json().unwrap();
        assert_eq!(
            data["plugins"][0],
            json!({
                "name": "transfers",
                "version": 2,
                "storedVersion": null,
                "deadLetters": 0,
                "predicateFilters": 1,
                "updateQueries": [{"txTypes": ["SpendTx"]}]
            })
        );
    }

    // Test critique: la mutation rejoue l'historique stocké dans le plugin
    #[tokio::test]
    async fn test_run_plugin_upgrade_mutation() {
        let repos = Arc::new(InMemoryRepositories::new());
        repos.insert_transactions(&[
            spend_tx("th_1", 1, "ak_a", "ak_b"),
            spend_tx("th_2", 2, "ak_a", "ak_c"),
        ]);
        let plugin = spend_plugin();
        let schema = schema(repos, plugin.clone());

        let response = schema
            .execute(r#"mutation { runPluginUpgrade(name: "transfers") { plugin matched processed failed } }"#)
            .await;

        assert!(response.errors.is_empty(), "{:?}", response.errors);
        let data = response.data.into_json().unwrap();
        assert_eq!(
            data["runPluginUpgrade"],
            json!({"plugin": "transfers", "matched": 2, "processed": 2, "failed": 0})
        );
        assert_eq!(plugin.processed_hashes().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_plugin_upgrade_is_an_error() {
        let schema = schema(Arc::new(InMemoryRepositories::new()), spend_plugin());

        let response = schema
            .execute(r#"mutation { runPluginUpgrade(name: "nope") { matched } }"#)
            .await;

        assert_eq!(response.errors.len(), 1);
        assert!(response.errors[0].message.contains("nope"));
    }
}
