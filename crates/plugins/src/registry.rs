//! Bundle registry for managing plugin bundles.

use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::{debug, info, warn};

use aesync_core::ports::Plugin;

use crate::bundle::PluginBundle;

/// Ordered set of plugin bundles.
///
/// Bundles are walked by descending priority both when their migrations
/// run and when their plugins are handed to the core registry, so plugin
/// fan-out order follows bundle priority.
///
/// # Example
///
/// ```ignore
/// let mut bundles = BundleRegistry::new();
/// bundles.register(Box::new(SpendTransfersBundle::new(pool.clone())));
///
/// // Applied once per (bundle, index), recorded in plugin_migrations
/// bundles.run_migrations(&pool).await?;
///
/// let registry = PluginRegistryService::new(bundles.plugins())?;
/// ```
pub struct BundleRegistry {
    bundles: Vec<Box<dyn PluginBundle>>,
}

impl BundleRegistry {
    pub fn new() -> Self {
        Self {
            bundles: Vec::new(),
        }
    }

    /// Register a plugin bundle.
    pub fn register(&mut self, bundle: Box<dyn PluginBundle>) {
        info!(bundle = bundle.name(), "📦 Registering plugin bundle");
        self.bundles.push(bundle);
    }

    fn sorted(&self) -> Vec<&dyn PluginBundle> {
        let mut sorted: Vec<&dyn PluginBundle> = self.bundles.iter().map(|b| b.as_ref()).collect();
        sorted.sort_by_key(|b| Reverse(b.priority()));
        sorted
    }

    /// Apply pending bundle migrations, highest priority first.
    ///
    /// A migration already recorded for its (bundle, index) is skipped even
    /// if its checksum changed; the mismatch is only reported.
    pub async fn run_migrations(&self, pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
        for bundle in self.sorted() {
            let migrations = bundle.migrations();
            if migrations.is_empty() {
                debug!(bundle = bundle.name(), "Bundle owns no tables");
                bundle.on_initialized();
                continue;
            }

            for (index, migration) in migrations.iter().enumerate() {
                let checksum = compute_checksum(migration);
                let position = i32::try_from(index).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

                let existing: Option<(String,)> = sqlx::query_as(
                    "SELECT checksum FROM plugin_migrations WHERE bundle_name = $1 AND migration_index = $2",
                )
                .bind(bundle.name())
                .bind(position)
                .fetch_optional(pool)
                .await?;

                match existing {
                    Some((existing_checksum,)) => {
                        if existing_checksum != checksum {
                            warn!(
                                bundle = bundle.name(),
                                migration = index,
                                expected = %checksum,
                                found = %existing_checksum,
                                "⚠️  Plugin migration changed after it was applied"
                            );
                        }
                        debug!(
                            bundle = bundle.name(),
                            migration = index,
                            "Plugin migration already applied"
                        );
                    }
                    None => {
                        info!(
                            bundle = bundle.name(),
                            migration = index,
                            "🗄️  Applying migration"
                        );

                        // Schema change and bookkeeping land together.
                        let mut tx = pool.begin().await?;
                        sqlx::raw_sql(migration).execute(&mut *tx).await?;
                        sqlx::query(
                            "INSERT INTO plugin_migrations (bundle_name, migration_index, checksum) VALUES ($1, $2, $3)",
                        )
                        .bind(bundle.name())
                        .bind(position)
                        .bind(&checksum)
                        .execute(&mut *tx)
                        .await?;
                        tx.commit().await?;
                    }
                }
            }

            bundle.on_initialized();
        }

        Ok(())
    }

    /// Extract the plugin instances of all bundles, in bundle priority order.
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.sorted()
            .into_iter()
            .flat_map(|bundle| {
                let plugins = bundle.plugins();
                debug!(bundle = bundle.name(), plugins = plugins.len(), "Extracting plugins");
                plugins
            })
            .collect()
    }

    /// Bundle names in registration order.
    pub fn bundle_names(&self) -> Vec<&'static str> {
        self.bundles.iter().map(|b| b.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Deduplicated tables owned by all bundles.
    pub fn tables_to_purge(&self) -> Vec<&'static str> {
        let mut tables: Vec<&'static str> = self
            .bundles
            .iter()
            .flat_map(|b| b.tables_to_purge().iter().copied())
            .collect();
        tables.sort();
        tables.dedup();
        tables
    }

    /// Truncate all bundle-owned tables. Returns the number of tables truncated.
    pub async fn purge_tables(&self, pool: &sqlx::PgPool) -> Result<usize, sqlx::Error> {
        let tables = self.tables_to_purge();

        for table in &tables {
            debug!(table = %table, "Truncating plugin table");
            // Table names can't be bound as parameters
            let query = format!("TRUNCATE {} CASCADE", table);
            sqlx::raw_sql(&query).execute(pool).await?;
        }

        Ok(tables.len())
    }
}

impl Default for BundleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable fingerprint of a migration's SQL text.
fn compute_checksum(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aesync_core::testing::RecordingPlugin;

    struct MockBundle {
        name: &'static str,
        priority: i32,
        plugins: Vec<&'static str>,
        tables: &'static [&'static str],
    }

    impl PluginBundle for MockBundle {
        fn name(&self) -> &'static str {
            self.name
        }
        fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
            self.plugins
                .iter()
                .map(|name| Arc::new(RecordingPlugin::new(name, 1)) as Arc<dyn Plugin>)
                .collect()
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn tables_to_purge(&self) -> &'static [&'static str] {
            self.tables
        }
    }

    // Test critique: les plugins sont extraits dans l'ordre de priorité des bundles
    #[test]
    fn test_plugins_follow_bundle_priority() {
        let mut registry = BundleRegistry::new();
        registry.register(Box::new(MockBundle {
            name: "low_priority",
            priority: 0,
            plugins: vec!["nft"],
            tables: &[],
        }));
        registry.register(Box::new(MockBundle {
            name: "high_priority",
            priority: 100,
            plugins: vec!["dex", "dex_pairs"],
            tables: &[],
        }));

        let names: Vec<String> = registry
            .plugins()
            .iter()
            .map(|p| p.name().to_string())
            .collect();

        assert_eq!(names, vec!["dex", "dex_pairs", "nft"]);
        assert_eq!(registry.bundle_names(), vec!["low_priority", "high_priority"]);
    }

    #[test]
    fn test_purge_tables_are_deduplicated() {
        let mut registry = BundleRegistry::new();
        registry.register(Box::new(MockBundle {
            name: "a",
            priority: 0,
            plugins: vec![],
            tables: &["spend_transfers", "pairs"],
        }));
        registry.register(Box::new(MockBundle {
            name: "b",
            priority: 0,
            plugins: vec![],
            tables: &["pairs"],
        }));

        assert_eq!(registry.tables_to_purge(), vec!["pairs", "spend_transfers"]);
    }

    // Test critique: checksum déterministe pour tracking des migrations
    #[test]
    fn test_migration_checksum_stability() {
        let sql = "CREATE TABLE spend_transfers (tx_hash TEXT PRIMARY KEY);";

        assert_eq!(compute_checksum(sql), compute_checksum(sql));

        let sql_modified = "CREATE TABLE spend_transfers (tx_hash VARCHAR PRIMARY KEY);";
        assert_ne!(compute_checksum(sql), compute_checksum(sql_modified));
    }
}
