//! PostgreSQL database connection and configuration.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, instrument};

use aesync_core::error::{StorageError, StorageResult};

use super::helpers::query_error;

/// Tables holding mirrored data and sync progress, cleared by [`Database::purge`].
const PURGED_TABLES: &[&str] = &[
    "transactions",
    "micro_blocks",
    "key_blocks",
    "sync_state",
    "plugin_sync_state",
    "plugin_failed_transactions",
];

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Minimum number of connections to maintain.
    pub min_connections: u32,
    /// Connection acquisition timeout.
    pub acquire_timeout: Duration,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum connection lifetime.
    pub max_lifetime: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/aesync".to_string(),
            max_connections: 20,
            min_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DatabaseConfig {
    /// Create a configuration sized for the sync loops.
    ///
    /// Bulk waves run several range syncs at once, each holding a
    /// connection per write, next to the live, validation and retry loops.
    pub fn for_sync(url: &str, bulk_parallel_workers: usize) -> Self {
        let workers = u32::try_from(bulk_parallel_workers).unwrap_or(u32::MAX);
        Self {
            url: url.to_string(),
            max_connections: workers.saturating_add(8).max(10),
            min_connections: 3,
            ..Default::default()
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database with the given configuration.
    #[instrument(skip_all)]
    pub async fn connect(config: &DatabaseConfig) -> StorageResult<Self> {
        debug!(
            max_conn = config.max_connections,
            min_conn = config.min_connections,
            "Creating connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.url)
            .await
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;

        debug!("Connection pool created");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the core schema migrations.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> StorageResult<()> {
        debug!("Running migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::MigrationError(e.to_string()))?;

        debug!("Migrations completed");

        Ok(())
    }

    /// Check if the database connection is healthy.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Remove all mirrored data and sync progress.
    ///
    /// The schema and the `plugin_migrations` bookkeeping are kept; the
    /// next start seeds the frontiers from the tip again.
    #[instrument(skip(self))]
    pub async fn purge(&self) -> StorageResult<PurgeStats> {
        debug!("Starting database purge");

        let count = |table: &'static str| async move {
            sqlx::query_as::<_, (i64,)>(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await
                .map(|(n,)| n.max(0) as u64)
                .map_err(query_error)
        };
        let transactions_removed = count("transactions").await?;
        let key_blocks_removed = count("key_blocks").await?;
        let micro_blocks_removed = count("micro_blocks").await?;
        let dead_letters_removed = count("plugin_failed_transactions").await?;

        sqlx::raw_sql(&format!("TRUNCATE {}", PURGED_TABLES.join(", ")))
            .execute(&self.pool)
            .await
            .map_err(query_error)?;

        debug!(tables = PURGED_TABLES.len(), "Database purge completed");

        Ok(PurgeStats {
            transactions_removed,
            key_blocks_removed,
            micro_blocks_removed,
            dead_letters_removed,
        })
    }
}

/// Statistics from a database purge operation.
#[derive(Debug, Clone)]
pub struct PurgeStats {
    pub transactions_removed: u64,
    pub key_blocks_removed: u64,
    pub micro_blocks_removed: u64,
    pub dead_letters_removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_pool_grows_with_bulk_width() {
        assert_eq!(DatabaseConfig::for_sync("postgres://x", 4).max_connections, 12);
        assert_eq!(DatabaseConfig::for_sync("postgres://x", 1).max_connections, 10);
        assert_eq!(DatabaseConfig::for_sync("postgres://x", 16).max_connections, 24);
    }
}
