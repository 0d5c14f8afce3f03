//! PostgreSQL storage adapter.
//!
//! This module implements the repository traits defined in `aesync-core`
//! using PostgreSQL as the backing store.
//!
//! # Architecture
//!
//! - [`Database`] - Connection pool, migrations and purge
//! - [`PgRepositories`] - Composite repository implementing `Repositories` trait
//! - Individual repos: `PgTransactionRepository`, `PgBlockRepository`, etc.
//!
//! # Usage
//!
//! ```ignore
//! let config = DatabaseConfig::for_sync(&database_url, 4);
//! let db = Database::connect(&config).await?;
//! db.migrate().await?;
//!
//! let repositories = PgRepositories::new(Arc::new(db));
//! ```

mod block_repo;
mod database;
mod failed_repo;
mod helpers;
mod plugin_state_repo;
mod sync_state_repo;
mod transaction_repo;

pub use block_repo::PgBlockRepository;
pub use database::{Database, DatabaseConfig, PurgeStats};
pub use failed_repo::PgFailedTransactionRepository;
pub use plugin_state_repo::PgPluginSyncStateRepository;
pub use sync_state_repo::PgSyncStateRepository;
pub use transaction_repo::PgTransactionRepository;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use aesync_core::error::StorageResult;
use aesync_core::models::GLOBAL_SYNC_STATE_ID;
use aesync_core::ports::{
    BlockRepository, FailedTransactionRepository, PluginSyncStateRepository, ReorgPurge,
    Repositories, SyncStateRepository, TransactionRepository,
};

use helpers::{height_to_i64, query_error, transaction_error};

// =============================================================================
// Composite Repository
// =============================================================================

/// Aggregated PostgreSQL repositories implementing the `Repositories` trait.
///
/// This provides a single entry point for all storage operations and
/// implements the reorg purge that spans multiple tables.
pub struct PgRepositories {
    db: Arc<Database>,
    transactions: PgTransactionRepository,
    blocks: PgBlockRepository,
    sync_state: PgSyncStateRepository,
    plugin_sync_state: PgPluginSyncStateRepository,
    failed_transactions: PgFailedTransactionRepository,
}

impl PgRepositories {
    /// Create a new repository aggregate from a database connection.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            transactions: PgTransactionRepository::new(&db),
            blocks: PgBlockRepository::new(&db),
            sync_state: PgSyncStateRepository::new(&db),
            plugin_sync_state: PgPluginSyncStateRepository::new(&db),
            failed_transactions: PgFailedTransactionRepository::new(&db),
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl Repositories for PgRepositories {
    fn transactions(&self) -> &dyn TransactionRepository {
        &self.transactions
    }

    fn blocks(&self) -> &dyn BlockRepository {
        &self.blocks
    }

    fn sync_state(&self) -> &dyn SyncStateRepository {
        &self.sync_state
    }

    fn plugin_sync_state(&self) -> &dyn PluginSyncStateRepository {
        &self.plugin_sync_state
    }

    fn failed_transactions(&self) -> &dyn FailedTransactionRepository {
        &self.failed_transactions
    }

    async fn purge_from_height_atomic(&self, divergence_height: u64) -> StorageResult<ReorgPurge> {
        let from = height_to_i64(divergence_height, "divergence_height")?;
        let rewind_to = height_to_i64(divergence_height.saturating_sub(1), "rewind_to")?;

        let mut tx = self.db.pool().begin().await.map_err(transaction_error)?;

        // Transactions first; the returned hashes drive plugin rollback.
        let removed_hashes: Vec<String> =
            sqlx::query_scalar("DELETE FROM transactions WHERE block_height >= $1 RETURNING hash")
                .bind(from)
                .fetch_all(&mut *tx)
                .await
                .map_err(query_error)?;

        let micro_blocks_deleted = sqlx::query("DELETE FROM micro_blocks WHERE height >= $1")
            .bind(from)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?
            .rows_affected();

        let key_blocks_deleted = sqlx::query("DELETE FROM key_blocks WHERE height >= $1")
            .bind(from)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?
            .rows_affected();

        // The backward frontier is left alone: heights below the divergence stay mirrored.
        sqlx::query(
            r#"
            UPDATE sync_state SET
                last_synced_height = LEAST(last_synced_height, $2),
                live_synced_height = LEAST(live_synced_height, $2),
                indexer_head_height = LEAST(indexer_head_height, $2),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(GLOBAL_SYNC_STATE_ID)
        .bind(rewind_to)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let plugins_rewound = sqlx::query(
            r#"
            UPDATE plugin_sync_state SET
                last_synced_height = LEAST(last_synced_height, $1),
                live_synced_height = LEAST(live_synced_height, $1),
                updated_at = NOW()
            WHERE last_synced_height > $1 OR live_synced_height > $1
            "#,
        )
        .bind(rewind_to)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?
        .rows_affected();

        tx.commit().await.map_err(transaction_error)?;

        debug!(
            divergence_height,
            transactions = removed_hashes.len(),
            key_blocks_deleted,
            micro_blocks_deleted,
            plugins_rewound,
            "Purged chain data above divergence"
        );

        Ok(ReorgPurge {
            divergence_height,
            removed_hashes,
            key_blocks_deleted,
            micro_blocks_deleted,
            plugins_rewound,
        })
    }
}
