//! Global sync state repository implementation for PostgreSQL.
//!
//! The table holds a single row keyed by [`GLOBAL_SYNC_STATE_ID`]. Every
//! frontier update is a single monotonic `UPDATE` so concurrent loops can
//! never move a frontier the wrong way.

use async_trait::async_trait;
use sqlx::PgPool;

use aesync_core::error::StorageResult;
use aesync_core::models::{GLOBAL_SYNC_STATE_ID, SyncState};
use aesync_core::ports::SyncStateRepository;

use super::database::Database;
use super::helpers::{height_to_i64, i64_to_height, optional_height, query_error};

const SELECT_STATE: &str = r#"
    SELECT last_synced_height, tip_height, is_bulk_mode,
           backward_synced_height, live_synced_height, indexer_head_height, updated_at
    FROM sync_state
    WHERE id = $1
"#;

/// PostgreSQL implementation of SyncStateRepository.
pub struct PgSyncStateRepository {
    pool: PgPool,
}

impl PgSyncStateRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    async fn update(&self, statement: &str, height: u64, field_name: &str) -> StorageResult<()> {
        sqlx::query(statement)
            .bind(GLOBAL_SYNC_STATE_ID)
            .bind(height_to_i64(height, field_name)?)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(())
    }
}

#[async_trait]
impl SyncStateRepository for PgSyncStateRepository {
    async fn get(&self) -> StorageResult<Option<SyncState>> {
        let row = sqlx::query_as::<_, SyncStateRow>(SELECT_STATE)
            .bind(GLOBAL_SYNC_STATE_ID)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;

        row.map(SyncStateRow::into_state).transpose()
    }

    async fn init(&self, state: &SyncState) -> StorageResult<SyncState> {
        let optional = |h: Option<u64>, field: &str| h.map(|h| height_to_i64(h, field)).transpose();

        sqlx::query(
            r#"
            INSERT INTO sync_state (
                id, last_synced_height, tip_height, is_bulk_mode,
                backward_synced_height, live_synced_height, indexer_head_height, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(GLOBAL_SYNC_STATE_ID)
        .bind(height_to_i64(state.last_synced_height, "last_synced_height")?)
        .bind(height_to_i64(state.tip_height, "tip_height")?)
        .bind(state.is_bulk_mode)
        .bind(optional(state.backward_synced_height, "backward_synced_height")?)
        .bind(optional(state.live_synced_height, "live_synced_height")?)
        .bind(optional(state.indexer_head_height, "indexer_head_height")?)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        // Another process may have created the row first; return what is stored.
        let row = sqlx::query_as::<_, SyncStateRow>(SELECT_STATE)
            .bind(GLOBAL_SYNC_STATE_ID)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?;

        row.into_state()
    }

    async fn raise_tip(&self, height: u64) -> StorageResult<()> {
        self.update(
            "UPDATE sync_state SET tip_height = GREATEST(tip_height, $2), updated_at = NOW() \
             WHERE id = $1",
            height,
            "tip_height",
        )
        .await
    }

    async fn set_bulk_mode(&self, bulk: bool) -> StorageResult<()> {
        sqlx::query("UPDATE sync_state SET is_bulk_mode = $2, updated_at = NOW() WHERE id = $1")
            .bind(GLOBAL_SYNC_STATE_ID)
            .bind(bulk)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn lower_backward(&self, height: u64) -> StorageResult<()> {
        self.update(
            "UPDATE sync_state \
             SET backward_synced_height = LEAST(COALESCE(backward_synced_height, $2), $2), \
                 updated_at = NOW() \
             WHERE id = $1",
            height,
            "backward_synced_height",
        )
        .await
    }

    async fn raise_live(&self, height: u64) -> StorageResult<()> {
        self.update(
            "UPDATE sync_state \
             SET live_synced_height = GREATEST(COALESCE(live_synced_height, $2), $2), \
                 updated_at = NOW() \
             WHERE id = $1",
            height,
            "live_synced_height",
        )
        .await
    }

    async fn raise_indexer_head(&self, height: u64) -> StorageResult<()> {
        self.update(
            "UPDATE sync_state \
             SET indexer_head_height = GREATEST(COALESCE(indexer_head_height, $2), $2), \
                 updated_at = NOW() \
             WHERE id = $1",
            height,
            "indexer_head_height",
        )
        .await
    }

    async fn raise_last_synced(&self, height: u64) -> StorageResult<()> {
        self.update(
            "UPDATE sync_state \
             SET last_synced_height = GREATEST(last_synced_height, $2), updated_at = NOW() \
             WHERE id = $1",
            height,
            "last_synced_height",
        )
        .await
    }
}

#[derive(sqlx::FromRow)]
struct SyncStateRow {
    last_synced_height: i64,
    tip_height: i64,
    is_bulk_mode: bool,
    backward_synced_height: Option<i64>,
    live_synced_height: Option<i64>,
    indexer_head_height: Option<i64>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl SyncStateRow {
    fn into_state(self) -> StorageResult<SyncState> {
        Ok(SyncState {
            last_synced_height: i64_to_height(self.last_synced_height, "sync_state.last_synced_height")?,
            tip_height: i64_to_height(self.tip_height, "sync_state.tip_height")?,
            is_bulk_mode: self.is_bulk_mode,
            backward_synced_height: optional_height(
                self.backward_synced_height,
                "sync_state.backward_synced_height",
            )?,
            live_synced_height: optional_height(
                self.live_synced_height,
                "sync_state.live_synced_height",
            )?,
            indexer_head_height: optional_height(
                self.indexer_head_height,
                "sync_state.indexer_head_height",
            )?,
            updated_at: self.updated_at,
        })
    }
}
