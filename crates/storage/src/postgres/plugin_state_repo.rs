//! Per-plugin sync state repository implementation for PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;

use aesync_core::error::{StorageError, StorageResult};
use aesync_core::models::{PluginSyncState, SyncDirection};
use aesync_core::ports::PluginSyncStateRepository;

use super::database::Database;
use super::helpers::{height_to_i64, i64_to_height, optional_height, query_error};

const COLUMNS: &str = "plugin_name, version, last_synced_height, backward_synced_height, \
                       live_synced_height, start_from_height, updated_at";

/// PostgreSQL implementation of PluginSyncStateRepository.
pub struct PgPluginSyncStateRepository {
    pool: PgPool,
}

impl PgPluginSyncStateRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

/// Frontier update applied by `record_progress` for a direction.
fn progress_statement(direction: SyncDirection) -> String {
    let frontier = match direction {
        SyncDirection::Backward => {
            "backward_synced_height = LEAST(COALESCE(backward_synced_height, $2), $2),"
        }
        SyncDirection::Live => {
            "live_synced_height = GREATEST(COALESCE(live_synced_height, $2), $2),"
        }
        SyncDirection::Reorg | SyncDirection::Upgrade => "",
    };
    format!(
        "UPDATE plugin_sync_state SET {frontier} \
         last_synced_height = GREATEST(last_synced_height, $2), updated_at = NOW() \
         WHERE plugin_name = $1 \
         RETURNING {COLUMNS}"
    )
}

#[async_trait]
impl PluginSyncStateRepository for PgPluginSyncStateRepository {
    async fn get(&self, plugin_name: &str) -> StorageResult<Option<PluginSyncState>> {
        let row = sqlx::query_as::<_, PluginStateRow>(&format!(
            "SELECT {COLUMNS} FROM plugin_sync_state WHERE plugin_name = $1"
        ))
        .bind(plugin_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        row.map(PluginStateRow::into_state).transpose()
    }

    async fn list(&self) -> StorageResult<Vec<PluginSyncState>> {
        let rows = sqlx::query_as::<_, PluginStateRow>(&format!(
            "SELECT {COLUMNS} FROM plugin_sync_state ORDER BY plugin_name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.into_iter().map(PluginStateRow::into_state).collect()
    }

    async fn save(&self, state: &PluginSyncState) -> StorageResult<()> {
        let optional = |h: Option<u64>, field: &str| h.map(|h| height_to_i64(h, field)).transpose();

        sqlx::query(
            r#"
            INSERT INTO plugin_sync_state (
                plugin_name, version, last_synced_height, backward_synced_height,
                live_synced_height, start_from_height, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (plugin_name) DO UPDATE SET
                version = EXCLUDED.version,
                last_synced_height = EXCLUDED.last_synced_height,
                backward_synced_height = EXCLUDED.backward_synced_height,
                live_synced_height = EXCLUDED.live_synced_height,
                start_from_height = EXCLUDED.start_from_height,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&state.plugin_name)
        .bind(version_to_i32(state.version)?)
        .bind(height_to_i64(state.last_synced_height, "last_synced_height")?)
        .bind(optional(state.backward_synced_height, "backward_synced_height")?)
        .bind(optional(state.live_synced_height, "live_synced_height")?)
        .bind(height_to_i64(state.start_from_height, "start_from_height")?)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn record_progress(
        &self,
        plugin_name: &str,
        direction: SyncDirection,
        max_height: u64,
    ) -> StorageResult<Option<PluginSyncState>> {
        let row = sqlx::query_as::<_, PluginStateRow>(&progress_statement(direction))
            .bind(plugin_name)
            .bind(height_to_i64(max_height, "max_height")?)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;

        row.map(PluginStateRow::into_state).transpose()
    }
}

pub(super) fn version_to_i32(version: u32) -> StorageResult<i32> {
    i32::try_from(version)
        .map_err(|_| StorageError::SerializationError(format!("version out of range: {version}")))
}

pub(super) fn i32_to_version(value: i32, field_name: &str) -> StorageResult<u32> {
    u32::try_from(value).map_err(|_| {
        StorageError::SerializationError(format!("{field_name} is negative: {value}"))
    })
}

#[derive(sqlx::FromRow)]
struct PluginStateRow {
    plugin_name: String,
    version: i32,
    last_synced_height: i64,
    backward_synced_height: Option<i64>,
    live_synced_height: Option<i64>,
    start_from_height: i64,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl PluginStateRow {
    fn into_state(self) -> StorageResult<PluginSyncState> {
        Ok(PluginSyncState {
            version: i32_to_version(self.version, "plugin_sync_state.version")?,
            last_synced_height: i64_to_height(
                self.last_synced_height,
                "plugin_sync_state.last_synced_height",
            )?,
            backward_synced_height: optional_height(
                self.backward_synced_height,
                "plugin_sync_state.backward_synced_height",
            )?,
            live_synced_height: optional_height(
                self.live_synced_height,
                "plugin_sync_state.live_synced_height",
            )?,
            start_from_height: i64_to_height(
                self.start_from_height,
                "plugin_sync_state.start_from_height",
            )?,
            plugin_name: self.plugin_name,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test critique: backward ne touche que sa propre frontière
    #[test]
    fn test_progress_statement_per_direction() {
        let backward = progress_statement(SyncDirection::Backward);
        assert!(backward.contains("backward_synced_height = LEAST"));
        assert!(!backward.contains("live_synced_height = GREATEST"));

        let live = progress_statement(SyncDirection::Live);
        assert!(live.contains("live_synced_height = GREATEST"));
        assert!(!live.contains("backward_synced_height = LEAST"));

        for direction in [SyncDirection::Reorg, SyncDirection::Upgrade] {
            let sql = progress_statement(direction);
            assert!(!sql.contains("LEAST"));
            assert!(sql.contains("last_synced_height = GREATEST(last_synced_height, $2)"));
            assert!(sql.contains("RETURNING"));
        }
    }

    #[test]
    fn test_version_conversion_bounds() {
        assert_eq!(version_to_i32(7).unwrap(), 7);
        assert!(version_to_i32(u32::MAX).is_err());
        assert!(i32_to_version(-1, "version").is_err());
    }
}
