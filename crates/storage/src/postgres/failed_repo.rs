//! Plugin dead-letter repository implementation for PostgreSQL.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use aesync_core::error::StorageResult;
use aesync_core::models::PluginFailedTransaction;
use aesync_core::ports::FailedTransactionRepository;

use super::database::Database;
use super::helpers::query_error;
use super::plugin_state_repo::{i32_to_version, version_to_i32};

/// PostgreSQL implementation of FailedTransactionRepository.
pub struct PgFailedTransactionRepository {
    pool: PgPool,
}

impl PgFailedTransactionRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl FailedTransactionRepository for PgFailedTransactionRepository {
    async fn upsert(&self, records: &[PluginFailedTransaction]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        // Last record wins for a repeated key within one statement.
        let mut by_key = std::collections::BTreeMap::new();
        for record in records {
            by_key.insert((record.plugin_name.as_str(), record.tx_hash.as_str()), record);
        }
        let versions = by_key
            .values()
            .map(|r| version_to_i32(r.version))
            .collect::<StorageResult<Vec<_>>>()?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO plugin_failed_transactions \
             (plugin_name, tx_hash, version, error_message, error_trace, created_at, updated_at) ",
        );
        builder.push_values(by_key.values().zip(&versions), |mut b, (record, version)| {
            b.push_bind(&record.plugin_name)
                .push_bind(&record.tx_hash)
                .push_bind(*version)
                .push_bind(&record.error_message)
                .push_bind(&record.error_trace)
                .push_bind(record.created_at)
                .push_bind(record.updated_at);
        });
        // created_at keeps the first failure time.
        builder.push(
            r#"
            ON CONFLICT (plugin_name, tx_hash) DO UPDATE SET
                version = EXCLUDED.version,
                error_message = EXCLUDED.error_message,
                error_trace = EXCLUDED.error_trace,
                updated_at = EXCLUDED.updated_at
            "#,
        );

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn list_by_version(
        &self,
        plugin_name: &str,
        version: u32,
    ) -> StorageResult<Vec<PluginFailedTransaction>> {
        let rows = sqlx::query_as::<_, FailedRow>(
            r#"
            SELECT plugin_name, tx_hash, version, error_message, error_trace, created_at, updated_at
            FROM plugin_failed_transactions
            WHERE plugin_name = $1 AND version = $2
            ORDER BY created_at, tx_hash
            "#,
        )
        .bind(plugin_name)
        .bind(version_to_i32(version)?)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.into_iter().map(FailedRow::into_record).collect()
    }

    async fn versions(&self, plugin_name: &str) -> StorageResult<Vec<u32>> {
        let versions: Vec<i32> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT version
            FROM plugin_failed_transactions
            WHERE plugin_name = $1
            ORDER BY version
            "#,
        )
        .bind(plugin_name)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        versions
            .into_iter()
            .map(|v| i32_to_version(v, "plugin_failed_transactions.version"))
            .collect()
    }

    async fn delete(&self, plugin_name: &str, tx_hashes: &[String]) -> StorageResult<u64> {
        if tx_hashes.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM plugin_failed_transactions WHERE plugin_name = $1 AND tx_hash = ANY($2)",
        )
        .bind(plugin_name)
        .bind(tx_hashes)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected())
    }

    async fn bump_version(
        &self,
        plugin_name: &str,
        tx_hashes: &[String],
        new_version: u32,
        error_message: &str,
    ) -> StorageResult<u64> {
        if tx_hashes.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE plugin_failed_transactions
            SET version = $3, error_message = $4, updated_at = NOW()
            WHERE plugin_name = $1 AND tx_hash = ANY($2)
            "#,
        )
        .bind(plugin_name)
        .bind(tx_hashes)
        .bind(version_to_i32(new_version)?)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected())
    }

    async fn count(&self, plugin_name: &str) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM plugin_failed_transactions WHERE plugin_name = $1",
        )
        .bind(plugin_name)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(count.max(0) as u64)
    }
}

#[derive(sqlx::FromRow)]
struct FailedRow {
    plugin_name: String,
    tx_hash: String,
    version: i32,
    error_message: String,
    error_trace: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl FailedRow {
    fn into_record(self) -> StorageResult<PluginFailedTransaction> {
        Ok(PluginFailedTransaction {
            version: i32_to_version(self.version, "plugin_failed_transactions.version")?,
            plugin_name: self.plugin_name,
            tx_hash: self.tx_hash,
            error_message: self.error_message,
            error_trace: self.error_trace,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
