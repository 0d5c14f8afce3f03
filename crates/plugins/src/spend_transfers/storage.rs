//! Storage layer for the spend transfers plugin.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use aesync_core::error::{StorageError, StorageResult};

use super::models::SpendTransfer;

/// Storage trait for spend transfer rows.
#[async_trait]
pub trait SpendTransfersStorage: Send + Sync {
    /// Insert or overwrite transfers by transaction hash.
    async fn upsert_transfers(&self, transfers: &[SpendTransfer]) -> StorageResult<u64>;

    /// Delete transfers by transaction hash (reorg rollback).
    async fn delete_transfers(&self, tx_hashes: &[String]) -> StorageResult<u64>;
}

/// PostgreSQL implementation of SpendTransfersStorage.
pub struct PgSpendTransfersStorage {
    pool: PgPool,
}

impl PgSpendTransfersStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SpendTransfersStorage for PgSpendTransfersStorage {
    async fn upsert_transfers(&self, transfers: &[SpendTransfer]) -> StorageResult<u64> {
        if transfers.is_empty() {
            return Ok(0);
        }
        // One row per hash, last wins.
        let transfers: Vec<&SpendTransfer> = transfers
            .iter()
            .map(|t| (t.tx_hash.as_str(), t))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect();
        let heights = transfers
            .iter()
            .map(|t| {
                i64::try_from(t.block_height).map_err(|_| {
                    StorageError::SerializationError(format!(
                        "block_height out of range: {}",
                        t.block_height
                    ))
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO spend_transfers \
             (tx_hash, block_height, micro_time, sender_id, recipient_id, amount, payload) ",
        );
        builder.push_values(transfers.iter().zip(&heights), |mut b, (transfer, height)| {
            b.push_bind(&transfer.tx_hash)
                .push_bind(*height)
                .push_bind(transfer.micro_time)
                .push_bind(&transfer.sender_id)
                .push_bind(&transfer.recipient_id)
                .push_bind(transfer.amount.to_string())
                .push_unseparated("::NUMERIC")
                .push_bind(&transfer.payload);
        });
        builder.push(
            r#"
            ON CONFLICT (tx_hash) DO UPDATE SET
                block_height = EXCLUDED.block_height,
                micro_time = EXCLUDED.micro_time,
                sender_id = EXCLUDED.sender_id,
                recipient_id = EXCLUDED.recipient_id,
                amount = EXCLUDED.amount,
                payload = EXCLUDED.payload
            "#,
        );

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn delete_transfers(&self, tx_hashes: &[String]) -> StorageResult<u64> {
        if tx_hashes.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM spend_transfers WHERE tx_hash = ANY($1)")
            .bind(tx_hashes)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Migrations
// =============================================================================

/// SQL migrations for the spend transfers schema.
pub const MIGRATIONS: &[&str] = &[
    // Migration 0: Create spend_transfers table
    r#"
CREATE TABLE IF NOT EXISTS spend_transfers (
    tx_hash TEXT PRIMARY KEY,
    block_height BIGINT NOT NULL,
    micro_time BIGINT NOT NULL,
    sender_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    amount NUMERIC(39, 0) NOT NULL,
    payload TEXT
);

CREATE INDEX IF NOT EXISTS idx_spend_transfers_height ON spend_transfers(block_height);
CREATE INDEX IF NOT EXISTS idx_spend_transfers_sender ON spend_transfers(sender_id);
CREATE INDEX IF NOT EXISTS idx_spend_transfers_recipient ON spend_transfers(recipient_id);
"#,
];
