//! Transaction repository implementation for PostgreSQL.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use aesync_core::error::{StorageError, StorageResult};
use aesync_core::models::{SidecarKind, Transaction, TxCursor, VersionedEntry};
use aesync_core::ports::{BulkInsertOutcome, TransactionQuery, TransactionRepository, UpsertOutcome};

use super::database::Database;
use super::helpers::{
    decode_sidecar, encode_sidecar, height_to_i64, i64_to_height, query_error, u32_to_i32,
};

const COLUMNS: &str = "hash, block_hash, block_height, micro_index, micro_time, tx_type, \
    contract_id, function, caller_id, sender_id, recipient_id, raw, data, logs";

/// PostgreSQL implementation of TransactionRepository.
pub struct PgTransactionRepository {
    pool: PgPool,
}

impl PgTransactionRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

/// Rows ready for binding, one per distinct hash (last occurrence wins).
fn prepare_rows(txs: &[Transaction]) -> StorageResult<Vec<InsertRow<'_>>> {
    let mut by_hash: BTreeMap<&str, &Transaction> = BTreeMap::new();
    for tx in txs {
        by_hash.insert(tx.hash.as_str(), tx);
    }
    by_hash.into_values().map(InsertRow::new).collect()
}

struct InsertRow<'a> {
    tx: &'a Transaction,
    block_height: i64,
    micro_index: i32,
    data: serde_json::Value,
    logs: serde_json::Value,
}

impl<'a> InsertRow<'a> {
    fn new(tx: &'a Transaction) -> StorageResult<Self> {
        Ok(Self {
            block_height: height_to_i64(tx.block_height, "transaction.block_height")?,
            micro_index: u32_to_i32(tx.micro_index, "transaction.micro_index")?,
            data: encode_sidecar(&tx.data)?,
            logs: encode_sidecar(&tx.logs)?,
            tx,
        })
    }
}

fn push_insert<'a>(rows: &'a [InsertRow<'a>]) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!("INSERT INTO transactions ({COLUMNS}) "));
    builder.push_values(rows, |mut b, row| {
        b.push_bind(&row.tx.hash)
            .push_bind(&row.tx.block_hash)
            .push_bind(row.block_height)
            .push_bind(row.micro_index)
            .push_bind(row.tx.micro_time)
            .push_bind(&row.tx.tx_type)
            .push_bind(&row.tx.contract_id)
            .push_bind(&row.tx.function)
            .push_bind(&row.tx.caller_id)
            .push_bind(&row.tx.sender_id)
            .push_bind(&row.tx.recipient_id)
            .push_bind(&row.tx.raw)
            .push_bind(&row.data)
            .push_bind(&row.logs);
    });
    builder
}

#[async_trait]
impl TransactionRepository for PgTransactionRepository {
    async fn upsert_transactions(&self, txs: &[Transaction]) -> StorageResult<UpsertOutcome> {
        if txs.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let rows = prepare_rows(txs)?;

        // Sidecars are owned by plugins and never overwritten here. Unchanged
        // rows are not touched and do not appear in RETURNING.
        let mut builder = push_insert(&rows);
        builder.push(
            r#"
            ON CONFLICT (hash) DO UPDATE SET
                block_hash = EXCLUDED.block_hash,
                block_height = EXCLUDED.block_height,
                micro_index = EXCLUDED.micro_index,
                micro_time = EXCLUDED.micro_time,
                tx_type = EXCLUDED.tx_type,
                contract_id = EXCLUDED.contract_id,
                function = EXCLUDED.function,
                caller_id = EXCLUDED.caller_id,
                sender_id = EXCLUDED.sender_id,
                recipient_id = EXCLUDED.recipient_id,
                raw = EXCLUDED.raw,
                updated_at = NOW()
            WHERE (transactions.block_hash, transactions.block_height, transactions.micro_index,
                   transactions.micro_time, transactions.tx_type, transactions.contract_id,
                   transactions.function, transactions.caller_id, transactions.sender_id,
                   transactions.recipient_id, transactions.raw)
                IS DISTINCT FROM
                  (EXCLUDED.block_hash, EXCLUDED.block_height, EXCLUDED.micro_index,
                   EXCLUDED.micro_time, EXCLUDED.tx_type, EXCLUDED.contract_id,
                   EXCLUDED.function, EXCLUDED.caller_id, EXCLUDED.sender_id,
                   EXCLUDED.recipient_id, EXCLUDED.raw)
            RETURNING hash, (xmax = 0) AS inserted
            "#,
        );

        let written: Vec<(String, bool)> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;

        let mut outcome = UpsertOutcome::default();
        for (hash, inserted) in written {
            if inserted {
                outcome.inserted.push(hash);
            } else {
                outcome.updated += 1;
            }
        }
        Ok(outcome)
    }

    async fn bulk_insert_transactions(
        &self,
        txs: &[Transaction],
    ) -> StorageResult<BulkInsertOutcome> {
        if txs.is_empty() {
            return Ok(BulkInsertOutcome::default());
        }
        let rows = prepare_rows(txs)?;

        let mut builder = push_insert(&rows);
        builder.push(" ON CONFLICT (hash) DO NOTHING");
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(query_error)?;

        let inserted = result.rows_affected();
        Ok(BulkInsertOutcome {
            inserted,
            duplicates: (txs.len() as u64).saturating_sub(inserted),
        })
    }

    async fn get_transactions(&self, hashes: &[String]) -> StorageResult<Vec<Transaction>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM transactions WHERE hash = ANY($1) \
             ORDER BY block_height, micro_index, micro_time, hash"
        ))
        .bind(hashes)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.into_iter().map(TransactionRow::into_transaction).collect()
    }

    async fn hashes_at_height(&self, height: u64) -> StorageResult<Vec<String>> {
        sqlx::query_scalar("SELECT hash FROM transactions WHERE block_height = $1")
            .bind(height_to_i64(height, "height")?)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)
    }

    async fn delete_transactions(&self, hashes: &[String]) -> StorageResult<u64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM transactions WHERE hash = ANY($1)")
            .bind(hashes)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn find_transactions(
        &self,
        query: &TransactionQuery,
        after: Option<&TxCursor>,
        limit: usize,
    ) -> StorageResult<Vec<Transaction>> {
        // Column names and operators are fixed; every value is bound.
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM transactions WHERE TRUE"));

        if !query.tx_types.is_empty() {
            builder.push(" AND tx_type = ANY(").push_bind(&query.tx_types).push(")");
        }
        if !query.contract_ids.is_empty() {
            builder
                .push(" AND contract_id = ANY(")
                .push_bind(&query.contract_ids)
                .push(")");
        }
        if !query.functions.is_empty() {
            builder.push(" AND function = ANY(").push_bind(&query.functions).push(")");
        }
        if let Some(gte) = query.height_gte {
            builder
                .push(" AND block_height >= ")
                .push_bind(height_to_i64(gte, "height_gte")?);
        }
        if let Some(lte) = query.height_lte {
            builder
                .push(" AND block_height <= ")
                .push_bind(height_to_i64(lte, "height_lte")?);
        }
        if let Some(cursor) = after {
            builder
                .push(" AND (block_height, micro_index, micro_time, hash) > (")
                .push_bind(height_to_i64(cursor.block_height, "cursor.block_height")?)
                .push(", ")
                .push_bind(u32_to_i32(cursor.micro_index, "cursor.micro_index")?)
                .push(", ")
                .push_bind(cursor.micro_time)
                .push(", ")
                .push_bind(&cursor.hash)
                .push(")");
        }
        builder
            .push(" ORDER BY block_height, micro_index, micro_time, hash LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows: Vec<TransactionRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;

        rows.into_iter().map(TransactionRow::into_transaction).collect()
    }

    async fn set_sidecar_entry(
        &self,
        hash: &str,
        kind: SidecarKind,
        plugin: &str,
        entry: &VersionedEntry,
    ) -> StorageResult<()> {
        let column = kind.column();
        let value =
            serde_json::to_value(entry).map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let result = sqlx::query(&format!(
            "UPDATE transactions SET {column} = jsonb_set({column}, ARRAY[$2], $3, true), \
             updated_at = NOW() WHERE hash = $1"
        ))
        .bind(hash)
        .bind(plugin)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("transaction {hash}")));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    hash: String,
    block_hash: String,
    block_height: i64,
    micro_index: i32,
    micro_time: i64,
    tx_type: String,
    contract_id: Option<String>,
    function: Option<String>,
    caller_id: Option<String>,
    sender_id: Option<String>,
    recipient_id: Option<String>,
    raw: serde_json::Value,
    data: serde_json::Value,
    logs: serde_json::Value,
}

impl TransactionRow {
    fn into_transaction(self) -> StorageResult<Transaction> {
        Ok(Transaction {
            block_height: i64_to_height(self.block_height, "transactions.block_height")?,
            micro_index: u32::try_from(self.micro_index).map_err(|_| {
                StorageError::SerializationError(format!(
                    "transactions.micro_index is negative: {}",
                    self.micro_index
                ))
            })?,
            data: decode_sidecar(self.data, "transactions.data")?,
            logs: decode_sidecar(self.logs, "transactions.logs")?,
            hash: self.hash,
            block_hash: self.block_hash,
            micro_time: self.micro_time,
            tx_type: self.tx_type,
            contract_id: self.contract_id,
            function: self.function,
            caller_id: self.caller_id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            raw: self.raw,
        })
    }
}
