//! Key block and micro block repository implementation for PostgreSQL.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use aesync_core::error::StorageResult;
use aesync_core::models::{KeyBlock, MicroBlock};
use aesync_core::ports::{BlockRepository, HeightRange};

use super::database::Database;
use super::helpers::{height_to_i64, i64_to_height, optional_height, query_error, u32_to_i32};

/// PostgreSQL implementation of BlockRepository.
pub struct PgBlockRepository {
    pool: PgPool,
}

impl PgBlockRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

/// Keep the last block per key so one statement never updates a row twice.
fn dedup_by<T, K: Ord>(items: &[T], key: impl Fn(&T) -> K) -> Vec<&T> {
    let mut by_key: BTreeMap<K, &T> = BTreeMap::new();
    for item in items {
        by_key.insert(key(item), item);
    }
    by_key.into_values().collect()
}

#[async_trait]
impl BlockRepository for PgBlockRepository {
    async fn upsert_key_blocks(&self, blocks: &[KeyBlock]) -> StorageResult<u64> {
        if blocks.is_empty() {
            return Ok(0);
        }
        let rows = dedup_by(blocks, |b| b.height);
        let columns = rows
            .iter()
            .map(|b| {
                Ok((
                    height_to_i64(b.height, "key_block.height")?,
                    u32_to_i32(b.micro_blocks_count, "key_block.micro_blocks_count")?,
                    u32_to_i32(b.transactions_count, "key_block.transactions_count")?,
                ))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO key_blocks (height, hash, prev_hash, prev_key_hash, beneficiary, miner, \
             time, micro_blocks_count, transactions_count) ",
        );
        builder.push_values(
            rows.iter().zip(&columns),
            |mut b, (block, (height, micro_blocks, transactions))| {
                b.push_bind(*height)
                    .push_bind(&block.hash)
                    .push_bind(&block.prev_hash)
                    .push_bind(&block.prev_key_hash)
                    .push_bind(&block.beneficiary)
                    .push_bind(&block.miner)
                    .push_bind(block.time)
                    .push_bind(*micro_blocks)
                    .push_bind(*transactions);
            },
        );
        builder.push(
            r#"
            ON CONFLICT (height) DO UPDATE SET
                hash = EXCLUDED.hash,
                prev_hash = EXCLUDED.prev_hash,
                prev_key_hash = EXCLUDED.prev_key_hash,
                beneficiary = EXCLUDED.beneficiary,
                miner = EXCLUDED.miner,
                time = EXCLUDED.time,
                micro_blocks_count = EXCLUDED.micro_blocks_count,
                transactions_count = EXCLUDED.transactions_count,
                updated_at = NOW()
            WHERE (key_blocks.hash, key_blocks.micro_blocks_count, key_blocks.transactions_count)
                IS DISTINCT FROM
                  (EXCLUDED.hash, EXCLUDED.micro_blocks_count, EXCLUDED.transactions_count)
            "#,
        );

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn upsert_micro_blocks(&self, blocks: &[MicroBlock]) -> StorageResult<u64> {
        if blocks.is_empty() {
            return Ok(0);
        }
        let rows = dedup_by(blocks, |b| b.hash.clone());
        let columns = rows
            .iter()
            .map(|b| {
                Ok((
                    height_to_i64(b.height, "micro_block.height")?,
                    u32_to_i32(b.micro_block_index, "micro_block.micro_block_index")?,
                    u32_to_i32(b.transactions_count, "micro_block.transactions_count")?,
                ))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO micro_blocks (hash, height, prev_hash, prev_key_hash, micro_block_index, \
             time, transactions_count) ",
        );
        builder.push_values(
            rows.iter().zip(&columns),
            |mut b, (block, (height, index, transactions))| {
                b.push_bind(&block.hash)
                    .push_bind(*height)
                    .push_bind(&block.prev_hash)
                    .push_bind(&block.prev_key_hash)
                    .push_bind(*index)
                    .push_bind(block.time)
                    .push_bind(*transactions);
            },
        );
        builder.push(
            r#"
            ON CONFLICT (hash) DO UPDATE SET
                height = EXCLUDED.height,
                prev_hash = EXCLUDED.prev_hash,
                prev_key_hash = EXCLUDED.prev_key_hash,
                micro_block_index = EXCLUDED.micro_block_index,
                time = EXCLUDED.time,
                transactions_count = EXCLUDED.transactions_count,
                updated_at = NOW()
            WHERE (micro_blocks.height, micro_blocks.transactions_count)
                IS DISTINCT FROM (EXCLUDED.height, EXCLUDED.transactions_count)
            "#,
        );

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn key_block_hashes(&self, range: HeightRange) -> StorageResult<BTreeMap<u64, String>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT height, hash
            FROM key_blocks
            WHERE height BETWEEN $1 AND $2
            ORDER BY height
            "#,
        )
        .bind(height_to_i64(range.from, "range.from")?)
        .bind(height_to_i64(range.to, "range.to")?)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.into_iter()
            .map(|(height, hash)| Ok((i64_to_height(height, "key_blocks.height")?, hash)))
            .collect()
    }

    async fn latest_key_block_height(&self) -> StorageResult<Option<u64>> {
        let height: Option<i64> = sqlx::query_scalar("SELECT MAX(height) FROM key_blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?;

        optional_height(height, "key_blocks.height")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_block(height: u64, hash: &str) -> KeyBlock {
        KeyBlock {
            hash: hash.into(),
            height,
            prev_hash: String::new(),
            prev_key_hash: String::new(),
            beneficiary: None,
            miner: None,
            time: 0,
            micro_blocks_count: 0,
            transactions_count: 0,
        }
    }

    #[test]
    fn test_dedup_keeps_last_block_per_height() {
        let blocks = vec![key_block(5, "kh_old"), key_block(6, "kh_6"), key_block(5, "kh_new")];

        let rows = dedup_by(&blocks, |b| b.height);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].hash, "kh_new");
        assert_eq!(rows[1].hash, "kh_6");
    }
}
