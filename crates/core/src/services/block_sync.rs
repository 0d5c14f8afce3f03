//! Height-range mirroring.
//!
//! Syncs one range in three steps: key blocks, then the micro blocks of
//! each generation, then transactions. Transactions are written in chunks
//! through one of two paths (bulk insert or upsert) and each chunk can be
//! handed to the plugin fan-out right after it is written.

use std::sync::Arc;

use tracing::{debug, error, instrument, trace, warn};

use crate::error::{IndexerResult, StorageError};
use crate::events::TransactionEvents;
use crate::metrics::{record_key_blocks_persisted, record_transactions_persisted};
use crate::models::{KeyBlock, SyncDirection, Transaction};
use crate::ports::{ChainApi, FetchDirection, HeightRange, Repositories};

use super::micro_block::MicroBlockService;
use super::plugin_batch_processor::PluginBatchProcessorService;

/// Transactions per write chunk.
pub const WRITE_CHUNK_SIZE: usize = 1000;

/// How transactions are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    /// Plain insert skipping existing rows; never emits created events.
    Bulk,
    /// Upsert by hash; the caller decides whether created events go out.
    Upsert { emit_created: bool },
}

/// Options of one range sync.
#[derive(Debug, Clone, Copy)]
pub struct RangeSyncOptions {
    pub fetch: FetchDirection,
    pub write: WritePath,
    /// Hand each written chunk to the plugins with this direction.
    pub dispatch: Option<SyncDirection>,
}

/// What a range sync wrote.
#[derive(Debug, Default, Clone)]
pub struct RangeSync {
    pub key_blocks: usize,
    pub micro_blocks: usize,
    /// Every transaction fetched for the range, in fetch order.
    pub transactions: Vec<Transaction>,
    /// Rows inserted or changed.
    pub written: u64,
    /// Rows skipped as already present.
    pub duplicates: u64,
}

/// Mirrors height ranges from the chain into the store.
pub struct BlockSyncService {
    chain: Arc<dyn ChainApi>,
    repositories: Arc<dyn Repositories>,
    micro_blocks: MicroBlockService,
    processor: Arc<PluginBatchProcessorService>,
    events: TransactionEvents,
}

impl BlockSyncService {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        repositories: Arc<dyn Repositories>,
        processor: Arc<PluginBatchProcessorService>,
        events: TransactionEvents,
    ) -> Self {
        Self {
            micro_blocks: MicroBlockService::new(chain.clone(), repositories.clone()),
            chain,
            repositories,
            processor,
            events,
        }
    }

    pub fn micro_blocks(&self) -> &MicroBlockService {
        &self.micro_blocks
    }

    /// Sync every block and transaction of `range`.
    ///
    /// Any fetch or unexpected store error aborts the range; nothing tells
    /// the caller which chunks made it, so frontiers must only move after
    /// this returns `Ok`.
    #[instrument(skip_all, fields(range = %range))]
    pub async fn sync_range(
        &self,
        range: HeightRange,
        options: RangeSyncOptions,
    ) -> IndexerResult<RangeSync> {
        let mut result = RangeSync::default();

        let key_blocks = self.fetch_key_blocks(range, options.fetch).await?;
        if !key_blocks.is_empty() {
            self.repositories.blocks().upsert_key_blocks(&key_blocks).await?;
            record_key_blocks_persisted(key_blocks.len() as u64);
        }
        result.key_blocks = key_blocks.len();
        result.micro_blocks = self.micro_blocks.sync_generations(&key_blocks).await?;

        let mut pending: Vec<Transaction> = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let page = self
                .chain
                .transactions(range, options.fetch, next.as_deref())
                .await?;
            pending.extend(page.data);

            while pending.len() >= WRITE_CHUNK_SIZE {
                let chunk: Vec<Transaction> = pending.drain(..WRITE_CHUNK_SIZE).collect();
                self.write_chunk(chunk, options, &mut result).await?;
            }

            match page.next {
                Some(cursor) => next = Some(cursor),
                None => break,
            }
        }
        if !pending.is_empty() {
            self.write_chunk(pending, options, &mut result).await?;
        }

        debug!(
            key_blocks = result.key_blocks,
            micro_blocks = result.micro_blocks,
            transactions = result.transactions.len(),
            written = result.written,
            duplicates = result.duplicates,
            "Range synced"
        );
        Ok(result)
    }

    async fn fetch_key_blocks(
        &self,
        range: HeightRange,
        direction: FetchDirection,
    ) -> IndexerResult<Vec<KeyBlock>> {
        let mut blocks = Vec::with_capacity(range.len() as usize);
        let mut next: Option<String> = None;
        loop {
            let page = self
                .chain
                .key_blocks(range, direction, next.as_deref())
                .await?;
            blocks.extend(page.data);
            match page.next {
                Some(cursor) => next = Some(cursor),
                None => break,
            }
        }
        Ok(blocks)
    }

    async fn write_chunk(
        &self,
        mut chunk: Vec<Transaction>,
        options: RangeSyncOptions,
        result: &mut RangeSync,
    ) -> IndexerResult<()> {
        let store = self.repositories.transactions();
        let mut rejected: Option<StorageError> = None;

        match options.write {
            WritePath::Bulk => match store.bulk_insert_transactions(&chunk).await {
                Ok(outcome) => {
                    record_transactions_persisted("bulk", outcome.inserted);
                    result.written += outcome.inserted;
                    result.duplicates += outcome.duplicates;
                }
                Err(StorageError::ConstraintViolation(detail)) => {
                    // Another loop wrote the same rows first.
                    trace!(detail = %detail, "Duplicate key during bulk insert, treated as applied");
                    result.duplicates += chunk.len() as u64;
                }
                Err(e) => {
                    warn!(error = %e, count = chunk.len(), "⚠️  Bulk insert failed, falling back to upsert");
                    let (landed, failure) = self.upsert_each(chunk, result).await;
                    chunk = landed;
                    rejected = failure;
                }
            },
            WritePath::Upsert { emit_created } => {
                let outcome = store.upsert_transactions(&chunk).await?;
                record_transactions_persisted("upsert", outcome.written());
                result.written += outcome.written();
                if emit_created {
                    self.events.emit_created(&chunk, &outcome.inserted);
                }
            }
        }

        if let Some(direction) = options.dispatch {
            self.processor.process(&chunk, direction).await;
        }
        result.transactions.extend(chunk);
        match rejected {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Upsert rows one at a time so a single bad row cannot keep the rest
    /// of the chunk out. Returns the rows that landed and the first error.
    async fn upsert_each(
        &self,
        chunk: Vec<Transaction>,
        result: &mut RangeSync,
    ) -> (Vec<Transaction>, Option<StorageError>) {
        let store = self.repositories.transactions();
        let mut landed = Vec::with_capacity(chunk.len());
        let mut first_error = None;

        for tx in chunk {
            match store.upsert_transactions(std::slice::from_ref(&tx)).await {
                Ok(outcome) => {
                    record_transactions_persisted("fallback", outcome.written());
                    result.written += outcome.written();
                    landed.push(tx);
                }
                Err(e) => {
                    error!(tx = %tx.hash, height = tx.block_height, error = %e, "❌ Row rejected by fallback upsert");
                    first_error.get_or_insert(e);
                }
            }
        }
        (landed, first_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Plugin;
    use crate::services::plugin_failed_transaction::PluginFailedTransactionService;
    use crate::services::plugin_registry::PluginRegistryService;
    use crate::testing::{InMemoryRepositories, MockChain, RecordingPlugin};

    struct Harness {
        chain: Arc<MockChain>,
        repos: Arc<InMemoryRepositories>,
        plugin: Arc<RecordingPlugin>,
        events: TransactionEvents,
        service: BlockSyncService,
    }

    async fn harness(chain: MockChain) -> Harness {
        let chain = Arc::new(chain);
        let repos = Arc::new(InMemoryRepositories::new());
        let plugin = Arc::new(RecordingPlugin::new("rec", 1));
        let registry =
            Arc::new(PluginRegistryService::new(vec![plugin.clone() as Arc<dyn Plugin>]).unwrap());
        registry.bootstrap(repos.as_ref()).await.unwrap();
        let failed = Arc::new(PluginFailedTransactionService::new(repos.clone(), registry.clone()));
        let processor = Arc::new(PluginBatchProcessorService::new(repos.clone(), registry, failed));
        let events = TransactionEvents::default();
        let service = BlockSyncService::new(chain.clone(), repos.clone(), processor, events.clone());
        Harness {
            chain,
            repos,
            plugin,
            events,
            service,
        }
    }

    fn options(write: WritePath, dispatch: Option<SyncDirection>) -> RangeSyncOptions {
        RangeSyncOptions {
            fetch: FetchDirection::Backward,
            write,
            dispatch,
        }
    }

    #[tokio::test]
    async fn range_sync_mirrors_blocks_and_paginated_transactions() {
        let h = harness(MockChain::generate(20, 3).with_page_size(7)).await;
        let range = HeightRange::new(5, 14).unwrap();

        let synced = h
            .service
            .sync_range(range, options(WritePath::Upsert { emit_created: false }, None))
            .await
            .unwrap();

        assert_eq!(synced.key_blocks, 10);
        assert_eq!(synced.micro_blocks, 10);
        assert_eq!(synced.transactions.len(), 30);
        assert_eq!(h.repos.all_transactions().len(), 30);
        assert!(h.repos.key_block_at(4).is_none());
        assert!(h.repos.key_block_at(14).is_some());
    }

    // Test critique: resynchroniser une plage déjà synchronisée ne change rien
    #[tokio::test]
    async fn resyncing_a_range_is_idempotent() {
        let h = harness(MockChain::generate(10, 2)).await;
        let range = HeightRange::new(0, 10).unwrap();
        let opts = options(WritePath::Upsert { emit_created: true }, None);

        h.service.sync_range(range, opts).await.unwrap();
        let before = h.repos.all_transactions();
        let writes = h.repos.row_writes();

        let again = h.service.sync_range(range, opts).await.unwrap();

        assert_eq!(again.written, 0);
        assert_eq!(h.repos.row_writes(), writes);
        assert_eq!(h.repos.all_transactions(), before);
    }

    #[tokio::test]
    async fn bulk_path_skips_duplicates_and_emits_nothing() {
        let h = harness(MockChain::generate(10, 2)).await;
        let mut rx = h.events.subscribe();
        h.repos.insert_transactions(&h.chain.transactions_at(3));

        let synced = h
            .service
            .sync_range(
                HeightRange::new(0, 10).unwrap(),
                options(WritePath::Bulk, Some(SyncDirection::Backward)),
            )
            .await
            .unwrap();

        assert_eq!(synced.written, 20);
        assert_eq!(synced.duplicates, 2);
        assert!(rx.try_recv().is_err());
        // Les doublons sont quand même transmis aux plugins
        assert_eq!(h.plugin.processed_hashes().len(), 22);
    }

    #[tokio::test]
    async fn bulk_failure_falls_back_to_upsert_once() {
        let h = harness(MockChain::generate(5, 2)).await;
        h.repos.fail_next_bulk_insert();

        let synced = h
            .service
            .sync_range(
                HeightRange::new(0, 5).unwrap(),
                options(WritePath::Bulk, Some(SyncDirection::Backward)),
            )
            .await
            .unwrap();

        assert_eq!(h.repos.bulk_calls(), 1);
        assert_eq!(synced.written, 12);
        assert_eq!(h.repos.all_transactions().len(), 12);
        assert_eq!(h.plugin.processed_hashes().len(), 12);
    }

    // Test critique: une ligne rejetée par le repli n'empêche pas les autres d'être écrites
    #[tokio::test]
    async fn fallback_persists_rows_around_a_rejected_one() {
        let h = harness(MockChain::generate(5, 2)).await;
        h.repos.fail_next_bulk_insert();
        h.repos.reject_row("th_3_1");

        let result = h
            .service
            .sync_range(
                HeightRange::new(0, 5).unwrap(),
                options(WritePath::Bulk, Some(SyncDirection::Backward)),
            )
            .await;

        assert!(result.is_err());
        let stored = h.repos.all_transactions();
        assert_eq!(stored.len(), 11);
        assert!(h.repos.transaction("th_3_1").is_none());
        assert!(h.repos.transaction("th_3_0").is_some());
        let processed = h.plugin.processed_hashes();
        assert_eq!(processed.len(), 11);
        assert!(!processed.contains(&"th_3_1".to_string()));
    }

    #[tokio::test]
    async fn constraint_violation_is_treated_as_applied() {
        let h = harness(MockChain::generate(3, 1)).await;
        h.repos.conflict_next_bulk_insert();

        let synced = h
            .service
            .sync_range(
                HeightRange::new(0, 3).unwrap(),
                options(WritePath::Bulk, Some(SyncDirection::Backward)),
            )
            .await
            .unwrap();

        assert_eq!(synced.duplicates, 4);
        assert_eq!(h.plugin.processed_hashes().len(), 4);
    }

    #[tokio::test]
    async fn bulk_writes_in_chunks_of_one_thousand() {
        let h = harness(MockChain::generate(24, 100)).await;

        h.service
            .sync_range(
                HeightRange::new(0, 24).unwrap(),
                options(WritePath::Bulk, Some(SyncDirection::Backward)),
            )
            .await
            .unwrap();

        // 2500 transactions: 1000 + 1000 + 500
        assert_eq!(h.repos.bulk_calls(), 3);
        assert_eq!(h.plugin.batches().len(), 3);
    }

    #[tokio::test]
    async fn upsert_path_emits_created_events_for_new_rows_only() {
        let h = harness(MockChain::generate(2, 2)).await;
        let mut rx = h.events.subscribe();
        h.repos.insert_transactions(&h.chain.transactions_at(0));

        h.service
            .sync_range(
                HeightRange::new(0, 2).unwrap(),
                options(WritePath::Upsert { emit_created: true }, None),
            )
            .await
            .unwrap();

        let mut created = Vec::new();
        while let Ok(event) = rx.try_recv() {
            created.push(event.hash);
        }
        created.sort();
        assert_eq!(created, vec!["th_1_0", "th_1_1", "th_2_0", "th_2_1"]);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_range() {
        let h = harness(MockChain::generate(5, 1)).await;
        h.chain.fail_transactions_at(3);

        let result = h
            .service
            .sync_range(
                HeightRange::new(0, 5).unwrap(),
                options(WritePath::Bulk, None),
            )
            .await;

        assert!(result.is_err());
    }
}
