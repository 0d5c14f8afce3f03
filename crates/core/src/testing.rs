//! In-memory fakes of the ports, for service tests.
//!
//! Available to this crate's own tests and, through the `test-utils`
//! feature, to downstream crates.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{ChainError, ChainResult, PluginError, PluginResult, StorageError, StorageResult};
use crate::models::{
    KeyBlock, KeyBlockHeader, MicroBlock, PluginFailedTransaction, PluginSidecar, PluginSyncState,
    SPEND_TX, SidecarKind, SyncDirection, SyncState, Transaction, TxCursor, VersionedEntry,
};
use crate::ports::{
    BlockRepository, BulkInsertOutcome, ChainApi, ChainSubscriber, FailedTransactionRepository,
    FetchDirection, HeightRange, KeyBlockStream, Page, Plugin, PluginFilter,
    PluginSyncStateRepository, ReorgPurge, Repositories, SyncStateRepository, TransactionQuery,
    TransactionRepository, TransactionStream, UpsertOutcome,
};

// =============================================================================
// Fixtures
// =============================================================================

/// A spend transaction fixture.
pub fn spend_tx(hash: &str, height: u64, sender: &str, recipient: &str) -> Transaction {
    Transaction {
        hash: hash.to_string(),
        block_hash: format!("mh_{height}"),
        block_height: height,
        micro_index: 0,
        micro_time: height as i64 * 1000,
        tx_type: SPEND_TX.to_string(),
        contract_id: None,
        function: None,
        caller_id: None,
        sender_id: Some(sender.to_string()),
        recipient_id: Some(recipient.to_string()),
        raw: json!({"type": SPEND_TX, "amount": 1}),
        data: PluginSidecar::new(),
        logs: PluginSidecar::new(),
    }
}

/// A contract call fixture.
pub fn contract_call_tx(hash: &str, height: u64, contract: &str, function: &str) -> Transaction {
    Transaction {
        hash: hash.to_string(),
        block_hash: format!("mh_{height}"),
        block_height: height,
        micro_index: 0,
        micro_time: height as i64 * 1000,
        tx_type: "ContractCallTx".to_string(),
        contract_id: Some(contract.to_string()),
        function: Some(function.to_string()),
        caller_id: Some("ak_caller".to_string()),
        sender_id: None,
        recipient_id: None,
        raw: json!({"type": "ContractCallTx"}),
        data: PluginSidecar::new(),
        logs: PluginSidecar::new(),
    }
}

fn generation(height: u64, tag: &str, txs_per_height: usize) -> (KeyBlock, MicroBlock, Vec<Transaction>) {
    let key_hash = format!("kh_{height}{tag}");
    let micro_hash = format!("mh_{height}{tag}");
    let key = KeyBlock {
        hash: key_hash.clone(),
        height,
        prev_hash: format!("mh_{}{tag}", height.saturating_sub(1)),
        prev_key_hash: format!("kh_{}{tag}", height.saturating_sub(1)),
        beneficiary: Some("ak_beneficiary".into()),
        miner: Some("ak_miner".into()),
        time: height as i64 * 180_000,
        micro_blocks_count: 1,
        transactions_count: txs_per_height as u32,
    };
    let micro = MicroBlock {
        hash: micro_hash.clone(),
        height,
        prev_hash: key_hash.clone(),
        prev_key_hash: key_hash,
        micro_block_index: 0,
        time: height as i64 * 180_000 + 1,
        transactions_count: txs_per_height as u32,
    };
    let txs = (0..txs_per_height)
        .map(|j| {
            let mut tx = spend_tx(
                &format!("th_{height}_{j}{tag}"),
                height,
                &format!("ak_s{j}"),
                &format!("ak_r{j}"),
            );
            tx.block_hash = micro_hash.clone();
            tx.micro_time = micro.time;
            tx
        })
        .collect();
    (key, micro, txs)
}

fn paginate<T: Clone>(items: Vec<T>, next: Option<&str>, page_size: usize) -> ChainResult<Page<T>> {
    let offset = match next {
        None => 0,
        Some(token) => token
            .strip_prefix("offset:")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| ChainError::Decode(format!("bad continuation: {token}")))?,
    };
    let end = (offset + page_size).min(items.len());
    let data = items.get(offset..end).map(<[T]>::to_vec).unwrap_or_default();
    let next = (end < items.len()).then(|| format!("offset:{end}"));
    Ok(Page { data, next })
}

// =============================================================================
// MockChain
// =============================================================================

#[derive(Default)]
struct ChainData {
    tip: u64,
    key_blocks: BTreeMap<u64, KeyBlock>,
    micro_blocks: BTreeMap<u64, Vec<MicroBlock>>,
    transactions: BTreeMap<u64, Vec<Transaction>>,
    failing_heights: HashSet<u64>,
    transaction_calls: Vec<HeightRange>,
}

/// Deterministic fake of the Chain Read API and push channels.
///
/// Heights `0..=tip` each hold one key block, one micro block and a fixed
/// number of spend transactions. Hashes carry a fork tag so a reorg can be
/// simulated by regenerating heights with another tag.
pub struct MockChain {
    data: Mutex<ChainData>,
    page_size: usize,
    txs_per_height: usize,
    tx_subscribers: Mutex<Vec<mpsc::UnboundedSender<ChainResult<Transaction>>>>,
    key_block_subscribers: Mutex<Vec<mpsc::UnboundedSender<ChainResult<KeyBlockHeader>>>>,
    refuse_subscriptions: AtomicBool,
}

impl MockChain {
    /// Chain with heights `0..=tip`, `txs_per_height` transactions each.
    pub fn generate(tip: u64, txs_per_height: usize) -> Self {
        let chain = Self {
            data: Mutex::new(ChainData::default()),
            page_size: 100,
            txs_per_height,
            tx_subscribers: Mutex::new(Vec::new()),
            key_block_subscribers: Mutex::new(Vec::new()),
            refuse_subscriptions: AtomicBool::new(false),
        };
        chain.extend_to(tip);
        chain
    }

    /// Use a smaller page size to exercise pagination.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Grow the chain up to `tip`.
    pub fn extend_to(&self, tip: u64) {
        let mut data = self.data.lock().unwrap();
        let from = data.key_blocks.keys().next_back().map_or(0, |h| h + 1);
        for height in from..=tip {
            let (key, micro, txs) = generation(height, "", self.txs_per_height);
            data.key_blocks.insert(height, key);
            data.micro_blocks.insert(height, vec![micro]);
            data.transactions.insert(height, txs);
        }
        data.tip = data.tip.max(tip);
    }

    /// Replace every height at or above `height` with a fork tagged `tag`.
    pub fn reorg_from(&self, height: u64, tag: &str) {
        let mut data = self.data.lock().unwrap();
        let tip = data.tip;
        for h in height..=tip {
            let (key, micro, txs) = generation(h, tag, self.txs_per_height);
            data.key_blocks.insert(h, key);
            data.micro_blocks.insert(h, vec![micro]);
            data.transactions.insert(h, txs);
        }
    }

    /// Replace the transactions served at one height.
    pub fn set_transactions(&self, height: u64, txs: Vec<Transaction>) {
        self.data.lock().unwrap().transactions.insert(height, txs);
    }

    /// Make transaction listings covering `height` fail.
    pub fn fail_transactions_at(&self, height: u64) {
        self.data.lock().unwrap().failing_heights.insert(height);
    }

    pub fn heal(&self) {
        self.data.lock().unwrap().failing_heights.clear();
    }

    /// Ranges requested through [`ChainApi::transactions`] (first page only).
    pub fn transaction_calls(&self) -> Vec<HeightRange> {
        self.data.lock().unwrap().transaction_calls.clone()
    }

    pub fn key_block_at(&self, height: u64) -> Option<KeyBlock> {
        self.data.lock().unwrap().key_blocks.get(&height).cloned()
    }

    pub fn transactions_at(&self, height: u64) -> Vec<Transaction> {
        self.data
            .lock()
            .unwrap()
            .transactions
            .get(&height)
            .cloned()
            .unwrap_or_default()
    }

    /// Reject new subscriptions.
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.refuse_subscriptions.store(refuse, Ordering::SeqCst);
    }

    /// Push a transaction to every live subscriber.
    pub fn push_transaction(&self, tx: Transaction) {
        self.tx_subscribers
            .lock()
            .unwrap()
            .retain(|s| s.send(Ok(tx.clone())).is_ok());
    }

    /// Push a key block header to every live subscriber.
    pub fn push_key_block(&self, header: KeyBlockHeader) {
        self.key_block_subscribers
            .lock()
            .unwrap()
            .retain(|s| s.send(Ok(header.clone())).is_ok());
    }

    /// Number of open subscriptions (both channels).
    pub fn open_subscriptions(&self) -> usize {
        let txs = self.tx_subscribers.lock().unwrap();
        let kbs = self.key_block_subscribers.lock().unwrap();
        txs.iter().filter(|s| !s.is_closed()).count()
            + kbs.iter().filter(|s| !s.is_closed()).count()
    }

    fn check_failing(data: &ChainData, range: HeightRange) -> ChainResult<()> {
        match data.failing_heights.iter().find(|h| range.contains(**h)) {
            Some(h) => Err(ChainError::Http(format!("injected failure at height {h}"))),
            None => Ok(()),
        }
    }
}

fn receiver_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<ChainResult<T>>,
) -> std::pin::Pin<Box<dyn futures::Stream<Item = ChainResult<T>> + Send>> {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

#[async_trait]
impl ChainApi for MockChain {
    async fn tip_height(&self) -> ChainResult<u64> {
        Ok(self.data.lock().unwrap().tip)
    }

    async fn key_blocks(
        &self,
        range: HeightRange,
        direction: FetchDirection,
        next: Option<&str>,
    ) -> ChainResult<Page<KeyBlock>> {
        let data = self.data.lock().unwrap();
        let mut blocks: Vec<KeyBlock> = data
            .key_blocks
            .range(range.from..=range.to)
            .map(|(_, b)| b.clone())
            .collect();
        if direction == FetchDirection::Backward {
            blocks.reverse();
        }
        paginate(blocks, next, self.page_size)
    }

    async fn key_block(&self, hash: &str) -> ChainResult<KeyBlock> {
        let data = self.data.lock().unwrap();
        data.key_blocks
            .values()
            .find(|b| b.hash == hash)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(hash.to_string()))
    }

    async fn micro_blocks(
        &self,
        key_block_hash: &str,
        next: Option<&str>,
    ) -> ChainResult<Page<MicroBlock>> {
        let data = self.data.lock().unwrap();
        let height = data
            .key_blocks
            .values()
            .find(|b| b.hash == key_block_hash)
            .map(|b| b.height)
            .ok_or_else(|| ChainError::NotFound(key_block_hash.to_string()))?;
        let micro = data.micro_blocks.get(&height).cloned().unwrap_or_default();
        paginate(micro, next, self.page_size)
    }

    async fn transactions(
        &self,
        range: HeightRange,
        direction: FetchDirection,
        next: Option<&str>,
    ) -> ChainResult<Page<Transaction>> {
        let mut data = self.data.lock().unwrap();
        Self::check_failing(&data, range)?;
        if next.is_none() {
            data.transaction_calls.push(range);
        }
        let mut txs: Vec<Transaction> = data
            .transactions
            .range(range.from..=range.to)
            .flat_map(|(_, txs)| txs.iter().cloned())
            .collect();
        txs.sort_by_key(Transaction::cursor);
        if direction == FetchDirection::Backward {
            txs.reverse();
        }
        paginate(txs, next, self.page_size)
    }
}

#[async_trait]
impl ChainSubscriber for MockChain {
    async fn subscribe_transactions(&self) -> ChainResult<TransactionStream> {
        if self.refuse_subscriptions.load(Ordering::SeqCst) {
            return Err(ChainError::SubscriptionError("refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx_subscribers.lock().unwrap().push(tx);
        Ok(receiver_stream(rx))
    }

    async fn subscribe_key_blocks(&self) -> ChainResult<KeyBlockStream> {
        if self.refuse_subscriptions.load(Ordering::SeqCst) {
            return Err(ChainError::SubscriptionError("refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.key_block_subscribers.lock().unwrap().push(tx);
        Ok(receiver_stream(rx))
    }
}

// =============================================================================
// InMemoryRepositories
// =============================================================================

#[derive(Default)]
struct MemoryState {
    transactions: BTreeMap<String, Transaction>,
    key_blocks: BTreeMap<u64, KeyBlock>,
    micro_blocks: BTreeMap<String, MicroBlock>,
    sync_state: Option<SyncState>,
    plugin_states: BTreeMap<String, PluginSyncState>,
    failed: BTreeMap<(String, String), PluginFailedTransaction>,
    rejected_rows: Vec<String>,
    row_writes: u64,
}

/// In-memory implementation of every repository port.
#[derive(Default)]
pub struct InMemoryRepositories {
    state: Mutex<MemoryState>,
    fail_next_bulk: AtomicBool,
    conflict_next_bulk: AtomicBool,
    fail_next_purge: AtomicBool,
    bulk_calls: AtomicUsize,
}

fn same_mirrored(a: &Transaction, b: &Transaction) -> bool {
    a.block_hash == b.block_hash
        && a.block_height == b.block_height
        && a.micro_index == b.micro_index
        && a.micro_time == b.micro_time
        && a.tx_type == b.tx_type
        && a.contract_id == b.contract_id
        && a.function == b.function
        && a.caller_id == b.caller_id
        && a.sender_id == b.sender_id
        && a.recipient_id == b.recipient_id
        && a.raw == b.raw
}

impl InMemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed transactions directly, bypassing every write path.
    pub fn insert_transactions(&self, txs: &[Transaction]) {
        let mut state = self.state.lock().unwrap();
        for tx in txs {
            state.transactions.insert(tx.hash.clone(), tx.clone());
        }
    }

    pub fn insert_key_blocks(&self, blocks: &[KeyBlock]) {
        let mut state = self.state.lock().unwrap();
        for block in blocks {
            state.key_blocks.insert(block.height, block.clone());
        }
    }

    pub fn seed_sync_state(&self, sync_state: SyncState) {
        self.state.lock().unwrap().sync_state = Some(sync_state);
    }

    pub fn seed_plugin_state(&self, plugin_state: PluginSyncState) {
        self.state
            .lock()
            .unwrap()
            .plugin_states
            .insert(plugin_state.plugin_name.clone(), plugin_state);
    }

    pub fn sync_state_snapshot(&self) -> Option<SyncState> {
        self.state.lock().unwrap().sync_state.clone()
    }

    pub fn transaction(&self, hash: &str) -> Option<Transaction> {
        self.state.lock().unwrap().transactions.get(hash).cloned()
    }

    /// All stored transactions in cursor order.
    pub fn all_transactions(&self) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> =
            self.state.lock().unwrap().transactions.values().cloned().collect();
        txs.sort_by_key(Transaction::cursor);
        txs
    }

    pub fn key_block_at(&self, height: u64) -> Option<KeyBlock> {
        self.state.lock().unwrap().key_blocks.get(&height).cloned()
    }

    pub fn key_block_count(&self) -> usize {
        self.state.lock().unwrap().key_blocks.len()
    }

    pub fn micro_block_count(&self) -> usize {
        self.state.lock().unwrap().micro_blocks.len()
    }

    pub fn plugin_state(&self, plugin_name: &str) -> Option<PluginSyncState> {
        self.state.lock().unwrap().plugin_states.get(plugin_name).cloned()
    }

    pub fn dead_letters(&self, plugin_name: &str) -> Vec<PluginFailedTransaction> {
        self.state
            .lock()
            .unwrap()
            .failed
            .values()
            .filter(|f| f.plugin_name == plugin_name)
            .cloned()
            .collect()
    }

    /// Rows inserted or changed by any write path so far.
    pub fn row_writes(&self) -> u64 {
        self.state.lock().unwrap().row_writes
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// The next bulk insert fails with a query error and writes nothing.
    pub fn fail_next_bulk_insert(&self) {
        self.fail_next_bulk.store(true, Ordering::SeqCst);
    }

    /// The next bulk insert writes its rows, then reports a unique violation.
    pub fn conflict_next_bulk_insert(&self) {
        self.conflict_next_bulk.store(true, Ordering::SeqCst);
    }

    /// Every upsert carrying `hash` fails as a whole, as a multi-row
    /// statement would.
    pub fn reject_row(&self, hash: &str) {
        self.state.lock().unwrap().rejected_rows.push(hash.to_string());
    }

    /// The next purge fails and leaves everything untouched.
    pub fn fail_next_purge(&self) {
        self.fail_next_purge.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionRepository for InMemoryRepositories {
    async fn upsert_transactions(&self, txs: &[Transaction]) -> StorageResult<UpsertOutcome> {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = txs.iter().find(|tx| state.rejected_rows.contains(&tx.hash)) {
            return Err(StorageError::QueryError(format!("injected rejection of {}", tx.hash)));
        }
        let mut outcome = UpsertOutcome::default();
        for tx in txs {
            match state.transactions.entry(tx.hash.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(tx.clone());
                    outcome.inserted.push(tx.hash.clone());
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if !same_mirrored(existing, tx) {
                        let data = std::mem::take(&mut existing.data);
                        let logs = std::mem::take(&mut existing.logs);
                        *existing = Transaction {
                            data,
                            logs,
                            ..tx.clone()
                        };
                        outcome.updated += 1;
                    }
                }
            }
        }
        state.row_writes += outcome.written();
        Ok(outcome)
    }

    async fn bulk_insert_transactions(
        &self,
        txs: &[Transaction],
    ) -> StorageResult<BulkInsertOutcome> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_bulk.swap(false, Ordering::SeqCst) {
            return Err(StorageError::QueryError("injected bulk failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        let mut outcome = BulkInsertOutcome::default();
        for tx in txs {
            if state.transactions.contains_key(&tx.hash) {
                outcome.duplicates += 1;
            } else {
                state.transactions.insert(tx.hash.clone(), tx.clone());
                outcome.inserted += 1;
            }
        }
        state.row_writes += outcome.inserted;
        if self.conflict_next_bulk.swap(false, Ordering::SeqCst) {
            return Err(StorageError::ConstraintViolation(
                "duplicate key value violates unique constraint".into(),
            ));
        }
        Ok(outcome)
    }

    async fn get_transactions(&self, hashes: &[String]) -> StorageResult<Vec<Transaction>> {
        let state = self.state.lock().unwrap();
        Ok(hashes
            .iter()
            .filter_map(|h| state.transactions.get(h).cloned())
            .collect())
    }

    async fn hashes_at_height(&self, height: u64) -> StorageResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .values()
            .filter(|tx| tx.block_height == height)
            .map(|tx| tx.hash.clone())
            .collect())
    }

    async fn delete_transactions(&self, hashes: &[String]) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        Ok(hashes
            .iter()
            .filter(|h| state.transactions.remove(*h).is_some())
            .count() as u64)
    }

    async fn find_transactions(
        &self,
        query: &TransactionQuery,
        after: Option<&TxCursor>,
        limit: usize,
    ) -> StorageResult<Vec<Transaction>> {
        let state = self.state.lock().unwrap();
        let mut txs: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| query.matches(tx))
            .filter(|tx| after.is_none_or(|c| tx.cursor() > *c))
            .cloned()
            .collect();
        txs.sort_by_key(Transaction::cursor);
        txs.truncate(limit);
        Ok(txs)
    }

    async fn set_sidecar_entry(
        &self,
        hash: &str,
        kind: SidecarKind,
        plugin: &str,
        entry: &VersionedEntry,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let tx = state
            .transactions
            .get_mut(hash)
            .ok_or_else(|| StorageError::NotFound(format!("transaction {hash}")))?;
        tx.sidecar_mut(kind).insert(plugin.to_string(), entry.clone());
        Ok(())
    }
}

#[async_trait]
impl BlockRepository for InMemoryRepositories {
    async fn upsert_key_blocks(&self, blocks: &[KeyBlock]) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        let mut written = 0;
        for block in blocks {
            if state.key_blocks.get(&block.height) != Some(block) {
                state.key_blocks.insert(block.height, block.clone());
                written += 1;
            }
        }
        state.row_writes += written;
        Ok(written)
    }

    async fn upsert_micro_blocks(&self, blocks: &[MicroBlock]) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        let mut written = 0;
        for block in blocks {
            if state.micro_blocks.get(&block.hash) != Some(block) {
                state.micro_blocks.insert(block.hash.clone(), block.clone());
                written += 1;
            }
        }
        state.row_writes += written;
        Ok(written)
    }

    async fn key_block_hashes(&self, range: HeightRange) -> StorageResult<BTreeMap<u64, String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .key_blocks
            .range(range.from..=range.to)
            .map(|(h, b)| (*h, b.hash.clone()))
            .collect())
    }

    async fn latest_key_block_height(&self) -> StorageResult<Option<u64>> {
        Ok(self.state.lock().unwrap().key_blocks.keys().next_back().copied())
    }
}

impl InMemoryRepositories {
    fn update_sync_state(&self, f: impl FnOnce(&mut SyncState)) {
        let mut state = self.state.lock().unwrap();
        if let Some(sync_state) = state.sync_state.as_mut() {
            f(sync_state);
            sync_state.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl SyncStateRepository for InMemoryRepositories {
    async fn get(&self) -> StorageResult<Option<SyncState>> {
        Ok(self.sync_state_snapshot())
    }

    async fn init(&self, initial: &SyncState) -> StorageResult<SyncState> {
        let mut state = self.state.lock().unwrap();
        Ok(state.sync_state.get_or_insert_with(|| initial.clone()).clone())
    }

    async fn raise_tip(&self, height: u64) -> StorageResult<()> {
        self.update_sync_state(|s| s.tip_height = s.tip_height.max(height));
        Ok(())
    }

    async fn set_bulk_mode(&self, bulk: bool) -> StorageResult<()> {
        self.update_sync_state(|s| s.is_bulk_mode = bulk);
        Ok(())
    }

    async fn lower_backward(&self, height: u64) -> StorageResult<()> {
        self.update_sync_state(|s| {
            s.backward_synced_height = Some(s.backward_synced_height.map_or(height, |b| b.min(height)));
        });
        Ok(())
    }

    async fn raise_live(&self, height: u64) -> StorageResult<()> {
        self.update_sync_state(|s| {
            s.live_synced_height = Some(s.live_synced_height.map_or(height, |l| l.max(height)));
        });
        Ok(())
    }

    async fn raise_indexer_head(&self, height: u64) -> StorageResult<()> {
        self.update_sync_state(|s| {
            s.indexer_head_height = Some(s.indexer_head_height.map_or(height, |h| h.max(height)));
        });
        Ok(())
    }

    async fn raise_last_synced(&self, height: u64) -> StorageResult<()> {
        self.update_sync_state(|s| s.last_synced_height = s.last_synced_height.max(height));
        Ok(())
    }
}

#[async_trait]
impl PluginSyncStateRepository for InMemoryRepositories {
    async fn get(&self, plugin_name: &str) -> StorageResult<Option<PluginSyncState>> {
        Ok(self.plugin_state(plugin_name))
    }

    async fn list(&self) -> StorageResult<Vec<PluginSyncState>> {
        Ok(self.state.lock().unwrap().plugin_states.values().cloned().collect())
    }

    async fn save(&self, plugin_state: &PluginSyncState) -> StorageResult<()> {
        self.seed_plugin_state(plugin_state.clone());
        Ok(())
    }

    async fn record_progress(
        &self,
        plugin_name: &str,
        direction: SyncDirection,
        max_height: u64,
    ) -> StorageResult<Option<PluginSyncState>> {
        let mut state = self.state.lock().unwrap();
        let Some(row) = state.plugin_states.get_mut(plugin_name) else {
            return Ok(None);
        };
        match direction {
            SyncDirection::Backward => {
                row.backward_synced_height =
                    Some(row.backward_synced_height.map_or(max_height, |b| b.min(max_height)));
            }
            SyncDirection::Live => {
                row.live_synced_height =
                    Some(row.live_synced_height.map_or(max_height, |l| l.max(max_height)));
            }
            SyncDirection::Reorg | SyncDirection::Upgrade => {}
        }
        row.last_synced_height = row.last_synced_height.max(max_height);
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }
}

#[async_trait]
impl FailedTransactionRepository for InMemoryRepositories {
    async fn upsert(&self, records: &[PluginFailedTransaction]) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        for record in records {
            let key = (record.plugin_name.clone(), record.tx_hash.clone());
            let created_at = state.failed.get(&key).map_or(record.created_at, |r| r.created_at);
            state.failed.insert(
                key,
                PluginFailedTransaction {
                    created_at,
                    ..record.clone()
                },
            );
        }
        Ok(())
    }

    async fn list_by_version(
        &self,
        plugin_name: &str,
        version: u32,
    ) -> StorageResult<Vec<PluginFailedTransaction>> {
        Ok(self
            .dead_letters(plugin_name)
            .into_iter()
            .filter(|f| f.version == version)
            .collect())
    }

    async fn versions(&self, plugin_name: &str) -> StorageResult<Vec<u32>> {
        let mut versions: Vec<u32> =
            self.dead_letters(plugin_name).iter().map(|f| f.version).collect();
        versions.sort_unstable();
        versions.dedup();
        Ok(versions)
    }

    async fn delete(&self, plugin_name: &str, tx_hashes: &[String]) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        Ok(tx_hashes
            .iter()
            .filter(|h| {
                state
                    .failed
                    .remove(&(plugin_name.to_string(), (*h).clone()))
                    .is_some()
            })
            .count() as u64)
    }

    async fn bump_version(
        &self,
        plugin_name: &str,
        tx_hashes: &[String],
        new_version: u32,
        error_message: &str,
    ) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        let mut bumped = 0;
        for hash in tx_hashes {
            if let Some(row) = state.failed.get_mut(&(plugin_name.to_string(), hash.clone())) {
                row.version = new_version;
                row.error_message = error_message.to_string();
                row.updated_at = Utc::now();
                bumped += 1;
            }
        }
        Ok(bumped)
    }

    async fn count(&self, plugin_name: &str) -> StorageResult<u64> {
        Ok(self.dead_letters(plugin_name).len() as u64)
    }
}

#[async_trait]
impl Repositories for InMemoryRepositories {
    fn transactions(&self) -> &dyn TransactionRepository {
        self
    }

    fn blocks(&self) -> &dyn BlockRepository {
        self
    }

    fn sync_state(&self) -> &dyn SyncStateRepository {
        self
    }

    fn plugin_sync_state(&self) -> &dyn PluginSyncStateRepository {
        self
    }

    fn failed_transactions(&self) -> &dyn FailedTransactionRepository {
        self
    }

    async fn purge_from_height_atomic(&self, divergence_height: u64) -> StorageResult<ReorgPurge> {
        if self.fail_next_purge.swap(false, Ordering::SeqCst) {
            return Err(StorageError::TransactionError("injected purge failure".into()));
        }
        let rewind_to = divergence_height.saturating_sub(1);
        let mut state = self.state.lock().unwrap();

        let removed_hashes: Vec<String> = state
            .transactions
            .values()
            .filter(|tx| tx.block_height >= divergence_height)
            .map(|tx| tx.hash.clone())
            .collect();
        state.transactions.retain(|_, tx| tx.block_height < divergence_height);

        let micro_before = state.micro_blocks.len();
        state.micro_blocks.retain(|_, b| b.height < divergence_height);
        let micro_blocks_deleted = (micro_before - state.micro_blocks.len()) as u64;

        let key_before = state.key_blocks.len();
        state.key_blocks.retain(|h, _| *h < divergence_height);
        let key_blocks_deleted = (key_before - state.key_blocks.len()) as u64;

        if let Some(sync_state) = state.sync_state.as_mut() {
            sync_state.last_synced_height = sync_state.last_synced_height.min(rewind_to);
            sync_state.live_synced_height = sync_state.live_synced_height.map(|h| h.min(rewind_to));
            sync_state.indexer_head_height =
                sync_state.indexer_head_height.map(|h| h.min(rewind_to));
        }

        let mut plugins_rewound = 0;
        for row in state.plugin_states.values_mut() {
            let live = row.live_synced_height.map(|h| h.min(rewind_to));
            if row.last_synced_height > rewind_to || live != row.live_synced_height {
                row.last_synced_height = row.last_synced_height.min(rewind_to);
                row.live_synced_height = live;
                plugins_rewound += 1;
            }
        }

        Ok(ReorgPurge {
            divergence_height,
            removed_hashes,
            key_blocks_deleted,
            micro_blocks_deleted,
            plugins_rewound,
        })
    }
}

// =============================================================================
// RecordingPlugin
// =============================================================================

/// Plugin that records every delivery.
pub struct RecordingPlugin {
    name: String,
    version: u32,
    start_from_height: u64,
    filters: Vec<PluginFilter>,
    decodes: bool,
    failing: AtomicBool,
    failing_reorg: AtomicBool,
    attempts: AtomicUsize,
    decode_calls: AtomicUsize,
    batches: Mutex<Vec<(SyncDirection, Vec<String>)>>,
    reorgs: Mutex<Vec<Vec<String>>>,
}

impl RecordingPlugin {
    /// Plugin accepting every transaction through a predicate filter.
    pub fn new(name: &str, version: u32) -> Self {
        Self {
            name: name.to_string(),
            version,
            start_from_height: 0,
            filters: vec![PluginFilter::predicate(|_| true)],
            decodes: false,
            failing: AtomicBool::new(false),
            failing_reorg: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            decode_calls: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            reorgs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_filters(mut self, filters: Vec<PluginFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_start(mut self, height: u64) -> Self {
        self.start_from_height = height;
        self
    }

    /// Enable a `data` decode hook that stores `{"hash": ...}`.
    pub fn with_decoder(mut self) -> Self {
        self.decodes = true;
        self
    }

    pub fn failing(self) -> Self {
        self.set_failing(true);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_failing_reorg(&self, failing: bool) {
        self.failing_reorg.store(failing, Ordering::SeqCst);
    }

    /// Successful batches, in delivery order.
    pub fn batches(&self) -> Vec<(SyncDirection, Vec<String>)> {
        self.batches.lock().unwrap().clone()
    }

    /// Hashes of every successfully processed transaction.
    pub fn processed_hashes(&self) -> Vec<String> {
        self.batches()
            .into_iter()
            .flat_map(|(_, hashes)| hashes)
            .collect()
    }

    /// Calls to `process_batch`, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub fn reorg_calls(&self) -> Vec<Vec<String>> {
        self.reorgs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn start_from_height(&self) -> u64 {
        self.start_from_height
    }

    fn filters(&self) -> Vec<PluginFilter> {
        self.filters.clone()
    }

    async fn process_batch(&self, txs: &[Transaction], direction: SyncDirection) -> PluginResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PluginError::processing(&self.name, "injected failure"));
        }
        self.batches
            .lock()
            .unwrap()
            .push((direction, txs.iter().map(|tx| tx.hash.clone()).collect()));
        Ok(())
    }

    async fn on_reorg(&self, removed_hashes: &[String]) -> PluginResult<()> {
        self.reorgs.lock().unwrap().push(removed_hashes.to_vec());
        if self.failing_reorg.load(Ordering::SeqCst) {
            return Err(PluginError::processing(&self.name, "injected reorg failure"));
        }
        Ok(())
    }

    async fn decode_data(&self, tx: &Transaction) -> PluginResult<Option<serde_json::Value>> {
        if !self.decodes {
            return Ok(None);
        }
        self.decode_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(json!({"hash": tx.hash})))
    }
}
