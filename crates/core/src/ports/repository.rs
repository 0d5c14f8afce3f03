//! Port traits for data repositories.
//!
//! These traits define the storage interface used by the domain layer.
//! Implementations live in the infrastructure layer (e.g., `aesync-storage`).

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::models::{
    KeyBlock, MicroBlock, PluginFailedTransaction, PluginSyncState, SidecarKind, SyncDirection,
    SyncState, Transaction, TxCursor, VersionedEntry,
};

use super::chain_api::HeightRange;

// =============================================================================
// Filter Types
// =============================================================================

/// Structural transaction query, used by catch-up / upgrade walks.
///
/// Each non-empty field restricts the result; empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionQuery {
    pub tx_types: Vec<String>,
    pub contract_ids: Vec<String>,
    pub functions: Vec<String>,
    pub height_gte: Option<u64>,
    pub height_lte: Option<u64>,
}

impl TransactionQuery {
    /// In-process evaluation, mirroring the SQL built by storage adapters.
    pub fn matches(&self, tx: &Transaction) -> bool {
        let in_list = |list: &[String], value: Option<&String>| {
            list.is_empty() || value.is_some_and(|v| list.contains(v))
        };

        in_list(&self.tx_types, Some(&tx.tx_type))
            && in_list(&self.contract_ids, tx.contract_id.as_ref())
            && in_list(&self.functions, tx.function.as_ref())
            && self.height_gte.is_none_or(|h| tx.block_height >= h)
            && self.height_lte.is_none_or(|h| tx.block_height <= h)
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Hashes of rows that did not exist before.
    pub inserted: Vec<String>,
    /// Existing rows whose mirrored columns changed.
    pub updated: u64,
}

impl UpsertOutcome {
    pub fn written(&self) -> u64 {
        self.inserted.len() as u64 + self.updated
    }
}

/// Result of a bulk insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkInsertOutcome {
    /// Rows newly written.
    pub inserted: u64,
    /// Rows skipped because the key already existed.
    pub duplicates: u64,
}

/// What a reorg purge removed.
#[derive(Debug, Clone, Default)]
pub struct ReorgPurge {
    pub divergence_height: u64,
    pub removed_hashes: Vec<String>,
    pub key_blocks_deleted: u64,
    pub micro_blocks_deleted: u64,
    pub plugins_rewound: u64,
}

// =============================================================================
// Repository Traits
// =============================================================================

/// Repository for mirrored transactions.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Insert or update by hash. Rows whose mirrored columns are unchanged
    /// are left untouched. Plugin sidecars are never overwritten.
    async fn upsert_transactions(&self, txs: &[Transaction]) -> StorageResult<UpsertOutcome>;

    /// Plain bulk insert; existing hashes are skipped and counted.
    async fn bulk_insert_transactions(&self, txs: &[Transaction])
        -> StorageResult<BulkInsertOutcome>;

    /// Load transactions by hash (missing hashes are omitted).
    async fn get_transactions(&self, hashes: &[String]) -> StorageResult<Vec<Transaction>>;

    /// Hashes stored at one height.
    async fn hashes_at_height(&self, height: u64) -> StorageResult<Vec<String>>;

    /// Delete by hash. Returns the number of rows deleted.
    async fn delete_transactions(&self, hashes: &[String]) -> StorageResult<u64>;

    /// Page through transactions matching `query`, strictly after `after`,
    /// in [`TxCursor`] order.
    async fn find_transactions(
        &self,
        query: &TransactionQuery,
        after: Option<&TxCursor>,
        limit: usize,
    ) -> StorageResult<Vec<Transaction>>;

    /// Write one plugin's sidecar entry.
    async fn set_sidecar_entry(
        &self,
        hash: &str,
        kind: SidecarKind,
        plugin: &str,
        entry: &VersionedEntry,
    ) -> StorageResult<()>;
}

/// Repository for key blocks and micro blocks.
#[async_trait]
pub trait BlockRepository: Send + Sync {
    /// Insert or update key blocks by hash.
    async fn upsert_key_blocks(&self, blocks: &[KeyBlock]) -> StorageResult<u64>;

    /// Insert or update micro blocks by hash.
    async fn upsert_micro_blocks(&self, blocks: &[MicroBlock]) -> StorageResult<u64>;

    /// Stored key block hash per height within `range`.
    async fn key_block_hashes(&self, range: HeightRange) -> StorageResult<BTreeMap<u64, String>>;

    /// Highest stored key block height.
    async fn latest_key_block_height(&self) -> StorageResult<Option<u64>>;
}

/// Repository for the global sync state.
///
/// Frontier updates are single statements with monotonic semantics so the
/// backward and live loops can write concurrently without a lock.
#[async_trait]
pub trait SyncStateRepository: Send + Sync {
    /// Load the singleton row.
    async fn get(&self) -> StorageResult<Option<SyncState>>;

    /// Create the singleton row if it does not exist. Returns the stored row.
    async fn init(&self, state: &SyncState) -> StorageResult<SyncState>;

    /// Raise the tip height.
    async fn raise_tip(&self, height: u64) -> StorageResult<()>;

    /// Persist the backward mode flag.
    async fn set_bulk_mode(&self, bulk: bool) -> StorageResult<()>;

    /// Lower the backward frontier.
    async fn lower_backward(&self, height: u64) -> StorageResult<()>;

    /// Raise the live frontier.
    async fn raise_live(&self, height: u64) -> StorageResult<()>;

    /// Raise the indexer head.
    async fn raise_indexer_head(&self, height: u64) -> StorageResult<()>;

    /// Raise the legacy `last_synced_height`.
    async fn raise_last_synced(&self, height: u64) -> StorageResult<()>;
}

/// Repository for per-plugin sync state.
#[async_trait]
pub trait PluginSyncStateRepository: Send + Sync {
    async fn get(&self, plugin_name: &str) -> StorageResult<Option<PluginSyncState>>;

    async fn list(&self) -> StorageResult<Vec<PluginSyncState>>;

    /// Insert or overwrite the whole row.
    async fn save(&self, state: &PluginSyncState) -> StorageResult<()>;

    /// Record a successful batch: move the frontier of `direction` toward
    /// `max_height` (backward lowers, live raises, other directions leave
    /// both alone) and raise `last_synced_height`.
    ///
    /// Returns the updated row, or `None` if the plugin has no row.
    async fn record_progress(
        &self,
        plugin_name: &str,
        direction: SyncDirection,
        max_height: u64,
    ) -> StorageResult<Option<PluginSyncState>>;
}

/// Repository for plugin dead letters.
#[async_trait]
pub trait FailedTransactionRepository: Send + Sync {
    /// Insert or overwrite by (plugin, tx hash).
    async fn upsert(&self, records: &[PluginFailedTransaction]) -> StorageResult<()>;

    /// Failures of `plugin_name` recorded at `version`.
    async fn list_by_version(
        &self,
        plugin_name: &str,
        version: u32,
    ) -> StorageResult<Vec<PluginFailedTransaction>>;

    /// Distinct versions present in the plugin's failures.
    async fn versions(&self, plugin_name: &str) -> StorageResult<Vec<u32>>;

    /// Delete failures by hash.
    async fn delete(&self, plugin_name: &str, tx_hashes: &[String]) -> StorageResult<u64>;

    /// Move failures to `new_version` with a fresh error.
    async fn bump_version(
        &self,
        plugin_name: &str,
        tx_hashes: &[String],
        new_version: u32,
        error_message: &str,
    ) -> StorageResult<u64>;

    /// Number of failures currently stored for a plugin.
    async fn count(&self, plugin_name: &str) -> StorageResult<u64>;
}

// =============================================================================
// Composite Repository
// =============================================================================

/// Combined repository access for the sync services.
///
/// This trait provides access to all individual repositories and
/// atomic operations that span multiple tables.
#[async_trait]
pub trait Repositories: Send + Sync {
    fn transactions(&self) -> &dyn TransactionRepository;

    fn blocks(&self) -> &dyn BlockRepository;

    fn sync_state(&self) -> &dyn SyncStateRepository;

    fn plugin_sync_state(&self) -> &dyn PluginSyncStateRepository;

    fn failed_transactions(&self) -> &dyn FailedTransactionRepository;

    /// Reorg recovery in a single transaction.
    ///
    /// Deletes transactions, micro blocks and key blocks at or above
    /// `divergence_height`, rewinds the global `last_synced_height` (and the
    /// live frontier / indexer head when above it) to `divergence_height - 1`,
    /// and clamps every plugin's last/live heights to the same value.
    /// If any statement fails, everything is rolled back.
    async fn purge_from_height_atomic(&self, divergence_height: u64) -> StorageResult<ReorgPurge>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PluginSidecar;

    fn tx(tx_type: &str, contract: Option<&str>, function: Option<&str>, height: u64) -> Transaction {
        Transaction {
            hash: format!("th_{height}"),
            block_hash: "mh".into(),
            block_height: height,
            micro_index: 0,
            micro_time: 0,
            tx_type: tx_type.into(),
            contract_id: contract.map(Into::into),
            function: function.map(Into::into),
            caller_id: None,
            sender_id: None,
            recipient_id: None,
            raw: serde_json::Value::Null,
            data: PluginSidecar::new(),
            logs: PluginSidecar::new(),
        }
    }

    #[test]
    fn empty_query_matches_everything() {
        let query = TransactionQuery::default();
        assert!(query.matches(&tx("SpendTx", None, None, 1)));
    }

    #[test]
    fn structural_fields_are_anded() {
        let query = TransactionQuery {
            tx_types: vec!["ContractCallTx".into()],
            contract_ids: vec!["ct_dex".into()],
            functions: vec!["swap".into()],
            ..Default::default()
        };
        assert!(query.matches(&tx("ContractCallTx", Some("ct_dex"), Some("swap"), 1)));
        assert!(!query.matches(&tx("ContractCallTx", Some("ct_dex"), Some("add_liquidity"), 1)));
        // Un contrat absent ne doit jamais matcher une liste non vide
        assert!(!query.matches(&tx("ContractCallTx", None, Some("swap"), 1)));
    }

    #[test]
    fn height_bounds_are_inclusive() {
        let query = TransactionQuery {
            height_gte: Some(10),
            height_lte: Some(20),
            ..Default::default()
        };
        assert!(query.matches(&tx("SpendTx", None, None, 10)));
        assert!(query.matches(&tx("SpendTx", None, None, 20)));
        assert!(!query.matches(&tx("SpendTx", None, None, 21)));
    }
}
