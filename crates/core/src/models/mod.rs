//! Domain models representing mirrored chain data and sync progress.
//!
//! These models are storage-agnostic and represent the canonical
//! form of mirrored data within the domain layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transaction type of a plain token transfer.
pub const SPEND_TX: &str = "SpendTx";

/// Identifier of the singleton sync state row.
pub const GLOBAL_SYNC_STATE_ID: &str = "global";

// =============================================================================
// Plugin Sidecars
// =============================================================================

/// One plugin's entry in a transaction's `data` or `logs` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntry {
    /// Plugin version that produced `data`.
    #[serde(rename = "_version")]
    pub version: u32,
    pub data: serde_json::Value,
}

/// Per-plugin sidecar map. The plugin set is only known at deployment time,
/// so the keys stay dynamic.
pub type PluginSidecar = BTreeMap<String, VersionedEntry>;

/// Which sidecar map a decode hook writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarKind {
    Data,
    Logs,
}

impl SidecarKind {
    pub fn column(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Logs => "logs",
        }
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Mirrored transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash (primary key).
    pub hash: String,
    /// Hash of the micro block containing the transaction.
    pub block_hash: String,
    /// Key block height (generation).
    pub block_height: u64,
    /// Index of the micro block within its generation.
    pub micro_index: u32,
    /// Micro block time in milliseconds.
    pub micro_time: i64,
    /// Transaction type, e.g. `SpendTx`, `ContractCallTx`.
    pub tx_type: String,
    pub contract_id: Option<String>,
    pub function: Option<String>,
    pub caller_id: Option<String>,
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
    /// Opaque upstream payload.
    pub raw: serde_json::Value,
    /// Decoded data keyed by plugin name.
    #[serde(default)]
    pub data: PluginSidecar,
    /// Decoded logs keyed by plugin name.
    #[serde(default)]
    pub logs: PluginSidecar,
}

impl Transaction {
    /// A spend where sender and recipient are the same account.
    pub fn is_self_spend(&self) -> bool {
        self.tx_type == SPEND_TX
            && self.sender_id.is_some()
            && self.sender_id == self.recipient_id
    }

    /// Position of this transaction in the global ordering.
    pub fn cursor(&self) -> TxCursor {
        TxCursor {
            block_height: self.block_height,
            micro_index: self.micro_index,
            micro_time: self.micro_time,
            hash: self.hash.clone(),
        }
    }

    /// Sidecar map of the given kind.
    pub fn sidecar(&self, kind: SidecarKind) -> &PluginSidecar {
        match kind {
            SidecarKind::Data => &self.data,
            SidecarKind::Logs => &self.logs,
        }
    }

    /// Mutable sidecar map of the given kind.
    pub fn sidecar_mut(&mut self, kind: SidecarKind) -> &mut PluginSidecar {
        match kind {
            SidecarKind::Data => &mut self.data,
            SidecarKind::Logs => &mut self.logs,
        }
    }
}

/// Total order over transactions: height, micro block index, micro time, hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxCursor {
    pub block_height: u64,
    pub micro_index: u32,
    pub micro_time: i64,
    pub hash: String,
}

// =============================================================================
// Blocks
// =============================================================================

/// Key block (one per generation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBlock {
    pub hash: String,
    pub height: u64,
    pub prev_hash: String,
    pub prev_key_hash: String,
    pub beneficiary: Option<String>,
    pub miner: Option<String>,
    /// Block time in milliseconds.
    pub time: i64,
    pub micro_blocks_count: u32,
    pub transactions_count: u32,
}

/// Header pushed by the live key-block channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBlockHeader {
    pub hash: String,
    pub height: u64,
}

/// Micro block belonging to a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroBlock {
    pub hash: String,
    pub height: u64,
    pub prev_hash: String,
    pub prev_key_hash: String,
    pub micro_block_index: u32,
    /// Block time in milliseconds.
    pub time: i64,
    pub transactions_count: u32,
}

// =============================================================================
// Sync State
// =============================================================================

/// Global sync progress (singleton row).
///
/// `backward_synced_height` is the highest height the backward indexer still
/// owes; every height above it up to `indexer_head_height` is mirrored.
/// It reaches `0` once genesis itself is mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Legacy single frontier, kept for reorg scanning and plugin migration.
    pub last_synced_height: u64,
    pub tip_height: u64,
    pub is_bulk_mode: bool,
    pub backward_synced_height: Option<u64>,
    pub live_synced_height: Option<u64>,
    pub indexer_head_height: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    /// Fresh state for a store that has never synced.
    pub fn empty() -> Self {
        Self {
            last_synced_height: 0,
            tip_height: 0,
            is_bulk_mode: false,
            backward_synced_height: None,
            live_synced_height: None,
            indexer_head_height: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the backfill reached genesis.
    pub fn backward_complete(&self) -> bool {
        self.backward_synced_height == Some(0)
    }
}

/// Sync progress of one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSyncState {
    pub plugin_name: String,
    pub version: u32,
    pub last_synced_height: u64,
    pub backward_synced_height: Option<u64>,
    pub live_synced_height: Option<u64>,
    pub start_from_height: u64,
    pub updated_at: DateTime<Utc>,
}

impl PluginSyncState {
    /// Height a fresh or reset plugin is considered synced through.
    pub fn seed_height(start_from_height: u64) -> u64 {
        start_from_height.saturating_sub(1)
    }
}

/// Dead letter: a transaction a plugin failed to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginFailedTransaction {
    pub plugin_name: String,
    pub tx_hash: String,
    /// Plugin version the failure was recorded at.
    pub version: u32,
    pub error_message: String,
    pub error_trace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Sync Direction
// =============================================================================

/// Why a batch is being delivered to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Historical backfill or revalidation.
    Backward,
    /// Real-time tailing.
    Live,
    /// Reorg replay.
    Reorg,
    /// Version-upgrade backfill or dead-letter replay.
    Upgrade,
}

impl SyncDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backward => "backward",
            Self::Live => "live",
            Self::Reorg => "reorg",
            Self::Upgrade => "upgrade",
        }
    }
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
