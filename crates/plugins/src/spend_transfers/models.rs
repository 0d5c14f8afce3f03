//! Models for the spend transfers plugin.

use serde::{Deserialize, Serialize};

/// A token transfer made by a `SpendTx`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendTransfer {
    /// Transaction hash (primary key).
    pub tx_hash: String,
    pub block_height: u64,
    /// Micro block time in milliseconds.
    pub micro_time: i64,
    pub sender_id: String,
    pub recipient_id: String,
    /// Amount in aettos.
    pub amount: u128,
    pub payload: Option<String>,
}
