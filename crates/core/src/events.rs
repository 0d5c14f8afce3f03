//! Transaction-created notifications.
//!
//! Write paths that know they create rows (normal-mode backfill and live
//! tailing) publish here explicitly. The bulk path never does.

use tokio::sync::broadcast;

use crate::metrics::record_created_event;
use crate::models::Transaction;

/// Default channel capacity; slow receivers lag rather than block writers.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A newly stored transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCreated {
    pub hash: String,
    pub block_height: u64,
    pub tx_type: String,
}

impl From<&Transaction> for TransactionCreated {
    fn from(tx: &Transaction) -> Self {
        Self {
            hash: tx.hash.clone(),
            block_height: tx.block_height,
            tx_type: tx.tx_type.clone(),
        }
    }
}

/// Broadcast hub for [`TransactionCreated`].
#[derive(Debug, Clone)]
pub struct TransactionEvents {
    sender: broadcast::Sender<TransactionCreated>,
}

impl TransactionEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionCreated> {
        self.sender.subscribe()
    }

    /// Publish the transactions of `txs` whose hash is in `created`.
    ///
    /// Returns the number of events sent. With no receiver the events are
    /// dropped.
    pub fn emit_created(&self, txs: &[Transaction], created: &[String]) -> usize {
        if created.is_empty() || self.sender.receiver_count() == 0 {
            return 0;
        }
        txs.iter()
            .filter(|tx| created.contains(&tx.hash))
            .filter(|tx| self.sender.send(TransactionCreated::from(*tx)).is_ok())
            .inspect(|_| record_created_event())
            .count()
    }
}

impl Default for TransactionEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
