//! Port trait for downstream plugins.
//!
//! This is the main extensibility point of the mirror. Each consumer that
//! derives its own state from mirrored transactions implements [`Plugin`].
//! Plugins receive batches at-least-once and must be idempotent keyed by
//! (plugin name, transaction hash).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PluginResult;
use crate::models::{SyncDirection, Transaction};

use super::repository::TransactionQuery;

/// Predicate evaluated by the fan-out path.
pub type TxPredicate = Arc<dyn Fn(&Transaction) -> bool + Send + Sync>;

/// One plugin filter.
///
/// The fan-out path only looks at `predicate`; the structural fields
/// (`tx_type`, `contract_ids`, `functions`) only feed catch-up queries.
/// A filter without a predicate therefore matches nothing during live or
/// backward delivery.
#[derive(Clone, Default)]
pub struct PluginFilter {
    pub predicate: Option<TxPredicate>,
    pub tx_type: Option<String>,
    pub contract_ids: Vec<String>,
    pub functions: Vec<String>,
}

impl PluginFilter {
    /// Filter matching transactions for which `predicate` holds.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Transaction) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Some(Arc::new(predicate)),
            ..Default::default()
        }
    }

    /// Structural filter on transaction type.
    pub fn tx_type(tx_type: impl Into<String>) -> Self {
        Self {
            tx_type: Some(tx_type.into()),
            ..Default::default()
        }
    }

    pub fn with_contract_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contract_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_functions<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.functions = functions.into_iter().map(Into::into).collect();
        self
    }

    /// Fan-out match: evaluates the predicate only.
    pub fn matches_predicate(&self, tx: &Transaction) -> bool {
        self.predicate.as_ref().is_some_and(|p| p(tx))
    }

    /// Whether any structural field is set.
    pub fn is_structural(&self) -> bool {
        self.tx_type.is_some() || !self.contract_ids.is_empty() || !self.functions.is_empty()
    }

    /// Catch-up query built from the structural fields.
    pub fn to_query(&self) -> TransactionQuery {
        TransactionQuery {
            tx_types: self.tx_type.iter().cloned().collect(),
            contract_ids: self.contract_ids.clone(),
            functions: self.functions.clone(),
            ..Default::default()
        }
    }
}

impl fmt::Debug for PluginFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFilter")
            .field("predicate", &self.predicate.is_some())
            .field("tx_type", &self.tx_type)
            .field("contract_ids", &self.contract_ids)
            .field("functions", &self.functions)
            .finish()
    }
}

/// True if any filter's predicate accepts the transaction.
pub fn matches_any_predicate(filters: &[PluginFilter], tx: &Transaction) -> bool {
    filters.iter().any(|f| f.matches_predicate(tx))
}

/// Trait for downstream plugins.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name; also the key of its sidecar entries.
    fn name(&self) -> &str;

    /// Version of the plugin's derived state. Bumping it triggers a full
    /// resync of the plugin on next bootstrap.
    fn version(&self) -> u32;

    /// First height the plugin cares about.
    fn start_from_height(&self) -> u64 {
        0
    }

    /// Transaction filters.
    fn filters(&self) -> Vec<PluginFilter>;

    /// Process a batch of matched transactions.
    async fn process_batch(&self, txs: &[Transaction], direction: SyncDirection)
        -> PluginResult<()>;

    /// Called with the hashes of transactions removed by a reorg or by
    /// revalidation. The list is not filtered.
    async fn on_reorg(&self, removed_hashes: &[String]) -> PluginResult<()>;

    /// Decode hook for the `data` sidecar (optional).
    ///
    /// Returning `Some` stores the value under this plugin's key at its
    /// current version before `process_batch` runs.
    async fn decode_data(&self, _tx: &Transaction) -> PluginResult<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Decode hook for the `logs` sidecar (optional).
    async fn decode_logs(&self, _tx: &Transaction) -> PluginResult<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Queries used by version-upgrade backfills.
    ///
    /// Defaults to one query per structural filter.
    fn update_queries(&self) -> Vec<TransactionQuery> {
        self.filters()
            .iter()
            .filter(|f| f.is_structural())
            .map(PluginFilter::to_query)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PluginSidecar;

    fn call(contract: &str, function: &str) -> Transaction {
        Transaction {
            hash: "th_call".into(),
            block_hash: "mh".into(),
            block_height: 1,
            micro_index: 0,
            micro_time: 0,
            tx_type: "ContractCallTx".into(),
            contract_id: Some(contract.into()),
            function: Some(function.into()),
            caller_id: Some("ak_caller".into()),
            sender_id: None,
            recipient_id: None,
            raw: serde_json::Value::Null,
            data: PluginSidecar::new(),
            logs: PluginSidecar::new(),
        }
    }

    // Test critique: un filtre purement structurel ne matche rien en fan-out
    #[test]
    fn structural_filter_never_matches_predicate_path() {
        let filter = PluginFilter::tx_type("ContractCallTx").with_contract_ids(["ct_dex"]);
        let tx = call("ct_dex", "swap");

        assert!(!filter.matches_predicate(&tx));
        assert!(filter.to_query().matches(&tx));
    }

    #[test]
    fn predicate_filter_matches_when_predicate_holds() {
        let filter = PluginFilter::predicate(|tx| tx.function.as_deref() == Some("swap"));
        assert!(filter.matches_predicate(&call("ct_dex", "swap")));
        assert!(!filter.matches_predicate(&call("ct_dex", "mint")));
        assert!(!filter.is_structural());
    }

    #[test]
    fn any_predicate_is_enough() {
        let filters = vec![
            PluginFilter::tx_type("SpendTx"),
            PluginFilter::predicate(|tx| tx.contract_id.as_deref() == Some("ct_nft")),
        ];
        assert!(matches_any_predicate(&filters, &call("ct_nft", "mint")));
        assert!(!matches_any_predicate(&filters, &call("ct_dex", "mint")));
    }
}
