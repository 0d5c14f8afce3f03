//! Middleware response shapes and their conversion into domain models.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use aesync_core::error::{ChainError, ChainResult};
use aesync_core::models::{KeyBlock, KeyBlockHeader, MicroBlock, Transaction};

/// `GET /v3/status`.
#[derive(Debug, Deserialize)]
pub(crate) struct StatusWire {
    pub mdw_height: u64,
}

/// Every listing endpoint: `{data: [...], next: <path>|null}`.
#[derive(Debug, Deserialize)]
pub(crate) struct PageWire<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KeyBlockWire {
    hash: String,
    height: u64,
    prev_hash: String,
    prev_key_hash: String,
    #[serde(default)]
    beneficiary: Option<String>,
    #[serde(default)]
    miner: Option<String>,
    time: i64,
    #[serde(default)]
    micro_blocks_count: u32,
    #[serde(default)]
    transactions_count: u32,
}

impl From<KeyBlockWire> for KeyBlock {
    fn from(w: KeyBlockWire) -> Self {
        Self {
            hash: w.hash,
            height: w.height,
            prev_hash: w.prev_hash,
            prev_key_hash: w.prev_key_hash,
            beneficiary: w.beneficiary,
            miner: w.miner,
            time: w.time,
            micro_blocks_count: w.micro_blocks_count,
            transactions_count: w.transactions_count,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MicroBlockWire {
    hash: String,
    height: u64,
    prev_hash: String,
    prev_key_hash: String,
    micro_block_index: u32,
    time: i64,
    #[serde(default)]
    transactions_count: u32,
}

impl From<MicroBlockWire> for MicroBlock {
    fn from(w: MicroBlockWire) -> Self {
        Self {
            hash: w.hash,
            height: w.height,
            prev_hash: w.prev_hash,
            prev_key_hash: w.prev_key_hash,
            micro_block_index: w.micro_block_index,
            time: w.time,
            transactions_count: w.transactions_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TransactionWire {
    hash: String,
    block_hash: String,
    block_height: u64,
    micro_index: u32,
    micro_time: i64,
    tx: TxBodyWire,
}

#[derive(Debug, Deserialize)]
struct TxBodyWire {
    #[serde(rename = "type")]
    tx_type: String,
    #[serde(default)]
    contract_id: Option<String>,
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    caller_id: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    recipient_id: Option<String>,
}

/// Decode one transaction object, keeping the whole object as `raw`.
pub(crate) fn decode_transaction(value: Value) -> ChainResult<Transaction> {
    let wire = TransactionWire::deserialize(&value).map_err(|e| {
        let hash = value.get("hash").and_then(Value::as_str).unwrap_or("<unknown>");
        ChainError::Decode(format!("transaction {hash}: {e}"))
    })?;

    Ok(Transaction {
        hash: wire.hash,
        block_hash: wire.block_hash,
        block_height: wire.block_height,
        micro_index: wire.micro_index,
        micro_time: wire.micro_time,
        tx_type: wire.tx.tx_type,
        contract_id: wire.tx.contract_id,
        function: wire.tx.function,
        caller_id: wire.tx.caller_id,
        sender_id: wire.tx.sender_id,
        recipient_id: wire.tx.recipient_id,
        raw: value,
        data: Default::default(),
        logs: Default::default(),
    })
}

/// Decode a pushed key block into its header.
pub(crate) fn decode_key_block_header(value: Value) -> ChainResult<KeyBlockHeader> {
    serde_json::from_value(value).map_err(|e| ChainError::Decode(format!("key block header: {e}")))
}

// =============================================================================
// Push channel frames
// =============================================================================

/// Push channels offered by the middleware websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Transactions,
    KeyBlocks,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transactions => "Transactions",
            Self::KeyBlocks => "KeyBlocks",
        }
    }
}

/// Outgoing `{"op": "Subscribe", "payload": "<channel>"}` frame.
#[derive(Debug, Serialize)]
pub(crate) struct SubscribeRequest {
    op: &'static str,
    payload: &'static str,
}

impl SubscribeRequest {
    pub fn new(channel: Channel) -> Self {
        Self {
            op: "Subscribe",
            payload: channel.as_str(),
        }
    }
}

/// Incoming `{subscription, payload}` frame.
#[derive(Debug, Deserialize)]
pub(crate) struct SocketMessage {
    pub subscription: String,
    pub payload: Value,
}

/// Extract the payload of a text frame addressed to `channel`.
///
/// Subscription acknowledgements and frames of other channels yield `None`.
pub(crate) fn channel_payload(text: &str, channel: Channel) -> Option<Value> {
    serde_json::from_str::<SocketMessage>(text)
        .ok()
        .filter(|m| m.subscription == channel.as_str())
        .map(|m| m.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spend_json() -> Value {
        json!({
            "hash": "th_spend",
            "block_hash": "mh_1",
            "block_height": 812_345,
            "micro_index": 3,
            "micro_time": 1_700_000_000_000i64,
            "signatures": ["sg_1"],
            "tx": {
                "type": "SpendTx",
                "sender_id": "ak_alice",
                "recipient_id": "ak_bob",
                "amount": 10,
                "fee": 16_660_000_000_000u64,
                "nonce": 7
            }
        })
    }

    #[test]
    fn test_spend_transaction_decoding() {
        let tx = decode_transaction(spend_json()).unwrap();

        assert_eq!(tx.hash, "th_spend");
        assert_eq!(tx.block_height, 812_345);
        assert_eq!(tx.micro_index, 3);
        assert_eq!(tx.tx_type, "SpendTx");
        assert_eq!(tx.sender_id.as_deref(), Some("ak_alice"));
        assert_eq!(tx.recipient_id.as_deref(), Some("ak_bob"));
        assert_eq!(tx.contract_id, None);
        // Le payload complet est conservé tel quel
        assert_eq!(tx.raw["tx"]["nonce"], 7);
        assert!(tx.data.is_empty());
    }

    #[test]
    fn test_contract_call_decoding() {
        let tx = decode_transaction(json!({
            "hash": "th_call",
            "block_hash": "mh_2",
            "block_height": 10,
            "micro_index": 0,
            "micro_time": 5,
            "tx": {
                "type": "ContractCallTx",
                "contract_id": "ct_dex",
                "caller_id": "ak_alice",
                "function": "swap_exact_tokens_for_ae",
                "arguments": []
            }
        }))
        .unwrap();

        assert_eq!(tx.contract_id.as_deref(), Some("ct_dex"));
        assert_eq!(tx.function.as_deref(), Some("swap_exact_tokens_for_ae"));
        assert_eq!(tx.caller_id.as_deref(), Some("ak_alice"));
    }

    #[test]
    fn test_malformed_transaction_names_hash() {
        let err = decode_transaction(json!({"hash": "th_bad", "tx": {}})).unwrap_err();
        assert!(matches!(err, ChainError::Decode(ref m) if m.contains("th_bad")));
    }

    #[test]
    fn test_page_and_blocks_decoding() {
        let page: PageWire<KeyBlockWire> = serde_json::from_value(json!({
            "data": [{
                "hash": "kh_2",
                "height": 2,
                "prev_hash": "mh_1",
                "prev_key_hash": "kh_1",
                "beneficiary": "ak_b",
                "miner": "ak_m",
                "time": 1000,
                "micro_blocks_count": 4,
                "transactions_count": 9,
                "info": "cb_AAAA"
            }],
            "next": "/v3/key-blocks?cursor=1&limit=100"
        }))
        .unwrap();

        assert_eq!(page.next.as_deref(), Some("/v3/key-blocks?cursor=1&limit=100"));
        let block: KeyBlock = page.data.into_iter().next().unwrap().into();
        assert_eq!(block.height, 2);
        assert_eq!(block.micro_blocks_count, 4);

        let micro: PageWire<MicroBlockWire> = serde_json::from_value(json!({
            "data": [{
                "hash": "mh_9",
                "height": 2,
                "prev_hash": "kh_2",
                "prev_key_hash": "kh_2",
                "micro_block_index": 0,
                "time": 1001
            }],
            "next": null
        }))
        .unwrap();
        assert!(micro.next.is_none());
        let micro: MicroBlock = micro.data.into_iter().next().unwrap().into();
        assert_eq!(micro.transactions_count, 0);
    }

    #[test]
    fn test_socket_frames() {
        let frame = json!({
            "subscription": "KeyBlocks",
            "payload": {"hash": "kh_5", "height": 5, "prev_hash": "mh_4"}
        })
        .to_string();

        let payload = channel_payload(&frame, Channel::KeyBlocks).unwrap();
        let header = decode_key_block_header(payload).unwrap();
        assert_eq!(header, KeyBlockHeader { hash: "kh_5".into(), height: 5 });

        // Une trame d'un autre canal ou un accusé de souscription est ignoré
        assert!(channel_payload(&frame, Channel::Transactions).is_none());
        assert!(channel_payload(r#"["KeyBlocks"]"#, Channel::KeyBlocks).is_none());

        let request = serde_json::to_value(SubscribeRequest::new(Channel::Transactions)).unwrap();
        assert_eq!(request, json!({"op": "Subscribe", "payload": "Transactions"}));
    }
}
