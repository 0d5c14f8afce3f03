//! Middleware websocket adapter implementing the [`ChainSubscriber`] port.
//!
//! Each subscription opens its own connection, so dropping the returned
//! stream closes the socket and releases the subscription.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, instrument, trace, warn};

use aesync_core::error::{ChainError, ChainResult};
use aesync_core::ports::{ChainSubscriber, KeyBlockStream, TransactionStream};

use crate::wire::{
    Channel, SubscribeRequest, channel_payload, decode_key_block_header, decode_transaction,
};

/// Websocket push-channel adapter.
#[derive(Debug, Clone)]
pub struct MdwSocket {
    ws_url: String,
}

impl MdwSocket {
    /// `ws_url` is the full websocket endpoint, e.g. `wss://mainnet.aeternity.io/mdw/v3/websocket`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    /// Connect, subscribe to `channel` and return the payloads addressed to it.
    #[instrument(skip(self), fields(url = %self.ws_url, channel = channel.as_str()))]
    async fn open(
        &self,
        channel: Channel,
    ) -> ChainResult<futures::stream::BoxStream<'static, ChainResult<Value>>> {
        let (mut socket, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| ChainError::SubscriptionError(e.to_string()))?;

        let request = serde_json::to_string(&SubscribeRequest::new(channel))
            .map_err(|e| ChainError::SubscriptionError(e.to_string()))?;
        socket
            .send(Message::Text(request))
            .await
            .map_err(|e| ChainError::SubscriptionError(e.to_string()))?;
        debug!("Subscribed");

        // A close frame ends the stream; the caller reconnects.
        let stream = socket
            .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(move |frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => channel_payload(&text, channel).map(Ok),
                    Ok(other) => {
                        trace!(kind = ?other, "Ignoring non-text frame");
                        None
                    }
                    Err(e) => Some(Err(ChainError::SubscriptionError(e.to_string()))),
                })
            });

        Ok(stream.boxed())
    }
}

/// Decode a payload; an undecodable payload is logged and skipped so the
/// subscription stays up. Transport errors pass through.
fn decode_or_skip<T>(
    item: ChainResult<Value>,
    decode: fn(Value) -> ChainResult<T>,
) -> Option<ChainResult<T>> {
    match item.map(decode) {
        Ok(Ok(value)) => Some(Ok(value)),
        Ok(Err(e)) => {
            warn!(error = %e, "⚠️  Skipping undecodable push payload");
            None
        }
        Err(e) => Some(Err(e)),
    }
}

#[async_trait]
impl ChainSubscriber for MdwSocket {
    async fn subscribe_transactions(&self) -> ChainResult<TransactionStream> {
        let stream = self.open(Channel::Transactions).await?;
        Ok(Box::pin(stream.filter_map(|item| {
            future::ready(decode_or_skip(item, decode_transaction))
        })))
    }

    async fn subscribe_key_blocks(&self) -> ChainResult<KeyBlockStream> {
        let stream = self.open(Channel::KeyBlocks).await?;
        Ok(Box::pin(stream.filter_map(|item| {
            future::ready(decode_or_skip(item, decode_key_block_header))
        })))
    }
}
