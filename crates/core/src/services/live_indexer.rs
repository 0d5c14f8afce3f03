//! Live tailer following the chain's push channels.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::{ChainResult, IndexerError, IndexerResult};
use crate::events::TransactionEvents;
use crate::metrics::{
    record_key_blocks_persisted, record_live_duplicate, record_transactions_persisted,
    set_sync_height,
};
use crate::models::{KeyBlock, KeyBlockHeader, SyncDirection, Transaction};
use crate::ports::{ChainApi, ChainSubscriber, Repositories};

use super::micro_block::MicroBlockService;
use super::plugin_batch_processor::PluginBatchProcessorService;

/// Size of the live dedup window.
pub const DEDUP_CAPACITY: usize = 100;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Bounded set of the most recently persisted hashes, oldest evicted first.
#[derive(Debug)]
pub struct RecentHashes {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentHashes {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.seen.contains(hash)
    }

    pub fn insert(&mut self, hash: String) {
        if !self.seen.insert(hash.clone()) {
            return;
        }
        self.order.push_back(hash);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Subscription status of the live tailer, shared with health reporting.
#[derive(Debug, Clone, Default)]
pub struct LiveActivity {
    transactions: Arc<AtomicBool>,
    key_blocks: Arc<AtomicBool>,
}

impl LiveActivity {
    /// Both subscriptions are open.
    pub fn is_active(&self) -> bool {
        self.transactions.load(Ordering::SeqCst) && self.key_blocks.load(Ordering::SeqCst)
    }
}

/// What happened to one pushed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveTxOutcome {
    /// Seen within the dedup window.
    Duplicate,
    /// Spend from an account to itself, never stored.
    SelfSpend,
    /// Upserted and dispatched; `created` when the row is new.
    Persisted { created: bool },
}

/// Forward tailer: persists pushed transactions and key blocks.
pub struct LiveIndexerService {
    chain: Arc<dyn ChainApi>,
    subscriber: Arc<dyn ChainSubscriber>,
    repositories: Arc<dyn Repositories>,
    micro_blocks: MicroBlockService,
    processor: Arc<PluginBatchProcessorService>,
    events: TransactionEvents,
    recent: Mutex<RecentHashes>,
    activity: LiveActivity,
}

impl LiveIndexerService {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        subscriber: Arc<dyn ChainSubscriber>,
        repositories: Arc<dyn Repositories>,
        processor: Arc<PluginBatchProcessorService>,
        events: TransactionEvents,
    ) -> Self {
        Self {
            micro_blocks: MicroBlockService::new(chain.clone(), repositories.clone()),
            chain,
            subscriber,
            repositories,
            processor,
            events,
            recent: Mutex::new(RecentHashes::new(DEDUP_CAPACITY)),
            activity: LiveActivity::default(),
        }
    }

    /// Handle on the subscription status.
    pub fn activity(&self) -> LiveActivity {
        self.activity.clone()
    }

    pub fn is_active(&self) -> bool {
        self.activity.is_active()
    }

    /// Follow both push channels until shutdown. Subscriptions are released
    /// before returning.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown_rx: tokio::sync::watch::Receiver<bool>) -> IndexerResult<()> {
        info!("📡 Starting live tailer");

        let transactions = self.follow(
            "transactions",
            &self.activity.transactions,
            shutdown_rx.clone(),
            || self.subscriber.subscribe_transactions(),
            |tx: Transaction| async move { self.handle_transaction(tx).await.map(|_| ()) },
        );
        let key_blocks = self.follow(
            "key_blocks",
            &self.activity.key_blocks,
            shutdown_rx,
            || self.subscriber.subscribe_key_blocks(),
            |header: KeyBlockHeader| async move { self.handle_key_block(header).await.map(|_| ()) },
        );
        tokio::join!(transactions, key_blocks);

        Err(IndexerError::ShutdownRequested)
    }

    /// Persist and dispatch one pushed transaction.
    #[instrument(skip_all, fields(hash = %tx.hash))]
    pub async fn handle_transaction(&self, tx: Transaction) -> IndexerResult<LiveTxOutcome> {
        if self.recent.lock().await.contains(&tx.hash) {
            trace!("Duplicate live transaction dropped");
            record_live_duplicate();
            return Ok(LiveTxOutcome::Duplicate);
        }
        if tx.is_self_spend() {
            trace!("Self spend dropped");
            return Ok(LiveTxOutcome::SelfSpend);
        }

        let batch = std::slice::from_ref(&tx);
        let outcome = self
            .repositories
            .transactions()
            .upsert_transactions(batch)
            .await?;
        record_transactions_persisted("upsert", outcome.written());
        self.events.emit_created(batch, &outcome.inserted);
        self.recent.lock().await.insert(tx.hash.clone());

        self.processor.process(batch, SyncDirection::Live).await;

        Ok(LiveTxOutcome::Persisted {
            created: !outcome.inserted.is_empty(),
        })
    }

    /// Mirror a pushed key block with its generation and advance the live
    /// frontier.
    #[instrument(skip_all, fields(height = header.height))]
    pub async fn handle_key_block(&self, header: KeyBlockHeader) -> IndexerResult<KeyBlock> {
        let key_block = self.chain.key_block(&header.hash).await?;
        self.repositories
            .blocks()
            .upsert_key_blocks(std::slice::from_ref(&key_block))
            .await?;
        record_key_blocks_persisted(1);

        let store = self.repositories.sync_state();
        store.raise_live(key_block.height).await?;
        store.raise_tip(key_block.height).await?;
        set_sync_height("live", key_block.height);
        set_sync_height("tip", key_block.height);

        let micro_blocks = self.micro_blocks.sync_generation(&key_block.hash).await?;
        info!(
            height = key_block.height,
            hash = %key_block.hash,
            micro_blocks,
            "⛓️  Key block mirrored"
        );
        Ok(key_block)
    }

    /// Subscribe, handle every item, and resubscribe with exponential
    /// backoff until shutdown.
    async fn follow<T, Sub, SubFut, Handle, HandleFut>(
        &self,
        channel: &'static str,
        flag: &AtomicBool,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
        subscribe: Sub,
        handle: Handle,
    ) where
        Sub: Fn() -> SubFut,
        SubFut: Future<Output = ChainResult<BoxStream<'static, ChainResult<T>>>>,
        Handle: Fn(T) -> HandleFut,
        HandleFut: Future<Output = IndexerResult<()>>,
    {
        let mut retry_delay = INITIAL_RETRY_DELAY;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match subscribe().await {
                Ok(mut stream) => {
                    debug!(channel, "📡 Subscription established");
                    flag.store(true, Ordering::SeqCst);
                    retry_delay = INITIAL_RETRY_DELAY;

                    loop {
                        tokio::select! {
                            item = stream.next() => match item {
                                Some(Ok(item)) => {
                                    if let Err(e) = handle(item).await {
                                        error!(channel, error = ?e, "❌ Live item processing failed");
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!(channel, error = ?e, "⚠️  Subscription error, reconnecting...");
                                    break;
                                }
                                None => {
                                    warn!(channel, "⚠️  Subscription closed, reconnecting...");
                                    break;
                                }
                            },
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    flag.store(false, Ordering::SeqCst);
                    drop(stream);
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        channel,
                        error = ?e,
                        retry_in_ms = retry_delay.as_millis(),
                        "⚠️  Failed to subscribe, retrying..."
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(retry_delay) => {
                    debug!(channel, retry_delay_ms = retry_delay.as_millis(), "🔄 Resubscribing...");
                    retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        debug!(channel, "Subscription released");
    }
}
