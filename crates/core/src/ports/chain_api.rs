//! Port traits for the remote chain.
//!
//! [`ChainApi`] is the paginated Chain Read API (height-range queries,
//! direction, tip status). [`ChainSubscriber`] is the pair of push channels
//! used by the live tailer. Implementations live in the infrastructure
//! layer (e.g., `aesync-mdw`).

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{ChainResult, DomainError, DomainResult};
use crate::models::{KeyBlock, KeyBlockHeader, MicroBlock, Transaction};

/// Order in which the API walks a height range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchDirection {
    #[default]
    Forward,
    Backward,
}

impl FetchDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }
}

/// Inclusive height range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeightRange {
    pub from: u64,
    pub to: u64,
}

impl HeightRange {
    /// Build a range, rejecting `from > to`.
    pub fn new(from: u64, to: u64) -> DomainResult<Self> {
        if from > to {
            return Err(DomainError::InvalidRange { from, to });
        }
        Ok(Self { from, to })
    }

    /// A range covering a single height.
    pub fn single(height: u64) -> Self {
        Self {
            from: height,
            to: height,
        }
    }

    /// Number of heights in the range.
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    /// Always false: a constructed range holds at least one height.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, height: u64) -> bool {
        (self.from..=self.to).contains(&height)
    }

    /// API scope parameter, e.g. `gen:100-199`.
    pub fn scope(&self) -> String {
        format!("gen:{}-{}", self.from, self.to)
    }

    /// Split into consecutive sub-ranges of at most `width` heights,
    /// highest first.
    pub fn split_descending(&self, width: u64) -> Vec<HeightRange> {
        let width = width.max(1);
        let mut ranges = Vec::new();
        let mut to = self.to;
        loop {
            let from = to.saturating_sub(width - 1).max(self.from);
            ranges.push(HeightRange { from, to });
            if from == self.from {
                break;
            }
            to = from - 1;
        }
        ranges
    }
}

impl std::fmt::Display for HeightRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

/// One page of an API listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    /// Opaque continuation (API path of the next page), `None` on the last page.
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn last(data: Vec<T>) -> Self {
        Self { data, next: None }
    }
}

/// Port trait for the paginated Chain Read API.
///
/// Every listing accepts the `next` continuation of the previous page;
/// pass `None` for the first page.
#[async_trait]
pub trait ChainApi: Send + Sync {
    /// Current chain tip height.
    async fn tip_height(&self) -> ChainResult<u64>;

    /// Key blocks within `range`.
    async fn key_blocks(
        &self,
        range: HeightRange,
        direction: FetchDirection,
        next: Option<&str>,
    ) -> ChainResult<Page<KeyBlock>>;

    /// Full key block by hash.
    async fn key_block(&self, hash: &str) -> ChainResult<KeyBlock>;

    /// Micro blocks of one generation.
    async fn micro_blocks(
        &self,
        key_block_hash: &str,
        next: Option<&str>,
    ) -> ChainResult<Page<MicroBlock>>;

    /// Transactions within `range`.
    async fn transactions(
        &self,
        range: HeightRange,
        direction: FetchDirection,
        next: Option<&str>,
    ) -> ChainResult<Page<Transaction>>;
}

/// Stream of pushed transactions.
pub type TransactionStream = Pin<Box<dyn Stream<Item = ChainResult<Transaction>> + Send>>;

/// Stream of pushed key block headers.
pub type KeyBlockStream = Pin<Box<dyn Stream<Item = ChainResult<KeyBlockHeader>> + Send>>;

/// Port trait for the push channels.
///
/// Dropping a returned stream releases its subscription.
#[async_trait]
pub trait ChainSubscriber: Send + Sync {
    /// Subscribe to newly seen transactions.
    async fn subscribe_transactions(&self) -> ChainResult<TransactionStream>;

    /// Subscribe to new key block headers.
    async fn subscribe_key_blocks(&self) -> ChainResult<KeyBlockStream>;
}
