//! Micro block mirroring.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{instrument, trace};

use crate::error::IndexerResult;
use crate::models::KeyBlock;
use crate::ports::{ChainApi, Repositories};

/// Generations fetched concurrently per sub-batch.
pub const MICRO_BLOCK_CONCURRENCY: usize = 5;

/// Fetches and upserts the micro blocks of key blocks.
#[derive(Clone)]
pub struct MicroBlockService {
    chain: Arc<dyn ChainApi>,
    repositories: Arc<dyn Repositories>,
}

impl MicroBlockService {
    pub fn new(chain: Arc<dyn ChainApi>, repositories: Arc<dyn Repositories>) -> Self {
        Self {
            chain,
            repositories,
        }
    }

    /// Mirror every micro block of one generation. Returns the number fetched.
    #[instrument(skip(self))]
    pub async fn sync_generation(&self, key_block_hash: &str) -> IndexerResult<usize> {
        let mut next: Option<String> = None;
        let mut fetched = 0;

        loop {
            let page = self
                .chain
                .micro_blocks(key_block_hash, next.as_deref())
                .await?;
            if !page.data.is_empty() {
                self.repositories.blocks().upsert_micro_blocks(&page.data).await?;
                fetched += page.data.len();
            }
            match page.next {
                Some(cursor) => next = Some(cursor),
                None => break,
            }
        }

        trace!(fetched, "Micro blocks mirrored");
        Ok(fetched)
    }

    /// Mirror the micro blocks of several generations in small parallel
    /// sub-batches. The first failure aborts.
    pub async fn sync_generations(&self, key_blocks: &[KeyBlock]) -> IndexerResult<usize> {
        let mut total = 0;
        for chunk in key_blocks.chunks(MICRO_BLOCK_CONCURRENCY) {
            let counts =
                try_join_all(chunk.iter().map(|kb| self.sync_generation(&kb.hash))).await?;
            total += counts.iter().sum::<usize>();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryRepositories, MockChain};

    #[tokio::test]
    async fn generations_are_mirrored_across_pages() {
        let chain = Arc::new(MockChain::generate(12, 0).with_page_size(1));
        let repos = Arc::new(InMemoryRepositories::new());
        let service = MicroBlockService::new(chain.clone(), repos.clone());

        let key_blocks: Vec<KeyBlock> = (0..=12).filter_map(|h| chain.key_block_at(h)).collect();
        let total = service.sync_generations(&key_blocks).await.unwrap();

        assert_eq!(total, 13);
        assert_eq!(repos.micro_block_count(), 13);
    }

    #[tokio::test]
    async fn unknown_generation_is_an_error() {
        let chain = Arc::new(MockChain::generate(1, 0));
        let repos = Arc::new(InMemoryRepositories::new());
        let service = MicroBlockService::new(chain, repos);

        assert!(service.sync_generation("kh_missing").await.is_err());
    }
}
