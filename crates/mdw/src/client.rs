//! Middleware HTTP client implementing the [`ChainApi`] port.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, trace};
use url::Url;

use aesync_core::config::API_MAX_PAGE_SIZE;
use aesync_core::error::{ChainError, ChainResult};
use aesync_core::models::{KeyBlock, MicroBlock, Transaction};
use aesync_core::ports::{ChainApi, FetchDirection, HeightRange, Page};

use crate::wire::{KeyBlockWire, MicroBlockWire, PageWire, StatusWire, decode_transaction};

/// Configuration for the middleware client.
#[derive(Debug, Clone)]
pub struct MdwClientConfig {
    /// Base URL of the middleware, e.g. `https://mainnet.aeternity.io/mdw`.
    pub base_url: String,
    /// Requested page size, clamped to the API maximum.
    pub page_size: u32,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for MdwClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4000".to_string(),
            page_size: API_MAX_PAGE_SIZE,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Middleware client adapter implementing the ChainApi port.
pub struct MdwClient {
    http: Client,
    base: Url,
    limit: u32,
}

impl MdwClient {
    #[instrument(skip_all, fields(url = %config.base_url))]
    pub fn new(config: MdwClientConfig) -> ChainResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ChainError::Http(e.to_string()))?;

        let base = parse_base(&config.base_url)?;
        let limit = config.page_size.clamp(1, API_MAX_PAGE_SIZE);
        debug!(limit, "Middleware client ready");

        Ok(Self { http, base, limit })
    }

    /// URL of the first page of a listing.
    fn listing_url(&self, path: &str, params: &[(&str, &str)]) -> ChainResult<Url> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| ChainError::Http(format!("invalid path {path}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
            query.append_pair("limit", &self.limit.to_string());
        }
        Ok(url)
    }

    /// First page URL, or the continuation returned by the previous page.
    fn page_url(
        &self,
        next: Option<&str>,
        path: &str,
        params: &[(&str, &str)],
    ) -> ChainResult<Url> {
        match next {
            Some(next) => resolve_next(&self.base, next),
            None => self.listing_url(path, params),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> ChainResult<T> {
        trace!(%url, "GET");
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ChainError::Http(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ChainError::NotFound(url.path().to_string()));
        }
        if !status.is_success() {
            return Err(ChainError::Status {
                status: status.as_u16(),
                path: url.path().to_string(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ChainError::Decode(format!("{}: {e}", url.path())))
    }
}

/// Parse the base URL so that relative joins extend its path.
fn parse_base(base_url: &str) -> ChainResult<Url> {
    let normalized = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    Url::parse(&normalized).map_err(|e| ChainError::Http(format!("invalid base url {base_url}: {e}")))
}

/// Resolve a `next` continuation against the base URL.
///
/// The middleware returns either an absolute URL or a path that may or may
/// not repeat the base path prefix (e.g. `/mdw/v3/...` behind a proxy).
fn resolve_next(base: &Url, next: &str) -> ChainResult<Url> {
    if next.starts_with("http://") || next.starts_with("https://") {
        return Url::parse(next).map_err(|e| ChainError::Decode(format!("invalid next {next}: {e}")));
    }
    let prefix = base.path();
    let relative = next
        .strip_prefix(prefix)
        .or_else(|| next.strip_prefix('/'))
        .unwrap_or(next);
    base.join(relative)
        .map_err(|e| ChainError::Decode(format!("invalid next {next}: {e}")))
}

#[async_trait]
impl ChainApi for MdwClient {
    async fn tip_height(&self) -> ChainResult<u64> {
        let url = self
            .base
            .join("v3/status")
            .map_err(|e| ChainError::Http(e.to_string()))?;
        let status: StatusWire = self.get(url).await?;
        Ok(status.mdw_height)
    }

    #[instrument(skip(self, next), fields(range = %range, direction = direction.as_str()))]
    async fn key_blocks(
        &self,
        range: HeightRange,
        direction: FetchDirection,
        next: Option<&str>,
    ) -> ChainResult<Page<KeyBlock>> {
        let scope = range.scope();
        let url = self.page_url(
            next,
            "v3/key-blocks",
            &[("scope", &scope), ("direction", direction.as_str())],
        )?;
        let page: PageWire<KeyBlockWire> = self.get(url).await?;
        trace!(count = page.data.len(), "Fetched key blocks page");

        Ok(Page {
            data: page.data.into_iter().map(Into::into).collect(),
            next: page.next,
        })
    }

    async fn key_block(&self, hash: &str) -> ChainResult<KeyBlock> {
        let url = self
            .base
            .join(&format!("v3/key-blocks/{hash}"))
            .map_err(|e| ChainError::Http(e.to_string()))?;
        let block: KeyBlockWire = self.get(url).await?;
        Ok(block.into())
    }

    async fn micro_blocks(
        &self,
        key_block_hash: &str,
        next: Option<&str>,
    ) -> ChainResult<Page<MicroBlock>> {
        let path = format!("v3/key-blocks/{key_block_hash}/micro-blocks");
        let url = self.page_url(next, &path, &[])?;
        let page: PageWire<MicroBlockWire> = self.get(url).await?;

        Ok(Page {
            data: page.data.into_iter().map(Into::into).collect(),
            next: page.next,
        })
    }

    #[instrument(skip(self, next), fields(range = %range, direction = direction.as_str()))]
    async fn transactions(
        &self,
        range: HeightRange,
        direction: FetchDirection,
        next: Option<&str>,
    ) -> ChainResult<Page<Transaction>> {
        let scope = range.scope();
        let url = self.page_url(
            next,
            "v3/transactions",
            &[("scope", &scope), ("direction", direction.as_str())],
        )?;
        let page: PageWire<Value> = self.get(url).await?;
        trace!(count = page.data.len(), "Fetched transactions page");

        let data = page
            .data
            .into_iter()
            .map(decode_transaction)
            .collect::<ChainResult<Vec<_>>>()?;

        Ok(Page {
            data,
            next: page.next,
        })
    }
}
