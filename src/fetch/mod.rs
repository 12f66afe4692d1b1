//! Resilient fetch layer.
//!
//! Every outbound request in the crate goes through `Fetcher`:
//! - hard per-attempt timeout, reported as `FetchError::Timeout`
//! - HTTP 429 sleeps a fixed backoff and retries the same request,
//!   with no attempt limit, so callers never see rate limiting
//! - other statuses and network errors go straight back to the caller
//!
//! `fetch` always hits the network; `fetch_cached` consults the on-disk
//! cache first when one is configured.

pub mod cache;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

pub use cache::ResponseCache;
pub use transport::{FetchOptions, FetchResponse, HttpMethod, HttpTransport, ReqwestTransport};

use crate::error::FetchError;

/// Fixed sleep between retries of a rate-limited request.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(10);

/// Hard timeout for a single request attempt.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: REQUEST_TIMEOUT,
            backoff: RATE_LIMIT_BACKOFF,
        }
    }
}

pub struct Fetcher {
    transport: Arc<dyn HttpTransport>,
    cache: Option<ResponseCache>,
    policy: FetchPolicy,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: FetchPolicy) -> Self {
        Self {
            transport,
            cache: None,
            policy,
        }
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Uncached fetch.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let response =
                match tokio::time::timeout(self.policy.timeout, self.transport.send(url, options))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(FetchError::Timeout {
                            url: url.to_string(),
                            secs: self.policy.timeout.as_secs(),
                        })
                    }
                };

            if response.status == 429 {
                log::warn!(
                    "Fetch: 429 from {} (attempt {}), retrying in {:?}",
                    url,
                    attempt,
                    self.policy.backoff
                );
                tokio::time::sleep(self.policy.backoff).await;
                continue;
            }

            return Ok(response);
        }
    }

    /// Cached fetch. Falls back to `fetch` when no cache is configured.
    pub async fn fetch_cached(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<FetchResponse, FetchError> {
        let Some(cache) = &self.cache else {
            return self.fetch(url, options).await;
        };

        if let Some(hit) = cache.get(url, options).await {
            log::debug!("Fetch: cache hit for {}", url);
            return Ok(hit);
        }

        let response = self.fetch(url, options).await?;
        if cache::is_cacheable(&response) {
            if let Err(e) = cache.put(url, options, &response).await {
                log::warn!("Fetch: failed to cache {}: {}", url, e);
            }
        }
        Ok(response)
    }
}
