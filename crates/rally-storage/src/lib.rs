//! HTTP fetch utilities and resolver caches for the enrichment job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};

pub mod cache;

pub use cache::{
    CacheBackend, CacheEntry, CacheError, JsonLinesBackend, MemoryBackend, ResolverCache,
};

pub use reqwest::Url;

pub const CRATE_NAME: &str = "rally-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    /// Rate-limit style refusal; retried with the longer escalating delay.
    RetryableForbidden,
    NonRetryable,
}

/// Which non-standard statuses a caller wants retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOn {
    pub forbidden: bool,
}

pub fn classify_status(status: StatusCode, retry_on: RetryOn) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else if status == StatusCode::FORBIDDEN && retry_on.forbidden {
        RetryDisposition::RetryableForbidden
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub forbidden_base_delay: Duration,
    pub forbidden_max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            forbidden_base_delay: Duration::from_secs(5),
            forbidden_max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        exponential(self.base_delay, self.max_delay, attempt_index)
    }

    pub fn forbidden_delay_for_attempt(&self, attempt_index: usize) -> Duration {
        exponential(
            self.forbidden_base_delay,
            self.forbidden_max_delay,
            attempt_index,
        )
    }

    fn delay_for(&self, disposition: RetryDisposition, attempt_index: usize) -> Duration {
        match disposition {
            RetryDisposition::RetryableForbidden => self.forbidden_delay_for_attempt(attempt_index),
            _ => self.delay_for_attempt(attempt_index),
        }
    }
}

fn exponential(base: Duration, max: Duration, attempt_index: usize) -> Duration {
    let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between two requests to the same service.
    pub throttle_every: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            throttle_every: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1)) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Shared HTTP client. Every service name gets its own single-token bucket,
/// so the geocoder and the encyclopedia are throttled independently.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    throttle_every: Duration,
    throttles: Mutex<HashMap<String, Arc<SimpleTokenBucket>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            throttle_every: config.throttle_every,
            throttles: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn throttle_for(&self, service: &str) -> Arc<SimpleTokenBucket> {
        let mut map = self.throttles.lock().await;
        map.entry(service.to_string())
            .or_insert_with(|| Arc::new(SimpleTokenBucket::new(1, self.throttle_every)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        service: &str,
        url: &Url,
        retry_on: RetryOn,
    ) -> Result<FetchedResponse, FetchError> {
        let throttle = self.throttle_for(service).await;
        let span = info_span!("http_fetch", service, url = %url);

        async move {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                throttle.take().await;
                let resp_result = self.client.get(url.clone()).send().await;

                match resp_result {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                final_url,
                                body,
                            });
                        }

                        let disposition = classify_status(status, retry_on);
                        if disposition != RetryDisposition::NonRetryable
                            && attempt < self.backoff.max_retries
                        {
                            let delay = self.backoff.delay_for(disposition, attempt);
                            warn!(status = status.as_u16(), attempt, ?delay, "retrying request");
                            tokio::time::sleep(delay).await;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        let disposition = classify_reqwest_error(&err);
                        if disposition == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "retrying request after transport error");
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            match last_request_error {
                Some(err) => Err(FetchError::Request(err)),
                None => Err(FetchError::HttpStatus {
                    status: 0,
                    url: url.to_string(),
                }),
            }
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        service: &str,
        url: &Url,
        retry_on: RetryOn,
    ) -> Result<T, FetchError> {
        let response = self.fetch_bytes(service, url, retry_on).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }
}

/// Build `base?k=v&...` with proper escaping.
pub fn url_with_params(base: &str, params: &[(&str, &str)]) -> Result<Url, FetchError> {
    Url::parse_with_params(base, params).map_err(|e| FetchError::InvalidUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn forbidden_backoff_escalates_from_its_own_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.forbidden_delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.forbidden_delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.forbidden_delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn forbidden_is_only_retried_when_asked() {
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, RetryOn::default()),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, RetryOn { forbidden: true }),
            RetryDisposition::RetryableForbidden
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, RetryOn::default()),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, RetryOn { forbidden: true }),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn zero_interval_bucket_never_blocks() {
        let bucket = SimpleTokenBucket::new(1, Duration::ZERO);
        for _ in 0..5 {
            bucket.take().await;
        }
    }

    #[tokio::test]
    async fn single_token_bucket_spaces_calls() {
        let bucket = SimpleTokenBucket::new(1, Duration::from_millis(50));
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn params_are_escaped() {
        let url = url_with_params(
            "https://example.org/search",
            &[("q", "Springfield, IL"), ("format", "jsonv2")],
        )
        .expect("url");
        assert_eq!(
            url.as_str(),
            "https://example.org/search?q=Springfield%2C+IL&format=jsonv2"
        );
    }
}
