use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use std::time::Duration;
use thiserror::Error;

use crate::feed::parser::{parse_feed, FormatUnrecognized, ParseOptions};
use crate::storage::Source;

const USER_AGENT: &str = concat!("tidings/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while downloading a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Why a feed could not be turned into a [`Source`].
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Format(#[from] FormatUnrecognized),
}

/// Limits applied to every feed request.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Upper bound for one request attempt, body included.
    pub timeout: Duration,
    pub max_feed_bytes: usize,
    /// Retries for 429, 5xx and truncated bodies.
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub retry_base_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_feed_bytes: 10 * 1024 * 1024, // 10MB
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// HTTP client wrapper that downloads feeds under a [`FetchPolicy`].
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl Fetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, policy })
    }

    /// Download and parse one feed.
    pub async fn fetch_source(
        &self,
        url: &str,
        now: DateTime<Utc>,
        options: ParseOptions,
    ) -> Result<Source, SourceError> {
        let bytes = self.fetch(url).await?;
        let source = parse_feed(&bytes, url, now, options)?;
        Ok(source)
    }

    /// Download the raw body of `url`.
    ///
    /// Every attempt is bounded by the policy timeout. Rate limiting (429),
    /// server errors (5xx) and truncated bodies are retried with exponential
    /// backoff; other non-2xx statuses fail immediately.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry_count = 0;

        loop {
            let attempt = tokio::time::timeout(self.policy.timeout, self.attempt(url))
                .await
                .map_err(|_| FetchError::Timeout)?;

            let retryable = match attempt {
                Ok(bytes) => return Ok(bytes),
                Err(FetchError::HttpStatus(429)) => {
                    if retry_count >= self.policy.max_retries {
                        return Err(FetchError::RateLimited(self.policy.max_retries));
                    }
                    FetchError::HttpStatus(429)
                }
                Err(FetchError::HttpStatus(status)) if (500..600).contains(&status) => {
                    if retry_count >= self.policy.max_retries {
                        return Err(FetchError::HttpStatus(status));
                    }
                    FetchError::HttpStatus(status)
                }
                Err(e @ FetchError::IncompleteResponse { .. }) => {
                    if retry_count >= self.policy.max_retries {
                        return Err(e);
                    }
                    e
                }
                Err(e) => return Err(e),
            };

            let delay = backoff_delay(self.policy.retry_base_delay, retry_count);
            tracing::warn!(
                feed = %url,
                error = %retryable,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Retrying feed fetch after delay"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }

    async fn attempt(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, self.policy.max_feed_bytes).await
    }
}

/// `base * 2^retry`, saturating instead of overflowing for large retry counts.
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry))
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // Network interruptions can end the stream before Content-Length bytes arrive
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
