//! Shared HTTP plumbing for source clients.
//!
//! One fetcher per source: owns the reqwest client with the source's
//! timeouts, the source's rate limiter, and the retry policy. Clients
//! hand it a prepared URL and get back parsed JSON or a classified
//! `SourceError`.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::config::SourceSettings;
use crate::error::{CoreError, SourceError};
use crate::fetch::rate_limit::RateLimiter;

/// Backoff schedule for transient retries.
mod backoff {
    use std::time::Duration;

    const BASE: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(8);

    pub fn exponential(attempt: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1));
        BASE.saturating_mul(multiplier).min(MAX)
    }
}

struct FetchFailure {
    error: SourceError,
    retry_after: Option<Duration>,
}

#[derive(Debug)]
pub struct SourceFetcher {
    name: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    max_retries: u32,
}

impl SourceFetcher {
    pub fn new(settings: &SourceSettings) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.timeout())
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: settings.name.clone(),
            client,
            limiter: RateLimiter::from_settings(settings),
            max_retries: settings.max_retries.max(1),
        })
    }

    pub fn source_name(&self) -> &str {
        &self.name
    }

    /// GET a JSON document. Transient failures (timeouts, connection
    /// resets, 5xx, 429) retry with exponential backoff up to the
    /// configured cap; a `Retry-After` on 429 overrides the backoff
    /// delay. 404 maps to `NotFound`, other 4xx are permanent.
    pub async fn get_json(&self, url: Url) -> Result<serde_json::Value, SourceError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.limiter.acquire().await?;

            match self.execute(url.clone()).await {
                Ok(value) => return Ok(value),
                Err(failure) if failure.error.is_transient() && attempt < self.max_retries => {
                    let delay = failure
                        .retry_after
                        .unwrap_or_else(|| backoff::exponential(attempt));
                    warn!(
                        source = %self.name,
                        attempt,
                        ?delay,
                        error = %failure.error,
                        "transient fetch failure, retrying"
                    );
                    sleep(delay).await;
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }

    async fn execute(&self, url: Url) -> Result<serde_json::Value, FetchFailure> {
        debug!(source = %self.name, %url, "GET");

        let response = self.client.get(url).send().await.map_err(|e| {
            let detail = if e.is_timeout() {
                format!("request timed out: {e}")
            } else if e.is_connect() {
                format!("connection failed: {e}")
            } else {
                format!("network error: {e}")
            };
            FetchFailure {
                error: SourceError::transient(&self.name, detail),
                retry_after: None,
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchFailure {
                error: SourceError::not_found(&self.name, "404 Not Found"),
                retry_after: None,
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchFailure {
                error: SourceError::transient(&self.name, "429 Too Many Requests"),
                retry_after,
            });
        }
        if status.is_server_error() {
            return Err(FetchFailure {
                error: SourceError::transient(&self.name, format!("server error: {status}")),
                retry_after: None,
            });
        }
        if status.is_client_error() {
            return Err(FetchFailure {
                error: SourceError::permanent(&self.name, format!("client error: {status}")),
                retry_after: None,
            });
        }

        response.json::<serde_json::Value>().await.map_err(|e| {
            // A malformed body will not improve on retry.
            FetchFailure {
                error: SourceError::permanent(&self.name, format!("invalid JSON payload: {e}")),
                retry_after: None,
            }
        })
    }
}
