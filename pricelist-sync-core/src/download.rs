//! Fetching the upstream price list: the HTTP source and the retrying [`Fetcher`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::contract::ListSource;
use crate::error::{MalformedRecord, SourceError, SyncError};
use crate::record::ListRecord;

pub const DEFAULT_UPSTREAM_URL: &str =
    "https://cosmos-odyssey.azurewebsites.net/api/v1.0/TravelPrices";

/// [`ListSource`] backed by a single HTTP GET endpoint returning one JSON document.
pub struct HttpListSource {
    client: reqwest::Client,
    url: String,
}

impl HttpListSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ListSource for HttpListSource {
    async fn fetch_latest(&self) -> Result<serde_json::Value, SourceError> {
        debug!(url = %self.url, "[FETCH] Requesting upstream list");
        let resp = self.client.get(&self.url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(resp.json::<serde_json::Value>().await?)
    }
}

/// Result of one fetch cycle. Only `Fetched` carries data; the other two mean "nothing new this
/// cycle".
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(ListRecord),
    /// Upstream answered, but without a usable `id`/`validUntil`. Not retried.
    Malformed(MalformedRecord),
    /// Every allowed attempt failed.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay(),
            max_attempts: config.max_fetch_attempts,
        }
    }

    /// Backoff after the `failures`-th consecutive failure (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        self.base_delay.saturating_mul(failures.saturating_add(1))
    }
}

/// Retrieves one upstream list, retrying transient failures with linearly growing delays.
pub struct Fetcher {
    source: Arc<dyn ListSource>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(source: Arc<dyn ListSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Never fails: exhaustion of the retry budget is reported as [`FetchOutcome::Exhausted`].
    pub async fn fetch(&self) -> FetchOutcome {
        let mut failures: u32 = 0;
        loop {
            let attempt = failures + 1;
            match self.source.fetch_latest().await {
                Ok(value) => {
                    return match ListRecord::from_upstream(value) {
                        Ok(record) => {
                            info!(
                                id = %record.id,
                                valid_until = %record.valid_until,
                                attempt,
                                "[FETCH] Fetched upstream list"
                            );
                            FetchOutcome::Fetched(record)
                        }
                        Err(reason) => {
                            debug!(%reason, attempt, "[FETCH] Upstream response unusable");
                            FetchOutcome::Malformed(reason)
                        }
                    };
                }
                Err(source) => {
                    failures = attempt;
                    let err = SyncError::FetchTransient { attempt, source };
                    if failures >= self.policy.max_attempts {
                        error!(error = %err, "[FETCH][ERROR] Final fetch attempt failed");
                        return FetchOutcome::Exhausted { attempts: failures };
                    }
                    let delay = self.policy.delay_after(failures);
                    warn!(
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "[FETCH] Upstream fetch failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
