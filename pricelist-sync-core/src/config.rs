use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::SyncError;

pub const DEFAULT_RETENTION: usize = 15;
pub const DEFAULT_THROTTLE_WINDOW_MS: u64 = 10_000;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 5_000;
pub const DEFAULT_MAX_FETCH_ATTEMPTS: u32 = 20;
pub const DEFAULT_GRACE_DELAY_MS: u64 = 5_000;
pub const DEFAULT_SAFETY_MARGIN_MS: u64 = 5_000;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 5_000;

/// Tunables for the sync loop. Every field has a default, so a partial config section is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How many lists the store keeps, newest first.
    pub retention: usize,
    /// Trailing-edge throttle window of the dedup gate.
    pub throttle_window_ms: u64,
    /// Backoff after the n-th failed fetch is `retry_base_delay_ms * (n + 1)`.
    pub retry_base_delay_ms: u64,
    pub max_fetch_attempts: u32,
    /// Wait used when the latest list has already expired or a fetch came back empty-handed.
    pub grace_delay_ms: u64,
    /// Added on top of the remaining validity so the check lands after expiry.
    pub safety_margin_ms: u64,
    pub progress_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            throttle_window_ms: DEFAULT_THROTTLE_WINDOW_MS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_fetch_attempts: DEFAULT_MAX_FETCH_ATTEMPTS,
            grace_delay_ms: DEFAULT_GRACE_DELAY_MS,
            safety_margin_ms: DEFAULT_SAFETY_MARGIN_MS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl SyncConfig {
    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_window_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Rejects values that would break the loop's guarantees.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.retention == 0 {
            return Err(SyncError::InvalidConfig(
                "retention must keep at least one list".into(),
            ));
        }
        if self.max_fetch_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_fetch_attempts must be at least 1".into(),
            ));
        }
        if self.throttle_window_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "throttle_window_ms must be positive".into(),
            ));
        }
        // A zero margin would schedule the check exactly at expiry instead of after it.
        if self.safety_margin_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "safety_margin_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            retention = self.retention,
            throttle_window_ms = self.throttle_window_ms,
            max_fetch_attempts = self.max_fetch_attempts,
            "Loaded SyncConfig"
        );
        debug!(?self, "SyncConfig loaded (full debug)");
    }
}
