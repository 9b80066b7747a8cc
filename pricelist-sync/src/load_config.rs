//! `load_config`: reads the YAML config file, applies environment overrides and validates the
//! result.
//!
//! Every section is optional; a missing section takes its defaults. Environment variables win
//! over the file:
//! - `UPSTREAM_URL` replaces `upstream.url`
//! - `STORE_PATH` replaces `store.path`
//! - `PORT` replaces `server.port`

use anyhow::Result;
use pricelist_sync_core::config::SyncConfig;
use pricelist_sync_core::download::DEFAULT_UPSTREAM_URL;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_PORT: u16 = 5050;
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub upstream: UpstreamSection,
    pub store: StoreSection,
    pub server: ServerSection,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            timeout_ms: DEFAULT_UPSTREAM_TIMEOUT_MS,
        }
    }
}

impl UpstreamSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Without a path the store lives in memory only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

/// Loads the YAML config at `path`, applies env overrides and validates it.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    // An empty file is a valid "all defaults" config.
    let mut config: AppConfig = if config_content.trim().is_empty() {
        AppConfig::default()
    } else {
        match serde_yaml::from_str(&config_content) {
            Ok(conf) => {
                info!(config_path = ?path_ref, "Parsed config YAML successfully");
                conf
            }
            Err(e) => {
                error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
                return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
            }
        }
    };

    apply_env_overrides(&mut config)?;

    if let Err(e) = config.sync.validate() {
        error!(error = %e, config_path = ?path_ref, "Config failed validation");
        return Err(anyhow::anyhow!(e));
    }
    if config.upstream.timeout_ms == 0 {
        return Err(anyhow::anyhow!("upstream.timeout_ms must be positive"));
    }
    config.sync.trace_loaded();
    Ok(config)
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(url) = std::env::var("UPSTREAM_URL") {
        if !url.is_empty() {
            info!(%url, "Upstream URL overridden from environment");
            config.upstream.url = url;
        }
    }
    if let Ok(path) = std::env::var("STORE_PATH") {
        if !path.is_empty() {
            config.store.path = Some(PathBuf::from(path));
        }
    }
    if let Ok(port) = std::env::var("PORT") {
        match port.parse::<u16>() {
            Ok(port) => config.server.port = port,
            Err(e) => {
                error!(value = %port, error = %e, "Invalid PORT in environment");
                return Err(anyhow::anyhow!("PORT must be a port number, got {port:?}"));
            }
        }
    }
    Ok(())
}
