//! zsync2 configuration file parsing (.zsync2.toml)

use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::WrapErr;

use crate::sync::SyncOptions;

/// Config file name looked up in the working directory
pub const CONFIG_FILE: &str = ".zsync2.toml";

/// zsync2 configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Zsync2Config {
    pub sync: SyncConfig,
    pub http: HttpConfig,
}

/// `[sync]` table
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Matches queued between a seed scan and its writer
    pub channel_capacity: usize,
    /// Remote requests in flight at once
    pub fetch_concurrency: usize,
    /// Largest single range request; longer gaps are split
    pub max_request_bytes: u64,
    /// Check the SHA-1 of the result when the control file has one
    pub verify: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            fetch_concurrency: 4,
            max_request_bytes: 8 * 1024 * 1024,
            verify: true,
        }
    }
}

/// `[http]` table
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    /// Extra attempts after a transient failure
    pub retries: u32,
    /// Delay before the first retry; grows linearly
    pub retry_backoff_ms: u64,
    /// Connect timeout, and the longest a response may stall between reads
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_backoff_ms: 500,
            timeout_secs: 30,
            user_agent: concat!("zsync2/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Zsync2Config {
    /// Load config from `dir`.
    ///
    /// Returns default config if .zsync2.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(dir: &Path) -> color_eyre::Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load an explicitly named config file, which must exist
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .wrap_err_with(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Engine options described by the `[sync]` table
    #[must_use]
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            channel_capacity: self.sync.channel_capacity.max(1),
            fetch_concurrency: self.sync.fetch_concurrency.max(1),
            max_request_bytes: self.sync.max_request_bytes.max(1),
            verify: self.sync.verify,
        }
    }
}
