//! Configuration management for nodescope
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. Every section has defaults, so a file only needs
//! to name the values it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::scheduler::{CrawlCriteria, HandshakeCriteria};
use crate::utils::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node store configuration
    pub store: StoreConfig,

    /// Handshake scheduling
    pub handshake: HandshakeConfig,

    /// Crawl scheduling
    pub crawl: CrawlConfig,

    /// Backoff for claims that hit lock contention
    pub retry: RetrySettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Node store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path
    pub path: PathBuf,

    /// How long a statement waits on a locked database before failing
    pub busy_timeout_ms: u64,

    /// Upper bound on open pooled connections
    pub max_connections: usize,
}

/// Handshake scheduling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Quiet period after a successful handshake
    pub min_unused_ok_secs: u64,

    /// Quiet period after a failed handshake
    pub min_unused_err_secs: u64,

    /// Retry ceiling for non-transient errors
    pub max_tries: u32,

    /// Error tag exempt from the retry ceiling
    pub transient_error: String,

    /// Nodes claimed per round
    pub batch_size: usize,
}

/// Crawl scheduling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Cooldown between two crawls of the same node
    pub min_unused_secs: u64,

    /// Ping failure ceiling
    pub max_ping_tries: u32,

    /// Handshake retry ceiling for non-transient errors
    pub max_handshake_tries: u32,

    /// Handshake error tag exempt from the retry ceiling
    pub transient_handshake_error: String,

    /// Nodes claimed per round
    pub batch_size: usize,
}

/// Retry configuration for contended claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Base delay in milliseconds
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/nodes.db"),
            busy_timeout_ms: 5_000,
            max_connections: 8,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            min_unused_ok_secs: 24 * 3600,
            min_unused_err_secs: 3600,
            max_tries: 3,
            transient_error: String::from("timeout"),
            batch_size: 100,
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            min_unused_secs: 30 * 60,
            max_ping_tries: 3,
            max_handshake_tries: 3,
            transient_handshake_error: String::from("timeout"),
            batch_size: 100,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_retries: retry.max_retries,
            base_delay_ms: retry.base_delay_ms,
            max_delay_ms: retry.max_delay_ms,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl StoreConfig {
    /// Busy timeout as Duration
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl HandshakeConfig {
    /// Selection criteria for one handshake round
    pub fn criteria(&self) -> HandshakeCriteria {
        HandshakeCriteria {
            min_unused_ok: Duration::from_secs(self.min_unused_ok_secs),
            min_unused_err: Duration::from_secs(self.min_unused_err_secs),
            max_tries: self.max_tries,
            transient_err: self.transient_error.clone(),
            limit: self.batch_size,
        }
    }
}

impl CrawlConfig {
    /// Selection criteria for one crawl round
    pub fn criteria(&self) -> CrawlCriteria {
        CrawlCriteria {
            min_unused: Duration::from_secs(self.min_unused_secs),
            max_ping_tries: self.max_ping_tries,
            max_handshake_tries: self.max_handshake_tries,
            transient_handshake_err: self.transient_handshake_error.clone(),
            limit: self.batch_size,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig::with_delays(
            settings.max_retries,
            settings.base_delay_ms,
            settings.max_delay_ms,
        )
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override values from `NODESCOPE_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("NODESCOPE_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(ms) = env_parse("NODESCOPE_BUSY_TIMEOUT_MS") {
            self.store.busy_timeout_ms = ms;
        }
        if let Some(max) = env_parse("NODESCOPE_MAX_CONNECTIONS") {
            self.store.max_connections = max;
        }
        if let Some(secs) = env_parse("NODESCOPE_HANDSHAKE_MIN_UNUSED_OK_SECS") {
            self.handshake.min_unused_ok_secs = secs;
        }
        if let Some(secs) = env_parse("NODESCOPE_HANDSHAKE_MIN_UNUSED_ERR_SECS") {
            self.handshake.min_unused_err_secs = secs;
        }
        if let Some(tries) = env_parse("NODESCOPE_HANDSHAKE_MAX_TRIES") {
            self.handshake.max_tries = tries;
        }
        if let Ok(err) = std::env::var("NODESCOPE_HANDSHAKE_TRANSIENT_ERROR") {
            self.handshake.transient_error = err;
        }
        if let Some(size) = env_parse("NODESCOPE_HANDSHAKE_BATCH_SIZE") {
            self.handshake.batch_size = size;
        }
        if let Some(secs) = env_parse("NODESCOPE_CRAWL_MIN_UNUSED_SECS") {
            self.crawl.min_unused_secs = secs;
        }
        if let Some(tries) = env_parse("NODESCOPE_CRAWL_MAX_PING_TRIES") {
            self.crawl.max_ping_tries = tries;
        }
        if let Some(tries) = env_parse("NODESCOPE_CRAWL_MAX_HANDSHAKE_TRIES") {
            self.crawl.max_handshake_tries = tries;
        }
        if let Ok(err) = std::env::var("NODESCOPE_CRAWL_TRANSIENT_HANDSHAKE_ERROR") {
            self.crawl.transient_handshake_error = err;
        }
        if let Some(size) = env_parse("NODESCOPE_CRAWL_BATCH_SIZE") {
            self.crawl.batch_size = size;
        }
        if let Some(retries) = env_parse("NODESCOPE_RETRY_MAX_RETRIES") {
            self.retry.max_retries = retries;
        }
        if let Some(ms) = env_parse("NODESCOPE_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = ms;
        }
        if let Some(ms) = env_parse("NODESCOPE_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = ms;
        }
        if let Ok(level) = std::env::var("NODESCOPE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("NODESCOPE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.store.path.as_os_str().is_empty() {
            return Err(Error::config("store.path must not be empty"));
        }

        if self.store.max_connections == 0 {
            return Err(Error::config("store.max_connections must be greater than 0"));
        }

        if self.handshake.batch_size == 0 {
            return Err(Error::config("handshake.batch_size must be greater than 0"));
        }

        if self.crawl.batch_size == 0 {
            return Err(Error::config("crawl.batch_size must be greater than 0"));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::config(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_is_invalid() {
        let mut config = Config::default();
        config.crawl.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.handshake.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_format_is_invalid() {
        let mut config = Config::default();
        config.logging.format = String::from("yaml");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [store]
            path = "/var/lib/nodescope/nodes.db"

            [handshake]
            max_tries = 7
            transient_error = "i/o timeout"
            "#,
        )
        .unwrap();

        assert_eq!(config.store.path, PathBuf::from("/var/lib/nodescope/nodes.db"));
        assert_eq!(config.store.busy_timeout_ms, 5_000);
        assert_eq!(config.handshake.max_tries, 7);
        assert_eq!(config.handshake.batch_size, 100);
        assert_eq!(config.crawl, CrawlConfig::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = Config::from_toml("store = 5").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn test_criteria_conversion() {
        let config = Config::default();

        let handshake = config.handshake.criteria();
        assert_eq!(handshake.min_unused_ok, Duration::from_secs(24 * 3600));
        assert_eq!(handshake.min_unused_err, Duration::from_secs(3600));
        assert_eq!(handshake.transient_err, "timeout");
        assert_eq!(handshake.limit, 100);

        let crawl = config.crawl.criteria();
        assert_eq!(crawl.min_unused, Duration::from_secs(1800));
        assert_eq!(crawl.max_ping_tries, 3);

        let retry = RetryConfig::from(&config.retry);
        assert_eq!(retry.max_retries, RetryConfig::default().max_retries);
    }

    // Only test in the crate that touches the process environment
    #[test]
    fn test_env_overrides() {
        let vars = [
            ("NODESCOPE_MAX_CONNECTIONS", "2"),
            ("NODESCOPE_HANDSHAKE_TRANSIENT_ERROR", "i/o timeout"),
            ("NODESCOPE_HANDSHAKE_BATCH_SIZE", "20"),
            ("NODESCOPE_CRAWL_MAX_HANDSHAKE_TRIES", "9"),
            ("NODESCOPE_CRAWL_TRANSIENT_HANDSHAKE_ERROR", "too many peers"),
            ("NODESCOPE_CRAWL_BATCH_SIZE", "0"),
            ("NODESCOPE_RETRY_MAX_RETRIES", "1"),
            ("NODESCOPE_RETRY_BASE_DELAY_MS", "10"),
            ("NODESCOPE_RETRY_MAX_DELAY_MS", "not-a-number"),
        ];
        for (name, value) in vars {
            std::env::set_var(name, value);
        }
        let mut config = Config::default();
        config.apply_env();
        for (name, _) in vars {
            std::env::remove_var(name);
        }

        assert_eq!(config.store.max_connections, 2);
        assert_eq!(config.handshake.transient_error, "i/o timeout");
        assert_eq!(config.handshake.batch_size, 20);
        assert_eq!(config.crawl.max_handshake_tries, 9);
        assert_eq!(config.crawl.transient_handshake_error, "too many peers");
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_delay_ms, 10);
        // unparsable values keep the default
        assert_eq!(config.retry.max_delay_ms, RetrySettings::default().max_delay_ms);

        assert_eq!(config.crawl.batch_size, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_busy_timeout_conversion() {
        let config = StoreConfig::default();
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
    }
}
