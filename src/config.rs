//! Configuration file parser for ~/.config/tidings/config.toml.
//!
//! The config file is optional. A missing or empty file yields
//! `Config::default()`. Unknown keys are accepted but logged as likely typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::scheduler::{DEFAULT_PERSIST_INTERVAL, DEFAULT_REFRESH_INTERVAL};
use crate::engine::EngineOptions;
use crate::feed::{FetchPolicy, ParseOptions};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds the maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Struct
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the state document lives. Defaults to `state.json` next to the
    /// config file.
    pub state_path: Option<PathBuf>,

    /// Address the web server binds to.
    pub listen_addr: String,

    /// Minutes between refresh passes.
    pub refresh_interval_minutes: u64,

    /// Seconds between persist cycles.
    pub persist_interval_secs: u64,

    pub fetch_timeout_secs: u64,

    /// Feeds larger than this many bytes are rejected.
    pub max_feed_bytes: usize,

    pub max_retries: u32,

    pub retry_base_delay_ms: u64,

    pub max_concurrent_fetches: usize,

    /// Keep entry summaries/content as the entry body.
    pub include_body: bool,

    /// Accept subscriptions on localhost or private networks.
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: None,
            listen_addr: "127.0.0.1:9090".to_string(),
            refresh_interval_minutes: DEFAULT_REFRESH_INTERVAL.as_secs() / 60,
            persist_interval_secs: DEFAULT_PERSIST_INTERVAL.as_secs(),
            fetch_timeout_secs: 30,
            max_feed_bytes: 10 * 1024 * 1024,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            max_concurrent_fetches: 10,
            include_body: false,
            allow_private_hosts: false,
        }
    }
}

const KNOWN_KEYS: [&str; 11] = [
    "state_path",
    "listen_addr",
    "refresh_interval_minutes",
    "persist_interval_secs",
    "fetch_timeout_secs",
    "max_feed_bytes",
    "max_retries",
    "retry_base_delay_ms",
    "max_concurrent_fetches",
    "include_body",
    "allow_private_hosts",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::parse(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        Ok(toml::from_str(content)?)
    }

    /// The state document path, resolved against `config_dir` when unset or
    /// relative.
    pub fn resolve_state_path(&self, config_dir: &Path) -> PathBuf {
        match &self.state_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => config_dir.join(path),
            None => config_dir.join("state.json"),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_minutes.max(1) * 60)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs.max(1))
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            max_feed_bytes: self.max_feed_bytes,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            parse: ParseOptions {
                include_body: self.include_body,
            },
            max_concurrent_fetches: self.max_concurrent_fetches.max(1),
            allow_private_hosts: self.allow_private_hosts,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.state_path, None);
        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.refresh_interval(), Duration::from_secs(12 * 60 * 60));
        assert_eq!(config.persist_interval(), Duration::from_secs(15));
        assert!(!config.include_body);
        assert!(!config.allow_private_hosts);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_empty_and_whitespace_files_return_default() {
        for content in ["", "   \n  \n  "] {
            let (_dir, path) = write_config(content);
            assert_eq!(Config::load(&path).unwrap(), Config::default());
        }
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (_dir, path) = write_config("refresh_interval_minutes = 30\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.refresh_interval_minutes, 30);
        assert_eq!(config.persist_interval_secs, 15);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
state_path = "/var/lib/tidings/state.json"
listen_addr = "0.0.0.0:8080"
refresh_interval_minutes = 60
persist_interval_secs = 5
fetch_timeout_secs = 10
max_feed_bytes = 1024
max_retries = 1
retry_base_delay_ms = 250
max_concurrent_fetches = 4
include_body = true
allow_private_hosts = true
"#;
        let (_dir, path) = write_config(content);
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config,
            Config {
                state_path: Some(PathBuf::from("/var/lib/tidings/state.json")),
                listen_addr: "0.0.0.0:8080".to_string(),
                refresh_interval_minutes: 60,
                persist_interval_secs: 5,
                fetch_timeout_secs: 10,
                max_feed_bytes: 1024,
                max_retries: 1,
                retry_base_delay_ms: 250,
                max_concurrent_fetches: 4,
                include_body: true,
                allow_private_hosts: true,
            }
        );

        let policy = config.fetch_policy();
        assert_eq!(policy.timeout, Duration::from_secs(10));
        assert_eq!(policy.retry_base_delay, Duration::from_millis(250));
        let options = config.engine_options();
        assert!(options.parse.include_body);
        assert_eq!(options.max_concurrent_fetches, 4);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (_dir, path) = write_config("include_body = true\ntotally_fake_key = 1\n");
        assert!(Config::load(&path).unwrap().include_body);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (_dir, path) = write_config("max_retries = \"many\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (_dir, path) = write_config(&"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_state_path_resolution() {
        let dir = Path::new("/home/me/.config/tidings");
        let mut config = Config::default();
        assert_eq!(config.resolve_state_path(dir), dir.join("state.json"));

        config.state_path = Some(PathBuf::from("data/feeds.json"));
        assert_eq!(config.resolve_state_path(dir), dir.join("data/feeds.json"));

        config.state_path = Some(PathBuf::from("/srv/state.json"));
        assert_eq!(config.resolve_state_path(dir), PathBuf::from("/srv/state.json"));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = Config::parse("refresh_interval_minutes = 0\npersist_interval_secs = 0\n").unwrap();
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.persist_interval(), Duration::from_secs(1));
    }
}
