//! Configuration file parser for ~/.config/postfeed/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as likely typos.
use crate::feed::{RefreshPolicy, SessionOptions, DEFAULT_FETCH_TIMEOUT, DEFAULT_PAGE_SIZE};
use secrecy::SecretString;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides `api_key`.
pub const API_KEY_ENV: &str = "POSTFEED_API_KEY";

/// Account whose scraped posts file is used when `data_file` is unset.
pub const TARGET_USER_ENV: &str = "TARGET_USER";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// Well-formed TOML with a value outside its allowed range.
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// The custom Debug impl masks `api_key`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Items per page.
    pub page_size: u32,

    /// Poll the backend every `refresh_interval_secs`.
    pub auto_refresh: bool,

    pub refresh_interval_secs: u64,

    /// Quiet period before a change notification triggers a confirming refresh.
    pub change_debounce_ms: u64,

    /// Upper bound on one page fetch.
    pub fetch_timeout_secs: u64,

    pub refresh_policy: RefreshPolicy,

    /// Base URL of the PostgREST-style backend.
    pub backend_url: Option<String>,

    pub table: String,

    /// Backend API key (alternative to POSTFEED_API_KEY). Env var wins.
    pub api_key: Option<String>,

    /// Flat JSON posts file. Defaults to `{target_user}_threads.json`.
    pub data_file: Option<PathBuf>,

    /// Listen address for `serve`. `PORT` overrides the port.
    pub bind: String,

    pub static_dir: PathBuf,

    pub target_user: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            auto_refresh: false,
            refresh_interval_secs: 30,
            change_debounce_ms: 500,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT.as_secs(),
            refresh_policy: RefreshPolicy::default(),
            backend_url: None,
            table: "posts".to_string(),
            api_key: None,
            data_file: None,
            bind: "0.0.0.0:3000".to_string(),
            static_dir: PathBuf::from("frontend"),
            target_user: "j.p_morgan_trading".to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("page_size", &self.page_size)
            .field("auto_refresh", &self.auto_refresh)
            .field("refresh_interval_secs", &self.refresh_interval_secs)
            .field("change_debounce_ms", &self.change_debounce_ms)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("refresh_policy", &self.refresh_policy)
            .field("backend_url", &self.backend_url)
            .field("table", &self.table)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("data_file", &self.data_file)
            .field("bind", &self.bind)
            .field("static_dir", &self.static_dir)
            .field("target_user", &self.target_user)
            .finish()
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 13] = [
        "page_size",
        "auto_refresh",
        "refresh_interval_secs",
        "change_debounce_ms",
        "fetch_timeout_secs",
        "refresh_policy",
        "backend_url",
        "table",
        "api_key",
        "data_file",
        "bind",
        "static_dir",
        "target_user",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing or blank file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
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
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::parse(&content)?;
        tracing::info!(
            path = %path.display(),
            page_size = config.page_size,
            auto_refresh = config.auto_refresh,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parses and validates config text. Blank text yields defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch_timeout_secs must be at least 1".into(),
            ));
        }
        if self.auto_refresh && self.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "refresh_interval_secs must be at least 1 when auto_refresh is on".into(),
            ));
        }
        Ok(())
    }

    /// Applies environment overrides (`POSTFEED_API_KEY`, `PORT`, `TARGET_USER`).
    pub fn with_env(mut self) -> Self {
        self.apply_env(
            std::env::var(API_KEY_ENV).ok(),
            std::env::var("PORT").ok(),
            std::env::var(TARGET_USER_ENV).ok(),
        );
        self
    }

    fn apply_env(&mut self, api_key: Option<String>, port: Option<String>, target_user: Option<String>) {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(user) = target_user {
            let user = user.trim();
            if !user.is_empty() {
                self.target_user = user.to_string();
            }
        }
        if let Some(port) = port {
            match port.trim().parse::<u16>() {
                Ok(port) => {
                    let host = self
                        .bind
                        .rsplit_once(':')
                        .map_or(self.bind.as_str(), |(host, _)| host);
                    self.bind = format!("{host}:{port}");
                }
                Err(_) => tracing::warn!(port = %port, "Ignoring invalid PORT value"),
            }
        }
    }

    /// API key wrapped for handing to the backend client.
    pub fn api_key(&self) -> Option<SecretString> {
        self.api_key.clone().map(SecretString::from)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bind is not a socket address: {}", self.bind)))
    }

    /// Posts file served by `serve` and read by the flat-file backend.
    pub fn data_file(&self) -> PathBuf {
        self.data_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}_threads.json", self.target_user)))
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.auto_refresh
            .then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            page_size: self.page_size,
            refresh_interval: self.refresh_interval(),
            change_debounce: Duration::from_millis(self.change_debounce_ms),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            refresh_policy: self.refresh_policy,
            ..SessionOptions::default()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
