//! Runtime configuration for the sync engine.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (e.g. `ALERT_SYNC_API_URL`)
//! 2. Values from an optional TOML file
//! 3. Built-in defaults
//!
//! | Setting                  | Default | Used by              |
//! |--------------------------|---------|----------------------|
//! | `max_retries`            | 5       | reliability monitor  |
//! | `handshake_timeout`      | 15 s    | change feed client   |
//! | `retry_delay`            | 2 s     | change feed client   |
//! | `poll_interval`          | 30 s    | polling fallback     |
//! | `trial_interval`         | 60 s    | reliability monitor  |
//! | `identity_retry_interval`| 5 s     | engine bootstrap     |
//! | `preview_chars`          | 50      | notification sink    |

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use alert_core::{DEFAULT_LOG_EVERY, DEFAULT_MAX_RETRIES};

use crate::errors::SyncError;

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TRIAL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_IDENTITY_RETRY: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PREVIEW_CHARS: usize = 50;

const ENV_API_URL: &str = "ALERT_SYNC_API_URL";
const ENV_API_KEY: &str = "ALERT_SYNC_API_KEY";
const ENV_MAX_RETRIES: &str = "ALERT_SYNC_MAX_RETRIES";
const ENV_POLL_INTERVAL_SECS: &str = "ALERT_SYNC_POLL_INTERVAL_SECS";
const ENV_HANDSHAKE_TIMEOUT_SECS: &str = "ALERT_SYNC_HANDSHAKE_TIMEOUT_SECS";

/// Engine configuration. One instance per session.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base URL of the alert REST API.
    pub api_base_url: String,
    /// Bearer token sent with every request, if any.
    pub api_key: Option<String>,
    /// Ask the read endpoint for unread alerts only.
    pub unread_only: bool,
    /// Consecutive channel failures before the circuit opens.
    pub max_retries: u32,
    /// Warn on the first channel failure and every Nth after it.
    pub log_every: u32,
    /// Upper bound on a subscription handshake (and on unsubscribe).
    pub handshake_timeout: Duration,
    /// Delay before re-subscribing while the circuit is closed.
    pub retry_delay: Duration,
    /// Period of the polling fallback.
    pub poll_interval: Duration,
    /// Period of half-open trial subscriptions while degraded.
    pub trial_interval: Duration,
    /// Delay between identity resolution attempts.
    pub identity_retry_interval: Duration,
    /// TCP connect timeout for the HTTP client.
    pub connect_timeout: Duration,
    /// Characters of the message shown in a notification.
    pub preview_chars: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: None,
            unread_only: true,
            max_retries: DEFAULT_MAX_RETRIES,
            log_every: DEFAULT_LOG_EVERY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            trial_interval: DEFAULT_TRIAL_INTERVAL,
            identity_retry_interval: DEFAULT_IDENTITY_RETRY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

/// On-disk shape. Every field is optional; durations are whole seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_base_url: Option<String>,
    api_key: Option<String>,
    unread_only: Option<bool>,
    max_retries: Option<u32>,
    log_every: Option<u32>,
    handshake_timeout_secs: Option<u64>,
    retry_delay_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    trial_interval_secs: Option<u64>,
    identity_retry_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    preview_chars: Option<usize>,
}

impl SyncConfig {
    /// Defaults, then `path` (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            config.apply_toml(&raw)?;
        }
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a TOML document.
    pub fn apply_toml(&mut self, raw: &str) -> Result<(), SyncError> {
        let file: FileConfig =
            toml::from_str(raw).map_err(|e| SyncError::Configuration(e.to_string()))?;

        if let Some(v) = file.api_base_url {
            self.api_base_url = v;
        }
        if file.api_key.is_some() {
            self.api_key = file.api_key;
        }
        if let Some(v) = file.unread_only {
            self.unread_only = v;
        }
        if let Some(v) = file.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = file.log_every {
            self.log_every = v;
        }
        if let Some(v) = file.handshake_timeout_secs {
            self.handshake_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.retry_delay_secs {
            self.retry_delay = Duration::from_secs(v);
        }
        if let Some(v) = file.poll_interval_secs {
            self.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.trial_interval_secs {
            self.trial_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.identity_retry_secs {
            self.identity_retry_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.preview_chars {
            self.preview_chars = v;
        }
        Ok(())
    }

    /// Overlay environment variables. Unparsable numbers are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Ok(key) = env::var(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(v) = env_number::<u32>(ENV_MAX_RETRIES) {
            self.max_retries = v;
        }
        if let Some(v) = env_number::<u64>(ENV_POLL_INTERVAL_SECS) {
            self.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_number::<u64>(ENV_HANDSHAKE_TIMEOUT_SECS) {
            self.handshake_timeout = Duration::from_secs(v);
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        reqwest::Url::parse(&self.api_base_url).map_err(|e| {
            SyncError::Configuration(format!("invalid api_base_url {:?}: {e}", self.api_base_url))
        })?;
        if self.max_retries == 0 {
            return Err(SyncError::Configuration(
                "max_retries must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("handshake_timeout", self.handshake_timeout),
            ("poll_interval", self.poll_interval),
            ("trial_interval", self.trial_interval),
            ("identity_retry_interval", self.identity_retry_interval),
        ] {
            if value.is_zero() {
                return Err(SyncError::Configuration(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
