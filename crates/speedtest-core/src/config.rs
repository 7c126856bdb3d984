//! Test and client configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// What a session measures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    SpeedOnly,
    UnlockOnly,
    #[default]
    Both,
}

impl TestMode {
    /// Stage reported before the runner sends its first progress frame.
    #[must_use]
    pub const fn initial_stage(self) -> &'static str {
        match self {
            Self::UnlockOnly => "unlock_test",
            Self::SpeedOnly | Self::Both => "speed_test",
        }
    }

    #[must_use]
    pub const fn runs_speed(self) -> bool {
        matches!(self, Self::SpeedOnly | Self::Both)
    }

    #[must_use]
    pub const fn runs_unlock(self) -> bool {
        matches!(self, Self::UnlockOnly | Self::Both)
    }
}

/// Speed-test parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedParams {
    pub server_url: String,
    /// Download payload in MB.
    pub download_size: u32,
    /// Upload payload in MB.
    pub upload_size: u32,
}

impl Default for SpeedParams {
    fn default() -> Self {
        Self {
            server_url: "https://speed.cloudflare.com".to_string(),
            download_size: 50,
            upload_size: 20,
        }
    }
}

/// Unlock-detection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockParams {
    pub unlock_platforms: Vec<String>,
    pub unlock_concurrent: u32,
    /// Seconds per check.
    pub unlock_timeout: u32,
    pub unlock_retry: bool,
}

impl Default for UnlockParams {
    fn default() -> Self {
        Self {
            unlock_platforms: ["Netflix", "YouTube", "Disney+", "ChatGPT", "Spotify", "Bilibili"]
                .into_iter()
                .map(String::from)
                .collect(),
            unlock_concurrent: 5,
            unlock_timeout: 10,
            unlock_retry: false,
        }
    }
}

const SPEED_KEYS: [&str; 3] = ["serverUrl", "downloadSize", "uploadSize"];
const UNLOCK_KEYS: [&str; 4] = [
    "unlockPlatforms",
    "unlockConcurrent",
    "unlockTimeout",
    "unlockRetry",
];

/// Configuration posted to the runner to start a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfig {
    /// Proxy configuration source (path or subscription URL).
    pub config_paths: String,
    pub test_mode: TestMode,
    /// Selected target names.
    #[serde(rename = "includeNodes")]
    pub targets: Vec<String>,
    #[serde(default)]
    pub exclude_nodes: Vec<String>,
    /// Protocol allowlist; empty allows all.
    #[serde(default)]
    pub protocol_filter: Vec<String>,
    pub filter_regex: String,
    /// Seconds per target.
    pub timeout: u32,
    pub concurrent: u32,
    pub max_latency: u32,
    pub min_download_speed: f64,
    pub min_upload_speed: f64,
    #[serde(default)]
    pub stash_compatible: bool,
    #[serde(flatten)]
    pub speed: SpeedParams,
    #[serde(flatten)]
    pub unlock: UnlockParams,
}

impl TestConfig {
    /// Create a configuration with defaults for everything but the source
    /// and the selected targets.
    #[must_use]
    pub fn new<I>(config_paths: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            config_paths: config_paths.into(),
            test_mode: TestMode::default(),
            targets: targets.into_iter().map(Into::into).collect(),
            exclude_nodes: Vec::new(),
            protocol_filter: Vec::new(),
            filter_regex: ".+".to_string(),
            timeout: 5,
            concurrent: 4,
            max_latency: 800,
            min_download_speed: 0.0,
            min_upload_speed: 0.0,
            stash_compatible: false,
            speed: SpeedParams::default(),
            unlock: UnlockParams::default(),
        }
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: TestMode) -> Self {
        self.test_mode = mode;
        self
    }

    #[must_use]
    pub fn with_protocols<I>(mut self, protocols: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.protocol_filter = protocols.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// JSON body for the start call. Parameters of the stage the mode skips
    /// are left out.
    #[must_use]
    pub fn request_body(&self) -> Value {
        let mut body = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut body {
            if !self.test_mode.runs_speed() {
                for key in SPEED_KEYS {
                    map.remove(key);
                }
            }
            if !self.test_mode.runs_unlock() {
                for key in UNLOCK_KEYS {
                    map.remove(key);
                }
            }
        }
        body
    }
}

/// Reconnect schedule for the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnect that follows `retry_count` failed ones:
    /// `min(base * 2^retry_count, max)`.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1_u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Admission budget of the saved-session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_sessions: usize,
    pub retention: Duration,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must use one of {expected}, got {value:?}")]
    InvalidScheme {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

pub const API_URL_ENV: &str = "SPEEDTEST_API_URL";
pub const WS_URL_ENV: &str = "SPEEDTEST_WS_URL";
pub const STORE_PATH_ENV: &str = "SPEEDTEST_STORE_PATH";

/// Client-side endpoints and budgets.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the runner's HTTP API.
    pub api_url: String,
    /// Push-channel endpoint.
    pub ws_url: String,
    pub reconnect: ReconnectPolicy,
    pub store: StoreLimits,
    /// Directory for saved sessions; `None` uses the platform data dir.
    pub store_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            ws_url: "ws://localhost:8080/ws".to_string(),
            reconnect: ReconnectPolicy::default(),
            store: StoreLimits::default(),
            store_path: None,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `SPEEDTEST_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a URL has the wrong scheme.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an explicit variable source.
    ///
    /// # Errors
    /// Returns error if a URL has the wrong scheme.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let set = |key: &str| lookup(key).filter(|v: &String| !v.trim().is_empty());

        if let Some(api_url) = set(API_URL_ENV) {
            config.api_url = api_url.trim_end_matches('/').to_string();
        }
        if let Some(ws_url) = set(WS_URL_ENV) {
            config.ws_url = ws_url;
        }
        if let Some(path) = set(STORE_PATH_ENV) {
            config.store_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    /// Check URL schemes.
    ///
    /// # Errors
    /// Returns error if a URL has the wrong scheme.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme("api_url", &self.api_url, &["http://", "https://"], "http/https")?;
        check_scheme("ws_url", &self.ws_url, &["ws://", "wss://"], "ws/wss")
    }
}

fn check_scheme(
    name: &'static str,
    value: &str,
    schemes: &[&str],
    expected: &'static str,
) -> Result<(), ConfigError> {
    if schemes.iter().any(|s| value.starts_with(s)) {
        Ok(())
    } else {
        Err(ConfigError::InvalidScheme {
            name,
            expected,
            value: value.to_string(),
        })
    }
}
