use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Per-device worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound a caller waits for one command, in milliseconds.
    pub operation_timeout_ms: u64,
    pub channel_capacity: usize,
    /// Reopen-and-retry attempts after a transport error.
    pub max_retries: u32,
}

impl QueueConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 30_000,
            channel_capacity: 100,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    /// Use OS hot-plug notifications when libusb supports them.
    pub prefer_hotplug: bool,
    /// Fetch a features snapshot as soon as a device arrives.
    pub fetch_features_on_connect: bool,
    pub feature_fetch_attempts: u32,
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            prefer_hotplug: true,
            fetch_features_on_connect: true,
            feature_fetch_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pause between force-cleaning a stale recovery and retrying it.
    pub recovery_retry_pause_ms: u64,
}

impl SessionConfig {
    pub fn recovery_retry_pause(&self) -> Duration {
        Duration::from_millis(self.recovery_retry_pause_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { recovery_retry_pause_ms: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub queue: QueueConfig,
    pub watcher: WatcherConfig,
    pub session: SessionConfig,
    pub event_capacity: usize,
    /// `releases.json` used to derive update gating; none disables it.
    pub releases_path: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            watcher: WatcherConfig::default(),
            session: SessionConfig::default(),
            event_capacity: 256,
            releases_path: None,
        }
    }
}

impl CoreConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `KEEPKEY_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or panic the runtime: zero timeouts,
    /// zero intervals and zero-capacity channels.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("queue.operation_timeout_ms", self.queue.operation_timeout_ms),
            ("queue.channel_capacity", self.queue.channel_capacity as u64),
            ("watcher.poll_interval_ms", self.watcher.poll_interval_ms),
            ("watcher.feature_fetch_attempts", u64::from(self.watcher.feature_fetch_attempts)),
            ("event_capacity", self.event_capacity as u64),
        ];
        match positive.iter().find(|(_, value)| *value == 0) {
            Some((key, value)) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup("KEEPKEY_OPERATION_TIMEOUT_MS") {
            self.queue.operation_timeout_ms = parse_millis("KEEPKEY_OPERATION_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("KEEPKEY_POLL_INTERVAL_MS") {
            self.watcher.poll_interval_ms = parse_millis("KEEPKEY_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("KEEPKEY_RELEASES_PATH") {
            if !value.trim().is_empty() {
                self.releases_path = Some(PathBuf::from(value));
            }
        }
        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
