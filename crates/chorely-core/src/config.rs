//! Chorely configuration system.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChorelyError, Result};

/// Longest span any duration setting may express: ten years.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChorelyConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ChorelyConfig {
    /// Load config from the default path (~/.chorely/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChorelyError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ChorelyError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duration settings longer than [`MAX_DURATION_SECS`].
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        let spans = [
            ("scheduler.tick_interval_secs", scheduler.tick_interval_secs),
            ("scheduler.throttle_deferral_secs", scheduler.throttle_deferral_secs),
            ("scheduler.gateway_timeout_secs", scheduler.gateway_timeout_secs),
            ("scheduler.retention_hours", scheduler.retention_hours.saturating_mul(3600)),
            ("scheduler.retry.base_delay_secs", scheduler.retry.base_delay_secs),
            ("scheduler.retry.max_delay_secs", scheduler.retry.max_delay_secs),
            ("throttle.window_secs", self.throttle.window_secs),
            ("gateway.timeout_secs", self.gateway.timeout_secs),
        ];
        match spans.iter().find(|(_, secs)| *secs > MAX_DURATION_SECS) {
            Some((name, _)) => Err(ChorelyError::Config(format!(
                "{name} is longer than ten years"
            ))),
            None => Ok(()),
        }
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ChorelyError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Chorely home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chorely")
    }
}

/// Dispatch loop and retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// How far a throttled one-off message is pushed back.
    #[serde(default = "default_throttle_deferral")]
    pub throttle_deferral_secs: u64,
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
    /// Terminal messages older than this are purged. 0 keeps them forever.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_tick_interval() -> u64 { 60 }
fn default_max_attempts() -> u32 { 3 }
fn default_throttle_deferral() -> u64 { 60 }
fn default_gateway_timeout() -> u64 { 30 }
fn default_max_concurrent_sends() -> usize { 8 }
fn default_retention_hours() -> u64 { 168 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            default_max_attempts: default_max_attempts(),
            throttle_deferral_secs: default_throttle_deferral(),
            gateway_timeout_secs: default_gateway_timeout(),
            max_concurrent_sends: default_max_concurrent_sends(),
            retention_hours: default_retention_hours(),
            retry: RetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.clamp(1, MAX_DURATION_SECS))
    }

    pub fn retention(&self) -> Option<Duration> {
        (self.retention_hours > 0).then(|| {
            let secs = self.retention_hours.saturating_mul(3600);
            Duration::from_secs(secs.min(MAX_DURATION_SECS))
        })
    }
}

/// Backoff curve for failed deliveries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_strategy")]
    pub strategy: RetryStrategy,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_retry_strategy() -> RetryStrategy { RetryStrategy::Fixed }
fn default_base_delay() -> u64 { 300 }
fn default_max_delay() -> u64 { 3600 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: default_retry_strategy(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

/// Per-channel send budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Limit applied to channels without an explicit entry.
    #[serde(default = "default_channel_limit")]
    pub default_limit: u32,
    #[serde(default = "default_channel_limits")]
    pub channels: HashMap<String, u32>,
}

fn default_window_secs() -> u64 { 3600 }
fn default_channel_limit() -> u32 { 20 }
fn default_channel_limits() -> HashMap<String, u32> {
    [("whatsapp", 20), ("sms", 10), ("telegram", 50)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            default_limit: default_channel_limit(),
            channels: default_channel_limits(),
        }
    }
}

/// Delivery gateway selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// "log" or "webhook".
    #[serde(default = "default_gateway_kind")]
    pub kind: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

fn default_gateway_kind() -> String { "log".into() }
fn default_webhook_timeout() -> u64 { 10 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            kind: default_gateway_kind(),
            webhook_url: String::new(),
            timeout_secs: default_webhook_timeout(),
            headers: vec![],
        }
    }
}

/// Message store backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "memory" or "sqlite".
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

fn default_storage_backend() -> String { "memory".into() }
fn default_sqlite_path() -> String { "~/.chorely/scheduler.db".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl StorageConfig {
    /// SQLite path with `~` expanded.
    pub fn expanded_sqlite_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.sqlite_path).to_string())
    }
}
