//! Per-recipient, per-channel send budgets.
//!
//! Each `(recipient, channel)` pair gets a window that opens on its first send
//! and lasts `window_duration`. Reads never refresh or reset a window; a stale
//! window is treated as absent until the next `record_send` or `sweep_expired`.
//!
//! The ledger also remembers the channel each recipient was last reached on, so
//! a request that names no channel can still be checked against a budget.

use std::collections::{BTreeMap, HashMap};

use chorely_core::config::ThrottleConfig;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::message::config_span;

/// Send counter for one `(recipient, channel)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleWindow {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    #[serde(skip)]
    pub window_duration: Duration,
    pub limit: u32,
}

impl ThrottleWindow {
    /// A window is live on `[window_start, window_start + window_duration)`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_start + self.window_duration
    }
}

/// Channel limits and window length.
#[derive(Debug, Clone)]
pub struct ThrottleLimits {
    pub window: Duration,
    pub default_limit: u32,
    pub channels: HashMap<String, u32>,
}

impl ThrottleLimits {
    pub fn limit_for(&self, channel: &str) -> u32 {
        self.channels
            .get(channel)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Override one channel's limit.
    pub fn with_channel(mut self, channel: &str, limit: u32) -> Self {
        self.channels.insert(channel.to_string(), limit);
        self
    }
}

impl From<&ThrottleConfig> for ThrottleLimits {
    fn from(config: &ThrottleConfig) -> Self {
        Self {
            window: config_span(config.window_secs),
            default_limit: config.default_limit,
            channels: config.channels.clone(),
        }
    }
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self::from(&ThrottleConfig::default())
    }
}

/// Tracks live windows for every pair that has been sent to.
#[derive(Debug, Default)]
pub struct ThrottleLedger {
    windows: HashMap<(String, String), ThrottleWindow>,
    /// recipient → channel of the latest charged or reported send
    last_channel: HashMap<String, String>,
    limits: ThrottleLimits,
}

impl ThrottleLedger {
    pub fn new(limits: ThrottleLimits) -> Self {
        Self {
            windows: HashMap::new(),
            last_channel: HashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &ThrottleLimits {
        &self.limits
    }

    fn key(recipient_id: &str, channel: &str) -> (String, String) {
        (recipient_id.to_string(), channel.to_string())
    }

    /// Whether another send to this pair would exceed its budget.
    /// A channel configured with limit 0 is always throttled.
    pub fn is_throttled(&self, recipient_id: &str, channel: &str, now: DateTime<Utc>) -> bool {
        if self.limits.limit_for(channel) == 0 {
            return true;
        }
        match self.windows.get(&Self::key(recipient_id, channel)) {
            Some(window) if !window.is_stale(now) => window.count >= window.limit,
            _ => false,
        }
    }

    /// Charge one send. Opens a fresh window when none is live.
    pub fn record_send(&mut self, recipient_id: &str, channel: &str, now: DateTime<Utc>) {
        let limit = self.limits.limit_for(channel);
        let duration = self.limits.window;
        let window = self
            .windows
            .entry(Self::key(recipient_id, channel))
            .or_insert_with(|| ThrottleWindow {
                count: 0,
                window_start: now,
                window_duration: duration,
                limit,
            });

        if window.is_stale(now) {
            *window = ThrottleWindow {
                count: 1,
                window_start: now,
                window_duration: duration,
                limit,
            };
        } else {
            window.count += 1;
        }
        let count = window.count;
        let limit = window.limit;
        self.remember_channel(recipient_id, channel);

        tracing::debug!(
            recipient = recipient_id,
            channel,
            count,
            limit,
            "throttle send recorded"
        );
    }

    /// Note the channel a recipient was reached on without charging it.
    pub fn remember_channel(&mut self, recipient_id: &str, channel: &str) {
        if self.last_channel.get(recipient_id).map(String::as_str) != Some(channel) {
            self.last_channel
                .insert(recipient_id.to_string(), channel.to_string());
        }
    }

    /// Channel the recipient was last reached on, if any.
    pub fn last_channel(&self, recipient_id: &str) -> Option<&str> {
        self.last_channel.get(recipient_id).map(String::as_str)
    }

    /// Drop every stale window. Returns how many were removed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_stale(now));
        let removed = before - self.windows.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired throttle windows");
        }
        removed
    }

    /// Window for a pair, stale or not.
    pub fn window(&self, recipient_id: &str, channel: &str) -> Option<&ThrottleWindow> {
        self.windows.get(&Self::key(recipient_id, channel))
    }

    /// Sends left in the current window.
    pub fn remaining(&self, recipient_id: &str, channel: &str, now: DateTime<Utc>) -> u32 {
        match self.windows.get(&Self::key(recipient_id, channel)) {
            Some(w) if !w.is_stale(now) => w.limit.saturating_sub(w.count),
            _ => self.limits.limit_for(channel),
        }
    }

    /// Number of live windows.
    pub fn active(&self, now: DateTime<Utc>) -> usize {
        self.windows.values().filter(|w| !w.is_stale(now)).count()
    }

    /// Live windows grouped by channel.
    pub fn active_by_channel(&self, now: DateTime<Utc>) -> BTreeMap<String, usize> {
        let mut by_channel = BTreeMap::new();
        for ((_, channel), window) in &self.windows {
            if !window.is_stale(now) {
                *by_channel.entry(channel.clone()).or_insert(0) += 1;
            }
        }
        by_channel
    }
}
