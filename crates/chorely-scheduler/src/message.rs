//! Scheduled message definitions: the core data model for one-off deliveries.

use chorely_core::config::{MAX_DURATION_SECS, RetryConfig, RetryStrategy};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default number of delivery attempts for a scheduled message.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A configured number of seconds as a `Duration`, clamped to ten years.
pub fn config_span(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// A fully formed delivery request handed to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRequest {
    /// Family member the message targets.
    pub recipient_id: String,
    /// Explicit channel. `None` lets the gateway pick the recipient's preference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Category tag used for templating ("reminder", "digest", ...).
    pub message_type: String,
    /// Opaque body; the scheduler never looks inside.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DeliveryRequest {
    pub fn new(recipient_id: &str, message_type: &str, payload: serde_json::Value) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            channel: None,
            message_type: message_type.to_string(),
            payload,
        }
    }

    pub fn via(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }
}

/// Lifecycle status of a scheduled message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl MessageStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            "cancelled" => Some(MessageStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one dispatch attempt, as seen by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Gateway accepted the message.
    Sent,
    /// Gateway rejected, errored, timed out or panicked.
    Failed(String),
    /// Held back by the throttle ledger. Consumes an attempt.
    Deferred,
}

/// A one-off delivery waiting for its time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledMessage {
    pub id: String,
    pub recipient_id: String,
    pub message_type: String,
    /// Eligible for dispatch once `now >= scheduled_for`.
    pub scheduled_for: DateTime<Utc>,
    pub payload: DeliveryRequest,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Last status change; drives retention.
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ScheduledMessage {
    /// Create a new pending message.
    pub fn new(
        payload: DeliveryRequest,
        scheduled_for: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4().simple()),
            recipient_id: payload.recipient_id.clone(),
            message_type: payload.message_type.clone(),
            scheduled_for,
            payload,
            attempts: 0,
            max_attempts,
            status: MessageStatus::Pending,
            created_at: now,
            last_attempt_at: None,
            updated_at: now,
            last_error: None,
        }
    }

    /// Check if this message should be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Pending
            && self.scheduled_for <= now
            && self.attempts < self.max_attempts
    }

    /// Cancel if still pending. Returns whether anything changed.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != MessageStatus::Pending {
            return false;
        }
        self.status = MessageStatus::Cancelled;
        self.updated_at = now;
        true
    }

    /// Apply a dispatch outcome.
    ///
    /// Every outcome counts as one attempt. A failed or deferred attempt either
    /// exhausts the budget (`failed`) or pushes `scheduled_for` to
    /// `now + retry_delay`. Messages no longer pending are left untouched and
    /// `None` is returned.
    pub fn apply_outcome(
        &mut self,
        outcome: &AttemptOutcome,
        retry_delay: Duration,
        now: DateTime<Utc>,
    ) -> Option<MessageStatus> {
        if self.status != MessageStatus::Pending {
            return None;
        }

        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.last_attempt_at = Some(now);
        self.updated_at = now;

        match outcome {
            AttemptOutcome::Sent => {
                self.status = MessageStatus::Sent;
                self.last_error = None;
            }
            AttemptOutcome::Failed(_) | AttemptOutcome::Deferred => {
                self.last_error = Some(match outcome {
                    AttemptOutcome::Failed(e) => e.clone(),
                    _ => "throttled".to_string(),
                });
                if self.attempts >= self.max_attempts {
                    self.status = MessageStatus::Failed;
                } else {
                    self.scheduled_for = now
                        .checked_add_signed(retry_delay)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                }
            }
        }
        Some(self.status)
    }
}

/// Backoff curve between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// `base * 2^(attempts-1)`, capped at `max_delay`.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let base = config_span(config.base_delay_secs);
        match config.strategy {
            RetryStrategy::Fixed => Self::fixed(base),
            RetryStrategy::Exponential => {
                Self::exponential(base, config_span(config.max_delay_secs))
            }
        }
    }

    /// Delay before the next attempt, given attempts already made (including
    /// the one that just failed).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Exponential => {
                let exp = attempts.saturating_sub(1).min(20);
                self.base_delay
                    .checked_mul(1 << exp)
                    .map_or(self.max_delay, |delay| delay.min(self.max_delay))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::minutes(5))
    }
}
