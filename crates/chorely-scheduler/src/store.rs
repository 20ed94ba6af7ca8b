//! Scheduled message and recurring rule storage.
//!
//! The dispatch loop only talks to `MessageStore`, so the in-memory map can be
//! swapped for SQLite (see `persistence`) or anything else with atomic
//! per-message updates. Recurring rules live in the engine's `RuleBook`; a
//! `RuleStore` is where they are written through so they outlive the process.

use std::collections::HashMap;

use async_trait::async_trait;
use chorely_core::error::{ChorelyError, Result};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::message::{AttemptOutcome, MessageStatus, RetryPolicy, ScheduledMessage};
use crate::rules::RecurringRule;

/// Storage contract for one-off messages.
///
/// `cancel` and `record_outcome` must be atomic per id: once a message has left
/// `pending`, neither may change it again.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: ScheduledMessage) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<ScheduledMessage>>;

    /// Cancel a pending message. `false` for unknown or terminal ids.
    async fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Apply a dispatch outcome. `None` when the id is unknown or no longer
    /// pending (a concurrent cancel wins).
    async fn record_outcome(
        &self,
        id: &str,
        outcome: &AttemptOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<MessageStatus>>;

    /// Pending, due, attempts left; earliest first.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>>;

    /// Pending messages scheduled at or before `until`; earliest first.
    async fn list_pending_before(&self, until: DateTime<Utc>) -> Result<Vec<ScheduledMessage>>;

    async fn list_all(&self) -> Result<Vec<ScheduledMessage>>;

    /// Delete terminal messages last updated before `before`.
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Message count per status.
    async fn count_by_status(&self) -> Result<HashMap<MessageStatus, usize>> {
        let mut counts = HashMap::new();
        for msg in self.list_all().await? {
            *counts.entry(msg.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

fn sort_by_due(messages: &mut [ScheduledMessage]) {
    messages.sort_by(|a, b| {
        a.scheduled_for
            .cmp(&b.scheduled_for)
            .then(a.created_at.cmp(&b.created_at))
    });
}

/// Map-backed store. The default for a single process.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<String, ScheduledMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, message: ScheduledMessage) -> Result<()> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id) {
            return Err(ChorelyError::Storage(format!(
                "message {} already exists",
                message.id
            )));
        }
        messages.insert(message.id.clone(), message);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut messages = self.messages.write().await;
        Ok(messages.get_mut(id).is_some_and(|m| m.cancel(now)))
    }

    async fn record_outcome(
        &self,
        id: &str,
        outcome: &AttemptOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<MessageStatus>> {
        let mut messages = self.messages.write().await;
        let Some(msg) = messages.get_mut(id) else {
            return Ok(None);
        };
        let delay = policy.delay_for(msg.attempts + 1);
        Ok(msg.apply_outcome(outcome, delay, now))
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let messages = self.messages.read().await;
        let mut due: Vec<_> = messages.values().filter(|m| m.is_due(now)).cloned().collect();
        sort_by_due(&mut due);
        Ok(due)
    }

    async fn list_pending_before(&self, until: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let messages = self.messages.read().await;
        let mut pending: Vec<_> = messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending && m.scheduled_for <= until)
            .cloned()
            .collect();
        sort_by_due(&mut pending);
        Ok(pending)
    }

    async fn list_all(&self) -> Result<Vec<ScheduledMessage>> {
        let mut all: Vec<_> = self.messages.read().await.values().cloned().collect();
        sort_by_due(&mut all);
        Ok(all)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut messages = self.messages.write().await;
        let len = messages.len();
        messages.retain(|_, m| !(m.status.is_terminal() && m.updated_at < before));
        Ok(len - messages.len())
    }
}

/// Durable copy of the recurring rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert or replace a rule by id.
    async fn save_rule(&self, rule: &RecurringRule) -> Result<()>;

    /// `false` when the id was unknown.
    async fn delete_rule(&self, id: &str) -> Result<bool>;

    /// Every stored rule, by creation time.
    async fn load_rules(&self) -> Result<Vec<RecurringRule>>;
}

/// Rules kept for the life of the process.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<HashMap<String, RecurringRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn save_rule(&self, rule: &RecurringRule) -> Result<()> {
        self.rules
            .write()
            .await
            .insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, id: &str) -> Result<bool> {
        Ok(self.rules.write().await.remove(id).is_some())
    }

    async fn load_rules(&self) -> Result<Vec<RecurringRule>> {
        let mut rules: Vec<_> = self.rules.read().await.values().cloned().collect();
        rules.sort_by_key(|r| r.created_at);
        Ok(rules)
    }
}
