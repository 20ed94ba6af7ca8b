//! Recurring rules: standing deliveries that fire whenever their recurrence
//! elapses.
//!
//! Firing is "fire and recompute": `last_run` and `next_run` move in the same
//! step that emits the `Firing`, so a rule can't fire twice for one due instant.
//! Rules don't backfill: a disabled rule re-enabled later starts from "now".

use std::collections::HashMap;

use chorely_core::error::{ChorelyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::DeliveryRequest;
use crate::recurrence::Recurrence;

/// A standing delivery rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecurringRule {
    pub id: String,
    pub recipient_id: String,
    pub message_type: String,
    /// Expression as registered, see `recurrence`.
    pub recurrence: String,
    pub enabled: bool,
    /// Partial delivery data; a `"channel"` string here pins the channel.
    pub template: serde_json::Value,
    pub last_run: Option<DateTime<Utc>>,
    /// Frozen while disabled.
    pub next_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub run_count: u32,
}

impl RecurringRule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run <= now
    }
}

/// One emitted occurrence of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    pub rule_id: String,
    pub recipient_id: String,
    pub message_type: String,
    pub template: serde_json::Value,
    /// The `next_run` that made this firing due.
    pub due_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

impl Firing {
    /// Build the delivery request, merging live context into the template
    /// under `"context"`.
    pub fn into_request(self, context: serde_json::Value) -> DeliveryRequest {
        let channel = self
            .template
            .get("channel")
            .and_then(|c| c.as_str())
            .map(str::to_string);

        let payload = match self.template {
            serde_json::Value::Object(mut fields) => {
                fields.insert("context".to_string(), context);
                serde_json::Value::Object(fields)
            }
            serde_json::Value::Null => serde_json::json!({ "context": context }),
            other => serde_json::json!({ "template": other, "context": context }),
        };

        DeliveryRequest {
            recipient_id: self.recipient_id,
            channel,
            message_type: self.message_type,
            payload,
        }
    }
}

struct RuleEntry {
    rule: RecurringRule,
    schedule: Recurrence,
}

/// All registered rules.
#[derive(Default)]
pub struct RuleBook {
    rules: HashMap<String, RuleEntry>,
}

impl RuleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an enabled rule with `next_run` computed from `now`.
    pub fn register(
        &mut self,
        recipient_id: &str,
        message_type: &str,
        expression: &str,
        template: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let schedule = Recurrence::parse(expression)?;
        let next_run = schedule.next_after(now).ok_or_else(|| {
            ChorelyError::invalid_recurrence(expression, "has no future trigger")
        })?;

        let id = format!("rule-{}", uuid::Uuid::new_v4().simple());
        let rule = RecurringRule {
            id: id.clone(),
            recipient_id: recipient_id.to_string(),
            message_type: message_type.to_string(),
            recurrence: expression.trim().to_string(),
            enabled: true,
            template,
            last_run: None,
            next_run,
            created_at: now,
            run_count: 0,
        };
        tracing::info!(
            "📅 Rule registered: {} '{}' for {} (next {})",
            id,
            rule.recurrence,
            recipient_id,
            next_run
        );
        self.rules.insert(id.clone(), RuleEntry { rule, schedule });
        Ok(id)
    }

    /// Put back a rule loaded from storage, as it was saved. A rule whose
    /// `next_run` passed while the process was down fires once on the next
    /// tick; missed occurrences are not replayed.
    pub fn restore(&mut self, rule: RecurringRule) -> Result<()> {
        let schedule = Recurrence::parse(&rule.recurrence)?;
        self.rules
            .insert(rule.id.clone(), RuleEntry { rule, schedule });
        Ok(())
    }

    /// Enable or disable a rule. `false` for unknown ids.
    pub fn toggle(&mut self, id: &str, enabled: bool, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.rules.get_mut(id) else {
            return false;
        };
        if enabled && !entry.rule.enabled {
            match entry.schedule.next_after(now) {
                Some(next) => entry.rule.next_run = next,
                None => {
                    tracing::warn!("⚠️ Rule {} has no future trigger; leaving disabled", id);
                    return true;
                }
            }
        }
        entry.rule.enabled = enabled;
        tracing::info!(
            "Rule {} {} (next {})",
            id,
            if enabled { "enabled" } else { "disabled" },
            entry.rule.next_run
        );
        true
    }

    /// Enabled rules with `next_run <= now`, earliest first.
    pub fn list_due(&self, now: DateTime<Utc>) -> Vec<RecurringRule> {
        let mut due: Vec<_> = self
            .rules
            .values()
            .filter(|e| e.rule.is_due(now))
            .map(|e| e.rule.clone())
            .collect();
        due.sort_by_key(|r| r.next_run);
        due
    }

    /// Fire one rule and recompute its `next_run` from `now`.
    /// `None` for unknown or disabled rules.
    pub fn fire(&mut self, id: &str, now: DateTime<Utc>) -> Option<Firing> {
        let entry = self.rules.get_mut(id)?;
        if !entry.rule.enabled {
            return None;
        }

        let firing = Firing {
            rule_id: entry.rule.id.clone(),
            recipient_id: entry.rule.recipient_id.clone(),
            message_type: entry.rule.message_type.clone(),
            template: entry.rule.template.clone(),
            due_at: entry.rule.next_run,
            fired_at: now,
        };

        entry.rule.last_run = Some(now);
        entry.rule.run_count += 1;
        match entry.schedule.next_after(now) {
            Some(next) => entry.rule.next_run = next,
            None => {
                tracing::warn!("⚠️ Rule {} has no future trigger; disabling", id);
                entry.rule.enabled = false;
            }
        }
        Some(firing)
    }

    /// Fire every due rule in one pass.
    pub fn fire_due(&mut self, now: DateTime<Utc>) -> Vec<Firing> {
        self.list_due(now)
            .iter()
            .filter_map(|rule| self.fire(&rule.id, now))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<RecurringRule> {
        self.rules.get(id).map(|e| e.rule.clone())
    }

    /// Delete a rule.
    pub fn remove(&mut self, id: &str) -> bool {
        self.rules.remove(id).is_some()
    }

    /// All rules, by creation time.
    pub fn list(&self) -> Vec<RecurringRule> {
        let mut rules: Vec<_> = self.rules.values().map(|e| e.rule.clone()).collect();
        rules.sort_by_key(|r| r.created_at);
        rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.values().filter(|e| e.rule.enabled).count()
    }
}
