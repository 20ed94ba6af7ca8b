//! Scheduler Engine: the dispatch loop and the producer API.
//!
//! One `SchedulerEngine` value is the single scheduling authority. Producers
//! (`schedule_message`, `schedule_recurring`, `cancel`, `toggle`) may run at any
//! time; `tick` holds the tick lock for its whole duration so ticks never
//! overlap. The background loop (`start`) is a tokio interval that only calls
//! `tick`, so correctness doesn't depend on the cadence.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chorely_core::config::{ChorelyConfig, MAX_DURATION_SECS, SchedulerConfig};
use chorely_core::error::{ChorelyError, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::context::{ContextResolver, NoContext};
use crate::gateway::{DeliveryGateway, DeliveryReceipt, LogGateway, gateway_from_config};
use crate::history::{DeliveryLog, DeliveryRecord, DeliveryResult, DeliverySource};
use crate::message::{
    AttemptOutcome, DeliveryRequest, MessageStatus, RetryPolicy, ScheduledMessage, config_span,
};
use crate::persistence::SqliteMessageStore;
use crate::rules::{RecurringRule, RuleBook};
use crate::store::{InMemoryMessageStore, InMemoryRuleStore, MessageStore, RuleStore};
use crate::throttle::{ThrottleLedger, ThrottleLimits};

/// Tunables of the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub default_max_attempts: u32,
    pub retry: RetryPolicy,
    /// How far a throttled one-off message is pushed back.
    pub throttle_deferral: Duration,
    pub gateway_timeout: StdDuration,
    pub max_concurrent_sends: usize,
    /// Terminal messages older than this are purged. `None` keeps them.
    pub retention: Option<Duration>,
}

impl From<&SchedulerConfig> for DispatchSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            default_max_attempts: config.default_max_attempts,
            retry: RetryPolicy::from_config(&config.retry),
            throttle_deferral: config_span(config.throttle_deferral_secs),
            gateway_timeout: StdDuration::from_secs(
                config.gateway_timeout_secs.min(MAX_DURATION_SECS),
            ),
            max_concurrent_sends: config.max_concurrent_sends.max(1),
            retention: config.retention().and_then(|r| Duration::from_std(r).ok()),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due_messages: usize,
    pub fired_rules: usize,
    pub sent: usize,
    pub failed: usize,
    pub deferred: usize,
    pub dropped: usize,
    pub swept_windows: usize,
    pub purged_messages: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.due_messages == 0
            && self.fired_rules == 0
            && self.swept_windows == 0
            && self.purged_messages == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduledStats {
    pub total: usize,
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecurringStats {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    /// Live (non-stale) windows.
    pub active: usize,
    pub by_channel: BTreeMap<String, usize>,
}

/// Snapshot for dashboards and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub scheduled: ScheduledStats,
    pub recurring: RecurringStats,
    pub throttles: ThrottleStats,
}

/// A delivery about to go through the throttle gate.
struct Candidate {
    source: DeliverySource,
    request: DeliveryRequest,
}

/// The scheduler engine. Owns the rules, the throttle ledger and the loop.
pub struct SchedulerEngine {
    store: Arc<dyn MessageStore>,
    rule_store: Arc<dyn RuleStore>,
    gateway: Arc<dyn DeliveryGateway>,
    context: Arc<dyn ContextResolver>,
    clock: Arc<dyn Clock>,
    rules: Mutex<RuleBook>,
    throttle: Mutex<ThrottleLedger>,
    history: Mutex<DeliveryLog>,
    settings: DispatchSettings,
    tick_lock: Mutex<()>,
}

/// Builder for [`SchedulerEngine`]. Anything not set gets a development default:
/// in-memory stores, `LogGateway`, no context, wall clock.
///
/// Rules already in a persistent rule store are only picked up by
/// [`SchedulerEngine::load_rules`].
#[derive(Default)]
pub struct SchedulerEngineBuilder {
    store: Option<Arc<dyn MessageStore>>,
    rule_store: Option<Arc<dyn RuleStore>>,
    gateway: Option<Arc<dyn DeliveryGateway>>,
    context: Option<Arc<dyn ContextResolver>>,
    clock: Option<Arc<dyn Clock>>,
    limits: ThrottleLimits,
    settings: DispatchSettings,
}

impl SchedulerEngineBuilder {
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn rule_store(mut self, rule_store: Arc<dyn RuleStore>) -> Self {
        self.rule_store = Some(rule_store);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn DeliveryGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn context(mut self, context: Arc<dyn ContextResolver>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn throttle_limits(mut self, limits: ThrottleLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.settings.retry = retry;
        self
    }

    pub fn build(self) -> SchedulerEngine {
        SchedulerEngine {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryMessageStore::new())),
            rule_store: self
                .rule_store
                .unwrap_or_else(|| Arc::new(InMemoryRuleStore::new())),
            gateway: self
                .gateway
                .unwrap_or_else(|| Arc::new(LogGateway::default())),
            context: self.context.unwrap_or_else(|| Arc::new(NoContext)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            rules: Mutex::new(RuleBook::new()),
            throttle: Mutex::new(ThrottleLedger::new(self.limits)),
            history: Mutex::new(DeliveryLog::new()),
            settings: self.settings,
            tick_lock: Mutex::new(()),
        }
    }
}

impl SchedulerEngine {
    pub fn builder() -> SchedulerEngineBuilder {
        SchedulerEngineBuilder::default()
    }

    /// Build an engine from the loaded configuration, with any stored rules
    /// already loaded.
    pub async fn from_config(config: &ChorelyConfig) -> Result<Self> {
        let (store, rule_store): (Arc<dyn MessageStore>, Arc<dyn RuleStore>) =
            match config.storage.backend.as_str() {
                "memory" => (
                    Arc::new(InMemoryMessageStore::new()),
                    Arc::new(InMemoryRuleStore::new()),
                ),
                "sqlite" => {
                    let db = Arc::new(SqliteMessageStore::open(
                        &config.storage.expanded_sqlite_path(),
                    )?);
                    (db.clone(), db)
                }
                other => {
                    return Err(ChorelyError::Config(format!(
                        "unknown storage backend '{other}'"
                    )));
                }
            };

        let engine = Self::builder()
            .store(store)
            .rule_store(rule_store)
            .gateway(gateway_from_config(&config.gateway)?)
            .throttle_limits(ThrottleLimits::from(&config.throttle))
            .settings(DispatchSettings::from(&config.scheduler))
            .build();
        engine.load_rules().await?;
        Ok(engine)
    }

    /// Load the rule store into the rule book. Rules whose expression no
    /// longer parses are skipped with a warning.
    pub async fn load_rules(&self) -> Result<usize> {
        let stored = self.rule_store.load_rules().await?;
        let mut rules = self.rules.lock().await;
        let mut loaded = 0;
        for rule in stored {
            let id = rule.id.clone();
            match rules.restore(rule) {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!("⚠️ Skipping stored rule {}: {e}", id),
            }
        }
        if loaded > 0 {
            tracing::info!("📅 Loaded {} recurring rule(s)", loaded);
        }
        Ok(loaded)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    // ── Producer API ──────────────────────────────────────────

    /// Schedule a one-off delivery. Never blocks on delivery.
    pub async fn schedule_message(
        &self,
        request: DeliveryRequest,
        schedule_at: DateTime<Utc>,
        max_attempts: Option<u32>,
    ) -> Result<String> {
        let max_attempts = max_attempts.unwrap_or(self.settings.default_max_attempts);
        if max_attempts == 0 {
            return Err(ChorelyError::Validation(
                "max_attempts must be at least 1".into(),
            ));
        }
        if request.recipient_id.trim().is_empty() {
            return Err(ChorelyError::Validation("recipient_id is empty".into()));
        }

        let message = ScheduledMessage::new(request, schedule_at, max_attempts, self.now());
        let id = message.id.clone();
        tracing::info!(
            "📅 Message scheduled: {} '{}' for {} at {}",
            id,
            message.message_type,
            message.recipient_id,
            schedule_at
        );
        self.store.insert(message).await?;
        Ok(id)
    }

    /// Cancel a pending message. `false` for unknown or already finished ids.
    pub async fn cancel_scheduled_message(&self, id: &str) -> Result<bool> {
        let cancelled = self.store.cancel(id, self.now()).await?;
        if cancelled {
            tracing::info!("🚫 Message cancelled: {}", id);
        }
        Ok(cancelled)
    }

    /// Register a recurring rule. Invalid expressions are rejected here.
    pub async fn schedule_recurring(
        &self,
        recipient_id: &str,
        message_type: &str,
        recurrence: &str,
        template: serde_json::Value,
    ) -> Result<String> {
        if recipient_id.trim().is_empty() {
            return Err(ChorelyError::Validation("recipient_id is empty".into()));
        }
        let now = self.now();
        let mut rules = self.rules.lock().await;
        let id = rules.register(recipient_id, message_type, recurrence, template, now)?;
        if let Some(rule) = rules.get(&id)
            && let Err(e) = self.rule_store.save_rule(&rule).await
        {
            rules.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Enable or disable a rule. `false` for unknown ids. A failure to store
    /// the change is logged; the running engine keeps it either way.
    pub async fn toggle_recurring_rule(&self, id: &str, enabled: bool) -> bool {
        let now = self.now();
        let mut rules = self.rules.lock().await;
        if !rules.toggle(id, enabled, now) {
            return false;
        }
        if let Some(rule) = rules.get(id) {
            self.persist_rule(&rule).await;
        }
        true
    }

    pub async fn remove_recurring_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.lock().await;
        let removed = rules.remove(id);
        if removed {
            if let Err(e) = self.rule_store.delete_rule(id).await {
                tracing::warn!("⚠️ Failed to delete stored rule {}: {e}", id);
            }
            tracing::info!("Rule removed: {}", id);
        }
        removed
    }

    async fn persist_rule(&self, rule: &RecurringRule) {
        if let Err(e) = self.rule_store.save_rule(rule).await {
            tracing::warn!("⚠️ Failed to store rule {}: {e}", rule.id);
        }
    }

    /// Pending messages due within the next `within_hours`, earliest first.
    /// Windows reaching past the year 9999 are cut off there.
    pub async fn get_upcoming_messages(&self, within_hours: u64) -> Result<Vec<ScheduledMessage>> {
        let horizon = latest_listable();
        let until = i64::try_from(within_hours)
            .ok()
            .and_then(Duration::try_hours)
            .and_then(|window| self.now().checked_add_signed(window))
            .map_or(horizon, |until| until.min(horizon));
        self.store.list_pending_before(until).await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        self.store.get(id).await
    }

    pub async fn list_rules(&self) -> Vec<RecurringRule> {
        self.rules.lock().await.list()
    }

    pub async fn get_rule(&self, id: &str) -> Option<RecurringRule> {
        self.rules.lock().await.get(id)
    }

    /// Recent dispatch decisions, oldest first.
    pub async fn recent_deliveries(&self) -> Vec<DeliveryRecord> {
        self.history.lock().await.recent()
    }

    pub async fn get_stats(&self) -> Result<SchedulerStats> {
        let counts = self.store.count_by_status().await?;
        let count = |status: MessageStatus| counts.get(&status).copied().unwrap_or(0);
        let scheduled = ScheduledStats {
            total: counts.values().sum(),
            pending: count(MessageStatus::Pending),
            sent: count(MessageStatus::Sent),
            failed: count(MessageStatus::Failed),
            cancelled: count(MessageStatus::Cancelled),
        };

        let recurring = {
            let rules = self.rules.lock().await;
            let enabled = rules.enabled_count();
            RecurringStats {
                total: rules.len(),
                enabled,
                disabled: rules.len() - enabled,
            }
        };

        let now = self.now();
        let throttles = {
            let ledger = self.throttle.lock().await;
            ThrottleStats {
                active: ledger.active(now),
                by_channel: ledger.active_by_channel(now),
            }
        };

        Ok(SchedulerStats {
            scheduled,
            recurring,
            throttles,
        })
    }

    // ── Dispatch ──────────────────────────────────────────────

    /// Run one dispatch pass at `now`.
    ///
    /// Only storage failures while listing due messages abort the tick; every
    /// per-item problem is logged and the tick moves on.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let _guard = self.tick_lock.lock().await;
        let mut report = TickReport::default();

        let due = self.store.list_due(now).await?;
        let firings = {
            let mut rules = self.rules.lock().await;
            let firings = rules.fire_due(now);
            for firing in &firings {
                if let Some(rule) = rules.get(&firing.rule_id) {
                    self.persist_rule(&rule).await;
                }
            }
            firings
        };
        report.due_messages = due.len();
        report.fired_rules = firings.len();

        let mut candidates: Vec<Candidate> = due
            .into_iter()
            .map(|msg| Candidate {
                source: DeliverySource::Message(msg.id),
                request: msg.payload,
            })
            .collect();

        for firing in firings {
            match self
                .context
                .resolve(&firing.recipient_id, &firing.message_type, now)
                .await
            {
                Ok(context) => {
                    tracing::debug!("🔔 Rule fired: {} for {}", firing.rule_id, firing.recipient_id);
                    candidates.push(Candidate {
                        source: DeliverySource::Rule(firing.rule_id.clone()),
                        request: firing.into_request(context),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Context lookup failed for rule {}: {e}; skipping this occurrence",
                        firing.rule_id
                    );
                    report.dropped += 1;
                    self.remember(DeliveryRecord {
                        source: DeliverySource::Rule(firing.rule_id),
                        recipient_id: firing.recipient_id,
                        message_type: firing.message_type,
                        channel: None,
                        result: DeliveryResult::Dropped,
                        error: Some(e.to_string()),
                        timestamp: now,
                    })
                    .await;
                }
            }
        }

        // Throttle gate. Serial, and the budget is charged before the send so
        // the concurrent sends below can't overrun it. While a recipient's
        // channel is unknown only one of their deliveries goes out per round;
        // its receipt names the channel that gates the rest.
        let mut pending = candidates;
        while !pending.is_empty() {
            let mut sends = Vec::with_capacity(pending.len());
            let mut waiting = Vec::new();
            let mut learning = HashSet::new();

            for candidate in pending {
                match self.channel_for(&candidate.request).await {
                    Some(channel) => {
                        let mut ledger = self.throttle.lock().await;
                        if ledger.is_throttled(&candidate.request.recipient_id, &channel, now) {
                            drop(ledger);
                            self.hold_back(candidate, &channel, now, &mut report).await;
                            continue;
                        }
                        ledger.record_send(&candidate.request.recipient_id, &channel, now);
                        sends.push((candidate, Some(channel)));
                    }
                    None if learning.insert(candidate.request.recipient_id.clone()) => {
                        sends.push((candidate, None));
                    }
                    None => waiting.push(candidate),
                }
            }

            self.send_all(sends, now, &mut report).await;
            pending = waiting;
        }

        report.swept_windows = self.throttle.lock().await.sweep_expired(now);

        if let Some(retention) = self.settings.retention {
            if let Some(cutoff) = now.checked_sub_signed(retention) {
                match self.store.purge_terminal(cutoff).await {
                    Ok(purged) => report.purged_messages = purged,
                    Err(e) => tracing::warn!("⚠️ Failed to purge old messages: {e}"),
                }
            }
        }

        Ok(report)
    }

    /// Channel a request will go out on: its own, the gateway's preference,
    /// or the one the recipient was last reached on.
    async fn channel_for(&self, request: &DeliveryRequest) -> Option<String> {
        if let Some(channel) = &request.channel {
            return Some(channel.clone());
        }
        if let Some(channel) = self.gateway.preferred_channel(&request.recipient_id).await {
            return Some(channel);
        }
        self.throttle
            .lock()
            .await
            .last_channel(&request.recipient_id)
            .map(str::to_string)
    }

    /// Send a batch concurrently and settle every result.
    async fn send_all(
        &self,
        sends: Vec<(Candidate, Option<String>)>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        if sends.is_empty() {
            return;
        }
        let gateway = &self.gateway;
        let timeout = self.settings.gateway_timeout;
        let results: Vec<_> = futures::stream::iter(sends.into_iter().map(
            |(candidate, charged)| async move {
                let result = send_guarded(gateway.as_ref(), &candidate.request, timeout).await;
                (candidate, charged, result)
            },
        ))
        .buffer_unordered(self.settings.max_concurrent_sends.max(1))
        .collect()
        .await;

        for (candidate, charged, result) in results {
            self.settle(candidate, charged, result, now, report).await;
        }
    }

    /// Throttled: defer a one-off message, drop a recurring firing.
    async fn hold_back(
        &self,
        candidate: Candidate,
        channel: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let result = match &candidate.source {
            DeliverySource::Message(id) => {
                let deferral = RetryPolicy::fixed(self.settings.throttle_deferral);
                match self
                    .store
                    .record_outcome(id, &AttemptOutcome::Deferred, &deferral, now)
                    .await
                {
                    Ok(Some(MessageStatus::Failed)) => {
                        tracing::warn!("❌ Message {} exhausted its attempts while throttled", id);
                    }
                    Ok(_) => {
                        tracing::debug!("⏳ Message {} throttled on {}; deferred", id, channel);
                    }
                    Err(e) => tracing::warn!("⚠️ Failed to defer message {}: {e}", id),
                }
                report.deferred += 1;
                DeliveryResult::Deferred
            }
            DeliverySource::Rule(id) => {
                tracing::info!("⏳ Rule {} throttled on {}; occurrence dropped", id, channel);
                report.dropped += 1;
                DeliveryResult::Dropped
            }
        };

        self.remember(DeliveryRecord {
            source: candidate.source,
            recipient_id: candidate.request.recipient_id,
            message_type: candidate.request.message_type,
            channel: Some(channel.to_string()),
            result,
            error: Some("throttled".into()),
            timestamp: now,
        })
        .await;
    }

    /// Record the outcome of one gateway call.
    async fn settle(
        &self,
        candidate: Candidate,
        charged: Option<String>,
        result: std::result::Result<DeliveryReceipt, String>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let (reported, error) = match result {
            Ok(receipt) if receipt.success => (Some(receipt.channel), None),
            Ok(receipt) => {
                let error = receipt
                    .error
                    .unwrap_or_else(|| "gateway reported failure".to_string());
                (Some(receipt.channel), Some(error))
            }
            Err(error) => (None, Some(error)),
        };

        if let Some(channel) = reported.as_deref() {
            let mut ledger = self.throttle.lock().await;
            if error.is_none() && charged.as_deref() != Some(channel) {
                // The gateway picked a different channel than the one charged.
                ledger.record_send(&candidate.request.recipient_id, channel, now);
            } else {
                ledger.remember_channel(&candidate.request.recipient_id, channel);
            }
        }

        if let DeliverySource::Message(id) = &candidate.source {
            let outcome = match &error {
                None => AttemptOutcome::Sent,
                Some(e) => AttemptOutcome::Failed(e.clone()),
            };
            match self
                .store
                .record_outcome(id, &outcome, &self.settings.retry, now)
                .await
            {
                Ok(Some(MessageStatus::Failed)) => {
                    tracing::warn!("❌ Message {} failed permanently", id);
                }
                Ok(Some(status)) => tracing::debug!("Message {} → {}", id, status),
                Ok(None) => {
                    tracing::debug!("Message {} left pending during send; outcome ignored", id);
                }
                Err(e) => tracing::warn!("⚠️ Failed to record outcome for {}: {e}", id),
            }
        }

        let result = match &error {
            None => {
                report.sent += 1;
                DeliveryResult::Sent
            }
            Some(e) => {
                tracing::warn!(
                    "⚠️ Delivery to {} failed: {}",
                    candidate.request.recipient_id,
                    e
                );
                report.failed += 1;
                DeliveryResult::Failed
            }
        };

        self.remember(DeliveryRecord {
            source: candidate.source,
            recipient_id: candidate.request.recipient_id,
            message_type: candidate.request.message_type,
            channel: reported.or(charged),
            result,
            error,
            timestamp: now,
        })
        .await;
    }

    async fn remember(&self, record: DeliveryRecord) {
        self.history.lock().await.record(record);
    }

    // ── Background loop ───────────────────────────────────────

    /// Spawn the dispatch loop on the current tokio runtime.
    pub fn start(self: &Arc<Self>, interval: StdDuration) -> DispatchHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);

        let task = tokio::spawn(async move {
            tracing::info!("⏰ Dispatch loop started (tick every {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = engine.clock.now();
                        match engine.tick(now).await {
                            Ok(report) if !report.is_idle() => tracing::info!(
                                "📣 Tick: {} sent, {} failed, {} deferred, {} dropped",
                                report.sent,
                                report.failed,
                                report.deferred,
                                report.dropped
                            ),
                            Ok(_) => {}
                            Err(e) => tracing::warn!("⚠️ Tick failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::info!("Dispatch loop stopped");
        });

        DispatchHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running dispatch loop.
pub struct DispatchHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatchHandle {
    /// Stop ticking. An in-flight tick runs to completion first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("⚠️ Dispatch loop ended abnormally: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Last instant stored timestamps still sort correctly as RFC 3339 text.
fn latest_listable() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|day| day.and_hms_opt(23, 59, 59))
        .map_or(DateTime::<Utc>::MAX_UTC, |t| t.and_utc())
}

/// Call the gateway with a timeout, turning errors and panics into `Err`.
async fn send_guarded(
    gateway: &dyn DeliveryGateway,
    request: &DeliveryRequest,
    timeout: StdDuration,
) -> std::result::Result<DeliveryReceipt, String> {
    let call = AssertUnwindSafe(gateway.send(request)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(format!("{} timed out after {:?}", gateway.name(), timeout)),
        Ok(Err(_)) => Err(format!("{} panicked", gateway.name())),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Ok(Ok(receipt))) => Ok(receipt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::ContextFn;
    use async_trait::async_trait;
    use chrono::TimeZone;

    #[derive(Clone)]
    enum Script {
        Succeed,
        Fail,
        Error,
        Panic,
        Hang(StdDuration),
        ReportChannel(&'static str),
    }

    struct ScriptedGateway {
        script: Script,
        preferred: Option<String>,
        sent: std::sync::Mutex<Vec<DeliveryRequest>>,
    }

    impl ScriptedGateway {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                preferred: None,
                sent: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn preferring(script: Script, channel: &str) -> Arc<Self> {
            Arc::new(Self {
                script,
                preferred: Some(channel.to_string()),
                sent: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<DeliveryRequest> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryGateway for ScriptedGateway {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn preferred_channel(&self, _recipient_id: &str) -> Option<String> {
            self.preferred.clone()
        }

        async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt> {
            self.sent.lock().unwrap().push(request.clone());
            let channel = request.channel.clone().unwrap_or_else(|| "test".into());
            match &self.script {
                Script::Succeed => Ok(DeliveryReceipt::sent(&channel)),
                Script::Fail => Ok(DeliveryReceipt::failed(&channel, "recipient unreachable")),
                Script::Error => Err(ChorelyError::Gateway("connection reset".into())),
                Script::Panic => panic!("gateway bug"),
                Script::Hang(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(DeliveryReceipt::sent(&channel))
                }
                Script::ReportChannel(ch) => Ok(DeliveryReceipt::sent(ch)),
            }
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn engine_with(gateway: Arc<ScriptedGateway>, clock: Arc<ManualClock>) -> SchedulerEngine {
        SchedulerEngine::builder()
            .gateway(gateway)
            .clock(clock)
            .build()
    }

    fn sms(recipient: &str) -> DeliveryRequest {
        DeliveryRequest::new(recipient, "reminder", serde_json::json!({"task": "dishes"})).via("sms")
    }

    #[tokio::test]
    async fn test_send_marks_sent() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::Succeed);
        let engine = engine_with(gateway.clone(), clock.clone());

        let id = engine.schedule_message(sms("kid"), t0(), None).await.unwrap();
        let report = engine.tick(t0()).await.unwrap();
        assert_eq!(report.sent, 1);

        let msg = engine.get_message(&id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.attempts, 1);
        assert_eq!(gateway.sent().len(), 1);
        assert_eq!(engine.recent_deliveries().await[0].result, DeliveryResult::Sent);

        // Nothing left to send.
        let report = engine.tick(t0() + Duration::minutes(1)).await.unwrap();
        assert_eq!(report.due_messages, 0);
        assert_eq!(gateway.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_gateway_exhausts_attempts() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::Fail);
        let engine = engine_with(gateway.clone(), clock.clone());

        let at = t0() + Duration::seconds(1);
        let id = engine.schedule_message(sms("kid"), at, Some(2)).await.unwrap();

        engine.tick(at).await.unwrap();
        let msg = engine.get_message(&id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.attempts, 1);
        assert_eq!(msg.scheduled_for, at + Duration::minutes(5));
        assert_eq!(msg.last_error.as_deref(), Some("recipient unreachable"));

        // Too early for the retry.
        let report = engine.tick(at + Duration::minutes(4)).await.unwrap();
        assert_eq!(report.due_messages, 0);

        engine.tick(at + Duration::minutes(5)).await.unwrap();
        let msg = engine.get_message(&id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.attempts, 2);
        assert_eq!(gateway.sent().len(), 2);

        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.scheduled.failed, 1);
    }

    #[tokio::test]
    async fn test_gateway_error_and_panic_are_failures() {
        for script in [Script::Error, Script::Panic] {
            let clock = Arc::new(ManualClock::new(t0()));
            let gateway = ScriptedGateway::new(script);
            let engine = engine_with(gateway, clock);

            let first = engine.schedule_message(sms("kid"), t0(), None).await.unwrap();
            let second = engine.schedule_message(sms("mom"), t0(), None).await.unwrap();
            let report = engine.tick(t0()).await.unwrap();
            assert_eq!(report.failed, 2);

            for id in [first, second] {
                let msg = engine.get_message(&id).await.unwrap().unwrap();
                assert_eq!(msg.status, MessageStatus::Pending);
                assert_eq!(msg.attempts, 1);
                assert!(msg.last_error.is_some());
            }
        }
    }

    #[tokio::test]
    async fn test_gateway_timeout_is_failure() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::Hang(StdDuration::from_secs(5)));
        let settings = DispatchSettings {
            gateway_timeout: StdDuration::from_millis(50),
            ..DispatchSettings::default()
        };
        let engine = SchedulerEngine::builder()
            .gateway(gateway)
            .clock(clock)
            .settings(settings)
            .build();

        let id = engine.schedule_message(sms("kid"), t0(), None).await.unwrap();
        let report = engine.tick(t0()).await.unwrap();
        assert_eq!(report.failed, 1);
        let msg = engine.get_message(&id).await.unwrap().unwrap();
        assert!(msg.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_throttle_defers_one_off_messages() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::Succeed);
        let engine = SchedulerEngine::builder()
            .gateway(gateway.clone())
            .clock(clock)
            .throttle_limits(ThrottleLimits::default().with_channel("sms", 2))
            .build();

        let mut ids = Vec::new();
        for n in 0..3 {
            let at = t0() + Duration::seconds(n);
            ids.push(engine.schedule_message(sms("kid"), at, None).await.unwrap());
        }

        let now = t0() + Duration::seconds(5);
        let report = engine.tick(now).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(gateway.sent().len(), 2);

        let third = engine.get_message(&ids[2]).await.unwrap().unwrap();
        assert_eq!(third.status, MessageStatus::Pending);
        assert_eq!(third.attempts, 1);
        assert_eq!(third.scheduled_for, now + Duration::seconds(60));

        let stats = engine.get_stats().await.unwrap();
        assert!(stats.throttles.active >= 1);
        assert_eq!(stats.throttles.by_channel.get("sms"), Some(&1));

        // Still inside the window: deferred again.
        let report = engine.tick(now + Duration::seconds(60)).await.unwrap();
        assert_eq!(report.deferred, 1);

        // Window rolled over.
        let later = t0() + Duration::hours(1) + Duration::minutes(1);
        let report = engine.tick(later).await.unwrap();
        assert_eq!(report.sent, 1);
        let third = engine.get_message(&ids[2]).await.unwrap().unwrap();
        assert_eq!(third.status, MessageStatus::Sent);
        assert_eq!(third.attempts, 3);
    }

    #[tokio::test]
    async fn test_throttle_drops_recurring_firing() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::Succeed);
        let engine = SchedulerEngine::builder()
            .gateway(gateway.clone())
            .clock(clock.clone())
            .throttle_limits(ThrottleLimits::default().with_channel("sms", 2))
            .build();

        for _ in 0..2 {
            engine.schedule_message(sms("kid"), t0(), None).await.unwrap();
        }
        let rule = engine
            .schedule_recurring("kid", "digest", "every 1m", serde_json::json!({"channel": "sms"}))
            .await
            .unwrap();

        let now = t0() + Duration::minutes(1);
        let report = engine.tick(now).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(gateway.sent().len(), 2);

        let rule = engine.get_rule(&rule).await.unwrap();
        assert_eq!(rule.run_count, 1);
        assert_eq!(rule.next_run, now + Duration::minutes(1));

        let last = engine.recent_deliveries().await.pop().unwrap();
        assert_eq!(last.result, DeliveryResult::Dropped);
    }

    #[tokio::test]
    async fn test_cancel_before_tick() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::Succeed);
        let engine = engine_with(gateway.clone(), clock);

        let id = engine.schedule_message(sms("kid"), t0(), None).await.unwrap();
        assert!(engine.cancel_scheduled_message(&id).await.unwrap());
        assert!(!engine.cancel_scheduled_message(&id).await.unwrap());
        assert!(!engine.cancel_scheduled_message("msg-missing").await.unwrap());

        let report = engine.tick(t0()).await.unwrap();
        assert_eq!(report.due_messages, 0);
        assert!(gateway.sent().is_empty());
        let msg = engine.get_message(&id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_send_wins() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::Hang(StdDuration::from_millis(200)));
        let engine = Arc::new(engine_with(gateway, clock));

        let id = engine.schedule_message(sms("kid"), t0(), None).await.unwrap();
        let ticking = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.tick(t0()).await })
        };
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(engine.cancel_scheduled_message(&id).await.unwrap());

        let report = ticking.await.unwrap().unwrap();
        assert_eq!(report.sent, 1);
        let msg = engine.get_message(&id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Cancelled);
        assert_eq!(msg.attempts, 0);
    }

    #[tokio::test]
    async fn test_rule_firing_carries_live_context() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::Succeed);
        let context = ContextFn(|recipient: &str, _kind: &str, _now: DateTime<Utc>| {
            Ok(serde_json::json!({"recipient": recipient, "open_tasks": 2}))
        });
        let engine = SchedulerEngine::builder()
            .gateway(gateway.clone())
            .clock(clock.clone())
            .context(Arc::new(context))
            .build();

        let id = engine
            .schedule_recurring("kid", "digest", "daily 09:30", serde_json::json!({"title": "Today"}))
            .await
            .unwrap();
        let rule = engine.get_rule(&id).await.unwrap();
        assert_eq!(rule.next_run, t0() + Duration::minutes(30));

        let now = clock.advance(Duration::minutes(30));
        let report = engine.tick(now).await.unwrap();
        assert_eq!(report.fired_rules, 1);
        assert_eq!(report.sent, 1);

        let sent = gateway.sent();
        assert_eq!(sent[0].message_type, "digest");
        assert_eq!(sent[0].payload["title"], "Today");
        assert_eq!(sent[0].payload["context"]["open_tasks"], 2);

        let rule = engine.get_rule(&id).await.unwrap();
        assert_eq!(rule.last_run, Some(now));
        assert_eq!(rule.next_run, now + Duration::days(1));
    }

    #[tokio::test]
    async fn test_context_failure_skips_occurrence() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::Succeed);
        let context = ContextFn(|_: &str, _: &str, _: DateTime<Utc>| {
            Err(ChorelyError::Storage("tasks db offline".into()))
        });
        let engine = SchedulerEngine::builder()
            .gateway(gateway.clone())
            .clock(clock)
            .context(Arc::new(context))
            .build();

        let id = engine
            .schedule_recurring("kid", "digest", "every 1h", serde_json::json!({}))
            .await
            .unwrap();
        let now = t0() + Duration::hours(1);
        let report = engine.tick(now).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(gateway.sent().is_empty());
        assert_eq!(engine.get_rule(&id).await.unwrap().next_run, now + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_reported_channel_is_charged() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::ReportChannel("whatsapp"));
        let engine = engine_with(gateway, clock);

        let request = DeliveryRequest::new("kid", "reminder", serde_json::json!({}));
        engine.schedule_message(request, t0(), None).await.unwrap();
        engine.tick(t0()).await.unwrap();

        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.throttles.by_channel.get("whatsapp"), Some(&1));
        let record = engine.recent_deliveries().await.pop().unwrap();
        assert_eq!(record.channel.as_deref(), Some("whatsapp"));
    }

    #[tokio::test]
    async fn test_preferred_channel_gates_before_send() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::preferring(Script::Succeed, "telegram");
        let engine = SchedulerEngine::builder()
            .gateway(gateway.clone())
            .clock(clock)
            .throttle_limits(ThrottleLimits::default().with_channel("telegram", 0))
            .build();

        let request = DeliveryRequest::new("kid", "reminder", serde_json::json!({}));
        engine.schedule_message(request, t0(), None).await.unwrap();
        let report = engine.tick(t0()).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert!(gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_channelless_requests_throttled_on_learned_channel() {
        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = ScriptedGateway::new(Script::ReportChannel("sms"));
        let engine = SchedulerEngine::builder()
            .gateway(gateway.clone())
            .clock(clock)
            .throttle_limits(ThrottleLimits::default().with_channel("sms", 2))
            .build();

        for _ in 0..5 {
            let request = DeliveryRequest::new("kid", "reminder", serde_json::json!({}));
            engine.schedule_message(request, t0(), None).await.unwrap();
        }
        let report = engine.tick(t0()).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.deferred, 3);
        assert_eq!(gateway.sent().len(), 2);

        // Same window, later tick: the learned channel is still spent.
        let later = t0() + Duration::seconds(30);
        for _ in 0..3 {
            let request = DeliveryRequest::new("kid", "reminder", serde_json::json!({}));
            engine.schedule_message(request, later, None).await.unwrap();
        }
        let report = engine.tick(later).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.deferred, 3);
        assert_eq!(gateway.sent().len(), 2);

        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.throttles.by_channel.get("sms"), Some(&1));
    }

    #[tokio::test]
    async fn test_upcoming_with_unbounded_window() {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine_with(ScriptedGateway::new(Script::Succeed), clock);
        engine
            .schedule_message(sms("kid"), t0() + Duration::hours(2), None)
            .await
            .unwrap();

        for hours in [u64::MAX, i64::MAX as u64, 1_000_000_000_000_000_000, 1_000_000] {
            let upcoming = engine.get_upcoming_messages(hours).await.unwrap();
            assert_eq!(upcoming.len(), 1, "within {hours}h");
        }
        assert!(engine.get_upcoming_messages(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upcoming_unbounded_window_on_sqlite() {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = SchedulerEngine::builder()
            .store(Arc::new(SqliteMessageStore::open_in_memory().unwrap()))
            .clock(clock)
            .build();
        engine
            .schedule_message(sms("kid"), t0() + Duration::hours(2), None)
            .await
            .unwrap();

        let upcoming = engine.get_upcoming_messages(u64::MAX).await.unwrap();
        assert_eq!(upcoming.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_zero_max_attempts() {
        let engine = SchedulerEngine::builder().build();
        let err = engine
            .schedule_message(sms("kid"), Utc::now(), Some(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ChorelyError::Validation(_)));

        let err = engine
            .schedule_recurring("kid", "digest", "every 0m", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ChorelyError::InvalidRecurrence { .. }));
    }

    #[tokio::test]
    async fn test_toggle_and_stats() {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine_with(ScriptedGateway::new(Script::Succeed), clock.clone());

        let id = engine
            .schedule_recurring("kid", "digest", "every 1h", serde_json::json!({}))
            .await
            .unwrap();
        engine
            .schedule_recurring("mom", "digest", "weekly sun 18:00", serde_json::json!({}))
            .await
            .unwrap();
        assert!(engine.toggle_recurring_rule(&id, false).await);
        assert!(!engine.toggle_recurring_rule("rule-missing", true).await);

        let later = clock.advance(Duration::hours(3));
        assert_eq!(engine.tick(later).await.unwrap().fired_rules, 0);

        assert!(engine.toggle_recurring_rule(&id, true).await);
        let rule = engine.get_rule(&id).await.unwrap();
        assert_eq!(rule.next_run, later + Duration::hours(1));

        engine.schedule_message(sms("kid"), later + Duration::hours(2), None).await.unwrap();
        engine.schedule_message(sms("kid"), later + Duration::hours(48), None).await.unwrap();
        let upcoming = engine.get_upcoming_messages(24).await.unwrap();
        assert_eq!(upcoming.len(), 1);

        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.scheduled.total, 2);
        assert_eq!(stats.scheduled.pending, 2);
        assert_eq!(stats.recurring.total, 2);
        assert_eq!(stats.recurring.enabled, 2);
        assert_eq!(stats.throttles.active, 0);

        assert!(engine.remove_recurring_rule(&id).await);
        assert_eq!(engine.list_rules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retention_purges_terminal_messages() {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine_with(ScriptedGateway::new(Script::Succeed), clock);

        let id = engine.schedule_message(sms("kid"), t0(), None).await.unwrap();
        engine.tick(t0()).await.unwrap();
        assert!(engine.get_message(&id).await.unwrap().is_some());

        let report = engine.tick(t0() + Duration::days(8)).await.unwrap();
        assert_eq!(report.purged_messages, 1);
        assert!(engine.get_message(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_runs_each_tick() {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine_with(ScriptedGateway::new(Script::Succeed), clock);

        engine.schedule_message(sms("kid"), t0(), None).await.unwrap();
        engine.tick(t0()).await.unwrap();
        let report = engine.tick(t0() + Duration::hours(2)).await.unwrap();
        assert_eq!(report.swept_windows, 1);
        let report = engine.tick(t0() + Duration::hours(3)).await.unwrap();
        assert_eq!(report.swept_windows, 0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let gateway = ScriptedGateway::new(Script::Succeed);
        let engine = Arc::new(
            SchedulerEngine::builder()
                .gateway(gateway.clone())
                .build(),
        );
        let id = engine
            .schedule_message(sms("kid"), Utc::now() - Duration::seconds(1), None)
            .await
            .unwrap();

        let handle = engine.start(StdDuration::from_millis(10));
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        handle.stop().await;

        let msg = engine.get_message(&id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(gateway.sent().len(), 1);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = SchedulerConfig::default();
        config.retention_hours = 0;
        config.max_concurrent_sends = 0;
        let settings = DispatchSettings::from(&config);
        assert!(settings.retention.is_none());
        assert_eq!(settings.max_concurrent_sends, 1);
        assert_eq!(settings.throttle_deferral, Duration::seconds(60));
        assert_eq!(settings.retry, RetryPolicy::default());
    }

    #[test]
    fn test_settings_clamp_absurd_config() {
        let mut config = SchedulerConfig::default();
        config.throttle_deferral_secs = u64::MAX;
        config.gateway_timeout_secs = u64::MAX;
        config.retention_hours = u64::MAX;
        config.retry.base_delay_secs = u64::MAX;
        let settings = DispatchSettings::from(&config);
        let ten_years = Duration::days(3650);
        assert_eq!(settings.throttle_deferral, ten_years);
        assert_eq!(settings.retention, Some(ten_years));
        assert_eq!(settings.retry.base_delay, ten_years);
        assert_eq!(settings.gateway_timeout, StdDuration::from_secs(MAX_DURATION_SECS));
    }

    #[tokio::test]
    async fn test_from_config_rejects_unknown_backend() {
        let mut config = ChorelyConfig::default();
        assert!(SchedulerEngine::from_config(&config).await.is_ok());
        config.storage.backend = "cassandra".into();
        assert!(SchedulerEngine::from_config(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_rules_survive_engine_restart() {
        let db = Arc::new(SqliteMessageStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = SchedulerEngine::builder()
            .store(db.clone())
            .rule_store(db.clone())
            .gateway(ScriptedGateway::new(Script::Succeed))
            .clock(clock.clone())
            .build();

        let kept = engine
            .schedule_recurring("kid", "digest", "every 1h", serde_json::json!({"channel": "telegram"}))
            .await
            .unwrap();
        let paused = engine
            .schedule_recurring("mom", "digest", "daily 18:00", serde_json::json!({}))
            .await
            .unwrap();
        let gone = engine
            .schedule_recurring("dad", "digest", "hourly", serde_json::json!({}))
            .await
            .unwrap();
        assert!(engine.toggle_recurring_rule(&paused, false).await);
        assert!(engine.remove_recurring_rule(&gone).await);
        let now = clock.advance(Duration::hours(1));
        assert_eq!(engine.tick(now).await.unwrap().sent, 1);
        drop(engine);

        let gateway = ScriptedGateway::new(Script::Succeed);
        let restarted = SchedulerEngine::builder()
            .store(db.clone())
            .rule_store(db)
            .gateway(gateway.clone())
            .clock(clock.clone())
            .build();
        assert_eq!(restarted.load_rules().await.unwrap(), 2);
        assert!(restarted.get_rule(&gone).await.is_none());
        assert!(!restarted.get_rule(&paused).await.unwrap().enabled);

        let rule = restarted.get_rule(&kept).await.unwrap();
        assert_eq!(rule.run_count, 1);
        assert_eq!(rule.last_run, Some(now));
        assert_eq!(rule.next_run, now + Duration::hours(1));

        let now = clock.advance(Duration::hours(1));
        let report = restarted.tick(now).await.unwrap();
        assert_eq!(report.fired_rules, 1);
        assert_eq!(gateway.sent()[0].recipient_id, "kid");
    }

    #[tokio::test]
    async fn test_unbounded_interval_rule_rejected() {
        let engine = SchedulerEngine::builder().build();
        let err = engine
            .schedule_recurring("kid", "digest", "every 100000000d", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ChorelyError::InvalidRecurrence { .. }));
        assert!(engine.list_rules().await.is_empty());
    }
}
