//! # Chorely Scheduler
//!
//! Decides when household notifications go out, how often a family member may
//! be contacted on each channel, and how failed deliveries are retried.
//!
//! ## Design Principles
//! - One engine value, no globals; shared as `Arc<SchedulerEngine>`
//! - Storage behind traits (MessageStore, RuleStore): in-memory by default, SQLite when it must survive restarts
//! - Tokio timers only, zero overhead when idle
//! - The engine never picks a transport; the gateway does
//!
//! ## Architecture
//! ```text
//! Producers
//!   ├── schedule_message   → MessageStore (pending)
//!   ├── schedule_recurring → RuleBook ("daily 08:00", "*/15 * * * *") → RuleStore
//!   └── cancel / toggle
//!
//! Dispatch loop (tokio interval → tick)
//!   ├── due messages + fired rules (+ live context)
//!   ├── ThrottleLedger gate  → defer (message) / drop (rule)
//!   ├── DeliveryGateway      → Log | Webhook | your own
//!   ├── outcome → sent | retry later | failed
//!   └── sweep stale windows, purge old terminal messages
//! ```

pub mod clock;
pub mod context;
pub mod engine;
pub mod gateway;
pub mod history;
pub mod message;
pub mod persistence;
pub mod recurrence;
pub mod reminders;
pub mod rules;
pub mod store;
pub mod throttle;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ContextFn, ContextResolver, NoContext};
pub use engine::{DispatchHandle, DispatchSettings, SchedulerEngine, SchedulerStats, TickReport};
pub use gateway::{DeliveryGateway, DeliveryReceipt, LogGateway, WebhookGateway};
pub use history::{DeliveryLog, DeliveryRecord, DeliveryResult, DeliverySource};
pub use message::{AttemptOutcome, DeliveryRequest, MessageStatus, RetryPolicy, ScheduledMessage};
pub use persistence::SqliteMessageStore;
pub use recurrence::{Recurrence, next_run};
pub use rules::{Firing, RecurringRule, RuleBook};
pub use store::{InMemoryMessageStore, InMemoryRuleStore, MessageStore, RuleStore};
pub use throttle::{ThrottleLedger, ThrottleLimits, ThrottleWindow};
