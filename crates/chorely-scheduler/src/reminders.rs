//! Household conveniences on top of the engine: due-date reminders for a chore
//! and recurring digests at a member's preferred time.

use chorely_core::error::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::engine::SchedulerEngine;
use crate::message::DeliveryRequest;
use crate::recurrence::Recurrence;

/// Message type of due-date reminders.
pub const REMINDER_MESSAGE_TYPE: &str = "reminder";
/// Message type of digests.
pub const DIGEST_MESSAGE_TYPE: &str = "digest";

/// The chore a reminder is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRef {
    pub task_id: String,
    pub title: String,
    pub assignee_id: String,
    #[serde(default)]
    pub channel: Option<String>,
}

/// One day and one hour before the due time.
pub fn default_reminder_offsets() -> Vec<Duration> {
    vec![Duration::days(1), Duration::hours(1)]
}

/// Schedule one reminder per offset ahead of `due_at`. Offsets whose reminder
/// time has already passed are skipped. Returns the new message ids.
pub async fn schedule_due_reminders(
    engine: &SchedulerEngine,
    task: &TaskRef,
    due_at: DateTime<Utc>,
    offsets: &[Duration],
) -> Result<Vec<String>> {
    let now = engine.now();
    let mut ids = Vec::with_capacity(offsets.len());

    for offset in offsets {
        let remind_at = due_at - *offset;
        if remind_at <= now {
            tracing::debug!(
                "Skipping reminder for '{}' {}m before due: already past",
                task.title,
                offset.num_minutes()
            );
            continue;
        }

        let mut request = DeliveryRequest::new(
            &task.assignee_id,
            REMINDER_MESSAGE_TYPE,
            serde_json::json!({
                "task_id": task.task_id,
                "title": task.title,
                "due_at": due_at.to_rfc3339(),
                "lead_minutes": offset.num_minutes(),
            }),
        );
        if let Some(channel) = &task.channel {
            request = request.via(channel);
        }
        ids.push(engine.schedule_message(request, remind_at, None).await?);
    }
    Ok(ids)
}

/// How often a digest goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestCadence {
    Daily,
    Weekly(Weekday),
}

impl DigestCadence {
    fn recurrence(self, at: NaiveTime) -> Recurrence {
        match self {
            DigestCadence::Daily => Recurrence::Daily { at },
            DigestCadence::Weekly(weekday) => Recurrence::Weekly { weekday, at },
        }
    }
}

/// Register a recurring digest for `recipient_id` at `at` (UTC).
pub async fn schedule_digest(
    engine: &SchedulerEngine,
    recipient_id: &str,
    cadence: DigestCadence,
    at: NaiveTime,
) -> Result<String> {
    let expression = cadence.recurrence(at).to_string();
    engine
        .schedule_recurring(
            recipient_id,
            DIGEST_MESSAGE_TYPE,
            &expression,
            serde_json::json!({ "cadence": expression }),
        )
        .await
}
