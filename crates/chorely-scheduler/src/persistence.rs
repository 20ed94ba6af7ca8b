//! SQLite-backed message and rule store. It survives restarts and lets the CLI
//! inspect or edit the queue of a running daemon.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chorely_core::error::{ChorelyError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::sync::Mutex;

use crate::message::{AttemptOutcome, MessageStatus, RetryPolicy, ScheduledMessage};
use crate::rules::RecurringRule;
use crate::store::{MessageStore, RuleStore};

const COLUMNS: &str = "id, recipient_id, message_type, scheduled_for, payload, attempts, \
                       max_attempts, status, created_at, last_attempt_at, updated_at, last_error";

const RULE_COLUMNS: &str = "id, recipient_id, message_type, recurrence, enabled, template, \
                            last_run, next_run, created_at, run_count";

/// SQLite persistence for scheduled messages and recurring rules.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Run migrations to create tables.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_messages (
            id TEXT PRIMARY KEY,
            recipient_id TEXT NOT NULL,
            message_type TEXT NOT NULL,
            scheduled_for TEXT NOT NULL,      -- fixed-width RFC 3339, sorts lexically
            payload TEXT NOT NULL,            -- JSON DeliveryRequest
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            last_attempt_at TEXT,
            updated_at TEXT NOT NULL,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_scheduled_messages_due
            ON scheduled_messages (status, scheduled_for);

        CREATE TABLE IF NOT EXISTS recurring_rules (
            id TEXT PRIMARY KEY,
            recipient_id TEXT NOT NULL,
            message_type TEXT NOT NULL,
            recurrence TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            template TEXT NOT NULL,           -- JSON
            last_run TEXT,
            next_run TEXT NOT NULL,
            created_at TEXT NOT NULL,
            run_count INTEGER NOT NULL DEFAULT 0
        );
        ",
    )
    .map_err(db_err("Migration"))
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> ChorelyError {
    move |e| ChorelyError::Storage(format!("{context}: {e}"))
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<ScheduledMessage> {
    let payload_str: String = row.get(4)?;
    let payload = serde_json::from_str(&payload_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status_str: String = row.get(7)?;
    let status = MessageStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("unknown status '{status_str}'").into(),
        )
    })?;
    let last_attempt_at: Option<String> = row.get(9)?;

    Ok(ScheduledMessage {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        message_type: row.get(2)?,
        scheduled_for: parse_ts(3, &row.get::<_, String>(3)?)?,
        payload,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        status,
        created_at: parse_ts(8, &row.get::<_, String>(8)?)?,
        last_attempt_at: last_attempt_at.map(|s| parse_ts(9, &s)).transpose()?,
        updated_at: parse_ts(10, &row.get::<_, String>(10)?)?,
        last_error: row.get(11)?,
    })
}

fn write_message(conn: &Connection, msg: &ScheduledMessage) -> Result<()> {
    let payload = serde_json::to_string(&msg.payload)?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO scheduled_messages ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            msg.id,
            msg.recipient_id,
            msg.message_type,
            ts(msg.scheduled_for),
            payload,
            msg.attempts,
            msg.max_attempts,
            msg.status.as_str(),
            ts(msg.created_at),
            msg.last_attempt_at.map(ts),
            ts(msg.updated_at),
            msg.last_error,
        ],
    )
    .map_err(db_err("Save message"))?;
    Ok(())
}

fn find_message(conn: &Connection, id: &str) -> Result<Option<ScheduledMessage>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM scheduled_messages WHERE id = ?1"),
        [id],
        read_message,
    )
    .optional()
    .map_err(db_err("Load message"))
}

fn query_messages(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ScheduledMessage>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {COLUMNS} FROM scheduled_messages {filter} ORDER BY scheduled_for, created_at"
        ))
        .map_err(db_err("Prepare query"))?;
    let rows = stmt
        .query_map(params, read_message)
        .map_err(db_err("Query messages"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err("Read message row"))
}

fn read_rule(row: &Row<'_>) -> rusqlite::Result<RecurringRule> {
    let template_str: String = row.get(5)?;
    let template = serde_json::from_str(&template_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_run: Option<String> = row.get(6)?;

    Ok(RecurringRule {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        message_type: row.get(2)?,
        recurrence: row.get(3)?,
        enabled: row.get(4)?,
        template,
        last_run: last_run.map(|s| parse_ts(6, &s)).transpose()?,
        next_run: parse_ts(7, &row.get::<_, String>(7)?)?,
        created_at: parse_ts(8, &row.get::<_, String>(8)?)?,
        run_count: row.get(9)?,
    })
}

#[async_trait]
impl RuleStore for SqliteMessageStore {
    async fn save_rule(&self, rule: &RecurringRule) -> Result<()> {
        let template = serde_json::to_string(&rule.template)?;
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO recurring_rules ({RULE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                rule.id,
                rule.recipient_id,
                rule.message_type,
                rule.recurrence,
                rule.enabled,
                template,
                rule.last_run.map(ts),
                ts(rule.next_run),
                ts(rule.created_at),
                rule.run_count,
            ],
        )
        .map_err(db_err("Save rule"))?;
        Ok(())
    }

    async fn delete_rule(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute("DELETE FROM recurring_rules WHERE id = ?1", [id])
            .map_err(db_err("Delete rule"))?;
        Ok(deleted > 0)
    }

    async fn load_rules(&self) -> Result<Vec<RecurringRule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM recurring_rules ORDER BY created_at, id"
            ))
            .map_err(db_err("Prepare rules"))?;
        let rows = stmt.query_map([], read_rule).map_err(db_err("Query rules"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read rule row"))
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert(&self, message: ScheduledMessage) -> Result<()> {
        let conn = self.conn.lock().await;
        if find_message(&conn, &message.id)?.is_some() {
            return Err(ChorelyError::Storage(format!(
                "message {} already exists",
                message.id
            )));
        }
        write_message(&conn, &message)
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        let conn = self.conn.lock().await;
        find_message(&conn, id)
    }

    async fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        let Some(mut msg) = find_message(&tx, id)? else {
            return Ok(false);
        };
        if !msg.cancel(now) {
            return Ok(false);
        }
        write_message(&tx, &msg)?;
        tx.commit().map_err(db_err("Commit"))?;
        Ok(true)
    }

    async fn record_outcome(
        &self,
        id: &str,
        outcome: &AttemptOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<MessageStatus>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        let Some(mut msg) = find_message(&tx, id)? else {
            return Ok(None);
        };
        let delay = policy.delay_for(msg.attempts + 1);
        let Some(status) = msg.apply_outcome(outcome, delay, now) else {
            return Ok(None);
        };
        write_message(&tx, &msg)?;
        tx.commit().map_err(db_err("Commit"))?;
        Ok(Some(status))
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let conn = self.conn.lock().await;
        query_messages(
            &conn,
            "WHERE status = 'pending' AND scheduled_for <= ?1 AND attempts < max_attempts",
            params![ts(now)],
        )
    }

    async fn list_pending_before(&self, until: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let conn = self.conn.lock().await;
        query_messages(
            &conn,
            "WHERE status = 'pending' AND scheduled_for <= ?1",
            params![ts(until)],
        )
    }

    async fn list_all(&self) -> Result<Vec<ScheduledMessage>> {
        let conn = self.conn.lock().await;
        query_messages(&conn, "", params![])
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM scheduled_messages WHERE status != 'pending' AND updated_at < ?1",
            [ts(before)],
        )
        .map_err(db_err("Purge messages"))
    }

    async fn count_by_status(&self) -> Result<HashMap<MessageStatus, usize>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM scheduled_messages GROUP BY status")
            .map_err(db_err("Prepare count"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err("Count messages"))?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row.map_err(db_err("Read count row"))?;
            match MessageStatus::parse(&status) {
                Some(s) => {
                    counts.insert(s, count as usize);
                }
                None => tracing::warn!("⚠️ Unknown message status in database: {status}"),
            }
        }
        Ok(counts)
    }
}
