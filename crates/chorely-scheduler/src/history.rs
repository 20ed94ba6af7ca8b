//! Delivery history: what the dispatch loop did, most recent last.
//! In-memory ring buffer; nothing here is needed for correctness.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_CAPACITY: usize = 100;

/// Where a delivery came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum DeliverySource {
    Message(String),
    Rule(String),
}

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryResult {
    Sent,
    Failed,
    /// One-off message pushed back by the throttle.
    Deferred,
    /// Recurring firing skipped for this occurrence.
    Dropped,
}

/// One dispatch decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub source: DeliverySource,
    pub recipient_id: String,
    pub message_type: String,
    pub channel: Option<String>,
    pub result: DeliveryResult,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded log of recent deliveries.
#[derive(Debug)]
pub struct DeliveryLog {
    records: VecDeque<DeliveryRecord>,
    capacity: usize,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Record a delivery, evicting the oldest when full.
    pub fn record(&mut self, record: DeliveryRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Records, oldest first.
    pub fn recent(&self) -> Vec<DeliveryRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> DeliveryRecord {
        DeliveryRecord {
            source: DeliverySource::Message(format!("msg-{n}")),
            recipient_id: "kid".into(),
            message_type: "reminder".into(),
            channel: Some("telegram".into()),
            result: DeliveryResult::Sent,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_ring_buffer_keeps_latest() {
        let mut log = DeliveryLog::with_capacity(3);
        for n in 0..5 {
            log.record(record(n));
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent();
        assert_eq!(recent[0].source, DeliverySource::Message("msg-2".into()));
        assert_eq!(recent[2].source, DeliverySource::Message("msg-4".into()));
    }

    #[test]
    fn test_source_serialization() {
        let json = serde_json::to_value(DeliverySource::Rule("rule-1".into())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "rule", "id": "rule-1"}));
    }
}
