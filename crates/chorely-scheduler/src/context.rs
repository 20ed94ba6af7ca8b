//! Live context for recurring deliveries.
//!
//! A rule's template is static; whatever the recipient should see *now*
//! (open chores, who's overdue) is fetched at each firing through a
//! `ContextResolver`. Nothing is captured when the rule is registered.

use async_trait::async_trait;
use chorely_core::error::Result;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait ContextResolver: Send + Sync {
    async fn resolve(
        &self,
        recipient_id: &str,
        message_type: &str,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value>;
}

/// Resolves every context to `null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

#[async_trait]
impl ContextResolver for NoContext {
    async fn resolve(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

/// Adapter for synchronous lookups.
pub struct ContextFn<F>(pub F);

#[async_trait]
impl<F> ContextResolver for ContextFn<F>
where
    F: Fn(&str, &str, DateTime<Utc>) -> Result<serde_json::Value> + Send + Sync,
{
    async fn resolve(
        &self,
        recipient_id: &str,
        message_type: &str,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value> {
        (self.0)(recipient_id, message_type, now)
    }
}
