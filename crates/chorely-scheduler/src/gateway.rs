//! Delivery gateway: the boundary where messages leave the engine.
//!
//! The engine never picks a transport. A gateway resolves the recipient's
//! preferred channel, sends, and reports which channel it actually used so
//! the throttle ledger can charge it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorely_core::config::GatewayConfig;
use chorely_core::error::{ChorelyError, Result};
use serde::{Deserialize, Serialize};

use crate::message::DeliveryRequest;

/// What the gateway reports back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReceipt {
    pub success: bool,
    /// Channel actually used.
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryReceipt {
    pub fn sent(channel: &str) -> Self {
        Self {
            success: true,
            channel: channel.to_string(),
            error: None,
        }
    }

    pub fn failed(channel: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            channel: channel.to_string(),
            error: Some(error.into()),
        }
    }
}

/// Transport capability consumed by the dispatch loop.
///
/// An `Err` is treated exactly like `success: false`.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Channel this gateway would use for a recipient when the request doesn't
    /// name one. `None` when it can't tell before sending.
    async fn preferred_channel(&self, _recipient_id: &str) -> Option<String> {
        None
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt>;
}

/// Logs every delivery and reports success. For development and dry runs.
#[derive(Debug, Clone)]
pub struct LogGateway {
    default_channel: String,
}

impl LogGateway {
    pub fn new(default_channel: &str) -> Self {
        Self {
            default_channel: default_channel.to_string(),
        }
    }
}

impl Default for LogGateway {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl DeliveryGateway for LogGateway {
    fn name(&self) -> &str {
        "log"
    }

    async fn preferred_channel(&self, _recipient_id: &str) -> Option<String> {
        Some(self.default_channel.clone())
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt> {
        let channel = request
            .channel
            .clone()
            .unwrap_or_else(|| self.default_channel.clone());
        tracing::info!(
            recipient = %request.recipient_id,
            message_type = %request.message_type,
            channel = %channel,
            payload = %request.payload,
            "📢 delivery"
        );
        Ok(DeliveryReceipt::sent(&channel))
    }
}

/// Generic HTTP webhook: POST with a JSON body.
///
/// A 2xx response is a success. The response body may be
/// `{"channel": "..."}` to report the channel the downstream service used.
pub struct WebhookGateway {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct WebhookReply {
    channel: Option<String>,
}

impl WebhookGateway {
    pub fn new(url: &str, headers: Vec<(String, String)>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
            timeout,
        }
    }
}

#[async_trait]
impl DeliveryGateway for WebhookGateway {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt> {
        let fallback_channel = request.channel.as_deref().unwrap_or("webhook");
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "recipient_id": request.recipient_id,
                "channel": request.channel,
                "message_type": request.message_type,
                "payload": request.payload,
                "sent_at": chrono::Utc::now().to_rfc3339(),
            }))
            .timeout(self.timeout);

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ChorelyError::Gateway(format!("Webhook send failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Ok(DeliveryReceipt::failed(
                fallback_channel,
                format!("Webhook error {status}: {body}"),
            ));
        }

        let reported = resp
            .json::<WebhookReply>()
            .await
            .ok()
            .and_then(|r| r.channel);
        let channel = reported.as_deref().unwrap_or(fallback_channel);
        tracing::debug!("✅ Webhook delivery to {} via {}", self.url, channel);
        Ok(DeliveryReceipt::sent(channel))
    }
}

/// Build the configured gateway.
pub fn gateway_from_config(config: &GatewayConfig) -> Result<Arc<dyn DeliveryGateway>> {
    match config.kind.as_str() {
        "log" => Ok(Arc::new(LogGateway::default())),
        "webhook" => {
            if config.webhook_url.is_empty() {
                return Err(ChorelyError::Config(
                    "gateway.kind = \"webhook\" requires gateway.webhook_url".into(),
                ));
            }
            Ok(Arc::new(WebhookGateway::new(
                &config.webhook_url,
                config.headers.clone(),
                Duration::from_secs(config.timeout_secs),
            )))
        }
        other => Err(ChorelyError::Config(format!("unknown gateway kind '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_gateway_uses_requested_channel() {
        let gateway = LogGateway::new("telegram");
        let req = DeliveryRequest::new("mom", "digest", serde_json::json!({})).via("sms");
        let receipt = gateway.send(&req).await.unwrap();
        assert_eq!(receipt, DeliveryReceipt::sent("sms"));

        let req = DeliveryRequest::new("mom", "digest", serde_json::json!({}));
        let receipt = gateway.send(&req).await.unwrap();
        assert_eq!(receipt.channel, "telegram");
        assert_eq!(
            gateway.preferred_channel("mom").await.as_deref(),
            Some("telegram")
        );
    }

    #[test]
    fn test_gateway_from_config() {
        let config = GatewayConfig::default();
        assert_eq!(gateway_from_config(&config).unwrap().name(), "log");

        let mut config = GatewayConfig {
            kind: "webhook".into(),
            ..GatewayConfig::default()
        };
        assert!(gateway_from_config(&config).is_err());
        config.webhook_url = "http://127.0.0.1:9/hook".into();
        assert_eq!(gateway_from_config(&config).unwrap().name(), "webhook");

        config.kind = "pigeon".into();
        assert!(gateway_from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_error() {
        let gateway = WebhookGateway::new("http://127.0.0.1:9/hook", vec![], Duration::from_millis(500));
        let req = DeliveryRequest::new("mom", "reminder", serde_json::json!({}));
        assert!(matches!(gateway.send(&req).await, Err(ChorelyError::Gateway(_))));
    }
}
