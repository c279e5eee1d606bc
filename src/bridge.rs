//! Cart change notifications for connected UI clients
//!
//! Publishing is best-effort: errors are logged and never reach the session.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Event type used for every cart notification
const EVENT_TYPE: &str = "cart.updated";

/// Transient "cart changed" notice
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartUpdateNotification {
    /// Cart lines as returned by the backend
    pub items: Vec<Value>,
    /// Cart total
    pub total: f64,
    /// Client that caused the change
    pub client_id: String,
}

impl CartUpdateNotification {
    /// Build a notification from a tool result that carries cart contents
    ///
    /// Accepts `{cart: [...]}` or `{cart: {items: [...], total}}`. The total
    /// comes from the result when present, otherwise it is summed from
    /// `price * quantity` of each line.
    #[must_use]
    pub fn from_tool_result(result: &Value, client_id: &str) -> Option<Self> {
        let cart = result.get("cart")?;
        let (items, cart_total) = match cart {
            Value::Array(items) => (items.clone(), None),
            Value::Object(obj) => (
                obj.get("items")?.as_array()?.clone(),
                obj.get("total").and_then(Value::as_f64),
            ),
            _ => return None,
        };

        let total = result
            .get("total")
            .and_then(Value::as_f64)
            .or(cart_total)
            .unwrap_or_else(|| items.iter().map(line_total).sum());

        Some(Self {
            items,
            total,
            client_id: client_id.to_string(),
        })
    }
}

fn line_total(item: &Value) -> f64 {
    let price = item.get("price").and_then(Value::as_f64).unwrap_or(0.0);
    let quantity = item.get("quantity").and_then(Value::as_f64).unwrap_or(1.0);
    price * quantity
}

/// Publishes cart notifications without waiting for delivery
pub trait CartPublisher: Send + Sync {
    /// Hand off a notification
    fn publish(&self, notification: CartUpdateNotification);
}

/// Envelope posted to the broadcast bridge
#[derive(Debug, Serialize)]
struct BridgeEvent<'a> {
    id: String,
    #[serde(rename = "type")]
    event_type: &'a str,
    timestamp: String,
    data: &'a CartUpdateNotification,
}

/// HTTP client for the broadcast bridge
pub struct HttpBroadcastBridge {
    client: reqwest::Client,
    url: String,
}

impl HttpBroadcastBridge {
    /// Create a publisher for `url`
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl CartPublisher for HttpBroadcastBridge {
    fn publish(&self, notification: CartUpdateNotification) {
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            let event = BridgeEvent {
                id: Uuid::new_v4().to_string(),
                event_type: EVENT_TYPE,
                timestamp: chrono::Utc::now().to_rfc3339(),
                data: &notification,
            };
            match client.post(&url).json(&event).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(items = notification.items.len(), total = notification.total, "cart update published");
                }
                Ok(resp) => {
                    tracing::warn!(status = %resp.status(), "broadcast bridge rejected cart update");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to publish cart update");
                }
            }
        });
    }
}

/// Used when no bridge is configured
#[derive(Debug, Default)]
pub struct NoopPublisher;

impl CartPublisher for NoopPublisher {
    fn publish(&self, notification: CartUpdateNotification) {
        tracing::debug!(items = notification.items.len(), "no broadcast bridge configured, dropping cart update");
    }
}
