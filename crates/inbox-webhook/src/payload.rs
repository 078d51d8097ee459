//! Webhook wire payload
//!
//! Body shape: `{"event": "<type>", "timestamp": "<RFC 3339>", "data": {...}}`.
//! `data` always carries an `eventId` receivers can de-duplicate on.

use chrono::{DateTime, Utc};
use inbox_core::{Event, EventType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl WebhookPayload {
    pub fn from_event(event: &Event) -> Self {
        let data = match &event.data {
            Value::Object(map) => {
                let mut map = map.clone();
                map.insert("eventId".to_string(), Value::String(event.id.clone()));
                Value::Object(map)
            }
            Value::Null => json!({ "eventId": event.id }),
            other => json!({ "eventId": event.id, "value": other }),
        };

        Self {
            event: event.event_type,
            timestamp: event.timestamp,
            data,
        }
    }

    /// Compact JSON body; these exact bytes are signed and sent.
    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn event_id(&self) -> Option<&str> {
        self.data.get("eventId").and_then(Value::as_str)
    }
}

/// Synthetic event used to verify a webhook configuration
pub fn test_event(tenant_id: &str, webhook_id: &str) -> Event {
    Event::new(
        EventType::Test,
        tenant_id,
        json!({
            "webhookId": webhook_id,
            "message": "This is a test webhook delivery",
        }),
    )
}
