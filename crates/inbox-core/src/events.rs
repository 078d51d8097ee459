//! Domain events and the in-process event bus.
//!
//! The conversation service publishes through [`EventPublisher`]; the webhook
//! bridge subscribes through [`InProcessEventBus::subscribe`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Domain event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "conversation.created")]
    ConversationCreated,
    #[serde(rename = "conversation.status_changed")]
    ConversationStatusChanged,
    #[serde(rename = "conversation.assigned")]
    ConversationAssigned,
    #[serde(rename = "conversation.deleted")]
    ConversationDeleted,
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "message.sent")]
    MessageSent,
    #[serde(rename = "message.status_changed")]
    MessageStatusChanged,
    #[serde(rename = "ticket.created")]
    TicketCreated,
    #[serde(rename = "ticket.assigned")]
    TicketAssigned,
    #[serde(rename = "ticket.resolved")]
    TicketResolved,
    /// Synthetic event used to verify a webhook configuration.
    #[serde(rename = "test.event")]
    Test,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        Self::ConversationCreated,
        Self::ConversationStatusChanged,
        Self::ConversationAssigned,
        Self::ConversationDeleted,
        Self::MessageReceived,
        Self::MessageSent,
        Self::MessageStatusChanged,
        Self::TicketCreated,
        Self::TicketAssigned,
        Self::TicketResolved,
        Self::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConversationCreated => "conversation.created",
            Self::ConversationStatusChanged => "conversation.status_changed",
            Self::ConversationAssigned => "conversation.assigned",
            Self::ConversationDeleted => "conversation.deleted",
            Self::MessageReceived => "message.received",
            Self::MessageSent => "message.sent",
            Self::MessageStatusChanged => "message.status_changed",
            Self::TicketCreated => "ticket.created",
            Self::TicketAssigned => "ticket.assigned",
            Self::TicketResolved => "ticket.resolved",
            Self::Test => "test.event",
        }
    }

    /// Get category for this event type
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConversationCreated
            | Self::ConversationStatusChanged
            | Self::ConversationAssigned
            | Self::ConversationDeleted => "conversation",
            Self::MessageReceived | Self::MessageSent | Self::MessageStatusChanged => "message",
            Self::TicketCreated | Self::TicketAssigned | Self::TicketResolved => "ticket",
            Self::Test => "test",
        }
    }

    /// Parse a wire name such as `message.received`.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == value)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant-scoped domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Stable identifier; webhook receivers de-duplicate on it
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub tenant_id: String,
    /// Logical time of the change that produced the event
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl Event {
    /// Create a new event with the given type and payload.
    pub fn new<T: Serialize>(event_type: EventType, tenant_id: impl Into<String>, data: T) -> Self {
        Self {
            id: format!("evt_{}", Uuid::new_v4().simple()),
            event_type,
            tenant_id: tenant_id.into(),
            timestamp: Utc::now(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            meta: HashMap::new(),
        }
    }

    /// Add metadata to the event.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Event bus errors
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Event bus closed")]
    Closed,

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Trait for publishing events to a messaging system.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: &Event) -> Result<(), EventBusError>;
}

/// Broadcast-backed event bus living inside the process.
///
/// Slow subscribers observe `RecvError::Lagged` and skip ahead; publishers never block.
#[derive(Clone)]
pub struct InProcessEventBus {
    sender: broadcast::Sender<Event>,
}

impl InProcessEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for InProcessEventBus {
    async fn publish(&self, event: &Event) -> Result<(), EventBusError> {
        match self.sender.send(event.clone()) {
            Ok(receivers) => {
                debug!(event_id = %event.id, event_type = %event.event_type, receivers, "Event published");
            }
            Err(_) => {
                debug!(event_id = %event.id, event_type = %event.event_type, "Event published with no subscribers");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(EventType::ConversationStatusChanged.as_str(), "conversation.status_changed");
        assert_eq!(EventType::Test.as_str(), "test.event");
        for event_type in EventType::ALL {
            let json = serde_json::to_value(event_type).unwrap();
            assert_eq!(json, event_type.as_str());
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(EventType::parse("nope"), None);
    }

    #[test]
    fn test_event_category() {
        assert_eq!(EventType::ConversationAssigned.category(), "conversation");
        assert_eq!(EventType::MessageStatusChanged.category(), "message");
        assert_eq!(EventType::TicketResolved.category(), "ticket");
    }

    #[test]
    fn test_event_creation() {
        let event = Event::new(
            EventType::MessageReceived,
            "tenant-1",
            serde_json::json!({"conversationId": "conv_1"}),
        )
        .with_meta("source", "whatsapp");

        assert!(event.id.starts_with("evt_"));
        assert_eq!(event.tenant_id, "tenant-1");
        assert_eq!(event.data["conversationId"], "conv_1");
        assert_eq!(event.meta.get("source"), Some(&"whatsapp".to_string()));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message.received");
        assert_eq!(json["tenantId"], "tenant-1");
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = InProcessEventBus::new(16);
        let mut rx = bus.subscribe();

        let event = Event::new(EventType::TicketCreated, "tenant-1", serde_json::json!({}));
        bus.publish(&event).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, event.id);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = InProcessEventBus::default();
        let event = Event::new(EventType::TicketResolved, "tenant-1", serde_json::json!({}));
        assert!(bus.publish(&event).await.is_ok());
    }
}
