//! Conversation, message and note records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::status::{DeliveryTimestamps, MessageStatus};

/// Lifecycle status of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Open,
    Pending,
    Resolved,
    Closed,
    Snoozed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Pending => "PENDING",
            Self::Resolved => "RESOLVED",
            Self::Closed => "CLOSED",
            Self::Snoozed => "SNOOZED",
        }
    }

    /// Resolved and closed threads are considered finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business classification, independent of lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Purpose {
    #[default]
    General,
    Sales,
    Support,
    Service,
    Marketing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// The external party on the other side of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: Option<String>,
    /// Phone number, e-mail address or other channel-specific handle
    pub handle: String,
}

/// Reference to the channel account a conversation flows through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub account_id: String,
    /// Raw account type such as `EMAIL_GMAIL` or `WHATSAPP`
    pub account_type: Option<String>,
    /// Provider id used to look up the sending capability
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub contact: Contact,
    pub channel: ChannelRef,
    pub status: ConversationStatus,
    pub assigned_to_id: Option<String>,
    pub unread_count: u32,
    pub is_starred: bool,
    pub purpose: Purpose,
    pub sub_category: Option<String>,
    pub priority: Priority,
    pub tags: BTreeSet<String>,
    pub subject: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_customer_message_at: Option<DateTime<Utc>>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped by the store on every write
    pub version: u64,
}

impl Conversation {
    pub fn new(tenant_id: &str, contact: Contact, channel: ChannelRef, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("conv_{}", Uuid::new_v4().simple()),
            tenant_id: tenant_id.to_string(),
            contact,
            channel,
            status: ConversationStatus::Open,
            assigned_to_id: None,
            unread_count: 0,
            is_starred: false,
            purpose: Purpose::General,
            sub_category: None,
            priority: Priority::Medium,
            tags: BTreeSet::new(),
            subject: None,
            last_message_preview: None,
            last_customer_message_at: None,
            snoozed_until: None,
            closed_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Coarse channel type for display and filtering
    pub fn channel_type(&self) -> String {
        crate::channel::normalize_channel_type(self.channel.account_type.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A thread item; only its delivery timestamps change after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub content_type: String,
    pub body: String,
    /// Agent that sent an outbound message
    pub sender_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    #[serde(flatten)]
    pub timestamps: DeliveryTimestamps,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn inbound(conversation_id: &str, content_type: &str, body: &str, now: DateTime<Utc>) -> Self {
        Self::build(conversation_id, Direction::Inbound, content_type, body, now)
    }

    pub fn outbound(conversation_id: &str, content_type: &str, body: &str, now: DateTime<Utc>) -> Self {
        Self::build(conversation_id, Direction::Outbound, content_type, body, now)
    }

    fn build(
        conversation_id: &str,
        direction: Direction,
        content_type: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            conversation_id: conversation_id.to_string(),
            direction,
            content_type: content_type.to_string(),
            body: body.to_string(),
            sender_id: None,
            provider_message_id: None,
            error: None,
            timestamps: DeliveryTimestamps::default(),
            created_at: now,
        }
    }

    pub fn status(&self) -> MessageStatus {
        MessageStatus::derive(&self.timestamps)
    }

    pub fn preview(&self) -> String {
        preview(&self.body)
    }
}

/// Internal agent note attached to a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Note {
    pub fn new(conversation_id: &str, author_id: &str, body: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("note_{}", Uuid::new_v4().simple()),
            conversation_id: conversation_id.to_string(),
            author_id: author_id.to_string(),
            body: body.to_string(),
            created_at: now,
        }
    }
}

const PREVIEW_CHARS: usize = 120;

fn preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= PREVIEW_CHARS {
        trimmed.to_string()
    } else {
        let mut out: String = trimmed.chars().take(PREVIEW_CHARS).collect();
        out.push('…');
        out
    }
}
