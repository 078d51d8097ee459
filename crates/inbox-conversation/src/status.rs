//! Message delivery status derivation
//!
//! A message stores only the timestamps its provider reported. The lifecycle
//! status is computed from them with fixed precedence
//! `FAILED > READ > DELIVERED > SENT > QUEUED`. A `failedAt` always wins,
//! even when a `readAt` is also present.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryTimestamps {
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Total over every combination of timestamps; first match wins.
    pub fn derive(timestamps: &DeliveryTimestamps) -> Self {
        if timestamps.failed_at.is_some() {
            Self::Failed
        } else if timestamps.read_at.is_some() {
            Self::Read
        } else if timestamps.delivered_at.is_some() {
            Self::Delivered
        } else if timestamps.sent_at.is_some() {
            Self::Sent
        } else {
            Self::Queued
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Read => "READ",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a provider callback reports about a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Sent,
    Delivered,
    Read,
    Failed,
}

/// Normalized asynchronous delivery callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
    pub kind: ReceiptKind,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DeliveryTimestamps {
    /// Record a receipt. Timestamps are write-once: a duplicate or replayed
    /// callback leaves the first value in place. Returns whether anything changed.
    pub fn record(&mut self, kind: ReceiptKind, at: DateTime<Utc>) -> bool {
        let slot = match kind {
            ReceiptKind::Sent => &mut self.sent_at,
            ReceiptKind::Delivered => &mut self.delivered_at,
            ReceiptKind::Read => &mut self.read_at,
            ReceiptKind::Failed => &mut self.failed_at,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        true
    }
}
