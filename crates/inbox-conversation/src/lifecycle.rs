//! Pure conversation state transitions
//!
//! [`apply`] takes a conversation and a command and mutates the in-memory copy
//! without I/O. The service loads the current record, applies the command and
//! writes it back with compare-and-swap, re-running the transition on conflict.
//!
//! Status rules:
//! - inbound message: RESOLVED/CLOSED -> PENDING, otherwise unchanged; unread +1
//! - outbound message: never changes status
//! - mark read: PENDING -> OPEN; unread reset
//! - resolve: needs a prior OUTBOUND message unless forced
//! - reopen/unarchive -> OPEN, archive -> CLOSED, snooze -> SNOOZED

use chrono::{DateTime, Utc};
use inbox_core::{InboxError, Result};
use std::collections::BTreeSet;

use crate::model::{Conversation, ConversationStatus, Priority, Purpose};

pub const NO_REPLY_MESSAGE: &str = "Cannot resolve: No reply has been sent to the customer";

/// Commands that mutate a conversation
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    InboundReceived { at: DateTime<Utc>, preview: String },
    OutboundSent { preview: String },
    MarkRead,
    Assign { user_id: Option<String> },
    /// `has_reply` is whether the thread holds at least one OUTBOUND message
    Resolve { force: bool, has_reply: bool },
    Reopen,
    Archive,
    Unarchive,
    Snooze { until: DateTime<Utc> },
    ToggleStar,
    UpdatePurpose { purpose: Purpose, sub_category: Option<String> },
    SetPriority(Priority),
    SetTags(BTreeSet<String>),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InboundReceived { .. } => "inbound_received",
            Self::OutboundSent { .. } => "outbound_sent",
            Self::MarkRead => "mark_read",
            Self::Assign { .. } => "assign",
            Self::Resolve { .. } => "resolve",
            Self::Reopen => "reopen",
            Self::Archive => "archive",
            Self::Unarchive => "unarchive",
            Self::Snooze { .. } => "snooze",
            Self::ToggleStar => "toggle_star",
            Self::UpdatePurpose { .. } => "update_purpose",
            Self::SetPriority(_) => "set_priority",
            Self::SetTags(_) => "set_tags",
        }
    }
}

/// Status before and after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConversationStatus,
    pub to: ConversationStatus,
}

impl Transition {
    pub fn status_changed(&self) -> bool {
        self.from != self.to
    }
}

/// `None`, empty and the literal `"unassign"` all clear the assignee.
pub fn normalize_assignee(user_id: Option<&str>) -> Option<String> {
    match user_id.map(str::trim) {
        None | Some("") | Some("unassign") => None,
        Some(id) => Some(id.to_string()),
    }
}

/// Apply `command` to `conversation`.
///
/// On error the conversation is left untouched.
pub fn apply(
    conversation: &mut Conversation,
    command: &Command,
    now: DateTime<Utc>,
) -> Result<Transition> {
    let from = conversation.status;

    match command {
        Command::InboundReceived { at, preview } => {
            if from.is_terminal() {
                conversation.status = ConversationStatus::Pending;
                conversation.closed_at = None;
            }
            conversation.unread_count = conversation.unread_count.saturating_add(1);
            conversation.last_customer_message_at = Some(*at);
            conversation.last_message_preview = Some(preview.clone());
        }
        Command::OutboundSent { preview } => {
            conversation.last_message_preview = Some(preview.clone());
        }
        Command::MarkRead => {
            if from == ConversationStatus::Pending {
                conversation.status = ConversationStatus::Open;
            }
            conversation.unread_count = 0;
        }
        Command::Assign { user_id } => {
            conversation.assigned_to_id = normalize_assignee(user_id.as_deref());
        }
        Command::Resolve { force, has_reply } => {
            if !force && !has_reply {
                return Err(InboxError::invalid_state(NO_REPLY_MESSAGE));
            }
            conversation.status = ConversationStatus::Resolved;
            conversation.snoozed_until = None;
            conversation.closed_at = Some(now);
        }
        Command::Reopen | Command::Unarchive => {
            conversation.status = ConversationStatus::Open;
            conversation.closed_at = None;
            conversation.snoozed_until = None;
        }
        Command::Archive => {
            conversation.status = ConversationStatus::Closed;
            conversation.snoozed_until = None;
            conversation.closed_at = Some(now);
        }
        Command::Snooze { until } => {
            if *until <= now {
                return Err(InboxError::validation("Snooze time must be in the future"));
            }
            if from.is_terminal() {
                return Err(InboxError::invalid_state(format!(
                    "Cannot snooze a {} conversation",
                    from.as_str().to_lowercase()
                )));
            }
            conversation.status = ConversationStatus::Snoozed;
            conversation.snoozed_until = Some(*until);
        }
        Command::ToggleStar => {
            conversation.is_starred = !conversation.is_starred;
        }
        Command::UpdatePurpose {
            purpose,
            sub_category,
        } => {
            conversation.purpose = *purpose;
            conversation.sub_category = sub_category
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
        }
        Command::SetPriority(priority) => {
            conversation.priority = *priority;
        }
        Command::SetTags(tags) => {
            conversation.tags = tags
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
        }
    }

    conversation.updated_at = now;

    Ok(Transition {
        from,
        to: conversation.status,
    })
}
