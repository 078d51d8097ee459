//! Conversation listing filters.
//!
//! Buckets are derived views over status and flags. They are evaluated at
//! query time and never stored as a status value.

use chrono::{DateTime, Utc};
use inbox_core::{Page, PageRequest};
use serde::{Deserialize, Serialize};

use crate::model::{Conversation, ConversationStatus, Priority, Purpose};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    All,
    Unread,
    Resolved,
    Archived,
    Pending,
    Open,
}

impl Bucket {
    pub fn matches(&self, conversation: &Conversation) -> bool {
        use ConversationStatus::*;
        match self {
            Self::All => matches!(conversation.status, Open | Pending),
            Self::Unread => conversation.unread_count > 0,
            Self::Resolved => conversation.status == Resolved,
            Self::Archived => matches!(conversation.status, Resolved | Closed),
            Self::Pending => conversation.status == Pending,
            Self::Open => conversation.status == Open,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "unread" => Some(Self::Unread),
            "resolved" => Some(Self::Resolved),
            "archived" => Some(Self::Archived),
            "pending" => Some(Self::Pending),
            "open" => Some(Self::Open),
            _ => None,
        }
    }
}

/// Filters for listing; unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationFilter {
    pub status: Option<ConversationStatus>,
    pub bucket: Option<Bucket>,
    /// Normalized channel type, e.g. `email`
    pub channel_type: Option<String>,
    pub assigned_to: Option<String>,
    pub unassigned: bool,
    pub priority: Option<Priority>,
    pub starred: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub search: Option<String>,
    pub purpose: Option<Purpose>,
}

impl ConversationFilter {
    pub fn bucket(bucket: Bucket) -> Self {
        Self {
            bucket: Some(bucket),
            ..Default::default()
        }
    }

    pub fn matches(&self, c: &Conversation) -> bool {
        if let Some(status) = self.status {
            if c.status != status {
                return false;
            }
        }
        if let Some(bucket) = self.bucket {
            if !bucket.matches(c) {
                return false;
            }
        }
        if let Some(channel_type) = &self.channel_type {
            if !c.channel_type().eq_ignore_ascii_case(channel_type) {
                return false;
            }
        }
        if self.unassigned && c.assigned_to_id.is_some() {
            return false;
        }
        if let Some(user) = &self.assigned_to {
            if c.assigned_to_id.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        if self.priority.is_some_and(|p| p != c.priority) {
            return false;
        }
        if self.starred.is_some_and(|s| s != c.is_starred) {
            return false;
        }
        if self.purpose.is_some_and(|p| p != c.purpose) {
            return false;
        }
        if self.from.is_some_and(|from| c.updated_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| c.updated_at > to) {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => search_matches(c, &term.to_lowercase()),
            _ => true,
        }
    }

    /// Filter, order by most recently updated, then paginate.
    pub fn apply(&self, conversations: Vec<Conversation>, page: PageRequest) -> Page<Conversation> {
        let mut matched: Vec<Conversation> =
            conversations.into_iter().filter(|c| self.matches(c)).collect();
        matched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        page.apply(matched)
    }
}

fn search_matches(c: &Conversation, term: &str) -> bool {
    [
        c.contact.name.as_deref(),
        Some(c.contact.handle.as_str()),
        c.subject.as_deref(),
        c.last_message_preview.as_deref(),
    ]
    .into_iter()
    .flatten()
    .any(|field| field.to_lowercase().contains(term))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelRef, Contact};
    use chrono::Duration;

    fn conv(status: ConversationStatus, unread: u32) -> Conversation {
        let mut c = Conversation::new(
            "t1",
            Contact {
                id: "c1".into(),
                name: Some("Ravi Kumar".into()),
                handle: "+919800000000".into(),
            },
            ChannelRef {
                account_id: "a1".into(),
                account_type: Some("WHATSAPP".into()),
                provider: "gupshup".into(),
            },
            Utc::now(),
        );
        c.status = status;
        c.unread_count = unread;
        c
    }

    #[test]
    fn test_bucket_membership() {
        use ConversationStatus::*;
        assert!(Bucket::All.matches(&conv(Open, 0)));
        assert!(Bucket::All.matches(&conv(Pending, 0)));
        assert!(!Bucket::All.matches(&conv(Snoozed, 0)));
        assert!(Bucket::Unread.matches(&conv(Closed, 2)));
        assert!(Bucket::Archived.matches(&conv(Resolved, 0)));
        assert!(Bucket::Archived.matches(&conv(Closed, 0)));
        assert!(!Bucket::Resolved.matches(&conv(Closed, 0)));
        assert_eq!(Bucket::parse("ARCHIVED"), Some(Bucket::Archived));
        assert_eq!(Bucket::parse("starred"), None);
    }

    #[test]
    fn test_filter_dimensions() {
        let mut c = conv(ConversationStatus::Open, 0);
        c.assigned_to_id = Some("agent-1".into());
        c.priority = Priority::High;

        assert!(ConversationFilter::default().matches(&c));
        assert!(ConversationFilter {
            channel_type: Some("whatsapp".into()),
            assigned_to: Some("agent-1".into()),
            priority: Some(Priority::High),
            ..Default::default()
        }
        .matches(&c));
        assert!(!ConversationFilter {
            unassigned: true,
            ..Default::default()
        }
        .matches(&c));
        assert!(!ConversationFilter {
            starred: Some(true),
            ..Default::default()
        }
        .matches(&c));
        assert!(!ConversationFilter {
            from: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        }
        .matches(&c));
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let c = conv(ConversationStatus::Open, 0);
        let filter = |term: &str| ConversationFilter {
            search: Some(term.to_string()),
            ..Default::default()
        };
        assert!(filter("ravi").matches(&c));
        assert!(filter("98000").matches(&c));
        assert!(!filter("priya").matches(&c));
        assert!(filter("  ").matches(&c));
    }

    #[test]
    fn test_apply_orders_and_paginates() {
        let now = Utc::now();
        let items: Vec<Conversation> = (0..5)
            .map(|i| {
                let mut c = conv(ConversationStatus::Open, 0);
                c.updated_at = now - Duration::minutes(i);
                c
            })
            .collect();
        let newest = items[0].id.clone();

        let page = ConversationFilter::default().apply(items, PageRequest::new(1, 2));
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, newest);
    }
}
