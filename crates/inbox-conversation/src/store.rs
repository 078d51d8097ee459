//! Conversation persistence contract and the in-memory implementation.
//!
//! Messages and notes are stored inside their conversation's thread record, so
//! deleting a conversation removes its children in the same operation and an
//! append to a deleted conversation fails with `NotFound`. Message changes that
//! move a conversation counter go through [`ConversationStore::commit`] together
//! with the conversation write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use inbox_core::{InboxError, Result};
use tracing::debug;

use crate::model::{ChannelRef, Contact, Conversation, Direction, Message, Note};
use crate::status::{MessageStatus, ReceiptKind};

/// Outcome of a compare-and-swap write
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// Written; carries the stored record with its bumped version
    Applied(Conversation),
    /// Someone else wrote first
    Stale,
}

/// Thread-level change written in the same step as a conversation update
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadChange {
    /// Append a message. A provider message id already recorded for the
    /// tenant is rejected with `Conflict { entity: "message" }`.
    Append(Message),
    /// Set `readAt` on every inbound message that lacks one
    MarkInboundRead { at: DateTime<Utc> },
}

/// What a successful [`ConversationStore::commit`] wrote
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub conversation: Conversation,
    pub appended: Option<Message>,
    /// Messages whose derived status became `READ`
    pub read: Vec<Message>,
}

/// Outcome of [`ConversationStore::commit`]
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Applied(Committed),
    /// Someone else wrote first; nothing was changed
    Stale,
}

/// Changes a message may receive after creation. Every field is write-once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub receipt: Option<(ReceiptKind, DateTime<Utc>)>,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

/// Message before and after a patch
#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpdate {
    pub previous_status: MessageStatus,
    pub message: Message,
}

impl MessageUpdate {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.message.status()
    }
}

/// What a cascade delete removed
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedThread {
    pub conversation: Conversation,
    pub messages: usize,
    pub notes: usize,
}

/// Tenant-scoped conversation storage.
///
/// Every lookup filters by tenant; a record owned by another tenant is
/// reported exactly like a missing one.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Atomic find-or-create keyed by (tenant, contact, channel account).
    /// Returns the conversation and whether it was created.
    async fn find_or_create(
        &self,
        tenant_id: &str,
        contact: Contact,
        channel: ChannelRef,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)>;

    async fn get(&self, tenant_id: &str, conversation_id: &str) -> Result<Conversation>;

    /// Write `updated` if the stored version still equals `updated.version`.
    async fn compare_and_swap(&self, updated: Conversation) -> Result<CasOutcome>;

    async fn list(&self, tenant_id: &str) -> Result<Vec<Conversation>>;

    /// Remove a conversation with its messages and notes.
    async fn delete(&self, tenant_id: &str, conversation_id: &str) -> Result<DeletedThread>;

    /// Compare-and-swap `updated` and apply `change` to its thread as one
    /// atomic step. On `Stale` neither is written.
    async fn commit(&self, updated: Conversation, change: ThreadChange) -> Result<CommitOutcome>;

    /// Thread messages in insertion order
    async fn messages(&self, tenant_id: &str, conversation_id: &str) -> Result<Vec<Message>>;

    async fn has_outbound(&self, tenant_id: &str, conversation_id: &str) -> Result<bool>;

    async fn find_message_by_provider_id(
        &self,
        tenant_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<Message>>;

    async fn update_message(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<MessageUpdate>;

    async fn add_note(&self, tenant_id: &str, note: Note) -> Result<Note>;

    async fn notes(&self, tenant_id: &str, conversation_id: &str) -> Result<Vec<Note>>;
}

struct Thread {
    conversation: Conversation,
    messages: Vec<Message>,
    notes: Vec<Note>,
}

type ContactKey = (String, String, String);
type ProviderKey = (String, String);

#[derive(Default)]
pub struct InMemoryConversationStore {
    threads: DashMap<String, Thread>,
    by_contact: DashMap<ContactKey, String>,
    by_provider_id: DashMap<ProviderKey, (String, String)>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn not_found(conversation_id: &str) -> InboxError {
        InboxError::not_found("conversation", conversation_id)
    }

    /// Run `f` against a tenant's thread under the shard write lock.
    fn with_thread<T>(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        f: impl FnOnce(&mut Thread) -> Result<T>,
    ) -> Result<T> {
        let mut thread = self
            .threads
            .get_mut(conversation_id)
            .filter(|t| t.conversation.tenant_id == tenant_id)
            .ok_or_else(|| Self::not_found(conversation_id))?;
        f(thread.value_mut())
    }

    /// Index a provider id learned after creation; an existing entry wins.
    fn index_provider_id(&self, tenant_id: &str, message: &Message) {
        if let Some(provider_id) = &message.provider_message_id {
            self.by_provider_id
                .entry((tenant_id.to_string(), provider_id.clone()))
                .or_insert_with(|| (message.conversation_id.clone(), message.id.clone()));
        }
    }

    /// Runs under the thread's shard lock. The provider index is only ever
    /// locked after a thread, never before.
    fn append_locked(&self, tenant_id: &str, thread: &mut Thread, message: Message) -> Result<Message> {
        if let Some(provider_id) = &message.provider_message_id {
            match self
                .by_provider_id
                .entry((tenant_id.to_string(), provider_id.clone()))
            {
                Entry::Occupied(_) => {
                    return Err(InboxError::Conflict {
                        entity: "message",
                        id: provider_id.clone(),
                    });
                }
                Entry::Vacant(entry) => {
                    entry.insert((message.conversation_id.clone(), message.id.clone()));
                }
            }
        }
        thread.messages.push(message.clone());
        Ok(message)
    }
}

fn mark_inbound_read(thread: &mut Thread, at: DateTime<Utc>) -> Vec<Message> {
    let mut transitioned = Vec::new();
    for message in thread
        .messages
        .iter_mut()
        .filter(|m| m.direction == Direction::Inbound)
    {
        let before = message.status();
        if message.timestamps.record(ReceiptKind::Read, at)
            && before != MessageStatus::Read
            && message.status() == MessageStatus::Read
        {
            transitioned.push(message.clone());
        }
    }
    transitioned
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn find_or_create(
        &self,
        tenant_id: &str,
        contact: Contact,
        channel: ChannelRef,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        let key = (
            tenant_id.to_string(),
            contact.id.clone(),
            channel.account_id.clone(),
        );

        match self.by_contact.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Some(thread) = self.threads.get(entry.get()) {
                    return Ok((thread.conversation.clone(), false));
                }
                // Index outlived a concurrent delete.
                let conversation = Conversation::new(tenant_id, contact, channel, now);
                entry.insert(conversation.id.clone());
                self.threads.insert(
                    conversation.id.clone(),
                    Thread {
                        conversation: conversation.clone(),
                        messages: Vec::new(),
                        notes: Vec::new(),
                    },
                );
                Ok((conversation, true))
            }
            Entry::Vacant(entry) => {
                let conversation = Conversation::new(tenant_id, contact, channel, now);
                self.threads.insert(
                    conversation.id.clone(),
                    Thread {
                        conversation: conversation.clone(),
                        messages: Vec::new(),
                        notes: Vec::new(),
                    },
                );
                entry.insert(conversation.id.clone());
                debug!(conversation_id = %conversation.id, tenant_id, "Conversation created");
                Ok((conversation, true))
            }
        }
    }

    async fn get(&self, tenant_id: &str, conversation_id: &str) -> Result<Conversation> {
        self.threads
            .get(conversation_id)
            .filter(|t| t.conversation.tenant_id == tenant_id)
            .map(|t| t.conversation.clone())
            .ok_or_else(|| Self::not_found(conversation_id))
    }

    async fn compare_and_swap(&self, mut updated: Conversation) -> Result<CasOutcome> {
        let tenant_id = updated.tenant_id.clone();
        let id = updated.id.clone();
        self.with_thread(&tenant_id, &id, |thread| {
            if thread.conversation.version != updated.version {
                debug!(
                    conversation_id = %id,
                    expected = updated.version,
                    actual = thread.conversation.version,
                    "Compare-and-swap lost"
                );
                return Ok(CasOutcome::Stale);
            }
            updated.version += 1;
            thread.conversation = updated;
            Ok(CasOutcome::Applied(thread.conversation.clone()))
        })
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<Conversation>> {
        Ok(self
            .threads
            .iter()
            .filter(|t| t.conversation.tenant_id == tenant_id)
            .map(|t| t.conversation.clone())
            .collect())
    }

    async fn delete(&self, tenant_id: &str, conversation_id: &str) -> Result<DeletedThread> {
        let (_, thread) = self
            .threads
            .remove_if(conversation_id, |_, t| t.conversation.tenant_id == tenant_id)
            .ok_or_else(|| Self::not_found(conversation_id))?;

        let conv = &thread.conversation;
        self.by_contact.remove_if(
            &(
                tenant_id.to_string(),
                conv.contact.id.clone(),
                conv.channel.account_id.clone(),
            ),
            |_, id| id == conversation_id,
        );
        for message in &thread.messages {
            if let Some(provider_id) = &message.provider_message_id {
                self.by_provider_id
                    .remove(&(tenant_id.to_string(), provider_id.clone()));
            }
        }

        Ok(DeletedThread {
            messages: thread.messages.len(),
            notes: thread.notes.len(),
            conversation: thread.conversation,
        })
    }

    async fn commit(&self, mut updated: Conversation, change: ThreadChange) -> Result<CommitOutcome> {
        let tenant_id = updated.tenant_id.clone();
        let id = updated.id.clone();
        self.with_thread(&tenant_id, &id, |thread| {
            if thread.conversation.version != updated.version {
                debug!(conversation_id = %id, "Commit lost to a concurrent write");
                return Ok(CommitOutcome::Stale);
            }

            let (appended, read) = match change {
                ThreadChange::Append(message) => {
                    if message.conversation_id != id {
                        return Err(InboxError::validation("message belongs to another conversation"));
                    }
                    (Some(self.append_locked(&tenant_id, thread, message)?), Vec::new())
                }
                ThreadChange::MarkInboundRead { at } => (None, mark_inbound_read(thread, at)),
            };

            updated.version += 1;
            thread.conversation = updated;
            Ok(CommitOutcome::Applied(Committed {
                conversation: thread.conversation.clone(),
                appended,
                read,
            }))
        })
    }

    async fn messages(&self, tenant_id: &str, conversation_id: &str) -> Result<Vec<Message>> {
        self.with_thread(tenant_id, conversation_id, |thread| {
            Ok(thread.messages.clone())
        })
    }

    async fn has_outbound(&self, tenant_id: &str, conversation_id: &str) -> Result<bool> {
        self.with_thread(tenant_id, conversation_id, |thread| {
            Ok(thread
                .messages
                .iter()
                .any(|m| m.direction == Direction::Outbound))
        })
    }

    async fn find_message_by_provider_id(
        &self,
        tenant_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<Message>> {
        let Some(location) = self
            .by_provider_id
            .get(&(tenant_id.to_string(), provider_message_id.to_string()))
            .map(|e| e.value().clone())
        else {
            return Ok(None);
        };
        let (conversation_id, message_id) = location;

        Ok(self
            .threads
            .get(&conversation_id)
            .filter(|t| t.conversation.tenant_id == tenant_id)
            .and_then(|t| t.messages.iter().find(|m| m.id == message_id).cloned()))
    }

    async fn update_message(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<MessageUpdate> {
        let update = self.with_thread(tenant_id, conversation_id, |thread| {
            let message = thread
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| InboxError::not_found("message", message_id))?;

            let previous_status = message.status();
            if let Some((kind, at)) = patch.receipt {
                message.timestamps.record(kind, at);
            }
            if message.provider_message_id.is_none() {
                message.provider_message_id = patch.provider_message_id;
            }
            if message.error.is_none() {
                message.error = patch.error;
            }

            Ok(MessageUpdate {
                previous_status,
                message: message.clone(),
            })
        })?;

        self.index_provider_id(tenant_id, &update.message);
        Ok(update)
    }

    async fn add_note(&self, tenant_id: &str, note: Note) -> Result<Note> {
        let conversation_id = note.conversation_id.clone();
        self.with_thread(tenant_id, &conversation_id, |thread| {
            thread.notes.push(note.clone());
            Ok(note)
        })
    }

    async fn notes(&self, tenant_id: &str, conversation_id: &str) -> Result<Vec<Note>> {
        self.with_thread(tenant_id, conversation_id, |thread| Ok(thread.notes.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: &str) -> Contact {
        Contact {
            id: id.to_string(),
            name: None,
            handle: format!("{}@example.com", id),
        }
    }

    fn channel() -> ChannelRef {
        ChannelRef {
            account_id: "acct-1".to_string(),
            account_type: Some("EMAIL_SMTP".to_string()),
            provider: "smtp".to_string(),
        }
    }

    async fn append(store: &InMemoryConversationStore, tenant_id: &str, message: Message) -> Result<Message> {
        let conversation = store.get(tenant_id, &message.conversation_id).await?;
        match store.commit(conversation, ThreadChange::Append(message)).await? {
            CommitOutcome::Applied(committed) => Ok(committed.appended.unwrap()),
            CommitOutcome::Stale => panic!("no concurrent writer in this test"),
        }
    }

    async fn mark_read(store: &InMemoryConversationStore, tenant_id: &str, conversation_id: &str) -> Vec<Message> {
        let mut conversation = store.get(tenant_id, conversation_id).await.unwrap();
        conversation.unread_count = 0;
        match store
            .commit(conversation, ThreadChange::MarkInboundRead { at: Utc::now() })
            .await
            .unwrap()
        {
            CommitOutcome::Applied(committed) => committed.read,
            CommitOutcome::Stale => panic!("no concurrent writer in this test"),
        }
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let store = InMemoryConversationStore::new();
        let (first, created) = store
            .find_or_create("t1", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();
        assert!(created);

        let (second, created) = store
            .find_or_create("t1", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let (other_tenant, created) = store
            .find_or_create("t2", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();
        assert!(created);
        assert_ne!(other_tenant.id, first.id);
    }

    #[tokio::test]
    async fn test_compare_and_swap_detects_stale_writes() {
        let store = InMemoryConversationStore::new();
        let (conv, _) = store
            .find_or_create("t1", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();

        let mut a = conv.clone();
        a.is_starred = true;
        let mut b = conv.clone();
        b.unread_count = 3;

        let applied = store.compare_and_swap(a).await.unwrap();
        assert!(matches!(applied, CasOutcome::Applied(ref c) if c.version == 1));
        assert_eq!(store.compare_and_swap(b).await.unwrap(), CasOutcome::Stale);

        let stored = store.get("t1", &conv.id).await.unwrap();
        assert!(stored.is_starred);
        assert_eq!(stored.unread_count, 0);
    }

    #[tokio::test]
    async fn test_cross_tenant_lookups_are_not_found() {
        let store = InMemoryConversationStore::new();
        let (conv, _) = store
            .find_or_create("t1", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();

        assert!(matches!(
            store.get("t2", &conv.id).await,
            Err(InboxError::NotFound { .. })
        ));
        assert!(store.messages("t2", &conv.id).await.is_err());
        assert!(store.delete("t2", &conv.id).await.is_err());
        assert!(store.list("t2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = InMemoryConversationStore::new();
        let (conv, _) = store
            .find_or_create("t1", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();

        let mut msg = Message::outbound(&conv.id, "text", "hello", Utc::now());
        msg.provider_message_id = Some("prov-1".into());
        append(&store, "t1", msg).await.unwrap();
        store
            .add_note("t1", Note::new(&conv.id, "agent-1", "vip", Utc::now()))
            .await
            .unwrap();

        let deleted = store.delete("t1", &conv.id).await.unwrap();
        assert_eq!(deleted.messages, 1);
        assert_eq!(deleted.notes, 1);

        assert!(store.get("t1", &conv.id).await.is_err());
        assert!(store
            .find_message_by_provider_id("t1", "prov-1")
            .await
            .unwrap()
            .is_none());
        let late = append(&store, "t1", Message::inbound(&conv.id, "text", "late", Utc::now())).await;
        assert!(matches!(late, Err(InboxError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_update_message_is_write_once() {
        let store = InMemoryConversationStore::new();
        let (conv, _) = store
            .find_or_create("t1", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();
        let msg = append(&store, "t1", Message::outbound(&conv.id, "text", "hi", Utc::now()))
            .await
            .unwrap();

        let first = Utc::now();
        let update = store
            .update_message(
                "t1",
                &conv.id,
                &msg.id,
                MessagePatch {
                    receipt: Some((ReceiptKind::Sent, first)),
                    provider_message_id: Some("prov-9".into()),
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(update.previous_status, MessageStatus::Queued);
        assert!(update.status_changed());

        let replay = store
            .update_message(
                "t1",
                &conv.id,
                &msg.id,
                MessagePatch {
                    receipt: Some((ReceiptKind::Sent, first + chrono::Duration::seconds(5))),
                    provider_message_id: Some("prov-other".into()),
                    error: None,
                },
            )
            .await
            .unwrap();
        assert!(!replay.status_changed());
        assert_eq!(replay.message.timestamps.sent_at, Some(first));
        assert_eq!(replay.message.provider_message_id.as_deref(), Some("prov-9"));

        let found = store
            .find_message_by_provider_id("t1", "prov-9")
            .await
            .unwrap();
        assert_eq!(found.map(|m| m.id), Some(msg.id));
    }

    #[tokio::test]
    async fn test_mark_inbound_read_only_reports_transitions() {
        let store = InMemoryConversationStore::new();
        let (conv, _) = store
            .find_or_create("t1", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();
        for body in ["one", "two"] {
            append(&store, "t1", Message::inbound(&conv.id, "text", body, Utc::now()))
                .await
                .unwrap();
        }
        append(&store, "t1", Message::outbound(&conv.id, "text", "reply", Utc::now()))
            .await
            .unwrap();

        let read = mark_read(&store, "t1", &conv.id).await;
        assert_eq!(read.len(), 2);

        let again = mark_read(&store, "t1", &conv.id).await;
        assert!(again.is_empty());
        assert!(store.has_outbound("t1", &conv.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_commit_writes_nothing() {
        let store = InMemoryConversationStore::new();
        let (conv, _) = store
            .find_or_create("t1", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();
        append(&store, "t1", Message::inbound(&conv.id, "text", "one", Utc::now()))
            .await
            .unwrap();

        // `conv` predates the append above.
        let outcome = store
            .commit(conv.clone(), ThreadChange::MarkInboundRead { at: Utc::now() })
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Stale);

        let messages = store.messages("t1", &conv.id).await.unwrap();
        assert!(messages[0].timestamps.read_at.is_none());

        let stale_append = store
            .commit(conv.clone(), ThreadChange::Append(Message::inbound(&conv.id, "text", "two", Utc::now())))
            .await
            .unwrap();
        assert_eq!(stale_append, CommitOutcome::Stale);
        assert_eq!(store.messages("t1", &conv.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_duplicate_provider_id() {
        let store = InMemoryConversationStore::new();
        let (conv, _) = store
            .find_or_create("t1", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();

        let mut first = Message::inbound(&conv.id, "text", "hello", Utc::now());
        first.provider_message_id = Some("wamid-1".into());
        append(&store, "t1", first.clone()).await.unwrap();

        let mut redelivered = Message::inbound(&conv.id, "text", "hello", Utc::now());
        redelivered.provider_message_id = Some("wamid-1".into());
        let before = store.get("t1", &conv.id).await.unwrap();
        let result = store.commit(before.clone(), ThreadChange::Append(redelivered)).await;
        assert!(matches!(result, Err(InboxError::Conflict { entity: "message", .. })));

        assert_eq!(store.messages("t1", &conv.id).await.unwrap().len(), 1);
        assert_eq!(store.get("t1", &conv.id).await.unwrap().version, before.version);

        // Provider ids are scoped per tenant.
        let (other, _) = store
            .find_or_create("t2", contact("c1"), channel(), Utc::now())
            .await
            .unwrap();
        let mut foreign = Message::inbound(&other.id, "text", "hello", Utc::now());
        foreign.provider_message_id = Some("wamid-1".into());
        assert!(append(&store, "t2", foreign).await.is_ok());
    }
}
