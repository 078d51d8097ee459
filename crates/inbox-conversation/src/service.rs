//! Tenant-scoped inbox operations.
//!
//! Every state change loads the conversation, runs the pure transition in
//! [`crate::lifecycle`] and writes back with compare-and-swap. A lost race
//! re-reads and re-applies, so a concurrent inbound message and agent action
//! both land. Appending a message and marking a thread read are committed in
//! the same write as the counter change they cause.
//!
//! Event publication is fire-and-forget: a failing publisher is logged and the
//! business operation still succeeds.

use chrono::{DateTime, Utc};
use inbox_core::{Event, EventPublisher, EventType, InboxError, Page, PageRequest, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{OutboundMessage, ProviderBalance, ProviderRegistry, SendOutcome};
use crate::lifecycle::{self, Command};
use crate::model::{ChannelRef, Contact, Conversation, Message, Note, Priority, Purpose};
use crate::query::ConversationFilter;
use crate::status::{DeliveryReceipt, DeliveryTimestamps, MessageStatus, ReceiptKind};
use crate::store::{
    CasOutcome, CommitOutcome, Committed, ConversationStore, DeletedThread, MessagePatch, MessageUpdate,
    ThreadChange,
};

/// Attempts before a contended transition gives up with `Conflict`.
pub const MAX_CAS_ATTEMPTS: usize = 16;

/// Normalized inbound message produced by a channel adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub contact: Contact,
    pub channel: ChannelRef,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub body: String,
    #[serde(default)]
    pub subject: Option<String>,
    /// Provider id; repeated deliveries of the same id are ignored
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

fn default_content_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundOutcome {
    pub conversation: Conversation,
    pub message: Message,
    pub created: bool,
    /// The provider id was already recorded; nothing changed
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRequest {
    pub sender_id: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub body: String,
    #[serde(default)]
    pub subject: Option<String>,
}

struct Applied {
    previous: Conversation,
    current: Conversation,
    appended: Option<Message>,
    read: Vec<Message>,
}

pub struct InboxService {
    store: Arc<dyn ConversationStore>,
    events: Arc<dyn EventPublisher>,
    providers: Arc<ProviderRegistry>,
}

impl InboxService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        events: Arc<dyn EventPublisher>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            store,
            events,
            providers,
        }
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.events.publish(&event).await {
            warn!(
                event_type = %event.event_type,
                tenant_id = %event.tenant_id,
                event_id = %event.id,
                error = %e,
                "Event publication failed; continuing"
            );
        }
    }

    async fn transition(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        command: Command,
    ) -> Result<Applied> {
        self.transition_with(tenant_id, conversation_id, command, None).await
    }

    /// Apply `command`, plus `change` to the thread, atomically and emit
    /// `conversation.status_changed` when the status moved.
    async fn transition_with(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        command: Command,
        change: Option<ThreadChange>,
    ) -> Result<Applied> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let previous = self.store.get(tenant_id, conversation_id).await?;
            let mut next = previous.clone();
            let now = Utc::now();
            let transition = lifecycle::apply(&mut next, &command, now)?;

            let outcome = match &change {
                None => match self.store.compare_and_swap(next).await? {
                    CasOutcome::Applied(conversation) => CommitOutcome::Applied(Committed {
                        conversation,
                        appended: None,
                        read: Vec::new(),
                    }),
                    CasOutcome::Stale => CommitOutcome::Stale,
                },
                Some(change) => self.store.commit(next, change.clone()).await?,
            };

            match outcome {
                CommitOutcome::Applied(committed) => {
                    let current = committed.conversation;
                    if transition.status_changed() {
                        info!(
                            conversation_id,
                            tenant_id,
                            from = %transition.from,
                            to = %transition.to,
                            command = command.name(),
                            "Conversation status changed"
                        );
                        self.publish(
                            Event::new(
                                EventType::ConversationStatusChanged,
                                tenant_id,
                                json!({
                                    "conversationId": conversation_id,
                                    "previousStatus": transition.from,
                                    "status": transition.to,
                                    "trigger": command.name(),
                                    "assignedToId": current.assigned_to_id,
                                }),
                            )
                            .with_timestamp(now),
                        )
                        .await;
                    }
                    return Ok(Applied {
                        previous,
                        current,
                        appended: committed.appended,
                        read: committed.read,
                    });
                }
                CommitOutcome::Stale => {
                    debug!(conversation_id, attempt, command = command.name(), "Retrying contended transition");
                }
            }
        }

        warn!(conversation_id, tenant_id, command = command.name(), "Transition abandoned after contention");
        Err(InboxError::Conflict {
            entity: "conversation",
            id: conversation_id.to_string(),
        })
    }

    async fn publish_message_status(&self, tenant_id: &str, update: &MessageUpdate) {
        let message = &update.message;
        self.publish(Event::new(
            EventType::MessageStatusChanged,
            tenant_id,
            json!({
                "conversationId": message.conversation_id,
                "messageId": message.id,
                "direction": message.direction,
                "providerMessageId": message.provider_message_id,
                "previousStatus": update.previous_status,
                "status": message.status(),
                "error": message.error,
            }),
        ))
        .await;
    }

    /// Record an inbound message, creating the conversation on first contact.
    pub async fn receive_inbound(
        &self,
        tenant_id: &str,
        inbound: InboundMessage,
    ) -> Result<InboundOutcome> {
        if inbound.contact.id.trim().is_empty() {
            return Err(InboxError::validation("contact id is required"));
        }
        if inbound.channel.account_id.trim().is_empty() {
            return Err(InboxError::validation("channel account id is required"));
        }

        if let Some(provider_id) = inbound.provider_message_id.as_deref() {
            if let Some(duplicate) = self.duplicate_inbound(tenant_id, provider_id).await? {
                return Ok(duplicate);
            }
        }

        let now = Utc::now();
        let received_at = inbound.received_at.unwrap_or(now);
        let (conversation, created) = self
            .store
            .find_or_create(tenant_id, inbound.contact, inbound.channel, now)
            .await?;

        if created {
            info!(conversation_id = %conversation.id, tenant_id, "Conversation opened by first inbound message");
            self.publish(Event::new(
                EventType::ConversationCreated,
                tenant_id,
                json!({
                    "conversationId": conversation.id,
                    "contactId": conversation.contact.id,
                    "channelType": conversation.channel_type(),
                    "status": conversation.status,
                }),
            ))
            .await;
        }

        if inbound.subject.is_some() && conversation.subject.is_none() {
            self.set_subject(tenant_id, &conversation.id, inbound.subject).await?;
        }

        let mut message = Message::inbound(&conversation.id, &inbound.content_type, &inbound.body, received_at);
        message.provider_message_id = inbound.provider_message_id.clone();
        let preview = message.preview();

        let applied = match self
            .transition_with(
                tenant_id,
                &conversation.id,
                Command::InboundReceived { at: received_at, preview },
                Some(ThreadChange::Append(message.clone())),
            )
            .await
        {
            Ok(applied) => applied,
            // A concurrent redelivery of the same provider id won.
            Err(InboxError::Conflict { entity: "message", id }) => {
                return self
                    .duplicate_inbound(tenant_id, &id)
                    .await?
                    .ok_or_else(|| InboxError::not_found("message", id));
            }
            Err(e) => return Err(e),
        };
        let message = applied.appended.unwrap_or(message);

        self.publish(
            Event::new(
                EventType::MessageReceived,
                tenant_id,
                json!({
                    "conversationId": conversation.id,
                    "messageId": message.id,
                    "contentType": message.content_type,
                    "body": message.body,
                    "providerMessageId": message.provider_message_id,
                    "channelType": applied.current.channel_type(),
                }),
            )
            .with_timestamp(received_at),
        )
        .await;

        Ok(InboundOutcome {
            conversation: applied.current,
            message,
            created,
            duplicate: false,
        })
    }

    async fn duplicate_inbound(&self, tenant_id: &str, provider_id: &str) -> Result<Option<InboundOutcome>> {
        let Some(existing) = self
            .store
            .find_message_by_provider_id(tenant_id, provider_id)
            .await?
        else {
            return Ok(None);
        };
        debug!(tenant_id, provider_message_id = provider_id, "Duplicate inbound message ignored");
        let conversation = self.store.get(tenant_id, &existing.conversation_id).await?;
        Ok(Some(InboundOutcome {
            conversation,
            message: existing,
            created: false,
            duplicate: true,
        }))
    }

    async fn set_subject(&self, tenant_id: &str, conversation_id: &str, subject: Option<String>) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut conv = self.store.get(tenant_id, conversation_id).await?;
            if conv.subject.is_some() {
                return Ok(());
            }
            conv.subject = subject.clone();
            if let CasOutcome::Applied(_) = self.store.compare_and_swap(conv).await? {
                return Ok(());
            }
        }
        Err(InboxError::Conflict {
            entity: "conversation",
            id: conversation_id.to_string(),
        })
    }

    /// Send an agent reply through the conversation's provider.
    ///
    /// A provider-side failure is recorded on the message (`FAILED`) rather
    /// than returned as an error.
    pub async fn send_reply(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        reply: ReplyRequest,
    ) -> Result<Message> {
        if reply.body.trim().is_empty() {
            return Err(InboxError::validation("reply body is empty"));
        }
        let conversation = self.store.get(tenant_id, conversation_id).await?;
        let provider = self.providers.require(&conversation.channel.provider)?;

        let mut message = Message::outbound(conversation_id, &reply.content_type, &reply.body, Utc::now());
        message.sender_id = Some(reply.sender_id.clone());
        let preview = message.preview();
        let applied = self
            .transition_with(
                tenant_id,
                conversation_id,
                Command::OutboundSent { preview },
                Some(ThreadChange::Append(message.clone())),
            )
            .await?;
        let message = applied.appended.unwrap_or(message);

        let outcome = provider
            .send(
                &conversation.contact.handle,
                &OutboundMessage {
                    content_type: reply.content_type,
                    body: reply.body,
                    subject: reply.subject.or(conversation.subject),
                },
            )
            .await;

        let now = Utc::now();
        let patch = match outcome {
            SendOutcome::Sent { provider_message_id } => MessagePatch {
                receipt: Some((ReceiptKind::Sent, now)),
                provider_message_id: Some(provider_message_id),
                error: None,
            },
            SendOutcome::Failed { reason } => {
                warn!(conversation_id, tenant_id, provider = %conversation.channel.provider, reason = %reason, "Provider send failed");
                MessagePatch {
                    receipt: Some((ReceiptKind::Failed, now)),
                    provider_message_id: None,
                    error: Some(reason),
                }
            }
        };
        let update = self
            .store
            .update_message(tenant_id, conversation_id, &message.id, patch)
            .await?;

        self.publish(Event::new(
            EventType::MessageSent,
            tenant_id,
            json!({
                "conversationId": conversation_id,
                "messageId": update.message.id,
                "senderId": update.message.sender_id,
                "contentType": update.message.content_type,
                "body": update.message.body,
            }),
        ))
        .await;
        if update.status_changed() {
            self.publish_message_status(tenant_id, &update).await;
        }

        Ok(update.message)
    }

    /// Apply an asynchronous provider callback. Replays leave the message
    /// unchanged and emit nothing.
    pub async fn apply_delivery_receipt(
        &self,
        tenant_id: &str,
        receipt: DeliveryReceipt,
    ) -> Result<Message> {
        let message = self
            .store
            .find_message_by_provider_id(tenant_id, &receipt.provider_message_id)
            .await?
            .ok_or_else(|| InboxError::not_found("message", receipt.provider_message_id.clone()))?;

        let error = match receipt.kind {
            ReceiptKind::Failed => receipt.error,
            _ => None,
        };
        let update = self
            .store
            .update_message(
                tenant_id,
                &message.conversation_id,
                &message.id,
                MessagePatch {
                    receipt: Some((receipt.kind, receipt.at)),
                    provider_message_id: None,
                    error,
                },
            )
            .await?;

        if update.status_changed() {
            debug!(
                message_id = %update.message.id,
                from = %update.previous_status,
                to = %update.message.status(),
                "Message status changed"
            );
            self.publish_message_status(tenant_id, &update).await;
        }
        Ok(update.message)
    }

    pub async fn get_conversation(&self, tenant_id: &str, conversation_id: &str) -> Result<Conversation> {
        self.store.get(tenant_id, conversation_id).await
    }

    pub async fn list_conversations(
        &self,
        tenant_id: &str,
        filter: &ConversationFilter,
        page: PageRequest,
    ) -> Result<Page<Conversation>> {
        let all = self.store.list(tenant_id).await?;
        Ok(filter.apply(all, page))
    }

    pub async fn messages(&self, tenant_id: &str, conversation_id: &str) -> Result<Vec<Message>> {
        self.store.messages(tenant_id, conversation_id).await
    }

    /// Mark inbound messages read and reset the unread count.
    ///
    /// Emits one `message.status_changed` per message that became `READ`, so a
    /// repeated call emits nothing.
    pub async fn mark_as_read(&self, tenant_id: &str, conversation_id: &str) -> Result<Conversation> {
        let applied = self
            .transition_with(
                tenant_id,
                conversation_id,
                Command::MarkRead,
                Some(ThreadChange::MarkInboundRead { at: Utc::now() }),
            )
            .await?;

        for message in applied.read {
            self.publish_message_status(
                tenant_id,
                &MessageUpdate {
                    previous_status: MessageStatus::derive(&DeliveryTimestamps {
                        read_at: None,
                        ..message.timestamps
                    }),
                    message,
                },
            )
            .await;
        }
        Ok(applied.current)
    }

    /// Set or clear (`None` / `"unassign"`) the assignee.
    pub async fn assign(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        user_id: Option<&str>,
    ) -> Result<Conversation> {
        let applied = self
            .transition(
                tenant_id,
                conversation_id,
                Command::Assign {
                    user_id: user_id.map(str::to_string),
                },
            )
            .await?;

        if applied.previous.assigned_to_id != applied.current.assigned_to_id {
            info!(conversation_id, tenant_id, assigned_to = ?applied.current.assigned_to_id, "Conversation assigned");
            self.publish(Event::new(
                EventType::ConversationAssigned,
                tenant_id,
                json!({
                    "conversationId": conversation_id,
                    "previousAssignedToId": applied.previous.assigned_to_id,
                    "assignedToId": applied.current.assigned_to_id,
                }),
            ))
            .await;
        }
        Ok(applied.current)
    }

    /// Resolve; fails with `InvalidState` when no reply was sent unless `force`.
    pub async fn resolve(&self, tenant_id: &str, conversation_id: &str, force: bool) -> Result<Conversation> {
        let has_reply = self.store.has_outbound(tenant_id, conversation_id).await?;
        self.transition(tenant_id, conversation_id, Command::Resolve { force, has_reply })
            .await
            .map(|a| a.current)
    }

    pub async fn reopen(&self, tenant_id: &str, conversation_id: &str) -> Result<Conversation> {
        self.apply(tenant_id, conversation_id, Command::Reopen).await
    }

    pub async fn archive(&self, tenant_id: &str, conversation_id: &str) -> Result<Conversation> {
        self.apply(tenant_id, conversation_id, Command::Archive).await
    }

    pub async fn unarchive(&self, tenant_id: &str, conversation_id: &str) -> Result<Conversation> {
        self.apply(tenant_id, conversation_id, Command::Unarchive).await
    }

    pub async fn snooze(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        until: DateTime<Utc>,
    ) -> Result<Conversation> {
        self.apply(tenant_id, conversation_id, Command::Snooze { until }).await
    }

    pub async fn toggle_star(&self, tenant_id: &str, conversation_id: &str) -> Result<Conversation> {
        self.apply(tenant_id, conversation_id, Command::ToggleStar).await
    }

    pub async fn update_purpose(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        purpose: Purpose,
        sub_category: Option<String>,
    ) -> Result<Conversation> {
        self.apply(
            tenant_id,
            conversation_id,
            Command::UpdatePurpose {
                purpose,
                sub_category,
            },
        )
        .await
    }

    pub async fn set_tags(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        tags: BTreeSet<String>,
    ) -> Result<Conversation> {
        self.apply(tenant_id, conversation_id, Command::SetTags(tags)).await
    }

    pub async fn set_priority(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        priority: Priority,
    ) -> Result<Conversation> {
        self.apply(tenant_id, conversation_id, Command::SetPriority(priority))
            .await
    }

    async fn apply(&self, tenant_id: &str, conversation_id: &str, command: Command) -> Result<Conversation> {
        self.transition(tenant_id, conversation_id, command)
            .await
            .map(|a| a.current)
    }

    pub async fn add_note(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        author_id: &str,
        body: &str,
    ) -> Result<Note> {
        if body.trim().is_empty() {
            return Err(InboxError::validation("note body is empty"));
        }
        self.store
            .add_note(tenant_id, Note::new(conversation_id, author_id, body.trim(), Utc::now()))
            .await
    }

    pub async fn notes(&self, tenant_id: &str, conversation_id: &str) -> Result<Vec<Note>> {
        self.store.notes(tenant_id, conversation_id).await
    }

    /// Hard delete with cascade to messages and notes.
    pub async fn delete(&self, tenant_id: &str, conversation_id: &str) -> Result<DeletedThread> {
        let deleted = self.store.delete(tenant_id, conversation_id).await?;
        info!(
            conversation_id,
            tenant_id,
            messages = deleted.messages,
            notes = deleted.notes,
            "Conversation deleted"
        );
        self.publish(Event::new(
            EventType::ConversationDeleted,
            tenant_id,
            json!({ "conversationId": conversation_id }),
        ))
        .await;
        Ok(deleted)
    }

    pub async fn test_provider(&self, provider_id: &str) -> Result<()> {
        self.providers.require(provider_id)?.test_connection().await
    }

    pub async fn provider_balance(&self, provider_id: &str) -> Result<Option<ProviderBalance>> {
        self.providers.require(provider_id)?.balance().await
    }
}
