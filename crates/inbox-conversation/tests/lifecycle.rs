//! End-to-end conversation scenarios through the public service API.

use async_trait::async_trait;
use chrono::Utc;
use inbox_conversation::{
    Bucket, ChannelProvider, ChannelRef, Contact, ConversationFilter, ConversationStatus,
    ConversationStore, InMemoryConversationStore, InboundMessage, InboxService, OutboundMessage,
    ProviderBalance, ProviderRegistry, ReplyRequest, SendOutcome,
};
use inbox_core::{EventType, InProcessEventBus, PageRequest, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct CountingProvider {
    sent: AtomicUsize,
}

#[async_trait]
impl ChannelProvider for CountingProvider {
    async fn send(&self, _destination: &str, _message: &OutboundMessage) -> SendOutcome {
        let n = self.sent.fetch_add(1, Ordering::SeqCst);
        SendOutcome::Sent {
            provider_message_id: format!("sms-{}", n),
        }
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn balance(&self) -> Result<Option<ProviderBalance>> {
        Ok(None)
    }
}

fn inbound(body: &str) -> InboundMessage {
    InboundMessage {
        contact: Contact {
            id: "contact-42".into(),
            name: Some("Dana".into()),
            handle: "+15550142".into(),
        },
        channel: ChannelRef {
            account_id: "sms-main".into(),
            account_type: Some("SMS".into()),
            provider: "twilio".into(),
        },
        content_type: "text".into(),
        body: body.into(),
        subject: None,
        provider_message_id: None,
        received_at: None,
    }
}

struct Fixture {
    store: Arc<InMemoryConversationStore>,
    service: InboxService,
    bus: Arc<InProcessEventBus>,
}

fn fixture() -> Fixture {
    let store = Arc::new(InMemoryConversationStore::new());
    let bus = Arc::new(InProcessEventBus::new(128));
    let providers = Arc::new(ProviderRegistry::new());
    providers.register("twilio", Arc::new(CountingProvider::default()));
    Fixture {
        service: InboxService::new(store.clone(), bus.clone(), providers),
        store,
        bus,
    }
}

#[tokio::test]
async fn closed_conversation_reopens_and_resolves_after_reply() {
    let f = fixture();
    let conv = f.service.receive_inbound("acme", inbound("hi")).await.unwrap().conversation;

    // Start from CLOSED.
    let conv = f.service.archive("acme", &conv.id).await.unwrap();
    assert_eq!(conv.status, ConversationStatus::Closed);
    let conv = f.service.mark_as_read("acme", &conv.id).await.unwrap();
    assert_eq!(conv.unread_count, 0);

    let mut events = f.bus.subscribe();

    let outcome = f.service.receive_inbound("acme", inbound("still broken")).await.unwrap();
    assert_eq!(outcome.conversation.status, ConversationStatus::Pending);
    assert_eq!(outcome.conversation.unread_count, 1);

    f.service
        .send_reply(
            "acme",
            &conv.id,
            ReplyRequest {
                sender_id: "agent-7".into(),
                content_type: "text".into(),
                body: "Looking into it".into(),
                subject: None,
            },
        )
        .await
        .unwrap();
    let after_reply = f.service.get_conversation("acme", &conv.id).await.unwrap();
    assert_eq!(after_reply.status, ConversationStatus::Pending);

    let resolved = f.service.resolve("acme", &conv.id, false).await.unwrap();
    assert_eq!(resolved.status, ConversationStatus::Resolved);

    let mut status_changes = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type == EventType::ConversationStatusChanged {
            status_changes += 1;
        }
    }
    // CLOSED -> PENDING, PENDING -> RESOLVED
    assert_eq!(status_changes, 2);
}

#[tokio::test]
async fn buckets_are_views_not_statuses() {
    let f = fixture();
    let conv = f.service.receive_inbound("acme", inbound("hi")).await.unwrap().conversation;
    f.service.resolve("acme", &conv.id, true).await.unwrap();

    let archived = f
        .service
        .list_conversations("acme", &ConversationFilter::bucket(Bucket::Archived), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(archived.total, 1);

    let all = f
        .service
        .list_conversations("acme", &ConversationFilter::bucket(Bucket::All), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(all.total, 0);

    let unread = f
        .service
        .list_conversations("acme", &ConversationFilter::bucket(Bucket::Unread), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(unread.total, 1);

    let stored = f.store.get("acme", &conv.id).await.unwrap();
    assert_eq!(stored.status, ConversationStatus::Resolved);
}

#[tokio::test]
async fn snooze_survives_inbound_until_reopened() {
    let f = fixture();
    let conv = f.service.receive_inbound("acme", inbound("hi")).await.unwrap().conversation;

    let until = Utc::now() + chrono::Duration::hours(4);
    f.service.snooze("acme", &conv.id, until).await.unwrap();

    let after = f.service.receive_inbound("acme", inbound("ping")).await.unwrap().conversation;
    assert_eq!(after.status, ConversationStatus::Snoozed);
    assert_eq!(after.snoozed_until, Some(until));

    let reopened = f.service.reopen("acme", &conv.id).await.unwrap();
    assert_eq!(reopened.status, ConversationStatus::Open);
    assert!(reopened.snoozed_until.is_none());
}
