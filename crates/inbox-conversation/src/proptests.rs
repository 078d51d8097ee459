//! Property tests for status derivation and lifecycle transitions.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use crate::lifecycle::{apply, Command};
use crate::model::{ChannelRef, Contact, Conversation, ConversationStatus, Priority, Purpose};
use crate::status::{DeliveryTimestamps, MessageStatus};

fn base_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn conversation(status: ConversationStatus) -> Conversation {
    let mut conv = Conversation::new(
        "tenant",
        Contact {
            id: "contact".into(),
            name: None,
            handle: "+1555".into(),
        },
        ChannelRef {
            account_id: "acct".into(),
            account_type: Some("SMS".into()),
            provider: "twilio".into(),
        },
        base_time(),
    );
    conv.status = status;
    if status.is_terminal() {
        conv.closed_at = Some(base_time());
    }
    conv
}

fn status_strategy() -> impl Strategy<Value = ConversationStatus> {
    prop_oneof![
        Just(ConversationStatus::Open),
        Just(ConversationStatus::Pending),
        Just(ConversationStatus::Resolved),
        Just(ConversationStatus::Closed),
        Just(ConversationStatus::Snoozed),
    ]
}

fn command_strategy() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::InboundReceived {
            at: base_time(),
            preview: "hi".into()
        }),
        Just(Command::OutboundSent {
            preview: "hello".into()
        }),
        Just(Command::MarkRead),
        proptest::option::of("[a-z]{1,6}").prop_map(|user_id| Command::Assign { user_id }),
        (any::<bool>(), any::<bool>())
            .prop_map(|(force, has_reply)| Command::Resolve { force, has_reply }),
        Just(Command::Reopen),
        Just(Command::Archive),
        Just(Command::Unarchive),
        (-2i64..48).prop_map(|h| Command::Snooze {
            until: base_time() + Duration::hours(h)
        }),
        prop_oneof![
            Just(Command::ToggleStar),
            Just(Command::UpdatePurpose {
                purpose: Purpose::Support,
                sub_category: None
            }),
            Just(Command::SetPriority(Priority::Urgent)),
        ],
    ]
}

proptest! {
    #[test]
    fn derived_status_follows_precedence(
        sent in any::<bool>(),
        delivered in any::<bool>(),
        read in any::<bool>(),
        failed in any::<bool>(),
    ) {
        let at = base_time();
        let stamps = DeliveryTimestamps {
            sent_at: sent.then_some(at),
            delivered_at: delivered.then_some(at),
            read_at: read.then_some(at),
            failed_at: failed.then_some(at),
        };

        let expected = if failed {
            MessageStatus::Failed
        } else if read {
            MessageStatus::Read
        } else if delivered {
            MessageStatus::Delivered
        } else if sent {
            MessageStatus::Sent
        } else {
            MessageStatus::Queued
        };
        prop_assert_eq!(MessageStatus::derive(&stamps), expected);
    }

    #[test]
    fn resolve_without_reply_always_fails(status in status_strategy()) {
        let mut conv = conversation(status);
        let before = conv.clone();
        let result = apply(&mut conv, &Command::Resolve { force: false, has_reply: false }, base_time());
        prop_assert!(result.is_err());
        prop_assert_eq!(conv, before);
    }

    #[test]
    fn forced_resolve_always_succeeds(status in status_strategy(), has_reply in any::<bool>()) {
        let mut conv = conversation(status);
        let result = apply(&mut conv, &Command::Resolve { force: true, has_reply }, base_time());
        prop_assert!(result.is_ok());
        prop_assert_eq!(conv.status, ConversationStatus::Resolved);
    }

    #[test]
    fn inbound_reopens_only_finished_threads(status in status_strategy(), unread in 0u32..50) {
        let mut conv = conversation(status);
        conv.unread_count = unread;
        let t = apply(
            &mut conv,
            &Command::InboundReceived { at: base_time(), preview: "x".into() },
            base_time(),
        ).unwrap();

        let expected = if status.is_terminal() { ConversationStatus::Pending } else { status };
        prop_assert_eq!(t.to, expected);
        prop_assert_eq!(conv.unread_count, unread + 1);
    }

    #[test]
    fn command_sequences_keep_timestamps_consistent(
        commands in proptest::collection::vec(command_strategy(), 1..40)
    ) {
        let mut conv = conversation(ConversationStatus::Open);
        let now = base_time();

        for command in &commands {
            let before = conv.clone();
            match apply(&mut conv, command, now) {
                Ok(_) => {}
                Err(_) => prop_assert_eq!(&conv, &before),
            }

            prop_assert_eq!(conv.closed_at.is_some(), conv.status.is_terminal());
            prop_assert_eq!(conv.snoozed_until.is_some(), conv.status == ConversationStatus::Snoozed);
            if matches!(command, Command::MarkRead) {
                prop_assert_eq!(conv.unread_count, 0);
            }
            if matches!(command, Command::InboundReceived { .. }) {
                prop_assert!(!conv.status.is_terminal());
            }
        }
    }
}
