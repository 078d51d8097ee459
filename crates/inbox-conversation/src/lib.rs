//! Conversations for the unified inbox
//!
//! This crate provides:
//! - Conversation, message and note records
//! - Message delivery status derivation
//! - Pure lifecycle transitions with compare-and-swap application
//! - Tenant-scoped storage and listing filters
//! - Channel provider capabilities and account linking

pub mod channel;
pub mod lifecycle;
pub mod model;
pub mod query;
pub mod service;
pub mod status;
pub mod store;

#[cfg(test)]
mod proptests;

pub use channel::{
    normalize_channel_type, ChannelLinker, ChannelProvider, OutboundMessage, PendingLink,
    ProviderBalance, ProviderRegistry, SendOutcome,
};
pub use lifecycle::{Command, Transition};
pub use model::{
    ChannelRef, Contact, Conversation, ConversationStatus, Direction, Message, Note, Priority,
    Purpose,
};
pub use query::{Bucket, ConversationFilter};
pub use service::{InboundMessage, InboundOutcome, InboxService, ReplyRequest};
pub use status::{DeliveryReceipt, DeliveryTimestamps, MessageStatus, ReceiptKind};
pub use store::{
    CasOutcome, CommitOutcome, Committed, ConversationStore, DeletedThread,
    InMemoryConversationStore, MessagePatch, MessageUpdate, ThreadChange,
};
