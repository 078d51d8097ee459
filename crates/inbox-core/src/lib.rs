//! Core types for the unified inbox
//!
//! Shared by the conversation and webhook crates:
//! - Error taxonomy ([`InboxError`])
//! - Domain events and the in-process event bus
//! - Application configuration
//! - Pagination

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::*;
pub use error::*;
pub use events::{Event, EventBusError, EventPublisher, EventType, InProcessEventBus};
pub use types::*;
