//! Outbound webhooks for the unified inbox
//!
//! This crate provides webhook functionality:
//! - Per-tenant webhook registry with write-once secrets
//! - HMAC-SHA256 request signing and verification
//! - Delivery with retries, attempt timeouts and per-tenant concurrency limits
//! - An append-only delivery ledger with manual retry and test deliveries
//!
//! # Example
//!
//! ```rust,ignore
//! use inbox_webhook::{
//!     DispatcherConfig, InMemoryDeliveryRepository, InMemoryWebhookRepository, NewWebhook,
//!     WebhookDispatcher, WebhookEventQueue, WebhookRegistry,
//! };
//!
//! let webhooks = Arc::new(InMemoryWebhookRepository::new());
//! let registry = WebhookRegistry::new(webhooks.clone());
//! let created = registry.create("tenant-1", new_webhook).await?;
//! println!("store this secret: {}", created.secret);
//!
//! let dispatcher = Arc::new(WebhookDispatcher::new(
//!     DispatcherConfig::default(),
//!     webhooks,
//!     Arc::new(InMemoryDeliveryRepository::default()),
//! )?);
//! let (queue, processor) = WebhookEventQueue::new(dispatcher, 1024);
//! tokio::spawn(processor.run());
//! queue.enqueue(event)?;
//! ```

pub mod bridge;
pub mod delivery;
pub mod outbound;
pub mod payload;
pub mod registry;
pub mod signature;

pub use bridge::*;
pub use delivery::*;
pub use outbound::*;
pub use payload::*;
pub use registry::*;
pub use signature::*;

use inbox_core::InboxError;
use thiserror::Error;

/// Webhook errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Webhook not found: {0}")]
    NotFound(String),

    #[error("Webhook delivery not found: {0}")]
    DeliveryNotFound(String),

    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid webhook: {0}")]
    Validation(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("Webhook disabled")]
    Disabled,

    #[error("Webhook configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<WebhookError> for InboxError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::NotFound(id) => InboxError::not_found("webhook", id),
            WebhookError::DeliveryNotFound(id) => InboxError::not_found("webhook delivery", id),
            WebhookError::InvalidUrl(_) | WebhookError::Validation(_) => {
                InboxError::Validation(err.to_string())
            }
            WebhookError::SignatureVerificationFailed(_) => InboxError::Validation(err.to_string()),
            WebhookError::DeliveryFailed(_) => InboxError::DeliveryFailure(err.to_string()),
            WebhookError::Disabled | WebhookError::Configuration(_) => {
                InboxError::Configuration(err.to_string())
            }
            WebhookError::Serialization(msg) => InboxError::Internal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, WebhookError>;
