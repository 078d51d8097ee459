//! Error taxonomy shared by every inbox crate.

use thiserror::Error;

/// Inbox errors
///
/// `NotFound`, `Validation` and `InvalidState` are returned synchronously and are
/// never retried. `DeliveryFailure` is transient and only ever surfaces in the
/// webhook delivery history.
#[derive(Error, Debug)]
pub enum InboxError {
    /// Entity is absent or belongs to another tenant.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    InvalidState(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Optimistic update kept losing to concurrent writers.
    #[error("Concurrent modification of {entity} {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InboxError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether the operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeliveryFailure(_) | Self::Conflict { .. })
    }

    /// Stable machine-readable code for API layers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::DeliveryFailure(_) => "DELIVERY_FAILURE",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Conflict { .. } => "CONFLICT",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for InboxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, InboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = InboxError::not_found("conversation", "conv_1");
        assert_eq!(err.to_string(), "conversation not found: conv_1");
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_invalid_state_message_is_verbatim() {
        let err = InboxError::invalid_state("Cannot resolve: No reply has been sent to the customer");
        assert_eq!(
            err.to_string(),
            "Cannot resolve: No reply has been sent to the customer"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(InboxError::DeliveryFailure("timeout".into()).is_retryable());
        assert!(InboxError::Conflict {
            entity: "conversation",
            id: "c".into()
        }
        .is_retryable());
        assert!(!InboxError::validation("bad").is_retryable());
    }
}
