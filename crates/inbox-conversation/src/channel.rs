//! Channel plumbing: display normalization, provider capabilities and the
//! account linking flow.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use inbox_core::{InboxError, Result};
use inbox_infra::LinkStateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Map a raw channel-account type to its coarse display type.
///
/// Email subtypes collapse to `email`, missing types become `unknown` and
/// anything else is lower-cased.
pub fn normalize_channel_type(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        None | Some("") => "unknown".to_string(),
        Some(raw) => {
            let upper = raw.to_ascii_uppercase();
            if upper == "EMAIL" || upper.starts_with("EMAIL_") {
                "email".to_string()
            } else {
                raw.to_ascii_lowercase()
            }
        }
    }
}

/// Payload handed to a provider for one outbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub content_type: String,
    pub body: String,
    #[serde(default)]
    pub subject: Option<String>,
}

/// Result of a provider send call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { provider_message_id: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderBalance {
    pub amount: f64,
    pub currency: String,
}

/// Capabilities every channel provider exposes.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Send one message. Provider errors are reported as `Failed`, not `Err`.
    async fn send(&self, destination: &str, message: &OutboundMessage) -> SendOutcome;

    /// Verify credentials and reachability.
    async fn test_connection(&self) -> Result<()>;

    /// Remaining credit, for providers that bill per message.
    async fn balance(&self) -> Result<Option<ProviderBalance>>;
}

/// Providers keyed by id (`gupshup`, `twilio`, `resend`, ...)
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn ChannelProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<String>, provider: Arc<dyn ChannelProvider>) {
        let id = id.into();
        info!(provider = %id, "Registered channel provider");
        self.providers.insert(id, provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChannelProvider>> {
        self.providers.get(id).map(|p| Arc::clone(p.value()))
    }

    /// Like [`get`](Self::get) but fails with a configuration error.
    pub fn require(&self, id: &str) -> Result<Arc<dyn ChannelProvider>> {
        self.get(id).ok_or_else(|| {
            InboxError::Configuration(format!("no channel provider registered for '{}'", id))
        })
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// State carried between the start and the callback of a linking flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingLink {
    pub tenant_id: String,
    pub provider: String,
    pub account_type: Option<String>,
    pub initiated_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Two-step channel account linking backed by a [`LinkStateStore`].
pub struct ChannelLinker {
    store: Arc<dyn LinkStateStore>,
    ttl: Duration,
}

impl ChannelLinker {
    pub fn new(store: Arc<dyn LinkStateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Start a flow and return the opaque state token for the callback URL.
    pub async fn begin_link(
        &self,
        tenant_id: &str,
        provider: &str,
        account_type: Option<&str>,
        initiated_by: Option<&str>,
    ) -> Result<String> {
        if provider.trim().is_empty() {
            return Err(InboxError::validation("provider is required"));
        }
        let pending = PendingLink {
            tenant_id: tenant_id.to_string(),
            provider: provider.to_string(),
            account_type: account_type.map(str::to_string),
            initiated_by: initiated_by.map(str::to_string),
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&pending)?;
        let token = self
            .store
            .put(value, self.ttl)
            .await
            .map_err(|e| InboxError::Storage(e.to_string()))?;

        debug!(tenant_id, provider, "Channel link started");
        Ok(token)
    }

    /// Finish a flow. The token is consumed whether or not the tenant matches.
    pub async fn complete_link(&self, tenant_id: &str, token: &str) -> Result<PendingLink> {
        let value = self
            .store
            .take(token)
            .await
            .map_err(|e| InboxError::Storage(e.to_string()))?
            .ok_or_else(|| InboxError::not_found("link state", "token"))?;

        let pending: PendingLink = serde_json::from_value(value)?;
        if pending.tenant_id != tenant_id {
            return Err(InboxError::not_found("link state", "token"));
        }

        info!(tenant_id, provider = %pending.provider, "Channel link completed");
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbox_infra::InMemoryLinkStateStore;

    struct EchoProvider;

    #[async_trait]
    impl ChannelProvider for EchoProvider {
        async fn send(&self, destination: &str, _message: &OutboundMessage) -> SendOutcome {
            SendOutcome::Sent {
                provider_message_id: format!("echo-{}", destination),
            }
        }

        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }

        async fn balance(&self) -> Result<Option<ProviderBalance>> {
            Ok(None)
        }
    }

    #[test]
    fn test_normalize_channel_type() {
        assert_eq!(normalize_channel_type(Some("EMAIL_GMAIL")), "email");
        assert_eq!(normalize_channel_type(Some("EMAIL_MICROSOFT")), "email");
        assert_eq!(normalize_channel_type(Some("EMAIL_SMTP")), "email");
        assert_eq!(normalize_channel_type(Some("EMAIL")), "email");
        assert_eq!(normalize_channel_type(Some("WHATSAPP")), "whatsapp");
        assert_eq!(normalize_channel_type(Some("Voice")), "voice");
        assert_eq!(normalize_channel_type(None), "unknown");
        assert_eq!(normalize_channel_type(Some("")), "unknown");
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = ProviderRegistry::new();
        registry.register("echo", Arc::new(EchoProvider));

        let provider = registry.require("echo").unwrap();
        let outcome = provider
            .send(
                "+1555",
                &OutboundMessage {
                    content_type: "text".into(),
                    body: "hi".into(),
                    subject: None,
                },
            )
            .await;
        assert_eq!(
            outcome,
            SendOutcome::Sent {
                provider_message_id: "echo-+1555".into()
            }
        );

        let missing = registry.require("twilio");
        assert!(matches!(missing, Err(InboxError::Configuration(_))));
        assert_eq!(registry.ids(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_link_flow_is_single_use() {
        let linker = ChannelLinker::new(
            Arc::new(InMemoryLinkStateStore::new()),
            Duration::from_secs(60),
        );

        let token = linker
            .begin_link("tenant-1", "gmail", Some("EMAIL_GMAIL"), Some("user-1"))
            .await
            .unwrap();
        let pending = linker.complete_link("tenant-1", &token).await.unwrap();
        assert_eq!(pending.provider, "gmail");

        let again = linker.complete_link("tenant-1", &token).await;
        assert!(matches!(again, Err(InboxError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_link_flow_rejects_other_tenant() {
        let linker = ChannelLinker::new(
            Arc::new(InMemoryLinkStateStore::new()),
            Duration::from_secs(60),
        );
        let token = linker
            .begin_link("tenant-a", "outlook", None, None)
            .await
            .unwrap();

        let result = linker.complete_link("tenant-b", &token).await;
        assert!(matches!(result, Err(InboxError::NotFound { .. })));
    }
}
