//! Webhook registry
//!
//! Per-tenant subscription records. The secret is generated here, returned
//! once in [`CreatedWebhook`] and never again: [`WebhookView`] is the only
//! serializable shape of a stored webhook.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use inbox_core::EventType;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::signature::{generate_webhook_secret, is_reserved_header};
use crate::{Result, WebhookError};

pub const MAX_RETRIES_LIMIT: u32 = 10;
pub const MAX_RETRY_DELAY_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_seconds: 60,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay_seconds: u64) -> Self {
        Self {
            max_retries,
            retry_delay_seconds,
        }
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_delay_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(WebhookError::Validation(format!(
                "maxRetries must be at most {}",
                MAX_RETRIES_LIMIT
            )));
        }
        if self.retry_delay_seconds > MAX_RETRY_DELAY_SECONDS {
            return Err(WebhookError::Validation(format!(
                "retryDelaySeconds must be at most {}",
                MAX_RETRY_DELAY_SECONDS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    Active,
    Disabled,
}

/// Stored webhook, including its secret
#[derive(Clone)]
pub struct Webhook {
    pub id: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub url: String,
    pub secret: String,
    pub events: BTreeSet<EventType>,
    pub headers: BTreeMap<String, String>,
    pub retry_policy: RetryPolicy,
    pub status: WebhookStatus,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Webhook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Webhook")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .field("events", &self.events)
            .field("status", &self.status)
            .finish()
    }
}

impl Webhook {
    pub fn is_active(&self) -> bool {
        self.status == WebhookStatus::Active
    }

    pub fn subscribes_to(&self, event_type: EventType) -> bool {
        self.events.contains(&event_type)
    }

    pub fn view(&self) -> WebhookView {
        WebhookView {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            events: self.events.clone(),
            headers: self.headers.clone(),
            retry_policy: self.retry_policy,
            status: self.status,
            success_count: self.success_count,
            failure_count: self.failure_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Redacted webhook for read paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookView {
    pub id: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub url: String,
    pub events: BTreeSet<EventType>,
    pub headers: BTreeMap<String, String>,
    pub retry_policy: RetryPolicy,
    pub status: WebhookStatus,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation response; the only place the secret is ever returned
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedWebhook {
    #[serde(flatten)]
    pub webhook: WebhookView,
    pub secret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWebhook {
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    pub events: Vec<EventType>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

/// Partial update; the secret cannot be changed
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub events: Option<Vec<EventType>>,
    pub headers: Option<BTreeMap<String, String>>,
    pub retry_policy: Option<RetryPolicy>,
    pub status: Option<WebhookStatus>,
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url.trim()).map_err(|e| WebhookError::InvalidUrl(format!("{}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(WebhookError::InvalidUrl(format!(
            "{}: scheme must be http or https",
            url
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(WebhookError::InvalidUrl(format!("{}: missing host", url)));
    }
    Ok(())
}

fn validate_events(events: &[EventType]) -> Result<BTreeSet<EventType>> {
    if events.is_empty() {
        return Err(WebhookError::Validation(
            "at least one event type is required".to_string(),
        ));
    }
    Ok(events.iter().copied().collect())
}

/// Names are checked exactly as stored, since they are sent verbatim.
fn validate_headers(headers: &BTreeMap<String, String>) -> Result<()> {
    let mut seen = HashSet::new();
    for (name, value) in headers {
        if is_reserved_header(name) {
            return Err(WebhookError::Validation(format!(
                "header '{}' is reserved",
                name
            )));
        }
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| WebhookError::Validation(format!("invalid header name '{}'", name)))?;
        if !seen.insert(parsed) {
            return Err(WebhookError::Validation(format!(
                "header '{}' is given more than once",
                name
            )));
        }
        HeaderValue::from_str(value)
            .map_err(|_| WebhookError::Validation(format!("invalid value for header '{}'", name)))?;
    }
    Ok(())
}

/// Webhook storage
#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn insert(&self, webhook: &Webhook) -> Result<()>;

    /// Tenant-scoped lookup; other tenants' webhooks are `None`.
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Webhook>>;

    async fn list(&self, tenant_id: &str) -> Result<Vec<Webhook>>;

    async fn update(&self, webhook: &Webhook) -> Result<()>;

    async fn delete(&self, tenant_id: &str, id: &str) -> Result<bool>;

    /// Active webhooks of `tenant_id` subscribed to `event_type`
    async fn list_subscribed(&self, tenant_id: &str, event_type: EventType) -> Result<Vec<Webhook>>;

    /// Count one terminal delivery outcome. Missing webhooks are ignored.
    async fn record_outcome(&self, tenant_id: &str, id: &str, success: bool) -> Result<()>;
}

/// In-memory webhook repository
#[derive(Default)]
pub struct InMemoryWebhookRepository {
    webhooks: DashMap<String, Webhook>,
}

impl InMemoryWebhookRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookRepository for InMemoryWebhookRepository {
    async fn insert(&self, webhook: &Webhook) -> Result<()> {
        self.webhooks.insert(webhook.id.clone(), webhook.clone());
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Webhook>> {
        Ok(self
            .webhooks
            .get(id)
            .filter(|w| w.tenant_id == tenant_id)
            .map(|w| w.clone()))
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<Webhook>> {
        let mut webhooks: Vec<Webhook> = self
            .webhooks
            .iter()
            .filter(|w| w.tenant_id == tenant_id)
            .map(|w| w.clone())
            .collect();
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(webhooks)
    }

    async fn update(&self, webhook: &Webhook) -> Result<()> {
        match self.webhooks.get_mut(&webhook.id) {
            Some(mut existing) if existing.tenant_id == webhook.tenant_id => {
                // Counters are owned by record_outcome.
                let (success, failure) = (existing.success_count, existing.failure_count);
                *existing = webhook.clone();
                existing.success_count = success;
                existing.failure_count = failure;
                Ok(())
            }
            _ => Err(WebhookError::NotFound(webhook.id.clone())),
        }
    }

    async fn delete(&self, tenant_id: &str, id: &str) -> Result<bool> {
        Ok(self
            .webhooks
            .remove_if(id, |_, w| w.tenant_id == tenant_id)
            .is_some())
    }

    async fn list_subscribed(&self, tenant_id: &str, event_type: EventType) -> Result<Vec<Webhook>> {
        Ok(self
            .webhooks
            .iter()
            .filter(|w| w.tenant_id == tenant_id && w.is_active() && w.subscribes_to(event_type))
            .map(|w| w.clone())
            .collect())
    }

    async fn record_outcome(&self, tenant_id: &str, id: &str, success: bool) -> Result<()> {
        if let Some(mut webhook) = self.webhooks.get_mut(id) {
            if webhook.tenant_id == tenant_id {
                if success {
                    webhook.success_count += 1;
                } else {
                    webhook.failure_count += 1;
                }
            }
        }
        Ok(())
    }
}

/// Tenant-facing webhook management
pub struct WebhookRegistry {
    repository: Arc<dyn WebhookRepository>,
    default_retry_policy: RetryPolicy,
}

impl WebhookRegistry {
    pub fn new(repository: Arc<dyn WebhookRepository>) -> Self {
        Self {
            repository,
            default_retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    pub fn repository(&self) -> &Arc<dyn WebhookRepository> {
        &self.repository
    }

    async fn load(&self, tenant_id: &str, id: &str) -> Result<Webhook> {
        self.repository
            .get(tenant_id, id)
            .await?
            .ok_or_else(|| WebhookError::NotFound(id.to_string()))
    }

    pub async fn create(&self, tenant_id: &str, request: NewWebhook) -> Result<CreatedWebhook> {
        validate_url(&request.url)?;
        let events = validate_events(&request.events)?;
        validate_headers(&request.headers)?;
        let retry_policy = request.retry_policy.unwrap_or(self.default_retry_policy);
        retry_policy.validate()?;

        let now = Utc::now();
        let webhook = Webhook {
            id: format!("wh_{}", Uuid::new_v4().simple()),
            tenant_id: tenant_id.to_string(),
            name: request.name,
            url: request.url.trim().to_string(),
            secret: generate_webhook_secret(),
            events,
            headers: request.headers,
            retry_policy,
            status: WebhookStatus::Active,
            success_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.repository.insert(&webhook).await?;

        info!(
            webhook_id = %webhook.id,
            tenant_id,
            url = %webhook.url,
            events = webhook.events.len(),
            "Registered webhook"
        );

        Ok(CreatedWebhook {
            webhook: webhook.view(),
            secret: webhook.secret,
        })
    }

    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<WebhookView> {
        Ok(self.load(tenant_id, id).await?.view())
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<WebhookView>> {
        Ok(self
            .repository
            .list(tenant_id)
            .await?
            .iter()
            .map(Webhook::view)
            .collect())
    }

    pub async fn update(&self, tenant_id: &str, id: &str, update: WebhookUpdate) -> Result<WebhookView> {
        let mut webhook = self.load(tenant_id, id).await?;

        if let Some(url) = update.url {
            validate_url(&url)?;
            webhook.url = url.trim().to_string();
        }
        if let Some(events) = update.events {
            webhook.events = validate_events(&events)?;
        }
        if let Some(headers) = update.headers {
            validate_headers(&headers)?;
            webhook.headers = headers;
        }
        if let Some(policy) = update.retry_policy {
            policy.validate()?;
            webhook.retry_policy = policy;
        }
        if let Some(name) = update.name {
            webhook.name = Some(name);
        }
        if let Some(status) = update.status {
            webhook.status = status;
        }
        webhook.updated_at = Utc::now();

        self.repository.update(&webhook).await?;
        info!(webhook_id = %id, tenant_id, "Updated webhook");
        self.get(tenant_id, id).await
    }

    pub async fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        if !self.repository.delete(tenant_id, id).await? {
            return Err(WebhookError::NotFound(id.to_string()));
        }
        info!(webhook_id = %id, tenant_id, "Deleted webhook");
        Ok(())
    }

    pub async fn enable(&self, tenant_id: &str, id: &str) -> Result<WebhookView> {
        self.set_status(tenant_id, id, WebhookStatus::Active).await
    }

    /// Disable; an in-flight retry cycle stops before its next attempt.
    pub async fn disable(&self, tenant_id: &str, id: &str) -> Result<WebhookView> {
        self.set_status(tenant_id, id, WebhookStatus::Disabled).await
    }

    async fn set_status(&self, tenant_id: &str, id: &str, status: WebhookStatus) -> Result<WebhookView> {
        self.update(
            tenant_id,
            id,
            WebhookUpdate {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn has_subscribers(&self, tenant_id: &str, event_type: EventType) -> Result<bool> {
        Ok(!self
            .repository
            .list_subscribed(tenant_id, event_type)
            .await?
            .is_empty())
    }
}
