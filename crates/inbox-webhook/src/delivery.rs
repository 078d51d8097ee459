//! Webhook delivery ledger
//!
//! One append-only record per HTTP attempt, retries and manual re-sends
//! included. Records are never updated; retention cleanup deletes whole rows.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use inbox_core::{EventType, Page, PageRequest};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};
use uuid::Uuid;

use crate::Result;

/// Stored response bodies are cut to this many bytes.
pub const MAX_RESPONSE_BODY_BYTES: usize = 4 * 1024;

/// Attempt outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

/// What caused an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryTrigger {
    /// Part of an event's retry cycle
    Automatic,
    /// Operator re-send of an earlier delivery
    Manual,
    /// Configuration check; never retried or counted
    Test,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub id: String,
    pub webhook_id: String,
    pub tenant_id: String,
    pub event_id: String,
    pub event: EventType,
    /// 1-based position within its retry cycle
    pub attempt: u32,
    pub trigger: DeliveryTrigger,
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    /// Exact body that was signed and sent
    pub request_payload: String,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn new_id() -> String {
        format!("whd_{}", Uuid::new_v4().simple())
    }

    pub fn is_success(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

/// Truncate to at most `max` bytes on a char boundary.
pub fn truncate_body(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Delivery ledger storage
#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    async fn append(&self, delivery: &WebhookDelivery) -> Result<()>;

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<WebhookDelivery>>;

    /// Newest first
    async fn list_by_webhook(
        &self,
        tenant_id: &str,
        webhook_id: &str,
        page: PageRequest,
    ) -> Result<Page<WebhookDelivery>>;

    /// In insertion order
    async fn list_by_event(&self, tenant_id: &str, event_id: &str) -> Result<Vec<WebhookDelivery>>;

    /// Delete records created before `older_than`
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// In-memory delivery ledger.
///
/// Rows leave only through [`DeliveryRepository::cleanup`] unless a
/// per-webhook cap is opted into with [`Self::with_cap`].
#[derive(Default)]
pub struct InMemoryDeliveryRepository {
    deliveries: DashMap<String, WebhookDelivery>,
    by_webhook: DashMap<String, VecDeque<String>>,
    by_event: DashMap<String, Vec<String>>,
    max_per_webhook: Option<usize>,
    total_count: RwLock<usize>,
}

impl InMemoryDeliveryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max_per_webhook` rows per webhook, evicting the oldest.
    pub fn with_cap(max_per_webhook: usize) -> Self {
        Self {
            max_per_webhook: Some(max_per_webhook.max(1)),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        *self.total_count.read()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune_webhook(&self, webhook_id: &str) {
        let Some(cap) = self.max_per_webhook else {
            return;
        };
        let mut evicted = Vec::new();
        if let Some(mut ids) = self.by_webhook.get_mut(webhook_id) {
            while ids.len() > cap {
                if let Some(old_id) = ids.pop_front() {
                    evicted.push(old_id);
                }
            }
        }
        for id in evicted {
            self.remove(&id);
        }
    }

    fn remove(&self, id: &str) -> bool {
        let Some((_, delivery)) = self.deliveries.remove(id) else {
            return false;
        };
        if let Some(mut ids) = self.by_webhook.get_mut(&delivery.webhook_id) {
            ids.retain(|i| i != id);
        }
        self.by_webhook
            .remove_if(&delivery.webhook_id, |_, ids| ids.is_empty());
        if let Some(mut ids) = self.by_event.get_mut(&delivery.event_id) {
            ids.retain(|i| i != id);
        }
        self.by_event.remove_if(&delivery.event_id, |_, ids| ids.is_empty());
        let mut count = self.total_count.write();
        *count = count.saturating_sub(1);
        true
    }
}

#[async_trait]
impl DeliveryRepository for InMemoryDeliveryRepository {
    async fn append(&self, delivery: &WebhookDelivery) -> Result<()> {
        let id = delivery.id.clone();
        if self.deliveries.contains_key(&id) {
            debug!(delivery_id = %id, "Ignoring duplicate ledger append");
            return Ok(());
        }

        self.deliveries.insert(id.clone(), delivery.clone());
        self.by_webhook
            .entry(delivery.webhook_id.clone())
            .or_default()
            .push_back(id.clone());
        self.by_event
            .entry(delivery.event_id.clone())
            .or_default()
            .push(id);
        {
            let mut count = self.total_count.write();
            *count += 1;
        }

        self.prune_webhook(&delivery.webhook_id);
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<WebhookDelivery>> {
        Ok(self
            .deliveries
            .get(id)
            .filter(|d| d.tenant_id == tenant_id)
            .map(|d| d.clone()))
    }

    async fn list_by_webhook(
        &self,
        tenant_id: &str,
        webhook_id: &str,
        page: PageRequest,
    ) -> Result<Page<WebhookDelivery>> {
        let ids = self
            .by_webhook
            .get(webhook_id)
            .map(|ids| ids.iter().rev().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        let deliveries = ids
            .iter()
            .filter_map(|id| self.deliveries.get(id).map(|d| d.clone()))
            .filter(|d| d.tenant_id == tenant_id)
            .collect();

        Ok(page.apply(deliveries))
    }

    async fn list_by_event(&self, tenant_id: &str, event_id: &str) -> Result<Vec<WebhookDelivery>> {
        let ids = self
            .by_event
            .get(event_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        Ok(ids
            .iter()
            .filter_map(|id| self.deliveries.get(id).map(|d| d.clone()))
            .filter(|d| d.tenant_id == tenant_id)
            .collect())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let to_remove: Vec<_> = self
            .deliveries
            .iter()
            .filter(|d| d.created_at < older_than)
            .map(|d| d.id.clone())
            .collect();

        let removed = to_remove.iter().filter(|id| self.remove(id)).count() as u64;
        info!(removed, "Cleaned up old delivery records");
        Ok(removed)
    }
}

/// Delete ledger rows older than `retention_days`.
pub async fn cleanup_deliveries(repository: &dyn DeliveryRepository, retention_days: i64) -> Result<u64> {
    let cutoff = Utc::now() - Duration::days(retention_days.max(0));
    repository.cleanup(cutoff).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(id: &str, webhook_id: &str, status: DeliveryStatus) -> WebhookDelivery {
        WebhookDelivery {
            id: id.to_string(),
            webhook_id: webhook_id.to_string(),
            tenant_id: "t1".to_string(),
            event_id: "evt_123".to_string(),
            event: EventType::MessageReceived,
            attempt: 1,
            trigger: DeliveryTrigger::Automatic,
            status,
            status_code: Some(200),
            duration_ms: 12,
            request_payload: "{}".to_string(),
            response_body: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_query() {
        let repo = InMemoryDeliveryRepository::default();
        repo.append(&delivery("d1", "wh1", DeliveryStatus::Failed)).await.unwrap();
        repo.append(&delivery("d2", "wh1", DeliveryStatus::Delivered)).await.unwrap();

        let page = repo.list_by_webhook("t1", "wh1", PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].id, "d2");

        assert_eq!(repo.list_by_event("t1", "evt_123").await.unwrap().len(), 2);
        assert!(repo.get("t1", "d1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_append_never_overwrites() {
        let repo = InMemoryDeliveryRepository::default();
        repo.append(&delivery("d1", "wh1", DeliveryStatus::Failed)).await.unwrap();
        repo.append(&delivery("d1", "wh1", DeliveryStatus::Delivered)).await.unwrap();

        let stored = repo.get("t1", "d1").await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_tenant_scoping() {
        let repo = InMemoryDeliveryRepository::default();
        repo.append(&delivery("d1", "wh1", DeliveryStatus::Delivered)).await.unwrap();

        assert!(repo.get("t2", "d1").await.unwrap().is_none());
        assert_eq!(repo.list_by_webhook("t2", "wh1", PageRequest::default()).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_rows_are_kept_without_a_cap() {
        let repo = InMemoryDeliveryRepository::new();
        for i in 0..1500 {
            repo.append(&delivery(&format!("d{}", i), "wh1", DeliveryStatus::Delivered))
                .await
                .unwrap();
        }
        assert_eq!(repo.len(), 1500);
        assert!(repo.get("t1", "d0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_drops_empty_indexes() {
        let repo = InMemoryDeliveryRepository::new();
        let mut old = delivery("d1", "wh1", DeliveryStatus::Failed);
        old.created_at = Utc::now() - Duration::days(40);
        old.event_id = "evt_old".to_string();
        repo.append(&old).await.unwrap();
        repo.append(&delivery("d2", "wh2", DeliveryStatus::Delivered)).await.unwrap();

        assert_eq!(cleanup_deliveries(&repo, 30).await.unwrap(), 1);
        assert!(repo.by_webhook.get("wh1").is_none());
        assert!(repo.by_event.get("evt_old").is_none());
        assert!(repo.by_webhook.get("wh2").is_some());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_opt_in_per_webhook_cap() {
        let repo = InMemoryDeliveryRepository::with_cap(2);
        for i in 0..4 {
            repo.append(&delivery(&format!("d{}", i), "wh1", DeliveryStatus::Delivered))
                .await
                .unwrap();
        }
        assert_eq!(repo.len(), 2);
        assert!(repo.get("t1", "d0").await.unwrap().is_none());
        assert!(repo.get("t1", "d3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup() {
        let repo = InMemoryDeliveryRepository::default();

        let mut old = delivery("d_old", "wh1", DeliveryStatus::Delivered);
        old.created_at = Utc::now() - Duration::days(60);
        repo.append(&old).await.unwrap();
        repo.append(&delivery("d_new", "wh1", DeliveryStatus::Delivered)).await.unwrap();

        let removed = cleanup_deliveries(&repo, 30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get("t1", "d_old").await.unwrap().is_none());
        assert!(repo.get("t1", "d_new").await.unwrap().is_some());
        assert_eq!(repo.list_by_event("t1", "evt_123").await.unwrap().len(), 1);
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short", 10), "short");
        assert_eq!(truncate_body(&"a".repeat(5000), MAX_RESPONSE_BODY_BYTES).len(), 4096);

        // 'é' is two bytes; never split it
        let s = "é".repeat(3);
        assert_eq!(truncate_body(&s, 3), "é");
    }
}
