//! Outbound webhook delivery
//!
//! Sends signed events to tenant endpoints with retry support. Each HTTP
//! attempt holds a permit from the tenant's bulkhead, so one tenant's slow
//! endpoint cannot use up another tenant's delivery capacity. The permit is
//! released before the inter-retry sleep.

use chrono::Utc;
use futures::future::join_all;
use inbox_core::{Event, EventType, Page, PageRequest, WebhookSettings};
use inbox_infra::{BulkheadConfig, BulkheadPool};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::delivery::{
    truncate_body, DeliveryRepository, DeliveryStatus, DeliveryTrigger, WebhookDelivery,
    MAX_RESPONSE_BODY_BYTES,
};
use crate::payload::{test_event, WebhookPayload};
use crate::registry::{Webhook, WebhookRepository};
use crate::signature::{
    is_reserved_header, WebhookSigner, EVENT_ID_HEADER, EVENT_TYPE_HEADER, SIGNATURE_HEADER,
};
use crate::{Result, WebhookError};

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Hard limit for one HTTP attempt, distinct from the retry delay
    pub attempt_timeout: Duration,
    pub max_concurrent_per_tenant: usize,
    /// Retry cycles [`WebhookEventProcessor`] runs at once
    pub max_in_flight_cycles: usize,
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            max_concurrent_per_tenant: 4,
            max_in_flight_cycles: 64,
            user_agent: "Inbox-Webhook/1.0".to_string(),
        }
    }
}

impl From<&WebhookSettings> for DispatcherConfig {
    fn from(settings: &WebhookSettings) -> Self {
        Self {
            attempt_timeout: settings.attempt_timeout(),
            max_concurrent_per_tenant: settings.max_concurrent_per_tenant,
            max_in_flight_cycles: settings.max_in_flight_cycles,
            user_agent: settings.user_agent.clone(),
        }
    }
}

/// How a retry cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Delivered { attempts: u32 },
    /// Retries exhausted; counted as one failure
    Failed { attempts: u32 },
    /// Webhook disabled or deleted mid-cycle; not counted
    Abandoned { attempts: u32 },
}

impl CycleOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts } | Self::Failed { attempts } | Self::Abandoned { attempts } => {
                *attempts
            }
        }
    }
}

/// Webhook dispatcher for sending events to endpoints
pub struct WebhookDispatcher {
    client: Client,
    webhooks: Arc<dyn WebhookRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    bulkheads: BulkheadPool,
    config: DispatcherConfig,
}

impl WebhookDispatcher {
    pub fn new(
        config: DispatcherConfig,
        webhooks: Arc<dyn WebhookRepository>,
        deliveries: Arc<dyn DeliveryRepository>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.attempt_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| WebhookError::Configuration(format!("HTTP client: {}", e)))?;

        let bulkheads = BulkheadPool::new(
            BulkheadConfig::new("webhooks", config.max_concurrent_per_tenant).without_max_wait(),
        );

        Ok(Self {
            client,
            webhooks,
            deliveries,
            bulkheads,
            config,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn deliveries(&self) -> &Arc<dyn DeliveryRepository> {
        &self.deliveries
    }

    /// Deliver `event` to every active webhook of its tenant subscribed to it.
    pub async fn dispatch(&self, event: &Event) -> Result<Vec<CycleOutcome>> {
        let webhooks = self
            .webhooks
            .list_subscribed(&event.tenant_id, event.event_type)
            .await?;
        if webhooks.is_empty() {
            debug!(event_id = %event.id, event_type = %event.event_type, "No subscribed webhooks");
            return Ok(Vec::new());
        }

        let cycles = webhooks
            .into_iter()
            .map(|webhook| self.deliver_with_retries(webhook, event));
        Ok(join_all(cycles).await)
    }

    /// Run one event's retry cycle against one webhook.
    ///
    /// Every attempt appends one ledger row. Before each retry the webhook is
    /// re-read; if it was disabled or deleted the cycle stops.
    pub async fn deliver_with_retries(&self, webhook: Webhook, event: &Event) -> CycleOutcome {
        let body = match WebhookPayload::from_event(event).to_body() {
            Ok(body) => body,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Failed to serialize webhook payload");
                return CycleOutcome::Abandoned { attempts: 0 };
            }
        };

        let mut webhook = webhook;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let record = self
                .attempt(&webhook, &event.id, event.event_type, &body, attempt, DeliveryTrigger::Automatic)
                .await;

            if record.is_success() {
                self.count_outcome(&webhook, true).await;
                info!(
                    webhook_id = %webhook.id,
                    event_id = %event.id,
                    attempts = attempt,
                    "Webhook delivered"
                );
                return CycleOutcome::Delivered { attempts: attempt };
            }

            if attempt > webhook.retry_policy.max_retries {
                self.count_outcome(&webhook, false).await;
                error!(
                    webhook_id = %webhook.id,
                    tenant_id = %webhook.tenant_id,
                    event_id = %event.id,
                    attempts = attempt,
                    "Webhook delivery failed after all retries"
                );
                return CycleOutcome::Failed { attempts: attempt };
            }

            let delay = webhook.retry_policy.retry_delay();
            debug!(
                webhook_id = %webhook.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Waiting before retry"
            );
            tokio::time::sleep(delay).await;

            match self.webhooks.get(&webhook.tenant_id, &webhook.id).await {
                Ok(Some(current)) if current.is_active() => webhook = current,
                Ok(_) => {
                    info!(
                        webhook_id = %webhook.id,
                        event_id = %event.id,
                        attempts = attempt,
                        "Webhook disabled or deleted; retries cancelled"
                    );
                    return CycleOutcome::Abandoned { attempts: attempt };
                }
                Err(e) => {
                    warn!(webhook_id = %webhook.id, error = %e, "Could not reload webhook; retries cancelled");
                    return CycleOutcome::Abandoned { attempts: attempt };
                }
            }
        }
    }

    async fn count_outcome(&self, webhook: &Webhook, success: bool) {
        if let Err(e) = self
            .webhooks
            .record_outcome(&webhook.tenant_id, &webhook.id, success)
            .await
        {
            warn!(webhook_id = %webhook.id, error = %e, "Failed to update webhook counters");
        }
    }

    /// One signed HTTP attempt; always yields a ledger row.
    async fn attempt(
        &self,
        webhook: &Webhook,
        event_id: &str,
        event_type: EventType,
        body: &str,
        attempt: u32,
        trigger: DeliveryTrigger,
    ) -> WebhookDelivery {
        let mut record = WebhookDelivery {
            id: WebhookDelivery::new_id(),
            webhook_id: webhook.id.clone(),
            tenant_id: webhook.tenant_id.clone(),
            event_id: event_id.to_string(),
            event: event_type,
            attempt,
            trigger,
            status: DeliveryStatus::Failed,
            status_code: None,
            duration_ms: 0,
            request_payload: body.to_string(),
            response_body: None,
            error: None,
            created_at: Utc::now(),
        };

        match WebhookSigner::new(&webhook.secret).sign(body.as_bytes()) {
            Ok(signature) => self.send(webhook, event_id, event_type, body, &signature, &mut record).await,
            Err(e) => record.error = Some(e.to_string()),
        }

        if let Err(e) = self.deliveries.append(&record).await {
            warn!(delivery_id = %record.id, error = %e, "Failed to append delivery record");
        }
        record
    }

    async fn send(
        &self,
        webhook: &Webhook,
        event_id: &str,
        event_type: EventType,
        body: &str,
        signature: &str,
        record: &mut WebhookDelivery,
    ) {
        let _permit = match self.bulkheads.for_key(&webhook.tenant_id).acquire().await {
            Ok(permit) => permit,
            Err(rejection) => {
                record.error = Some(format!("tenant delivery capacity unavailable: {}", rejection));
                return;
            }
        };

        let mut request = self
            .client
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_ID_HEADER, event_id)
            .header(EVENT_TYPE_HEADER, event_type.as_str());

        for (name, value) in &webhook.headers {
            if is_reserved_header(name) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let result = request.body(body.to_string()).send().await;

        match result {
            Ok(response) => {
                let status_code = response.status();
                let response_body = response.text().await.unwrap_or_default();
                record.duration_ms = started.elapsed().as_millis() as u64;
                record.status_code = Some(status_code.as_u16());
                record.response_body = Some(truncate_body(&response_body, MAX_RESPONSE_BODY_BYTES));

                if status_code.is_success() {
                    record.status = DeliveryStatus::Delivered;
                } else {
                    warn!(
                        webhook_id = %webhook.id,
                        url = %webhook.url,
                        status = %status_code,
                        attempt = record.attempt,
                        "Webhook delivery received non-success response"
                    );
                }
            }
            Err(e) => {
                record.duration_ms = started.elapsed().as_millis() as u64;
                let reason = if e.is_timeout() {
                    format!("timed out after {}ms", self.config.attempt_timeout.as_millis())
                } else {
                    e.to_string()
                };
                warn!(
                    webhook_id = %webhook.id,
                    url = %webhook.url,
                    error = %reason,
                    attempt = record.attempt,
                    "Webhook delivery failed"
                );
                record.error = Some(reason);
            }
        }
    }

    async fn load(&self, tenant_id: &str, webhook_id: &str) -> Result<Webhook> {
        self.webhooks
            .get(tenant_id, webhook_id)
            .await?
            .ok_or_else(|| WebhookError::NotFound(webhook_id.to_string()))
    }

    /// Delivery history of one webhook, newest first.
    pub async fn delivery_history(
        &self,
        tenant_id: &str,
        webhook_id: &str,
        page: PageRequest,
    ) -> Result<Page<WebhookDelivery>> {
        self.load(tenant_id, webhook_id).await?;
        self.deliveries.list_by_webhook(tenant_id, webhook_id, page).await
    }

    /// Send a synthetic `test.event` once; no retries, counters untouched.
    pub async fn send_test(&self, tenant_id: &str, webhook_id: &str) -> Result<WebhookDelivery> {
        let webhook = self.load(tenant_id, webhook_id).await?;
        let event = test_event(tenant_id, webhook_id);
        let body = WebhookPayload::from_event(&event).to_body()?;

        let record = self
            .attempt(&webhook, &event.id, EventType::Test, &body, 1, DeliveryTrigger::Test)
            .await;
        info!(webhook_id, tenant_id, status = ?record.status, "Test webhook sent");
        Ok(record)
    }

    /// Re-send the exact payload of an earlier delivery as a new attempt.
    ///
    /// The original row is untouched. The result counts as one terminal
    /// outcome unless the original was a test delivery.
    pub async fn retry_delivery(
        &self,
        tenant_id: &str,
        webhook_id: &str,
        delivery_id: &str,
    ) -> Result<WebhookDelivery> {
        let webhook = self.load(tenant_id, webhook_id).await?;
        if !webhook.is_active() {
            return Err(WebhookError::Disabled);
        }

        let original = self
            .deliveries
            .get(tenant_id, delivery_id)
            .await?
            .filter(|d| d.webhook_id == webhook_id)
            .ok_or_else(|| WebhookError::DeliveryNotFound(delivery_id.to_string()))?;

        let trigger = match original.trigger {
            DeliveryTrigger::Test => DeliveryTrigger::Test,
            _ => DeliveryTrigger::Manual,
        };
        let record = self
            .attempt(
                &webhook,
                &original.event_id,
                original.event,
                &original.request_payload,
                1,
                trigger,
            )
            .await;

        if trigger == DeliveryTrigger::Manual {
            self.count_outcome(&webhook, record.is_success()).await;
        }
        info!(
            webhook_id,
            delivery_id,
            retry_id = %record.id,
            status = ?record.status,
            "Manual webhook retry"
        );
        Ok(record)
    }
}

/// An event waiting for delivery, optionally pinned to one webhook
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event: Event,
    pub webhook_id: Option<String>,
}

/// Bounded, non-blocking event queue in front of the dispatcher
#[derive(Clone)]
pub struct WebhookEventQueue {
    sender: mpsc::Sender<QueuedEvent>,
}

impl WebhookEventQueue {
    /// Create a new event queue with its processor
    pub fn new(dispatcher: Arc<WebhookDispatcher>, buffer_size: usize) -> (Self, WebhookEventProcessor) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));

        let slots = Arc::new(Semaphore::new(dispatcher.config().max_in_flight_cycles.max(1)));
        let processor = WebhookEventProcessor {
            dispatcher,
            receiver,
            slots,
        };

        (Self { sender }, processor)
    }

    /// Queue an event without waiting; fails when the queue is full or closed.
    pub fn enqueue(&self, event: Event) -> Result<()> {
        self.push(QueuedEvent {
            event,
            webhook_id: None,
        })
    }

    /// Queue an event for one specific webhook
    pub fn enqueue_for_webhook(&self, event: Event, webhook_id: &str) -> Result<()> {
        self.push(QueuedEvent {
            event,
            webhook_id: Some(webhook_id.to_string()),
        })
    }

    fn push(&self, queued: QueuedEvent) -> Result<()> {
        self.sender.try_send(queued).map_err(|e| match e {
            mpsc::error::TrySendError::Full(q) => {
                WebhookError::DeliveryFailed(format!("queue full, dropped event {}", q.event.id))
            }
            mpsc::error::TrySendError::Closed(q) => {
                WebhookError::DeliveryFailed(format!("queue closed, dropped event {}", q.event.id))
            }
        })
    }
}

/// Processes queued webhook events.
///
/// Each retry cycle holds one of `max_in_flight_cycles` slots. With every slot
/// taken the processor stops receiving, the queue fills and `enqueue` reports
/// it instead of tasks piling up.
pub struct WebhookEventProcessor {
    dispatcher: Arc<WebhookDispatcher>,
    receiver: mpsc::Receiver<QueuedEvent>,
    slots: Arc<Semaphore>,
}

impl WebhookEventProcessor {
    /// Run until every queue handle is dropped, then wait for in-flight cycles.
    pub async fn run(mut self) {
        info!("Starting webhook event processor");
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                queued = self.receiver.recv(), if self.slots.available_permits() > 0 => match queued {
                    Some(queued) => self.spawn_cycles(&mut cycles, queued).await,
                    None => break,
                },
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Webhook delivery task panicked");
                    }
                }
            }
        }

        let in_flight = cycles.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight webhook deliveries");
        }
        while let Some(joined) = cycles.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Webhook delivery task panicked");
            }
        }

        info!("Webhook event processor stopped");
    }

    async fn spawn_cycles(&self, cycles: &mut JoinSet<CycleOutcome>, queued: QueuedEvent) {
        let event = queued.event;
        let targets = match queued.webhook_id {
            Some(id) => self
                .dispatcher
                .webhooks
                .get(&event.tenant_id, &id)
                .await
                .map(|w| w.into_iter().filter(Webhook::is_active).collect::<Vec<_>>()),
            None => {
                self.dispatcher
                    .webhooks
                    .list_subscribed(&event.tenant_id, event.event_type)
                    .await
            }
        };

        let targets = match targets {
            Ok(targets) => targets,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Could not resolve webhook targets");
                return;
            }
        };

        for webhook in targets {
            // A fan-out wider than the free slots waits here for running cycles.
            let slot = match Arc::clone(&self.slots).acquire_owned().await {
                Ok(slot) => slot,
                Err(_) => {
                    warn!(event_id = %event.id, "Delivery slots closed; dropping remaining targets");
                    return;
                }
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            let event = event.clone();
            cycles.spawn(async move {
                let outcome = dispatcher.deliver_with_retries(webhook, &event).await;
                drop(slot);
                outcome
            });
        }
    }
}
