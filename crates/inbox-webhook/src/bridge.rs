//! Forwards domain events from the in-process bus to the webhook queue.

use inbox_core::Event;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::outbound::WebhookEventQueue;
use crate::registry::WebhookRegistry;

pub struct EventBridge {
    registry: Arc<WebhookRegistry>,
    queue: WebhookEventQueue,
}

impl EventBridge {
    pub fn new(registry: Arc<WebhookRegistry>, queue: WebhookEventQueue) -> Self {
        Self { registry, queue }
    }

    /// Consume `events` until the bus closes.
    ///
    /// Events without subscribers are skipped before they reach the queue.
    /// Lagging behind the bus drops events; that is logged, not fatal.
    pub async fn run(self, mut events: broadcast::Receiver<Event>) {
        info!("Webhook event bridge started");
        loop {
            match events.recv().await {
                Ok(event) => self.forward(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Webhook event bridge lagged; events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Webhook event bridge stopped");
    }

    pub fn spawn(self, events: broadcast::Receiver<Event>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    async fn forward(&self, event: Event) {
        match self
            .registry
            .has_subscribers(&event.tenant_id, event.event_type)
            .await
        {
            Ok(false) => {
                debug!(event_id = %event.id, event_type = %event.event_type, "No webhook subscribers");
            }
            Ok(true) => {
                let event_id = event.id.clone();
                if let Err(e) = self.queue.enqueue(event) {
                    warn!(event_id = %event_id, error = %e, "Failed to enqueue webhook event");
                }
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Could not check webhook subscribers");
            }
        }
    }
}
