//! Application state and initialization

use anyhow::{Context, Result};
use inbox_conversation::{ChannelLinker, InMemoryConversationStore, InboxService, ProviderRegistry};
use inbox_core::{AppConfig, InProcessEventBus, LinkStateBackend, LinkStateConfig};
use inbox_infra::{InMemoryLinkStateStore, LinkStateStore, RedisLinkStateConfig, RedisLinkStateStore};
use inbox_webhook::{
    cleanup_deliveries, DeliveryRepository, DispatcherConfig, EventBridge, InMemoryDeliveryRepository,
    InMemoryWebhookRepository, RetryPolicy, WebhookDispatcher, WebhookEventQueue, WebhookRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cli::Args;
use crate::server::Server;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Shared state handed to HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub inbox: Arc<InboxService>,
    pub linker: Arc<ChannelLinker>,
}

impl AppState {
    pub fn new(inbox: Arc<InboxService>, linker: Arc<ChannelLinker>) -> Self {
        Self { inbox, linker }
    }
}

/// Background tasks feeding tenant webhooks
struct Workers {
    processor: JoinHandle<()>,
    bridge: JoinHandle<()>,
    retention: JoinHandle<()>,
}

/// Main application
pub struct App {
    config: AppConfig,
    bus: InProcessEventBus,
    state: AppState,
    workers: Workers,
}

impl App {
    /// Build the application with all dependencies
    pub async fn build(args: Args) -> Result<Self> {
        let mut config = AppConfig::load_from_file(args.config_path()?)
            .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
        if let Some(port) = args.port {
            config.server.port = port;
        }

        info!("Initializing application components");
        let bus = InProcessEventBus::new(config.event_bus.capacity);

        let inbox = Arc::new(InboxService::new(
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(bus.clone()),
            Arc::new(ProviderRegistry::new()),
        ));
        let linker = Arc::new(ChannelLinker::new(
            link_state_store(&config.link_state).await?,
            config.link_state.ttl(),
        ));

        let webhooks = Arc::new(InMemoryWebhookRepository::new());
        let deliveries: Arc<dyn DeliveryRepository> = Arc::new(InMemoryDeliveryRepository::default());
        let registry = Arc::new(WebhookRegistry::new(webhooks.clone()).with_default_retry_policy(
            RetryPolicy::new(
                config.webhooks.default_max_retries,
                config.webhooks.default_retry_delay_seconds,
            ),
        ));
        let dispatcher = WebhookDispatcher::new(
            DispatcherConfig::from(&config.webhooks),
            webhooks,
            deliveries.clone(),
        )
        .context("Failed to create webhook dispatcher")?;

        let (queue, processor) =
            WebhookEventQueue::new(Arc::new(dispatcher), config.webhooks.queue_capacity);
        let workers = Workers {
            processor: tokio::spawn(processor.run()),
            bridge: EventBridge::new(registry, queue).spawn(bus.subscribe()),
            retention: spawn_retention(deliveries, config.webhooks.delivery_retention_days),
        };

        Ok(Self {
            config,
            bus,
            state: AppState::new(inbox, linker),
            workers,
        })
    }

    /// Serve until ctrl-c, then drain queued webhook deliveries.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            bus,
            state,
            workers,
        } = self;

        info!("HTTP address: {}", config.server.address());
        Server::new(config.server, state).run().await?;

        // Dropping the last bus sender ends the bridge, which releases the queue
        drop(bus);
        workers.retention.abort();
        if let Err(e) = workers.bridge.await {
            warn!(error = %e, "Event bridge task failed");
        }
        info!("Waiting for queued webhook deliveries");
        if let Err(e) = workers.processor.await {
            warn!(error = %e, "Webhook processor task failed");
        }

        Ok(())
    }
}

async fn link_state_store(config: &LinkStateConfig) -> Result<Arc<dyn LinkStateStore>> {
    match config.backend {
        LinkStateBackend::Memory => Ok(Arc::new(InMemoryLinkStateStore::new())),
        LinkStateBackend::Redis => {
            let url = config
                .redis_url
                .clone()
                .context("link_state.redis_url is required for the redis backend")?;
            let store = RedisLinkStateStore::new(RedisLinkStateConfig::new(url))
                .await
                .context("Failed to connect link state store")?;
            Ok(Arc::new(store))
        }
    }
}

fn spawn_retention(deliveries: Arc<dyn DeliveryRepository>, retention_days: i64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = cleanup_deliveries(deliveries.as_ref(), retention_days).await {
                warn!(error = %e, "Delivery retention sweep failed");
            }
        }
    })
}
