use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub webhooks: WebhookSettings,
    pub event_bus: EventBusConfig,
    pub link_state: LinkStateConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("INBOX")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = with_defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = with_defaults(Config::builder())?
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("INBOX")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    builder
        .set_default("server.host", default_host())?
        .set_default("server.port", default_port() as i64)?
        .set_default("webhooks.attempt_timeout_secs", default_attempt_timeout_secs() as i64)?
        .set_default("webhooks.max_concurrent_per_tenant", default_max_concurrent_per_tenant() as i64)?
        .set_default("webhooks.queue_capacity", default_queue_capacity() as i64)?
        .set_default("webhooks.max_in_flight_cycles", default_max_in_flight_cycles() as i64)?
        .set_default("webhooks.default_max_retries", default_max_retries() as i64)?
        .set_default("webhooks.default_retry_delay_seconds", default_retry_delay_seconds() as i64)?
        .set_default("webhooks.delivery_retention_days", default_retention_days())?
        .set_default("webhooks.user_agent", default_user_agent())?
        .set_default("event_bus.capacity", default_bus_capacity() as i64)?
        .set_default("link_state.backend", "memory")?
        .set_default("link_state.ttl_secs", default_link_ttl_secs() as i64)
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Outbound webhook delivery settings
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSettings {
    /// Hard timeout of a single HTTP attempt
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Concurrent HTTP attempts allowed per tenant
    #[serde(default = "default_max_concurrent_per_tenant")]
    pub max_concurrent_per_tenant: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Retry cycles the queue processor runs at once across all tenants
    #[serde(default = "default_max_in_flight_cycles")]
    pub max_in_flight_cycles: usize,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub default_retry_delay_seconds: u64,
    #[serde(default = "default_retention_days")]
    pub delivery_retention_days: i64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl WebhookSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: default_attempt_timeout_secs(),
            max_concurrent_per_tenant: default_max_concurrent_per_tenant(),
            queue_capacity: default_queue_capacity(),
            max_in_flight_cycles: default_max_in_flight_cycles(),
            default_max_retries: default_max_retries(),
            default_retry_delay_seconds: default_retry_delay_seconds(),
            delivery_retention_days: default_retention_days(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_attempt_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_per_tenant() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_in_flight_cycles() -> usize {
    64
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_seconds() -> u64 {
    60
}

fn default_retention_days() -> i64 {
    30
}

fn default_user_agent() -> String {
    "Inbox-Webhook/1.0".to_string()
}

/// In-process event bus configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

fn default_bus_capacity() -> usize {
    1024
}

/// Backend holding short-lived channel link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStateBackend {
    Memory,
    Redis,
}

/// Channel link state configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LinkStateConfig {
    pub backend: LinkStateBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_link_ttl_secs")]
    pub ttl_secs: u64,
}

impl LinkStateConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LinkStateConfig {
    fn default() -> Self {
        Self {
            backend: LinkStateBackend::Memory,
            redis_url: None,
            ttl_secs: default_link_ttl_secs(),
        }
    }
}

fn default_link_ttl_secs() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults() {
        let config = AppConfig::load_from_env("INBOX_TEST_UNSET_PREFIX").unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.webhooks.default_max_retries, 3);
        assert_eq!(config.webhooks.default_retry_delay_seconds, 60);
        assert_eq!(config.webhooks.attempt_timeout(), Duration::from_secs(10));
        assert_eq!(config.event_bus.capacity, 1024);
        assert_eq!(config.link_state.backend, LinkStateBackend::Memory);
        assert_eq!(config.link_state.ttl(), Duration::from_secs(600));
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new().with_port(3000);
        assert_eq!(config.address(), "0.0.0.0:3000");
    }

    #[test]
    fn test_webhook_settings_defaults() {
        let settings = WebhookSettings::default();
        assert_eq!(settings.max_concurrent_per_tenant, 4);
        assert_eq!(settings.user_agent, "Inbox-Webhook/1.0");
    }
}
