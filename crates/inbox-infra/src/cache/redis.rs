use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::time::Duration;
use tracing::{debug, info};

use super::link_state::{generate_state_token, LinkStateStore};
use crate::{InfraError, Result};

#[derive(Debug, Clone)]
pub struct RedisLinkStateConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisLinkStateConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            key_prefix: String::from("inbox:link-state:"),
        }
    }
}

impl RedisLinkStateConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Link state shared across instances through Redis `SET EX` / `GETDEL`.
#[derive(Clone)]
pub struct RedisLinkStateStore {
    connection: ConnectionManager,
    config: RedisLinkStateConfig,
}

impl RedisLinkStateStore {
    pub async fn new(config: RedisLinkStateConfig) -> Result<Self> {
        info!("Connecting to Redis at {}", config.url);

        let client = Client::open(config.url.clone())?;
        let connection = ConnectionManager::new(client).await?;

        info!("Redis connection established");

        Ok(Self { connection, config })
    }

    fn make_key(&self, token: &str) -> String {
        format!("{}{}", self.config.key_prefix, token)
    }
}

#[async_trait]
impl LinkStateStore for RedisLinkStateStore {
    async fn put(&self, value: serde_json::Value, ttl: Duration) -> Result<String> {
        let ttl_secs = ttl.as_secs().max(1);
        let token = generate_state_token();
        let key = self.make_key(&token);
        debug!(ttl_secs, "Storing link state");

        let serialized = serde_json::to_string(&value)?;
        let mut conn = self.connection.clone();
        let _: () = conn.set_ex(&key, serialized, ttl_secs).await?;

        Ok(token)
    }

    async fn take(&self, token: &str) -> Result<Option<serde_json::Value>> {
        let key = self.make_key(token);
        let mut conn = self.connection.clone();

        let raw: Option<String> = redis::cmd("GETDEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(InfraError::Cache)?;

        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(InfraError::from)
    }
}
