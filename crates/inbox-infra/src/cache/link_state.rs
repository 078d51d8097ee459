//! TTL-backed state for multi-step channel linking flows.
//!
//! State is keyed by an unguessable token and can be taken exactly once.
//! Nothing here lives in a process-global map, so a flow started on one
//! instance can complete on another when a shared backend is used.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::Result;

/// Generate a random state token (32 bytes, hex encoded)
pub fn generate_state_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Store for short-lived, single-use state
#[async_trait]
pub trait LinkStateStore: Send + Sync {
    /// Store `value` and return the token that retrieves it.
    async fn put(&self, value: serde_json::Value, ttl: Duration) -> Result<String>;

    /// Remove and return the value, or `None` if unknown or expired.
    async fn take(&self, token: &str) -> Result<Option<serde_json::Value>>;
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// In-memory store for tests and single-instance deployments
#[derive(Default)]
pub struct InMemoryLinkStateStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryLinkStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired link state entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LinkStateStore for InMemoryLinkStateStore {
    async fn put(&self, value: serde_json::Value, ttl: Duration) -> Result<String> {
        self.purge_expired();
        let token = generate_state_token();
        self.entries.insert(
            token.clone(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(token)
    }

    async fn take(&self, token: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .entries
            .remove(token)
            .filter(|(_, entry)| entry.expires_at > Instant::now())
            .map(|(_, entry)| entry.value))
    }
}
