//! Keyed concurrency limits
//!
//! A [`Bulkhead`] caps how many operations may run at once against one
//! resource. [`BulkheadPool`] hands out one bulkhead per key, so work for one
//! tenant queues behind that tenant's own limit and nobody else's.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Used as the log label and as the prefix of pooled bulkhead names
    pub name: String,
    pub max_concurrent: usize,
    /// `None` waits for a permit as long as it takes
    pub max_wait: Option<Duration>,
}

impl BulkheadConfig {
    pub fn new(name: &str, max_concurrent: usize) -> Self {
        Self {
            name: name.to_string(),
            max_concurrent: max_concurrent.max(1),
            max_wait: Some(Duration::from_secs(30)),
        }
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = Some(wait);
        self
    }

    pub fn without_max_wait(mut self) -> Self {
        self.max_wait = None;
        self
    }
}

/// Why a permit was not granted
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadRejection {
    #[error("all permits in use")]
    Full,

    #[error("timed out waiting for a permit")]
    TimedOut,

    #[error("bulkhead closed")]
    Closed,
}

/// Slot in a bulkhead; released on drop.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
pub struct Bulkhead {
    config: Arc<BulkheadConfig>,
    semaphore: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config: Arc::new(config),
        }
    }

    pub fn try_acquire(&self) -> Result<BulkheadPermit, BulkheadRejection> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(BulkheadPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(BulkheadRejection::Full),
            Err(TryAcquireError::Closed) => Err(BulkheadRejection::Closed),
        }
    }

    /// Wait for a permit, bounded by `max_wait` when one is configured.
    pub async fn acquire(&self) -> Result<BulkheadPermit, BulkheadRejection> {
        if self.semaphore.available_permits() == 0 {
            debug!(bulkhead = %self.config.name, in_flight = self.in_flight(), "Waiting for bulkhead permit");
        }

        let pending = self.semaphore.clone().acquire_owned();
        let acquired = match self.config.max_wait {
            None => pending.await,
            Some(max_wait) => tokio::time::timeout(max_wait, pending).await.map_err(|_| {
                warn!(
                    bulkhead = %self.config.name,
                    max_wait_ms = max_wait.as_millis() as u64,
                    "Gave up waiting for bulkhead permit"
                );
                BulkheadRejection::TimedOut
            })?,
        };

        acquired
            .map(|permit| BulkheadPermit { _permit: permit })
            .map_err(|_| BulkheadRejection::Closed)
    }

    /// Operations currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent - self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// Bulkheads created on demand from one template, one per key.
pub struct BulkheadPool {
    template: BulkheadConfig,
    bulkheads: DashMap<String, Bulkhead>,
}

impl BulkheadPool {
    pub fn new(template: BulkheadConfig) -> Self {
        Self {
            template,
            bulkheads: DashMap::new(),
        }
    }

    pub fn for_key(&self, key: &str) -> Bulkhead {
        if let Some(existing) = self.bulkheads.get(key) {
            return existing.clone();
        }
        self.bulkheads
            .entry(key.to_string())
            .or_insert_with(|| {
                Bulkhead::new(BulkheadConfig {
                    name: format!("{}:{}", self.template.name, key),
                    ..self.template.clone()
                })
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.bulkheads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bulkheads.is_empty()
    }
}
