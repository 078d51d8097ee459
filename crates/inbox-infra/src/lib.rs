pub mod cache;
pub mod resilience;

pub use cache::link_state::{generate_state_token, InMemoryLinkStateStore, LinkStateStore};
pub use cache::redis::{RedisLinkStateStore, RedisLinkStateConfig};
pub use resilience::bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadPool, BulkheadRejection};

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, InfraError>;
