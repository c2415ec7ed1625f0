//! Shared key-value store for rate counters, cached subscriptions and health snapshots.
//!
//! Every gateway instance talks to the same store, so all counter mutation goes through
//! [`MetricsStore::incr_with_ttl`], which must be atomic in each backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::error::IntegrationError;

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryMetricsStore;
pub use redis_store::RedisMetricsStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metrics store backend error: {0}")]
    Backend(String),
    #[error("value at key '{key}' is not an integer")]
    NotAnInteger { key: String },
    #[error("cached value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for IntegrationError {
    fn from(err: StoreError) -> Self {
        IntegrationError::connection_refused(err.to_string())
    }
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), StoreError>;

    /// Atomically increments the counter at `key`, creating it with `ttl` when absent.
    /// The expiry is not refreshed by later increments, giving fixed counting windows.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Remaining lifetime of `key`, or `None` when it is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Keys matching a glob pattern where `*` matches any run of characters.
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn MetricsStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json_with_ttl<T: Serialize>(
    store: &dyn MetricsStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)?;
    store.set_with_ttl(key, &raw, ttl).await
}

/// Key layout shared by all gateway instances.
pub mod keys {
    use uuid::Uuid;

    use crate::systems::ExternalSystemType;

    pub const GLOBAL_TENANT: &str = "global";
    pub const HEALTH_INDEX: &str = "health:pairs";

    pub fn tenant_segment(tenant_id: Option<Uuid>) -> String {
        tenant_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| GLOBAL_TENANT.to_string())
    }

    pub fn rate_window(
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
        window: &str,
    ) -> String {
        format!("rate:{system}:{}:{window}", tenant_segment(tenant_id))
    }

    pub fn rate_errors(system: ExternalSystemType, tenant_id: Option<Uuid>) -> String {
        rate_window(system, tenant_id, "errors")
    }

    pub fn rate_pattern(system: ExternalSystemType, tenant_id: Option<Uuid>) -> String {
        rate_window(system, tenant_id, "*")
    }

    pub fn subscription(tenant_id: Uuid, system: ExternalSystemType) -> String {
        format!("subscription:{tenant_id}:{system}")
    }

    pub fn health(tenant_id: Option<Uuid>, system: ExternalSystemType) -> String {
        format!("health:{}:{system}", tenant_segment(tenant_id))
    }

    pub fn health_member(tenant_id: Option<Uuid>, system: ExternalSystemType) -> String {
        format!("{}:{system}", tenant_segment(tenant_id))
    }
}
