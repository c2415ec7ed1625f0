//! Webhook subscriptions and their read-through cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::IntegrationError;
use crate::repositories::RecordStore;
use crate::store::{MetricsStore, get_json, keys, set_json_with_ttl};
use crate::systems::ExternalSystemType;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub system: ExternalSystemType,
    pub webhook_url: String,
    pub events: Vec<String>,
    pub secret_key: String,
    pub active: bool,
    pub failure_count: u32,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for WebhookSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSubscription")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("system", &self.system)
            .field("webhook_url", &self.webhook_url)
            .field("events", &self.events)
            .field("secret_key", &"[REDACTED]")
            .field("active", &self.active)
            .field("failure_count", &self.failure_count)
            .field("last_processed_at", &self.last_processed_at)
            .finish()
    }
}

/// Fields supplied when onboarding creates or replaces a subscription.
#[derive(Clone, PartialEq)]
pub struct NewSubscription {
    pub tenant_id: Uuid,
    pub system: ExternalSystemType,
    pub webhook_url: String,
    pub events: Vec<String>,
    pub secret_key: String,
}

impl std::fmt::Debug for NewSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewSubscription")
            .field("tenant_id", &self.tenant_id)
            .field("system", &self.system)
            .field("webhook_url", &self.webhook_url)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Subscription lookups cached in the metrics store with a short TTL.
///
/// Store errors on the cache path are logged and fall through to the record store.
#[derive(Clone)]
pub struct SubscriptionCache {
    records: Arc<dyn RecordStore>,
    metrics: Arc<dyn MetricsStore>,
    ttl: Duration,
}

impl SubscriptionCache {
    pub fn new(records: Arc<dyn RecordStore>, metrics: Arc<dyn MetricsStore>, ttl: Duration) -> Self {
        Self {
            records,
            metrics,
            ttl,
        }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub async fn get(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<WebhookSubscription>, IntegrationError> {
        let key = keys::subscription(tenant_id, system);
        match get_json::<WebhookSubscription>(self.metrics.as_ref(), &key).await {
            Ok(Some(cached)) => return Ok(Some(cached)),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, key = %key, "Subscription cache read failed");
            }
        }

        let found = self
            .records
            .find_subscription(tenant_id, system)
            .await
            .map_err(|e| IntegrationError::connection_refused(e.to_string()))?;

        if let Some(subscription) = &found {
            if let Err(err) =
                set_json_with_ttl(self.metrics.as_ref(), &key, subscription, self.ttl).await
            {
                warn!(error = %err, key = %key, "Subscription cache write failed");
            }
        }
        Ok(found)
    }

    pub async fn invalidate(&self, tenant_id: Uuid, system: ExternalSystemType) {
        let key = keys::subscription(tenant_id, system);
        if let Err(err) = self.metrics.delete(&[key.clone()]).await {
            warn!(error = %err, key = %key, "Subscription cache invalidation failed");
        }
    }
}

impl std::fmt::Debug for SubscriptionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
