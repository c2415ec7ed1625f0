//! Webhook-only adapter.
//!
//! Used for systems that push data to the gateway but have no pull client configured.
//! It verifies signatures with the system's scheme and normalizes through a transform
//! schema; pull operations return empty results.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde_json::Value;
use url::Url;

use crate::adapters::{
    AdapterMetadata, AdapterRegistry, AuthType, Credentials, PosAdapter, WebhookSetup, signing,
};
use crate::error::IntegrationError;
use crate::normalization::{LocationInfo, StandardizedTransaction, TransformSchema, transform};
use crate::systems::ExternalSystemType;

const SECRET_LEN: usize = 32;
const DEFAULT_EVENTS: [&str; 3] = ["order.created", "order.updated", "refund.created"];

#[derive(Debug, Clone)]
pub struct WebhookOnlyAdapter {
    schema: TransformSchema,
}

impl WebhookOnlyAdapter {
    pub fn new(schema: TransformSchema) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl PosAdapter for WebhookOnlyAdapter {
    fn system(&self) -> ExternalSystemType {
        self.schema.system
    }

    async fn test_connection(&self, _credentials: &Credentials) -> Result<bool, IntegrationError> {
        Ok(true)
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Credentials, IntegrationError> {
        Ok(credentials.clone())
    }

    async fn get_locations(
        &self,
        _credentials: &Credentials,
    ) -> Result<Vec<LocationInfo>, IntegrationError> {
        Ok(Vec::new())
    }

    async fn get_transactions(
        &self,
        _credentials: &Credentials,
        _location_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<StandardizedTransaction>, IntegrationError> {
        Ok(Vec::new())
    }

    async fn setup_webhooks(
        &self,
        _credentials: &Credentials,
        url: &Url,
    ) -> Result<WebhookSetup, IntegrationError> {
        let secret_key: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LEN)
            .map(char::from)
            .collect();

        Ok(WebhookSetup {
            endpoint: url.clone(),
            events: DEFAULT_EVENTS.iter().map(|e| e.to_string()).collect(),
            secret_key,
        })
    }

    fn validate_webhook(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        signing::is_valid(self.system().signature_scheme(), payload, signature, secret)
    }

    fn transform_raw_data(
        &self,
        payload: &Value,
    ) -> Result<StandardizedTransaction, IntegrationError> {
        transform(payload, &self.schema)
    }
}

/// Registers a webhook-only adapter for every schema given.
pub fn register_webhook_only_adapters(
    registry: &mut AdapterRegistry,
    schemas: impl IntoIterator<Item = TransformSchema>,
) {
    for schema in schemas {
        let system = schema.system;
        registry.register(
            Arc::new(WebhookOnlyAdapter::new(schema)),
            AdapterMetadata::new(system, AuthType::Custom("webhook_secret".to_string())),
        );
    }
}
