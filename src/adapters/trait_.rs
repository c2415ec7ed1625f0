//! POS adapter contract.
//!
//! The gateway core depends only on [`PosAdapter`]. Vendor field mappings, HTTP clients
//! and OAuth exchanges live behind it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::adapters::credentials::Credentials;
use crate::error::{ErrorCode, IntegrationError};
use crate::normalization::{LocationInfo, StandardizedTransaction};
use crate::systems::ExternalSystemType;

/// Result of registering the gateway's webhook endpoint with a system.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSetup {
    pub endpoint: Url,
    pub events: Vec<String>,
    pub secret_key: String,
}

impl std::fmt::Debug for WebhookSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSetup")
            .field("endpoint", &self.endpoint.as_str())
            .field("events", &self.events)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
pub trait PosAdapter: Send + Sync {
    fn system(&self) -> ExternalSystemType;

    async fn test_connection(&self, credentials: &Credentials) -> Result<bool, IntegrationError>;

    /// Exchanges or refreshes credentials, returning the replacement set.
    async fn authenticate(&self, credentials: &Credentials)
    -> Result<Credentials, IntegrationError>;

    async fn get_locations(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<LocationInfo>, IntegrationError>;

    async fn get_transactions(
        &self,
        credentials: &Credentials,
        location_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StandardizedTransaction>, IntegrationError>;

    async fn setup_webhooks(
        &self,
        credentials: &Credentials,
        url: &Url,
    ) -> Result<WebhookSetup, IntegrationError>;

    /// Checks `signature` over the raw request body with the subscription secret.
    fn validate_webhook(&self, payload: &[u8], signature: &str, secret: &str) -> bool;

    fn transform_raw_data(&self, payload: &Value)
    -> Result<StandardizedTransaction, IntegrationError>;
}

/// Raw failure observed by an adapter before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterFailure {
    /// Non-success HTTP response from the upstream API.
    Http {
        status: u16,
        body: Option<String>,
        retry_after: Option<Duration>,
    },
    ConnectionRefused { details: String },
    TimedOut { details: String },
    /// Credentials were rejected outright (bad API key, revoked grant).
    CredentialsRejected { details: String },
    MalformedResponse { details: String },
}

impl From<AdapterFailure> for IntegrationError {
    fn from(failure: AdapterFailure) -> Self {
        match failure {
            AdapterFailure::Http {
                status,
                body,
                retry_after,
            } => IntegrationError::from_http_status(
                status,
                body.unwrap_or_else(|| format!("upstream returned HTTP {status}")),
                retry_after,
            ),
            AdapterFailure::ConnectionRefused { details } => {
                IntegrationError::connection_refused(details)
            }
            AdapterFailure::TimedOut { details } => IntegrationError::timeout(details),
            AdapterFailure::CredentialsRejected { details } => {
                IntegrationError::invalid_credentials(details)
            }
            AdapterFailure::MalformedResponse { details } => {
                IntegrationError::new(ErrorCode::UnknownError, details)
                    .with_details(serde_json::json!({ "malformed_response": true }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_classify_once() {
        let limited: IntegrationError = AdapterFailure::Http {
            status: 429,
            body: None,
            retry_after: Some(Duration::from_secs(2)),
        }
        .into();
        assert_eq!(limited.code, ErrorCode::RateLimited);
        assert!(limited.retryable);
        assert_eq!(limited.retry_after, Some(Duration::from_secs(2)));
        assert_eq!(limited.message, "upstream returned HTTP 429");

        let refused: IntegrationError = AdapterFailure::ConnectionRefused {
            details: "econnrefused".to_string(),
        }
        .into();
        assert_eq!(refused.code, ErrorCode::ConnectionError);
        assert!(refused.retryable);

        let rejected: IntegrationError = AdapterFailure::CredentialsRejected {
            details: "revoked".to_string(),
        }
        .into();
        assert_eq!(rejected.code, ErrorCode::InvalidCredentials);
        assert!(!rejected.retryable);

        let malformed: IntegrationError = AdapterFailure::MalformedResponse {
            details: "truncated json".to_string(),
        }
        .into();
        assert_eq!(malformed.code, ErrorCode::UnknownError);
        assert!(!malformed.retryable);
    }
}
