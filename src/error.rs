//! Classified integration errors.
//!
//! Adapter failures are classified once, at the boundary, into an [`IntegrationError`]
//! carrying an [`ErrorCode`] and a `retryable` flag. The dispatcher, webhook pipeline and
//! recovery engine only ever act on that classification; they never re-classify.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::systems::ExternalSystemType;

/// Error taxonomy shared by every integration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCredentials,
    AuthError,
    RateLimited,
    ConnectionError,
    Timeout,
    ServerError,
    ValidationError,
    NotFound,
    WebhookInvalidSignature,
    TransformationFailed,
    /// The (tenant, system) pair was disabled and must be re-enabled manually.
    IntegrationDisabled,
    /// The gateway stopped before the call could be resolved.
    QueueUnavailable,
    UnknownError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::InvalidCredentials,
        ErrorCode::AuthError,
        ErrorCode::RateLimited,
        ErrorCode::ConnectionError,
        ErrorCode::Timeout,
        ErrorCode::ServerError,
        ErrorCode::ValidationError,
        ErrorCode::NotFound,
        ErrorCode::WebhookInvalidSignature,
        ErrorCode::TransformationFailed,
        ErrorCode::IntegrationDisabled,
        ErrorCode::QueueUnavailable,
        ErrorCode::UnknownError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ConnectionError => "CONNECTION_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::WebhookInvalidSignature => "WEBHOOK_INVALID_SIGNATURE",
            ErrorCode::TransformationFailed => "TRANSFORMATION_FAILED",
            ErrorCode::IntegrationDisabled => "INTEGRATION_DISABLED",
            ErrorCode::QueueUnavailable => "QUEUE_UNAVAILABLE",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Retryability assigned when nothing more specific is known about the failure.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited
                | ErrorCode::ConnectionError
                | ErrorCode::Timeout
                | ErrorCode::ServerError
        )
    }

    /// Auth and connection-class failures force a pair's health to `disconnected`.
    pub fn forces_disconnect(&self) -> bool {
        matches!(
            self,
            ErrorCode::AuthError | ErrorCode::InvalidCredentials | ErrorCode::ConnectionError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown error code '{0}'")]
pub struct UnknownErrorCode(pub String);

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownErrorCode(s.to_string()))
    }
}

/// A classified failure raised by an adapter or by the gateway itself.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct IntegrationError {
    pub code: ErrorCode,
    pub message: String,
    pub http_status: Option<u16>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub details: Option<Value>,
}

impl IntegrationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            http_status: None,
            retryable: code.default_retryable(),
            retry_after: None,
            details: None,
        }
    }

    /// Classify an upstream HTTP response.
    ///
    /// 429 and 5xx are retryable; 401/403/404/422 are not. A `Retry-After` hint is
    /// carried through so the dispatcher can widen its backoff window.
    pub fn from_http_status(
        status: u16,
        body: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let code = match status {
            401 | 403 => ErrorCode::AuthError,
            404 => ErrorCode::NotFound,
            400 | 422 => ErrorCode::ValidationError,
            408 => ErrorCode::Timeout,
            429 => ErrorCode::RateLimited,
            500..=599 => ErrorCode::ServerError,
            _ => ErrorCode::UnknownError,
        };

        let mut err = Self::new(code, body).with_status(status);
        if code == ErrorCode::RateLimited {
            err.retry_after = retry_after;
        }
        err
    }

    pub fn connection_refused(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthError, message)
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidCredentials, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(ErrorCode::RateLimited, "upstream rate limit exceeded");
        err.retry_after = retry_after;
        err
    }

    pub fn invalid_signature(system: ExternalSystemType) -> Self {
        Self::new(
            ErrorCode::WebhookInvalidSignature,
            format!("webhook signature mismatch for {system}"),
        )
    }

    pub fn transformation_failed(field: &str) -> Self {
        Self::new(
            ErrorCode::TransformationFailed,
            format!("missing mandatory field '{field}'"),
        )
        .with_details(serde_json::json!({ "field": field }))
    }

    pub fn integration_disabled(tenant_id: Uuid, system: ExternalSystemType) -> Self {
        Self::new(
            ErrorCode::IntegrationDisabled,
            format!("integration {system} is disabled for tenant {tenant_id}"),
        )
    }

    pub fn queue_unavailable() -> Self {
        Self::new(
            ErrorCode::QueueUnavailable,
            "gateway stopped before the call was resolved",
        )
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnknownError, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}
