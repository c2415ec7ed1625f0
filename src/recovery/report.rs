//! Failure reports handed to the recovery engine and the error log they produce.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorCode, IntegrationError};
use crate::systems::ExternalSystemType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    Dispatch,
    Webhook,
}

impl FailureSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureSource::Dispatch => "dispatch",
            FailureSource::Webhook => "webhook",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "dispatch" => Some(FailureSource::Dispatch),
            "webhook" => Some(FailureSource::Webhook),
            _ => None,
        }
    }
}

impl fmt::Display for FailureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal failure, tagged with where it happened.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub tenant_id: Option<Uuid>,
    pub system: ExternalSystemType,
    pub source: FailureSource,
    pub error: IntegrationError,
}

impl FailureReport {
    pub fn dispatch(
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
        error: IntegrationError,
    ) -> Self {
        Self {
            tenant_id,
            system,
            source: FailureSource::Dispatch,
            error,
        }
    }

    pub fn webhook(
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
        error: IntegrationError,
    ) -> Self {
        Self {
            tenant_id,
            system,
            source: FailureSource::Webhook,
            error,
        }
    }
}

/// Persisted row of the append-only error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub system: ExternalSystemType,
    pub source: FailureSource,
    pub code: ErrorCode,
    pub message: String,
    pub http_status: Option<u16>,
    pub retryable: bool,
    pub details: Option<Value>,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_report(report: &FailureReport, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: report.tenant_id,
            system: report.system,
            source: report.source,
            code: report.error.code,
            message: report.error.message.clone(),
            http_status: report.error.http_status,
            retryable: report.error.retryable,
            details: report.error.details.clone(),
            occurred_at,
        }
    }
}
