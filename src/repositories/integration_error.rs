//! Append-only error log repository

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;

use crate::error::ErrorCode;
use crate::models::integration_error::{self, Column, Entity as IntegrationErrors};
use crate::recovery::{ErrorRecord, FailureSource};

#[derive(Debug, Clone)]
pub struct IntegrationErrorRepository {
    pub db: Arc<DatabaseConnection>,
}

impl IntegrationErrorRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn append(&self, record: &ErrorRecord) -> Result<()> {
        integration_error::ActiveModel {
            id: Set(record.id),
            tenant_id: Set(record.tenant_id),
            system: Set(record.system.as_str().to_string()),
            source: Set(record.source.as_str().to_string()),
            code: Set(record.code.as_str().to_string()),
            message: Set(record.message.clone()),
            http_status: Set(record.http_status.map(i32::from)),
            retryable: Set(record.retryable),
            details: Set(record.details.clone()),
            occurred_at: Set(record.occurred_at.fixed_offset()),
        }
        .insert(&*self.db)
        .await?;
        Ok(())
    }

    /// Errors with `start <= occurred_at < end`, oldest first.
    pub async fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<ErrorRecord>> {
        IntegrationErrors::find()
            .filter(Column::OccurredAt.gte(start.fixed_offset()))
            .filter(Column::OccurredAt.lt(end.fixed_offset()))
            .order_by_asc(Column::OccurredAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(to_domain)
            .collect()
    }
}

fn to_domain(model: integration_error::Model) -> Result<ErrorRecord> {
    Ok(ErrorRecord {
        id: model.id,
        tenant_id: model.tenant_id,
        system: model.system.parse().map_err(|e| anyhow!("{e}"))?,
        source: FailureSource::parse(&model.source)
            .ok_or_else(|| anyhow!("unknown failure source '{}'", model.source))?,
        code: model
            .code
            .parse::<ErrorCode>()
            .unwrap_or(ErrorCode::UnknownError),
        message: model.message,
        http_status: model.http_status.and_then(|s| u16::try_from(s).ok()),
        retryable: model.retryable,
        details: model.details,
        occurred_at: model.occurred_at.with_timezone(&Utc),
    })
}
