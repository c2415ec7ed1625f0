//! Recovery action repository

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::recovery_action::{self, Column, Entity as RecoveryActions};
use crate::recovery::{RecoveryAction, RecoveryKind};
use crate::systems::ExternalSystemType;

#[derive(Debug, Clone)]
pub struct RecoveryActionRepository {
    pub db: Arc<DatabaseConnection>,
}

impl RecoveryActionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, action: &RecoveryAction) -> Result<()> {
        to_active_model(action).insert(&*self.db).await?;
        Ok(())
    }

    pub async fn update(&self, action: &RecoveryAction) -> Result<()> {
        to_active_model(action).update(&*self.db).await?;
        Ok(())
    }

    /// Most recent open action of `kind` for the pair, exhausted or not.
    pub async fn find_open(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        kind: RecoveryKind,
    ) -> Result<Option<RecoveryAction>> {
        let tenant_filter = match tenant_id {
            Some(id) => Column::TenantId.eq(id),
            None => Column::TenantId.is_null(),
        };

        RecoveryActions::find()
            .filter(tenant_filter)
            .filter(Column::System.eq(system.as_str()))
            .filter(Column::Kind.eq(kind.as_str()))
            .filter(Column::Success.eq(false))
            .filter(Column::RetiredAt.is_null())
            .order_by_desc(Column::CreatedAt)
            .one(&*self.db)
            .await?
            .map(to_domain)
            .transpose()
    }

    pub async fn due(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<RecoveryAction>> {
        RecoveryActions::find()
            .filter(Column::Success.eq(false))
            .filter(Column::RetiredAt.is_null())
            .filter(Expr::col(Column::Attempts).lt(Expr::col(Column::MaxAttempts)))
            .filter(Column::ScheduledAt.lte(now.fixed_offset()))
            .order_by_asc(Column::ScheduledAt)
            .limit(Some(limit))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(to_domain)
            .collect()
    }

    /// Closes every open action for the pair. Returns how many were retired.
    pub async fn retire_open(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = RecoveryActions::update_many()
            .col_expr(Column::RetiredAt, Expr::value(Some(now.fixed_offset())))
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()))
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::System.eq(system.as_str()))
            .filter(Column::Success.eq(false))
            .filter(Column::RetiredAt.is_null())
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecoveryAction>> {
        RecoveryActions::find()
            .filter(Column::CreatedAt.gte(start.fixed_offset()))
            .filter(Column::CreatedAt.lt(end.fixed_offset()))
            .order_by_asc(Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(to_domain)
            .collect()
    }
}

fn to_active_model(action: &RecoveryAction) -> recovery_action::ActiveModel {
    let updated_at = action
        .retired_at
        .or(action.last_attempt_at)
        .unwrap_or(action.created_at);
    recovery_action::ActiveModel {
        id: Set(action.id),
        kind: Set(action.kind.as_str().to_string()),
        tenant_id: Set(action.tenant_id),
        system: Set(action.system.as_str().to_string()),
        scheduled_at: Set(action.scheduled_at.fixed_offset()),
        attempts: Set(action.attempts as i32),
        max_attempts: Set(action.max_attempts as i32),
        last_attempt_at: Set(action.last_attempt_at.map(|at| at.fixed_offset())),
        success: Set(action.success),
        last_error: Set(action.last_error.clone()),
        error_code: Set(action.error_code.map(|code| code.as_str().to_string())),
        created_at: Set(action.created_at.fixed_offset()),
        updated_at: Set(updated_at.fixed_offset()),
        retired_at: Set(action.retired_at.map(|at| at.fixed_offset())),
    }
}

fn to_domain(model: recovery_action::Model) -> Result<RecoveryAction> {
    Ok(RecoveryAction {
        id: model.id,
        kind: model.kind.parse().map_err(|e| anyhow!("{e}"))?,
        tenant_id: model.tenant_id,
        system: model.system.parse().map_err(|e| anyhow!("{e}"))?,
        scheduled_at: model.scheduled_at.with_timezone(&Utc),
        attempts: model.attempts.max(0) as u32,
        max_attempts: model.max_attempts.max(0) as u32,
        last_attempt_at: model.last_attempt_at.map(|at| at.with_timezone(&Utc)),
        success: model.success,
        last_error: model.last_error,
        error_code: model.error_code.and_then(|code| code.parse().ok()),
        created_at: model.created_at.with_timezone(&Utc),
        retired_at: model.retired_at.map(|at| at.with_timezone(&Utc)),
    })
}
