//! Webhook subscription repository
//!
//! Subscriptions are keyed by (tenant_id, system); onboarding upserts on that pair.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::webhook_subscription::{self, Column, Entity as Subscriptions};
use crate::systems::ExternalSystemType;
use crate::webhooks::{NewSubscription, WebhookSubscription};

#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SubscriptionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn find_model(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<webhook_subscription::Model>> {
        Ok(Subscriptions::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::System.eq(system.as_str()))
            .one(&*self.db)
            .await?)
    }

    pub async fn find(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<WebhookSubscription>> {
        self.find_model(tenant_id, system)
            .await?
            .map(to_domain)
            .transpose()
    }

    /// Creates the subscription or replaces URL, events and secret of an existing one.
    /// Either way the subscription ends up active with a zero failure count.
    pub async fn upsert(
        &self,
        new: NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<WebhookSubscription> {
        let now = now.fixed_offset();
        let events = serde_json::to_value(&new.events)?;

        let saved = match self.find_model(new.tenant_id, new.system).await? {
            Some(existing) => {
                let mut active = existing.into_active_model();
                active.webhook_url = Set(new.webhook_url);
                active.events = Set(events);
                active.secret_key = Set(new.secret_key);
                active.active = Set(true);
                active.failure_count = Set(0);
                active.updated_at = Set(now);
                active.update(&*self.db).await?
            }
            None => {
                webhook_subscription::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    tenant_id: Set(new.tenant_id),
                    system: Set(new.system.as_str().to_string()),
                    webhook_url: Set(new.webhook_url),
                    events: Set(events),
                    secret_key: Set(new.secret_key),
                    active: Set(true),
                    failure_count: Set(0),
                    last_processed_at: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&*self.db)
                .await?
            }
        };

        tracing::info!(
            tenant_id = %saved.tenant_id,
            system = %saved.system,
            "Webhook subscription upserted"
        );

        to_domain(saved)
    }

    /// Atomically bumps the failure count, returning the new value.
    pub async fn increment_failure_count(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        let result = Subscriptions::update_many()
            .col_expr(
                Column::FailureCount,
                Expr::col(Column::FailureCount).add(1),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()))
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::System.eq(system.as_str()))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }

        Ok(self
            .find_model(tenant_id, system)
            .await?
            .map(|model| model.failure_count.max(0) as u32))
    }

    /// Flips the active flag. Re-enabling also clears the failure count.
    pub async fn set_active(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut update = Subscriptions::update_many()
            .col_expr(Column::Active, Expr::value(active))
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()));
        if active {
            update = update.col_expr(Column::FailureCount, Expr::value(0));
        }

        let result = update
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::System.eq(system.as_str()))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Records a successful delivery on an active subscription and clears its failures.
    pub async fn mark_processed(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = now.fixed_offset();
        let result = Subscriptions::update_many()
            .col_expr(Column::LastProcessedAt, Expr::value(Some(now)))
            .col_expr(Column::FailureCount, Expr::value(0))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::System.eq(system.as_str()))
            .filter(Column::Active.eq(true))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }
}

fn to_domain(model: webhook_subscription::Model) -> Result<WebhookSubscription> {
    let system = model
        .system
        .parse::<ExternalSystemType>()
        .map_err(|e| anyhow!("subscription {} has invalid system: {e}", model.id))?;
    let events: Vec<String> = serde_json::from_value(model.events)?;

    Ok(WebhookSubscription {
        id: model.id,
        tenant_id: model.tenant_id,
        system,
        webhook_url: model.webhook_url,
        events,
        secret_key: model.secret_key,
        active: model.active,
        failure_count: model.failure_count.max(0) as u32,
        last_processed_at: model.last_processed_at.map(|at| at.with_timezone(&Utc)),
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    })
}
