//! Creates the webhook_subscriptions table.
//!
//! One row per (tenant, system) pair. `active` and `failure_count` drive auto-disable.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(WebhookSubscriptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookSubscriptions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::TenantId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::System)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::WebhookUrl)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::Events)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::SecretKey)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::FailureCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::LastProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_subscriptions_tenant_system")
                    .table(WebhookSubscriptions::Table)
                    .col(WebhookSubscriptions::TenantId)
                    .col(WebhookSubscriptions::System)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_webhook_subscriptions_tenant_system")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(WebhookSubscriptions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum WebhookSubscriptions {
    Table,
    Id,
    TenantId,
    System,
    WebhookUrl,
    Events,
    SecretKey,
    Active,
    FailureCount,
    LastProcessedAt,
    CreatedAt,
    UpdatedAt,
}
