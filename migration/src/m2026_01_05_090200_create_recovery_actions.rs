//! Creates the recovery_actions table.
//!
//! Due actions are selected by `(success, scheduled_at)`, hence the composite index.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RecoveryActions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RecoveryActions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RecoveryActions::Kind).text().not_null())
                    .col(ColumnDef::new(RecoveryActions::TenantId).uuid().null())
                    .col(ColumnDef::new(RecoveryActions::System).text().not_null())
                    .col(
                        ColumnDef::new(RecoveryActions::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RecoveryActions::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RecoveryActions::MaxAttempts)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RecoveryActions::LastAttemptAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RecoveryActions::Success)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(RecoveryActions::LastError).text().null())
                    .col(ColumnDef::new(RecoveryActions::ErrorCode).text().null())
                    .col(
                        ColumnDef::new(RecoveryActions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RecoveryActions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RecoveryActions::RetiredAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_recovery_actions_due")
                    .table(RecoveryActions::Table)
                    .col(RecoveryActions::Success)
                    .col(RecoveryActions::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_recovery_actions_due").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(RecoveryActions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RecoveryActions {
    Table,
    Id,
    Kind,
    TenantId,
    System,
    ScheduledAt,
    Attempts,
    MaxAttempts,
    LastAttemptAt,
    Success,
    LastError,
    ErrorCode,
    CreatedAt,
    UpdatedAt,
    RetiredAt,
}
