//! Creates the integration_errors table, an append-only log of terminal failures.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(IntegrationErrors::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IntegrationErrors::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(IntegrationErrors::TenantId).uuid().null())
                    .col(ColumnDef::new(IntegrationErrors::System).text().not_null())
                    .col(ColumnDef::new(IntegrationErrors::Source).text().not_null())
                    .col(ColumnDef::new(IntegrationErrors::Code).text().not_null())
                    .col(ColumnDef::new(IntegrationErrors::Message).text().not_null())
                    .col(ColumnDef::new(IntegrationErrors::HttpStatus).integer().null())
                    .col(
                        ColumnDef::new(IntegrationErrors::Retryable)
                            .boolean()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IntegrationErrors::Details).json_binary().null())
                    .col(
                        ColumnDef::new(IntegrationErrors::OccurredAt)
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
                    .name("idx_integration_errors_occurred_at")
                    .table(IntegrationErrors::Table)
                    .col(IntegrationErrors::OccurredAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_integration_errors_occurred_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(IntegrationErrors::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum IntegrationErrors {
    Table,
    Id,
    TenantId,
    System,
    Source,
    Code,
    Message,
    HttpStatus,
    Retryable,
    Details,
    OccurredAt,
}
