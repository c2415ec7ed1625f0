//! Creates the integration_credentials table holding sealed adapter credentials.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(IntegrationCredentials::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IntegrationCredentials::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::TenantId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::System)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::Sealed)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::UpdatedAt)
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
                    .name("idx_integration_credentials_tenant_system")
                    .table(IntegrationCredentials::Table)
                    .col(IntegrationCredentials::TenantId)
                    .col(IntegrationCredentials::System)
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
                    .name("idx_integration_credentials_tenant_system")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(IntegrationCredentials::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum IntegrationCredentials {
    Table,
    Id,
    TenantId,
    System,
    Sealed,
    CreatedAt,
    UpdatedAt,
}
