//! Database migrations for the POS gateway.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_webhook_subscriptions;
mod m2026_01_05_090100_create_integration_errors;
mod m2026_01_05_090200_create_recovery_actions;
mod m2026_01_05_090300_create_integration_credentials;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_webhook_subscriptions::Migration),
            Box::new(m2026_01_05_090100_create_integration_errors::Migration),
            Box::new(m2026_01_05_090200_create_recovery_actions::Migration),
            Box::new(m2026_01_05_090300_create_integration_credentials::Migration),
        ]
    }
}
