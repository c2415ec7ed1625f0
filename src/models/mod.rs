//! # Data Models
//!
//! SeaORM entities for the gateway's durable state.

pub mod integration_credential;
pub mod integration_error;
pub mod recovery_action;
pub mod webhook_subscription;

pub use integration_credential::Entity as IntegrationCredential;
pub use integration_error::Entity as IntegrationErrorRow;
pub use recovery_action::Entity as RecoveryActionRow;
pub use webhook_subscription::Entity as WebhookSubscriptionRow;
