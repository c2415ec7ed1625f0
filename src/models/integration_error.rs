//! IntegrationError entity model
//!
//! Append-only record of failures reported to the recovery engine.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "integration_errors")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// `None` for system-wide failures
    pub tenant_id: Option<Uuid>,

    pub system: String,

    /// `dispatch` or `webhook`
    pub source: String,

    pub code: String,

    pub message: String,

    pub http_status: Option<i32>,

    pub retryable: bool,

    #[sea_orm(column_type = "JsonBinary")]
    pub details: Option<JsonValue>,

    pub occurred_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
