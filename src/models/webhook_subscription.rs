//! WebhookSubscription entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "webhook_subscriptions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    /// Lower-case system name (`square`, `toast`, ...)
    pub system: String,

    pub webhook_url: String,

    /// JSON array of subscribed event names
    #[sea_orm(column_type = "JsonBinary")]
    pub events: JsonValue,

    pub secret_key: String,

    pub active: bool,

    /// Terminal failures since the last successful delivery
    pub failure_count: i32,

    pub last_processed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
