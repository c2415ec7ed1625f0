//! RecoveryAction entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "recovery_actions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// `retry`, `refresh_token`, `reset_connection` or `disable_integration`
    pub kind: String,

    pub tenant_id: Option<Uuid>,

    pub system: String,

    pub scheduled_at: DateTimeWithTimeZone,

    pub attempts: i32,

    pub max_attempts: i32,

    pub last_attempt_at: Option<DateTimeWithTimeZone>,

    pub success: bool,

    pub last_error: Option<String>,

    /// Error code of the failure that created the action
    pub error_code: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub retired_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
