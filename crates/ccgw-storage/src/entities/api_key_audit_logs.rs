use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_key_audit_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub api_key_id: Option<i64>,
    pub api_key_name: Option<String>,
    /// create | delete | enable | disable | update_endpoints | auth_failure
    pub operation: String,
    pub operator: Option<String>,
    /// JSON details; for auth_failure at most a 16-hex-char hash prefix.
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
