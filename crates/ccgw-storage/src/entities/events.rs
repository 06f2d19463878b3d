use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Gateway lifecycle events (startup, shutdown, config changes, retention
/// sweeps). API key activity lives in `api_key_audit_logs`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: OffsetDateTime,
    pub level: String,
    pub kind: String,
    pub message: String,
    pub details: Option<String>,
}

impl ActiveModelBehavior for ActiveModel {}
