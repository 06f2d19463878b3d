use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_payloads")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub request_id: i64,
    /// Brotli-compressed prompt JSON.
    pub prompt: Option<Vec<u8>>,
    /// Brotli-compressed response text.
    pub response: Option<Vec<u8>>,
    #[sea_orm(belongs_to, from = "request_id", to = "id", on_delete = "Cascade")]
    pub request: HasOne<super::request_logs::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
