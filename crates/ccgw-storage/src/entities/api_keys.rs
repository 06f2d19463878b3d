use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// SHA-256 of the plaintext key, hex encoded.
    #[sea_orm(unique_key = "api_key_hash")]
    pub key_hash: String,
    /// Vault envelope of the plaintext, for reveal.
    pub key_ciphertext: String,
    pub key_prefix: String,
    pub key_suffix: String,
    pub is_wildcard: bool,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub request_count: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    /// JSON array of endpoint ids; NULL means unrestricted.
    pub allowed_endpoints: Option<String>,
}

impl ActiveModelBehavior for ActiveModel {}
