use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue, ColumnTrait, EntityTrait, ExprTrait, QueryFilter, QueryOrder, QuerySelect,
};
use time::OffsetDateTime;

use super::{GatewayStorage, StorageResult};
use crate::entities;
use crate::entities::api_keys::Column;

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub name: String,
    pub description: Option<String>,
    pub key_hash: String,
    pub key_ciphertext: String,
    pub key_prefix: String,
    pub key_suffix: String,
    pub is_wildcard: bool,
    pub allowed_endpoints: Option<Vec<String>>,
}

/// Partial update; `allowed_endpoints` is doubly optional so "leave alone",
/// "clear restriction", and "set restriction" are all expressible.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub allowed_endpoints: Option<Option<Vec<String>>>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditEntry {
    pub api_key_id: Option<i64>,
    pub api_key_name: Option<String>,
    pub operation: String,
    pub operator: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuditPage {
    pub rows: Vec<entities::api_key_audit_logs::Model>,
    pub has_more: bool,
}

pub(crate) fn encode_endpoints(endpoints: &[String]) -> String {
    serde_json::to_string(endpoints).unwrap_or_else(|_| "[]".to_string())
}

pub fn decode_endpoints(raw: Option<&str>) -> Option<Vec<String>> {
    raw.and_then(|text| serde_json::from_str(text).ok())
}

impl GatewayStorage {
    pub async fn insert_api_key(&self, key: NewApiKey) -> StorageResult<i64> {
        let active = entities::api_keys::ActiveModel {
            name: ActiveValue::Set(key.name),
            description: ActiveValue::Set(key.description),
            key_hash: ActiveValue::Set(key.key_hash),
            key_ciphertext: ActiveValue::Set(key.key_ciphertext),
            key_prefix: ActiveValue::Set(key.key_prefix),
            key_suffix: ActiveValue::Set(key.key_suffix),
            is_wildcard: ActiveValue::Set(key.is_wildcard),
            enabled: ActiveValue::Set(true),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            last_used_at: ActiveValue::Set(None),
            request_count: ActiveValue::Set(0),
            total_input_tokens: ActiveValue::Set(0),
            total_output_tokens: ActiveValue::Set(0),
            allowed_endpoints: ActiveValue::Set(
                key.allowed_endpoints
                    .as_deref()
                    .map(encode_endpoints),
            ),
            ..Default::default()
        };
        let result = entities::ApiKeys::insert(active).exec(&self.db).await?;
        Ok(result.last_insert_id)
    }

    pub async fn list_api_keys(&self) -> StorageResult<Vec<entities::api_keys::Model>> {
        Ok(entities::ApiKeys::find()
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn get_api_key(&self, id: i64) -> StorageResult<Option<entities::api_keys::Model>> {
        Ok(entities::ApiKeys::find_by_id(id).one(&self.db).await?)
    }

    pub async fn find_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> StorageResult<Option<entities::api_keys::Model>> {
        Ok(entities::ApiKeys::find()
            .filter(Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?)
    }

    pub async fn find_wildcard_api_key(
        &self,
    ) -> StorageResult<Option<entities::api_keys::Model>> {
        Ok(entities::ApiKeys::find()
            .filter(Column::IsWildcard.eq(true))
            .one(&self.db)
            .await?)
    }

    pub async fn update_api_key(&self, id: i64, patch: ApiKeyPatch) -> StorageResult<()> {
        let mut update = entities::ApiKeys::update_many();
        let mut dirty = false;
        if let Some(name) = patch.name {
            update = update.col_expr(Column::Name, Expr::value(name));
            dirty = true;
        }
        if let Some(description) = patch.description {
            update = update.col_expr(Column::Description, Expr::value(description));
            dirty = true;
        }
        if let Some(enabled) = patch.enabled {
            update = update.col_expr(Column::Enabled, Expr::value(enabled));
            dirty = true;
        }
        if let Some(endpoints) = patch.allowed_endpoints {
            update = update.col_expr(
                Column::AllowedEndpoints,
                Expr::value(endpoints.as_deref().map(encode_endpoints)),
            );
            dirty = true;
        }
        if !dirty {
            return Ok(());
        }
        update.filter(Column::Id.eq(id)).exec(&self.db).await?;
        Ok(())
    }

    pub async fn delete_api_key(&self, id: i64) -> StorageResult<bool> {
        let result = entities::ApiKeys::delete_by_id(id).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }

    /// Bump usage counters and touch `last_used_at`.
    pub async fn record_api_key_usage(
        &self,
        id: i64,
        input_tokens: i64,
        output_tokens: i64,
    ) -> StorageResult<()> {
        entities::ApiKeys::update_many()
            .col_expr(
                Column::RequestCount,
                Expr::col(Column::RequestCount).add(1),
            )
            .col_expr(
                Column::TotalInputTokens,
                Expr::col(Column::TotalInputTokens).add(input_tokens),
            )
            .col_expr(
                Column::TotalOutputTokens,
                Expr::col(Column::TotalOutputTokens).add(output_tokens),
            )
            .col_expr(
                Column::LastUsedAt,
                Expr::value(Some(OffsetDateTime::now_utc())),
            )
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn append_audit(&self, entry: AuditEntry) -> StorageResult<()> {
        let active = entities::api_key_audit_logs::ActiveModel {
            api_key_id: ActiveValue::Set(entry.api_key_id),
            api_key_name: ActiveValue::Set(entry.api_key_name),
            operation: ActiveValue::Set(entry.operation),
            operator: ActiveValue::Set(entry.operator),
            details: ActiveValue::Set(entry.details.map(|value| value.to_string())),
            ip_address: ActiveValue::Set(entry.ip_address),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::ApiKeyAuditLogs::insert(active).exec(&self.db).await?;
        Ok(())
    }

    pub async fn query_audit(&self, limit: u64, offset: u64) -> StorageResult<AuditPage> {
        let limit = limit.clamp(1, 500);
        let mut rows = entities::ApiKeyAuditLogs::find()
            .order_by_desc(entities::api_key_audit_logs::Column::Id)
            .offset(offset)
            .limit(limit + 1)
            .all(&self.db)
            .await?;
        let has_more = rows.len() as u64 > limit;
        rows.truncate(limit as usize);
        Ok(AuditPage { rows, has_more })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_storage;

    fn new_key(name: &str, hash: &str, wildcard: bool) -> NewApiKey {
        NewApiKey {
            name: name.to_string(),
            description: None,
            key_hash: hash.to_string(),
            key_ciphertext: "v1:dGVzdA==".to_string(),
            key_prefix: "sk-ccgw-ab".to_string(),
            key_suffix: "yz".to_string(),
            is_wildcard: wildcard,
            allowed_endpoints: None,
        }
    }

    #[tokio::test]
    async fn insert_and_lookup_by_hash() {
        let storage = memory_storage().await;
        let id = storage.insert_api_key(new_key("ci", "hash-a", false)).await.unwrap();
        let found = storage.find_api_key_by_hash("hash-a").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(found.enabled);
        assert_eq!(found.request_count, 0);
        assert!(storage.find_api_key_by_hash("hash-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_counters_accumulate() {
        let storage = memory_storage().await;
        let id = storage.insert_api_key(new_key("ci", "hash-a", false)).await.unwrap();
        storage.record_api_key_usage(id, 100, 10).await.unwrap();
        storage.record_api_key_usage(id, 50, 5).await.unwrap();
        let key = storage.get_api_key(id).await.unwrap().unwrap();
        assert_eq!(key.request_count, 2);
        assert_eq!(key.total_input_tokens, 150);
        assert_eq!(key.total_output_tokens, 15);
        assert!(key.last_used_at.is_some());
    }

    #[tokio::test]
    async fn patch_endpoints_three_states() {
        let storage = memory_storage().await;
        let id = storage.insert_api_key(new_key("ci", "hash-a", false)).await.unwrap();

        storage
            .update_api_key(
                id,
                ApiKeyPatch {
                    allowed_endpoints: Some(Some(vec!["anthropic".to_string()])),
                    ..ApiKeyPatch::default()
                },
            )
            .await
            .unwrap();
        let key = storage.get_api_key(id).await.unwrap().unwrap();
        assert_eq!(
            decode_endpoints(key.allowed_endpoints.as_deref()),
            Some(vec!["anthropic".to_string()])
        );

        // Leave alone.
        storage.update_api_key(id, ApiKeyPatch::default()).await.unwrap();
        let key = storage.get_api_key(id).await.unwrap().unwrap();
        assert!(key.allowed_endpoints.is_some());

        // Clear.
        storage
            .update_api_key(
                id,
                ApiKeyPatch {
                    allowed_endpoints: Some(None),
                    ..ApiKeyPatch::default()
                },
            )
            .await
            .unwrap();
        let key = storage.get_api_key(id).await.unwrap().unwrap();
        assert!(key.allowed_endpoints.is_none());
    }

    #[tokio::test]
    async fn audit_pages_in_reverse_order() {
        let storage = memory_storage().await;
        for operation in ["create", "disable", "enable"] {
            storage
                .append_audit(AuditEntry {
                    operation: operation.to_string(),
                    ..AuditEntry::default()
                })
                .await
                .unwrap();
        }
        let page = storage.query_audit(2, 0).await.unwrap();
        assert_eq!(page.rows.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.rows[0].operation, "enable");
    }
}
