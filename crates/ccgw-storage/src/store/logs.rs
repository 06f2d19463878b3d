#![allow(clippy::needless_update)]

use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue, ColumnTrait, EntityTrait, ExprTrait, FromQueryResult, QueryFilter, QueryOrder,
    QuerySelect,
};
use time::OffsetDateTime;

use super::{GatewayStorage, StorageResult};
use crate::codec;
use crate::entities;
use crate::entities::request_logs::Column;

/// API key identity snapshot frozen into each log row, so log history
/// survives key deletion.
#[derive(Debug, Clone)]
pub struct ApiKeySnapshot {
    pub id: i64,
    pub name: String,
    pub value_masked: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewRequestLog {
    pub endpoint: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub client_model: Option<String>,
    pub session_id: Option<String>,
    pub stream: bool,
    pub api_key: Option<ApiKeySnapshot>,
}

/// Terminal values for a log row. Token fields overwrite whatever was
/// recorded earlier (latest observation wins, so double updates are safe).
#[derive(Debug, Clone, Default)]
pub struct RequestLogFinal {
    pub status_code: i32,
    pub latency_ms: i64,
    pub ttft_ms: Option<i64>,
    pub tpot_ms: Option<f64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cached_tokens: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub limit: u64,
    pub offset: u64,
    pub endpoint: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub status: Option<i32>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub api_key_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct LogPage {
    pub rows: Vec<entities::request_logs::Model>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct RequestLogDetail {
    pub log: entities::request_logs::Model,
    pub prompt: Option<String>,
    pub response: Option<String>,
}

#[derive(Debug, Clone, Default, FromQueryResult, serde::Serialize)]
pub struct StatsOverview {
    pub total_requests: Option<i64>,
    pub total_input_tokens: Option<i64>,
    pub total_output_tokens: Option<i64>,
    pub total_latency_ms: Option<i64>,
}

#[derive(Debug, Clone, FromQueryResult, serde::Serialize)]
pub struct ModelStatRow {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub request_count: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

#[derive(Debug, Clone, FromQueryResult, serde::Serialize)]
pub struct KeyUsageRow {
    pub api_key_id: Option<i64>,
    pub api_key_name: Option<String>,
    pub request_count: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

impl GatewayStorage {
    pub async fn insert_request_log(&self, log: NewRequestLog) -> StorageResult<i64> {
        let (key_id, key_name, key_masked) = match log.api_key {
            Some(snapshot) => (
                Some(snapshot.id),
                Some(snapshot.name),
                Some(snapshot.value_masked),
            ),
            None => (None, None, None),
        };
        let active = entities::request_logs::ActiveModel {
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            session_id: ActiveValue::Set(log.session_id),
            endpoint: ActiveValue::Set(log.endpoint),
            provider: ActiveValue::Set(log.provider),
            model: ActiveValue::Set(log.model),
            client_model: ActiveValue::Set(log.client_model),
            stream: ActiveValue::Set(log.stream),
            api_key_id: ActiveValue::Set(key_id),
            api_key_name: ActiveValue::Set(key_name),
            api_key_value_masked: ActiveValue::Set(key_masked),
            ..Default::default()
        };
        let result = entities::RequestLogs::insert(active).exec(&self.db).await?;
        Ok(result.last_insert_id)
    }

    pub async fn finalize_request_log(
        &self,
        id: i64,
        terminal: RequestLogFinal,
    ) -> StorageResult<()> {
        let mut update = entities::RequestLogs::update_many()
            .col_expr(Column::StatusCode, Expr::value(terminal.status_code))
            .col_expr(Column::LatencyMs, Expr::value(terminal.latency_ms))
            .col_expr(Column::TtftMs, Expr::value(terminal.ttft_ms))
            .col_expr(Column::TpotMs, Expr::value(terminal.tpot_ms))
            .col_expr(Column::Error, Expr::value(terminal.error));
        if terminal.input_tokens.is_some() {
            update = update.col_expr(Column::InputTokens, Expr::value(terminal.input_tokens));
        }
        if terminal.output_tokens.is_some() {
            update = update.col_expr(Column::OutputTokens, Expr::value(terminal.output_tokens));
        }
        if terminal.cached_tokens.is_some() {
            update = update.col_expr(Column::CachedTokens, Expr::value(terminal.cached_tokens));
        }
        update.filter(Column::Id.eq(id)).exec(&self.db).await?;
        Ok(())
    }

    /// Compress and upsert payload blobs. `None` leaves the existing column
    /// untouched so prompt and response can be written at different times.
    pub async fn upsert_request_payload(
        &self,
        request_id: i64,
        prompt: Option<&str>,
        response: Option<&str>,
    ) -> StorageResult<()> {
        use crate::entities::request_payloads::Column as PayloadColumn;

        let prompt_blob = match prompt {
            Some(text) => Some(codec::compress(text).await?),
            None => None,
        };
        let response_blob = match response {
            Some(text) => Some(codec::compress(text).await?),
            None => None,
        };

        let active = entities::request_payloads::ActiveModel {
            request_id: ActiveValue::Set(request_id),
            prompt: ActiveValue::Set(prompt_blob.clone()),
            response: ActiveValue::Set(response_blob.clone()),
            ..Default::default()
        };

        let mut conflict = OnConflict::column(PayloadColumn::RequestId);
        let mut any_update = false;
        if prompt_blob.is_some() {
            conflict.update_column(PayloadColumn::Prompt);
            any_update = true;
        }
        if response_blob.is_some() {
            conflict.update_column(PayloadColumn::Response);
            any_update = true;
        }
        if !any_update {
            conflict.do_nothing();
        }

        let insert = entities::RequestPayloads::insert(active).on_conflict(conflict);
        match insert.exec(&self.db).await {
            Ok(_) => Ok(()),
            // DO NOTHING on a pure no-op upsert reports zero rows.
            Err(sea_orm::DbErr::RecordNotInserted) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_request_log(&self, id: i64) -> StorageResult<Option<RequestLogDetail>> {
        let Some(log) = entities::RequestLogs::find_by_id(id).one(&self.db).await? else {
            return Ok(None);
        };
        let payloads = entities::RequestPayloads::find_by_id(id).one(&self.db).await?;
        let (prompt, response) = match payloads {
            Some(row) => (
                decode_blob(row.prompt.as_deref()).await,
                decode_blob(row.response.as_deref()).await,
            ),
            None => (None, None),
        };
        Ok(Some(RequestLogDetail {
            log,
            prompt,
            response,
        }))
    }

    pub async fn query_request_logs(&self, filter: LogFilter) -> StorageResult<LogPage> {
        let limit = filter.limit.clamp(1, 500);
        let mut query = entities::RequestLogs::find()
            .order_by_desc(Column::Id)
            .offset(filter.offset)
            .limit(limit + 1);
        query = apply_log_filter(query, &filter);

        let mut rows = query.all(&self.db).await?;
        let has_more = rows.len() as u64 > limit;
        rows.truncate(limit as usize);
        Ok(LogPage { rows, has_more })
    }

    /// All matching rows with decompressed payloads, for the ZIP export.
    pub async fn export_request_logs(
        &self,
        filter: LogFilter,
    ) -> StorageResult<Vec<RequestLogDetail>> {
        let mut query = entities::RequestLogs::find().order_by_desc(Column::Id);
        if filter.limit > 0 {
            query = query.offset(filter.offset).limit(filter.limit);
        }
        query = apply_log_filter(query, &filter);
        let rows = query.all(&self.db).await?;

        let mut details = Vec::with_capacity(rows.len());
        for log in rows {
            let payloads = entities::RequestPayloads::find_by_id(log.id).one(&self.db).await?;
            let (prompt, response) = match payloads {
                Some(row) => (
                    decode_blob(row.prompt.as_deref()).await,
                    decode_blob(row.response.as_deref()).await,
                ),
                None => (None, None),
            };
            details.push(RequestLogDetail {
                log,
                prompt,
                response,
            });
        }
        Ok(details)
    }

    pub async fn stats_overview(
        &self,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> StorageResult<StatsOverview> {
        let mut query = entities::RequestLogs::find()
            .select_only()
            .column_as(Expr::col(Column::Id).count(), "total_requests")
            .column_as(Expr::col(Column::InputTokens).sum(), "total_input_tokens")
            .column_as(Expr::col(Column::OutputTokens).sum(), "total_output_tokens")
            .column_as(Expr::col(Column::LatencyMs).sum(), "total_latency_ms");
        if let Some(from) = from {
            query = query.filter(Column::CreatedAt.gte(from));
        }
        if let Some(to) = to {
            query = query.filter(Column::CreatedAt.lt(to));
        }
        let overview = query
            .into_model::<StatsOverview>()
            .one(&self.db)
            .await?
            .unwrap_or_default();
        Ok(overview)
    }

    pub async fn stats_by_model(
        &self,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> StorageResult<Vec<ModelStatRow>> {
        let mut query = entities::RequestLogs::find()
            .select_only()
            .column(Column::Provider)
            .column(Column::Model)
            .column_as(Expr::col(Column::Id).count(), "request_count")
            .column_as(Expr::col(Column::InputTokens).sum(), "input_tokens")
            .column_as(Expr::col(Column::OutputTokens).sum(), "output_tokens")
            .group_by(Column::Provider)
            .group_by(Column::Model);
        if let Some(from) = from {
            query = query.filter(Column::CreatedAt.gte(from));
        }
        if let Some(to) = to {
            query = query.filter(Column::CreatedAt.lt(to));
        }
        Ok(query.into_model::<ModelStatRow>().all(&self.db).await?)
    }

    pub async fn stats_by_api_key(
        &self,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> StorageResult<Vec<KeyUsageRow>> {
        let mut query = entities::RequestLogs::find()
            .select_only()
            .column(Column::ApiKeyId)
            .column(Column::ApiKeyName)
            .column_as(Expr::col(Column::Id).count(), "request_count")
            .column_as(Expr::col(Column::InputTokens).sum(), "input_tokens")
            .column_as(Expr::col(Column::OutputTokens).sum(), "output_tokens")
            .group_by(Column::ApiKeyId)
            .group_by(Column::ApiKeyName);
        if let Some(from) = from {
            query = query.filter(Column::CreatedAt.gte(from));
        }
        if let Some(to) = to {
            query = query.filter(Column::CreatedAt.lt(to));
        }
        Ok(query.into_model::<KeyUsageRow>().all(&self.db).await?)
    }
}

fn apply_log_filter(
    mut query: sea_orm::Select<entities::RequestLogs>,
    filter: &LogFilter,
) -> sea_orm::Select<entities::RequestLogs> {
    if let Some(endpoint) = &filter.endpoint {
        query = query.filter(Column::Endpoint.eq(endpoint));
    }
    if let Some(provider) = &filter.provider {
        query = query.filter(Column::Provider.eq(provider));
    }
    if let Some(model) = &filter.model {
        query = query.filter(Column::Model.eq(model));
    }
    if let Some(status) = filter.status {
        query = query.filter(Column::StatusCode.eq(status));
    }
    if let Some(from) = filter.from {
        query = query.filter(Column::CreatedAt.gte(from));
    }
    if let Some(to) = filter.to {
        query = query.filter(Column::CreatedAt.lt(to));
    }
    if !filter.api_key_ids.is_empty() {
        query = query.filter(Column::ApiKeyId.is_in(filter.api_key_ids.iter().copied()));
    }
    query
}

async fn decode_blob(blob: Option<&[u8]>) -> Option<String> {
    let bytes = blob?;
    match codec::decompress(bytes).await {
        Ok(text) => Some(text),
        Err(err) => {
            // A corrupt blob should not take the whole detail view down.
            tracing::warn!(event = "payload_decode_failed", error = %err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_storage;

    fn new_log(endpoint: &str) -> NewRequestLog {
        NewRequestLog {
            endpoint: endpoint.to_string(),
            provider: Some("deepseek".to_string()),
            model: Some("deepseek-chat".to_string()),
            client_model: Some("claude-3-5-sonnet".to_string()),
            stream: true,
            ..NewRequestLog::default()
        }
    }

    #[tokio::test]
    async fn log_lifecycle_insert_finalize_fetch() {
        let storage = memory_storage().await;
        let id = storage.insert_request_log(new_log("anthropic")).await.unwrap();

        storage
            .finalize_request_log(
                id,
                RequestLogFinal {
                    status_code: 200,
                    latency_ms: 1200,
                    ttft_ms: Some(300),
                    tpot_ms: Some(12.5),
                    input_tokens: Some(100),
                    output_tokens: Some(40),
                    cached_tokens: None,
                    error: None,
                },
            )
            .await
            .unwrap();

        let detail = storage.get_request_log(id).await.unwrap().unwrap();
        assert_eq!(detail.log.status_code, Some(200));
        assert_eq!(detail.log.latency_ms, Some(1200));
        assert_eq!(detail.log.input_tokens, Some(100));
        assert!(detail.prompt.is_none());
    }

    #[tokio::test]
    async fn finalize_keeps_earlier_tokens_when_refreshed_with_none() {
        let storage = memory_storage().await;
        let id = storage.insert_request_log(new_log("anthropic")).await.unwrap();

        storage
            .finalize_request_log(
                id,
                RequestLogFinal {
                    status_code: 200,
                    latency_ms: 100,
                    output_tokens: Some(7),
                    ..RequestLogFinal::default()
                },
            )
            .await
            .unwrap();
        // A second write without token data must not erase the counters.
        storage
            .finalize_request_log(
                id,
                RequestLogFinal {
                    status_code: 200,
                    latency_ms: 120,
                    ..RequestLogFinal::default()
                },
            )
            .await
            .unwrap();

        let detail = storage.get_request_log(id).await.unwrap().unwrap();
        assert_eq!(detail.log.output_tokens, Some(7));
        assert_eq!(detail.log.latency_ms, Some(120));
    }

    #[tokio::test]
    async fn payload_round_trip_and_partial_upsert() {
        let storage = memory_storage().await;
        let id = storage.insert_request_log(new_log("anthropic")).await.unwrap();

        storage
            .upsert_request_payload(id, Some("{\"prompt\":true}"), None)
            .await
            .unwrap();
        storage
            .upsert_request_payload(id, None, Some("streamed response text"))
            .await
            .unwrap();

        let detail = storage.get_request_log(id).await.unwrap().unwrap();
        assert_eq!(detail.prompt.as_deref(), Some("{\"prompt\":true}"));
        assert_eq!(detail.response.as_deref(), Some("streamed response text"));
    }

    #[tokio::test]
    async fn query_filters_and_pagination() {
        let storage = memory_storage().await;
        for _ in 0..3 {
            storage.insert_request_log(new_log("anthropic")).await.unwrap();
        }
        storage.insert_request_log(new_log("openai")).await.unwrap();

        let page = storage
            .query_request_logs(LogFilter {
                limit: 2,
                endpoint: Some("anthropic".to_string()),
                ..LogFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 2);
        assert!(page.has_more);

        let page = storage
            .query_request_logs(LogFilter {
                limit: 10,
                endpoint: Some("openai".to_string()),
                ..LogFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 1);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn clear_logs_removes_everything() {
        let storage = memory_storage().await;
        let id = storage.insert_request_log(new_log("anthropic")).await.unwrap();
        storage
            .upsert_request_payload(id, Some("p"), None)
            .await
            .unwrap();
        let deleted = storage.clear_logs().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(storage.get_request_log(id).await.unwrap().is_none());
    }
}
