//! Management API under `/api`: status, config, keys, logs, stats, audit
//! events, and the optional web-console session.

use std::io::Write;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use ccgw_config::GatewayConfig;
use ccgw_core::keys::sha256_hex;
use ccgw_core::{GatewayState, KeyServiceError, KeySettingsPatch, SessionStore};
use ccgw_storage::{decode_endpoints, entities, LogFilter};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::http::{cookie_value, epoch_ms, from_epoch_ms};

const SESSION_COOKIE: &str = "ccgw_session";

pub fn management_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/config/info", get(config_info))
        .route("/config", put(put_config))
        .route("/providers", get(list_providers))
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/{id}", axum::routing::patch(patch_key).delete(delete_key))
        .route("/keys/{id}/reveal", get(reveal_key))
        .route("/logs", get(query_logs))
        .route("/logs/export", post(export_logs))
        .route("/logs/cleanup", post(cleanup_logs))
        .route("/logs/clear", post(clear_logs))
        .route("/logs/{id}", get(log_detail))
        .route("/stats/overview", get(stats_overview))
        .route("/stats/daily", get(stats_daily))
        .route("/stats/model", get(stats_model))
        .route("/stats/api-keys/overview", get(stats_api_keys_overview))
        .route("/stats/api-keys/usage", get(stats_api_keys_usage))
        .route("/events", get(query_events))
        .route("/auth/web", get(web_auth_info).post(set_web_auth))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .layer(middleware::from_fn_with_state(state.clone(), session_guard))
        .with_state(state)
}

/// Gate everything behind the console session when web auth is enabled.
/// Login and the auth probe stay reachable so a session can be established.
async fn session_guard(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    let open = path == "/auth/login"
        || (path == "/auth/web" && request.method() == axum::http::Method::GET);
    if !open && SessionStore::required(&state.config.snapshot()) {
        let token = cookie_value(request.headers(), SESSION_COOKIE)
            .or_else(|| crate::http::header_value(request.headers(), "x-session-token"));
        let authorized = token.is_some_and(|token| state.sessions.validate(&token));
        if !authorized {
            return api_error(StatusCode::UNAUTHORIZED, "session required");
        }
    }
    next.run(request).await
}

fn api_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"error": {"message": message}})),
    )
        .into_response()
}

fn storage_error(err: impl std::fmt::Display) -> Response {
    warn!(event = "management_storage_error", error = %err);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "storage error")
}

fn key_service_error(err: KeyServiceError) -> Response {
    let status = match &err {
        KeyServiceError::NotFound => StatusCode::NOT_FOUND,
        KeyServiceError::WildcardExists
        | KeyServiceError::WildcardRestricted
        | KeyServiceError::WildcardReveal
        | KeyServiceError::WildcardDelete => StatusCode::BAD_REQUEST,
        KeyServiceError::RevealUnavailable
        | KeyServiceError::Storage(_)
        | KeyServiceError::Vault(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, &err.to_string())
}

// ---- status / config / providers ----------------------------------------

async fn status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let config = state.config.snapshot();
    Json(serde_json::json!({
        "host": config.host,
        "port": config.port,
        "providers": config.providers.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
        "activeRequests": state.active_requests(),
    }))
}

async fn config_info(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "path": state.config.path().display().to_string(),
        "config": &*state.config.snapshot(),
    }))
}

async fn put_config(
    State(state): State<Arc<GatewayState>>,
    Json(next): Json<GatewayConfig>,
) -> Response {
    match state.config.update(next).await {
        Ok(_) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(err) => api_error(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn list_providers(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let config = state.config.snapshot();
    let providers: Vec<serde_json::Value> = config
        .providers
        .iter()
        .map(|provider| {
            serde_json::json!({
                "id": provider.id,
                "label": provider.label,
                "type": provider.r#type,
                "models": provider.models.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
                "defaultModel": provider.default_model,
                "hasApiKey": provider.api_key.is_some(),
            })
        })
        .collect();
    Json(providers)
}

// ---- API keys ------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyBody {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    allowed_endpoints: Option<Vec<String>>,
    #[serde(default)]
    is_wildcard: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyView {
    id: i64,
    name: String,
    description: Option<String>,
    key_prefix: String,
    key_suffix: String,
    masked: String,
    is_wildcard: bool,
    enabled: bool,
    created_at: i64,
    last_used_at: Option<i64>,
    request_count: i64,
    total_input_tokens: i64,
    total_output_tokens: i64,
    allowed_endpoints: Option<Vec<String>>,
}

impl From<entities::api_keys::Model> for KeyView {
    fn from(row: entities::api_keys::Model) -> Self {
        Self {
            masked: ccgw_common::mask_key(&row.key_prefix, &row.key_suffix),
            id: row.id,
            name: row.name,
            description: row.description,
            key_prefix: row.key_prefix,
            key_suffix: row.key_suffix,
            is_wildcard: row.is_wildcard,
            enabled: row.enabled,
            created_at: epoch_ms(row.created_at),
            last_used_at: row.last_used_at.map(epoch_ms),
            request_count: row.request_count,
            total_input_tokens: row.total_input_tokens,
            total_output_tokens: row.total_output_tokens,
            allowed_endpoints: decode_endpoints(row.allowed_endpoints.as_deref()),
        }
    }
}

async fn list_keys(State(state): State<Arc<GatewayState>>) -> Response {
    match state.storage.list_api_keys().await {
        Ok(rows) => Json(rows.into_iter().map(KeyView::from).collect::<Vec<_>>()).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn create_key(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> Response {
    let ip = crate::http::client_ip(&headers);
    match state
        .keys
        .create(
            &body.name,
            body.description,
            body.allowed_endpoints,
            body.is_wildcard,
            Some("management"),
            ip.as_deref(),
        )
        .await
    {
        Ok(created) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"id": created.id, "key": created.plaintext})),
        )
            .into_response(),
        Err(err) => key_service_error(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchKeyBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, with = "double_option")]
    description: Option<Option<String>>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default, with = "double_option")]
    allowed_endpoints: Option<Option<Vec<String>>>,
}

/// Distinguishes an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

async fn patch_key(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<PatchKeyBody>,
) -> Response {
    let ip = crate::http::client_ip(&headers);
    let patch = KeySettingsPatch {
        name: body.name,
        description: body.description,
        enabled: body.enabled,
        allowed_endpoints: body.allowed_endpoints,
    };
    match state
        .keys
        .update_settings(id, patch, Some("management"), ip.as_deref())
        .await
    {
        Ok(()) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(err) => key_service_error(err),
    }
}

async fn delete_key(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let ip = crate::http::client_ip(&headers);
    match state.keys.delete(id, Some("management"), ip.as_deref()).await {
        Ok(()) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(err) => key_service_error(err),
    }
}

async fn reveal_key(State(state): State<Arc<GatewayState>>, Path(id): Path<i64>) -> Response {
    match state.keys.reveal(id).await {
        Ok(plaintext) => Json(serde_json::json!({"key": plaintext})).into_response(),
        Err(err) => key_service_error(err),
    }
}

// ---- logs ----------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    #[serde(default)]
    limit: Option<u64>,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    status: Option<i32>,
    /// Epoch milliseconds, inclusive.
    #[serde(default)]
    from: Option<i64>,
    /// Epoch milliseconds, exclusive.
    #[serde(default)]
    to: Option<i64>,
    /// Comma-separated API key ids.
    #[serde(default)]
    api_keys: Option<String>,
}

impl LogsQuery {
    fn into_filter(self) -> LogFilter {
        LogFilter {
            limit: self.limit.unwrap_or(50),
            offset: self.offset.unwrap_or(0),
            endpoint: self.endpoint,
            provider: self.provider,
            model: self.model,
            status: self.status,
            from: self.from.and_then(from_epoch_ms),
            to: self.to.and_then(from_epoch_ms),
            api_key_ids: self
                .api_keys
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .filter_map(|id| id.trim().parse::<i64>().ok())
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogView {
    id: i64,
    timestamp: i64,
    session_id: Option<String>,
    endpoint: String,
    provider: Option<String>,
    model: Option<String>,
    client_model: Option<String>,
    stream: bool,
    latency_ms: Option<i64>,
    ttft_ms: Option<i64>,
    tpot_ms: Option<f64>,
    status_code: Option<i32>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cached_tokens: Option<i64>,
    error: Option<String>,
    api_key_id: Option<i64>,
    api_key_name: Option<String>,
    api_key_value_masked: Option<String>,
}

impl From<entities::request_logs::Model> for LogView {
    fn from(row: entities::request_logs::Model) -> Self {
        Self {
            id: row.id,
            timestamp: epoch_ms(row.created_at),
            session_id: row.session_id,
            endpoint: row.endpoint,
            provider: row.provider,
            model: row.model,
            client_model: row.client_model,
            stream: row.stream,
            latency_ms: row.latency_ms,
            ttft_ms: row.ttft_ms,
            tpot_ms: row.tpot_ms,
            status_code: row.status_code,
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            cached_tokens: row.cached_tokens,
            error: row.error,
            api_key_id: row.api_key_id,
            api_key_name: row.api_key_name,
            api_key_value_masked: row.api_key_value_masked,
        }
    }
}

async fn query_logs(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state.storage.query_request_logs(query.into_filter()).await {
        Ok(page) => Json(serde_json::json!({
            "rows": page.rows.into_iter().map(LogView::from).collect::<Vec<_>>(),
            "hasMore": page.has_more,
        }))
        .into_response(),
        Err(err) => storage_error(err),
    }
}

async fn log_detail(State(state): State<Arc<GatewayState>>, Path(id): Path<i64>) -> Response {
    match state.storage.get_request_log(id).await {
        Ok(Some(detail)) => Json(serde_json::json!({
            "log": LogView::from(detail.log),
            "prompt": detail.prompt,
            "response": detail.response,
        }))
        .into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "log not found"),
        Err(err) => storage_error(err),
    }
}

/// ZIP archive of JSON-serialized logs matching the filter.
async fn export_logs(
    State(state): State<Arc<GatewayState>>,
    Json(query): Json<LogsQuery>,
) -> Response {
    let details = match state.storage.export_request_logs(query.into_filter()).await {
        Ok(details) => details,
        Err(err) => return storage_error(err),
    };

    let entries: Vec<serde_json::Value> = details
        .into_iter()
        .map(|detail| {
            serde_json::json!({
                "log": LogView::from(detail.log),
                "prompt": detail.prompt,
                "response": detail.response,
            })
        })
        .collect();

    let json = serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string());
    let archived = (|| -> zip::result::ZipResult<Vec<u8>> {
        let mut archive = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        archive.start_file("logs.json", options)?;
        archive.write_all(json.as_bytes())?;
        Ok(archive.finish()?.into_inner())
    })();
    let archived = match archived {
        Ok(bytes) => bytes,
        Err(err) => return storage_error(err),
    };

    let mut response = Response::new(Body::from(archived));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=\"cc-gw-logs.zip\""),
    );
    response
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupBody {
    #[serde(default)]
    days: Option<u32>,
}

async fn cleanup_logs(
    State(state): State<Arc<GatewayState>>,
    body: Option<Json<CleanupBody>>,
) -> Response {
    let days = body
        .and_then(|Json(body)| body.days)
        .unwrap_or_else(|| state.config.snapshot().log_retention_days);
    if days == 0 {
        return Json(serde_json::json!({"deleted": 0})).into_response();
    }
    let cutoff = time::OffsetDateTime::now_utc() - time::Duration::days(days as i64);
    match state.storage.delete_logs_before(cutoff).await {
        Ok(deleted) => Json(serde_json::json!({"deleted": deleted})).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn clear_logs(State(state): State<Arc<GatewayState>>) -> Response {
    match state.storage.clear_logs().await {
        Ok(deleted) => Json(serde_json::json!({"deleted": deleted})).into_response(),
        Err(err) => storage_error(err),
    }
}

// ---- stats ---------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct StatsQuery {
    #[serde(default)]
    from: Option<i64>,
    #[serde(default)]
    to: Option<i64>,
    #[serde(default)]
    endpoint: Option<String>,
}

async fn stats_overview(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let from = query.from.and_then(from_epoch_ms);
    let to = query.to.and_then(from_epoch_ms);
    match state.storage.stats_overview(from, to).await {
        Ok(overview) => {
            let requests = overview.total_requests.unwrap_or(0);
            let total_latency = overview.total_latency_ms.unwrap_or(0);
            Json(serde_json::json!({
                "totalRequests": requests,
                "totalInputTokens": overview.total_input_tokens.unwrap_or(0),
                "totalOutputTokens": overview.total_output_tokens.unwrap_or(0),
                "avgLatencyMs": if requests > 0 { total_latency as f64 / requests as f64 } else { 0.0 },
            }))
            .into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn stats_daily(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let from = query.from.and_then(from_epoch_ms).map(|at| at.date());
    let to = query.to.and_then(from_epoch_ms).map(|at| at.date());
    match state
        .storage
        .daily_metrics(from, to, query.endpoint.as_deref())
        .await
    {
        Ok(rows) => {
            let rows: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    serde_json::json!({
                        "date": row.date.to_string(),
                        "endpoint": row.endpoint,
                        "requestCount": row.request_count,
                        "totalInputTokens": row.total_input_tokens,
                        "totalOutputTokens": row.total_output_tokens,
                        "totalLatencyMs": row.total_latency_ms,
                    })
                })
                .collect();
            Json(rows).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn stats_model(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let from = query.from.and_then(from_epoch_ms);
    let to = query.to.and_then(from_epoch_ms);
    match state.storage.stats_by_model(from, to).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn stats_api_keys_overview(State(state): State<Arc<GatewayState>>) -> Response {
    match state.storage.list_api_keys().await {
        Ok(rows) => {
            let rows: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    serde_json::json!({
                        "id": row.id,
                        "name": row.name,
                        "requestCount": row.request_count,
                        "totalInputTokens": row.total_input_tokens,
                        "totalOutputTokens": row.total_output_tokens,
                        "lastUsedAt": row.last_used_at.map(epoch_ms),
                    })
                })
                .collect();
            Json(rows).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn stats_api_keys_usage(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let from = query.from.and_then(from_epoch_ms);
    let to = query.to.and_then(from_epoch_ms);
    match state.storage.stats_by_api_key(from, to).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => storage_error(err),
    }
}

// ---- audit events --------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    limit: Option<u64>,
    #[serde(default)]
    offset: Option<u64>,
}

async fn query_events(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    match state
        .storage
        .query_audit(query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await
    {
        Ok(page) => {
            let rows: Vec<serde_json::Value> = page
                .rows
                .into_iter()
                .map(|row| {
                    serde_json::json!({
                        "id": row.id,
                        "apiKeyId": row.api_key_id,
                        "apiKeyName": row.api_key_name,
                        "operation": row.operation,
                        "operator": row.operator,
                        "details": row
                            .details
                            .as_deref()
                            .and_then(|details| serde_json::from_str::<serde_json::Value>(details).ok()),
                        "ipAddress": row.ip_address,
                        "createdAt": epoch_ms(row.created_at),
                    })
                })
                .collect();
            Json(serde_json::json!({"rows": rows, "hasMore": page.has_more})).into_response()
        }
        Err(err) => storage_error(err),
    }
}

// ---- web console auth ----------------------------------------------------

async fn web_auth_info(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "enabled": SessionStore::required(&state.config.snapshot()),
    }))
}

#[derive(Debug, Deserialize)]
struct SetWebAuthBody {
    enabled: bool,
    #[serde(default)]
    password: Option<String>,
}

async fn set_web_auth(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<SetWebAuthBody>,
) -> Response {
    let mut next = (*state.config.snapshot()).clone();
    next.web_auth = Some(ccgw_config::WebAuthConfig {
        enabled: body.enabled,
        password_hash: match body.password.as_deref() {
            Some(password) if !password.is_empty() => Some(sha256_hex(password)),
            _ => next.web_auth.as_ref().and_then(|auth| auth.password_hash.clone()),
        },
    });
    match state.config.update(next).await {
        Ok(_) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(err) => api_error(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    password: String,
}

async fn login(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<LoginBody>,
) -> Response {
    let config = state.config.snapshot();
    match state.sessions.login(&config, &body.password) {
        Some(token) => {
            let cookie = format!("{SESSION_COOKIE}={token}; HttpOnly; Path=/; SameSite=Lax");
            let mut response =
                Json(serde_json::json!({"ok": true, "token": token})).into_response();
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            response
        }
        None => api_error(StatusCode::UNAUTHORIZED, "invalid password"),
    }
}

async fn logout(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    if let Some(token) = cookie_value(&headers, SESSION_COOKIE) {
        state.sessions.logout(&token);
    }
    let mut response = Json(serde_json::json!({"ok": true})).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        HeaderValue::from_static("ccgw_session=; Max-Age=0; Path=/"),
    );
    response
}
