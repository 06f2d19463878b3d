//! Public model endpoints: the Anthropic and OpenAI surfaces plus
//! config-registered custom paths, all funneling into the request pipeline.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use ccgw_common::{GatewayError, ENDPOINT_ANTHROPIC, ENDPOINT_OPENAI};
use ccgw_config::CustomProtocol;
use ccgw_core::{handle_chat, CallOutcome, ClientProtocol, GatewayState, InboundCall};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::http::{client_ip, extract_api_key};

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";

/// Build the public router. Custom endpoint paths are registered from the
/// boot-time config snapshot; their `enabled` flag is still honored per
/// request.
pub fn public_router(state: Arc<GatewayState>) -> Router {
    let config = state.config.snapshot();

    let mut router = Router::new()
        .route("/anthropic/v1/messages", post(anthropic_messages))
        .route("/openai/v1/chat/completions", post(openai_chat_completions))
        .route("/openai/v1/responses", post(openai_responses));

    let mut taken: HashSet<String> = [
        "/anthropic/v1/messages",
        "/openai/v1/chat/completions",
        "/openai/v1/responses",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();

    for endpoint in &config.custom_endpoints {
        for path in &endpoint.paths {
            if path.path.starts_with("/api/") || !taken.insert(path.path.clone()) {
                warn!(
                    event = "custom_endpoint_path_skipped",
                    endpoint = %endpoint.id,
                    path = %path.path,
                );
                continue;
            }
            let endpoint_id = endpoint.id.clone();
            let protocol = match path.protocol {
                CustomProtocol::Anthropic => ClientProtocol::Anthropic,
                CustomProtocol::OpenaiChat => ClientProtocol::OpenaiChat,
                CustomProtocol::OpenaiResponses => ClientProtocol::OpenaiResponses,
            };
            router = router.route(
                &path.path,
                post(
                    move |State(state): State<Arc<GatewayState>>,
                          headers: HeaderMap,
                          body: Bytes| {
                        let endpoint_id = endpoint_id.clone();
                        async move { custom_chat(state, endpoint_id, protocol, headers, body).await }
                    },
                ),
            );
        }
    }

    router
        .layer(DefaultBodyLimit::max(config.body_limit))
        .with_state(state)
}

async fn anthropic_messages(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_chat(state, ENDPOINT_ANTHROPIC, ClientProtocol::Anthropic, headers, body).await
}

async fn openai_chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_chat(state, ENDPOINT_OPENAI, ClientProtocol::OpenaiChat, headers, body).await
}

async fn openai_responses(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_chat(state, ENDPOINT_OPENAI, ClientProtocol::OpenaiResponses, headers, body).await
}

async fn custom_chat(
    state: Arc<GatewayState>,
    endpoint_id: String,
    protocol: ClientProtocol,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let enabled = state
        .config
        .snapshot()
        .custom_endpoints
        .iter()
        .any(|endpoint| endpoint.id == endpoint_id && endpoint.enabled);
    if !enabled {
        return plain_status(StatusCode::NOT_FOUND);
    }
    run_chat(state, &endpoint_id, protocol, headers, body).await
}

async fn run_chat(
    state: Arc<GatewayState>,
    endpoint: &str,
    protocol: ClientProtocol,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = InboundCall {
        endpoint: endpoint.to_string(),
        protocol,
        api_key: extract_api_key(&headers),
        ip_address: client_ip(&headers),
        body,
    };

    match handle_chat(state, call).await {
        Ok(CallOutcome::Json { status, body }) => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Ok(CallOutcome::Stream { frames }) => sse_response(frames),
        Err(err) => error_response(err),
    }
}

fn sse_response(frames: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(heartbeat(frames)).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

/// Interleave keep-alive comments into quiet streams so intermediaries keep
/// the connection open during long generations.
fn heartbeat(mut frames: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    ticker.reset();
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn error_response(err: GatewayError) -> Response {
    let mut response = Response::new(Body::from(err.body()));
    *response.status_mut() = err.status();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn plain_status(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}
