use super::*;
use async_trait::async_trait;
use ccgw_config::{AuthMode, ConfigStore, ModelConfig, ProviderType};
use ccgw_provider::{Connector, ConnectorError, ProviderRequest, ProviderResponse};
use ccgw_storage::GatewayStorage;
use ccgw_vault::Vault;
use std::sync::Mutex;

/// Connector double: replays a scripted upstream response and records the
/// request it was handed.
struct ScriptedConnector {
    status: u16,
    stream_chunks: Option<Vec<&'static str>>,
    body: &'static str,
    last_request: Mutex<Option<ProviderRequest>>,
}

impl ScriptedConnector {
    fn json(status: u16, body: &'static str) -> Self {
        Self {
            status,
            stream_chunks: None,
            body,
            last_request: Mutex::new(None),
        }
    }

    fn stream(chunks: Vec<&'static str>) -> Self {
        Self {
            status: 200,
            stream_chunks: Some(chunks),
            body: "",
            last_request: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, ConnectorError> {
        *self.last_request.lock().unwrap() = Some(request);
        let body = match &self.stream_chunks {
            Some(chunks) => {
                let (tx, rx) = mpsc::channel(8);
                let chunks = chunks.clone();
                tokio::spawn(async move {
                    for chunk in chunks {
                        if tx.send(Bytes::from_static(chunk.as_bytes())).await.is_err() {
                            break;
                        }
                    }
                });
                ProviderBody::Stream(rx)
            }
            None => ProviderBody::Bytes(Bytes::from_static(self.body.as_bytes())),
        };
        Ok(ProviderResponse {
            status: self.status,
            headers: Vec::new(),
            body,
        })
    }
}

async fn state_with(connector: Arc<dyn Connector>) -> (Arc<GatewayState>, String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(
        ConfigStore::load_or_init(dir.path().join("config.json"), Vault::from_key([5u8; 32]))
            .unwrap(),
    );

    let mut next = (*config.snapshot()).clone();
    next.enable_routing_fallback = false;
    next.providers = vec![
        ccgw_config::ProviderConfig {
            id: "deepseek".to_string(),
            label: String::new(),
            r#type: ProviderType::Deepseek,
            base_url: "https://api.deepseek.com/v1".to_string(),
            api_key: None,
            auth_mode: AuthMode::AuthToken,
            default_model: None,
            models: vec![ModelConfig {
                id: "deepseek-chat".to_string(),
                label: None,
                max_tokens: None,
            }],
            extra_headers: Default::default(),
        },
        ccgw_config::ProviderConfig {
            id: "anthro".to_string(),
            label: String::new(),
            r#type: ProviderType::Anthropic,
            base_url: "https://api.anthropic.com".to_string(),
            api_key: None,
            auth_mode: AuthMode::ApiKey,
            default_model: None,
            models: vec![ModelConfig {
                id: "claude-3-5-sonnet".to_string(),
                label: None,
                max_tokens: None,
            }],
            extra_headers: Default::default(),
        },
    ];
    if let Some(routing) = next.endpoint_routing.get_mut("anthropic") {
        routing
            .model_routes
            .insert("claude-*".to_string(), "deepseek:deepseek-chat".to_string());
        routing
            .model_routes
            .insert("passthrough-*".to_string(), "anthro:*".to_string());
        routing.defaults.completion = Some("deepseek:deepseek-chat".to_string());
    }
    if let Some(routing) = next.endpoint_routing.get_mut("openai") {
        routing.defaults.completion = Some("deepseek:deepseek-chat".to_string());
    }
    config.update(next).await.unwrap();

    let storage = GatewayStorage::connect("sqlite::memory:").await.unwrap();
    storage.sync().await.unwrap();

    let state = GatewayState::new(config, storage, connector);
    let created = state
        .keys
        .create("test", None, None, false, None, None)
        .await
        .unwrap();
    (state, created.plaintext, dir)
}

fn anthropic_call(key: &str, body: serde_json::Value) -> InboundCall {
    InboundCall {
        endpoint: "anthropic".to_string(),
        protocol: ClientProtocol::Anthropic,
        api_key: Some(key.to_string()),
        ip_address: Some("127.0.0.1".to_string()),
        body: Bytes::from(body.to_string()),
    }
}

async fn drain(mut rx: mpsc::Receiver<Bytes>) -> String {
    let mut out = String::new();
    while let Some(frame) = rx.recv().await {
        out.push_str(&String::from_utf8_lossy(&frame));
    }
    out
}

fn sse_event_names(raw: &str) -> Vec<&str> {
    raw.lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .collect()
}

#[tokio::test]
async fn openai_upstream_streams_anthropic_events_to_client() {
    let connector = Arc::new(ScriptedConnector::stream(vec![
        "data: {\"id\":\"chatcmpl-1\",\"model\":\"deepseek-chat\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":1}}\n\n",
        "data: [DONE]\n\n",
    ]));
    let (state, key, _dir) = state_with(connector.clone()).await;

    let outcome = handle_chat(
        state.clone(),
        anthropic_call(
            &key,
            serde_json::json!({
                "model": "claude-3-5-sonnet-latest",
                "max_tokens": 128,
                "stream": true,
                "messages": [{"role": "user", "content": "hello"}],
            }),
        ),
    )
    .await
    .unwrap();

    let CallOutcome::Stream { frames } = outcome else {
        panic!("expected a stream outcome");
    };
    let raw = drain(frames).await;
    assert_eq!(
        sse_event_names(&raw),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert!(raw.contains(r#""text":"Hi""#));
    assert!(raw.contains(r#""stop_reason":"end_turn""#));

    // The upstream request was translated to the OpenAI wire and asked for
    // streamed usage.
    let request = connector.last_request.lock().unwrap().take().unwrap();
    assert_eq!(request.url, "https://api.deepseek.com/v1/chat/completions");
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["model"], "deepseek-chat");
    assert_eq!(body["stream_options"]["include_usage"], true);

    // Finalization happened exactly once with consistent figures.
    let page = state
        .storage
        .query_request_logs(ccgw_storage::LogFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 1);
    let row = &page.rows[0];
    assert_eq!(row.status_code, Some(200));
    assert_eq!(row.provider.as_deref(), Some("deepseek"));
    assert_eq!(row.client_model.as_deref(), Some("claude-3-5-sonnet-latest"));
    assert_eq!(row.input_tokens, Some(12));
    assert_eq!(row.output_tokens, Some(1));
    assert!(row.stream);
    let latency = row.latency_ms.unwrap();
    if let Some(ttft) = row.ttft_ms {
        assert!(ttft <= latency);
    }

    let metrics = state.storage.daily_metrics(None, None, None).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].endpoint, "anthropic");
    assert_eq!(metrics[0].request_count, 1);

    let api_key = state.storage.list_api_keys().await.unwrap();
    assert_eq!(api_key[0].request_count, 1);
    assert_eq!(api_key[0].total_input_tokens, 12);
}

#[tokio::test]
async fn missing_key_without_wildcard_is_401_and_unlogged() {
    let (state, _key, _dir) = state_with(Arc::new(ScriptedConnector::json(200, "{}"))).await;
    let mut call = anthropic_call("unused", serde_json::json!({"messages": []}));
    call.api_key = None;

    let err = handle_chat(state.clone(), call).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Auth {
            code: AuthErrorCode::Missing,
            ..
        }
    ));
    let page = state
        .storage
        .query_request_logs(ccgw_storage::LogFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(page.rows.is_empty());
}

#[tokio::test]
async fn malformed_body_is_invalid_request() {
    let (state, key, _dir) = state_with(Arc::new(ScriptedConnector::json(200, "{}"))).await;
    let call = InboundCall {
        endpoint: "anthropic".to_string(),
        protocol: ClientProtocol::Anthropic,
        api_key: Some(key),
        ip_address: None,
        body: Bytes::from_static(b"[1,2,3]"),
    };
    assert!(matches!(
        handle_chat(state, call).await.unwrap_err(),
        GatewayError::InvalidRequest(_)
    ));
}

#[tokio::test]
async fn upstream_error_status_is_mirrored_and_logged() {
    let (state, key, _dir) = state_with(Arc::new(ScriptedConnector::json(
        429,
        "{\"error\":\"slow down\"}",
    )))
    .await;

    let err = handle_chat(
        state.clone(),
        anthropic_call(
            &key,
            serde_json::json!({
                "model": "claude-3",
                "messages": [{"role": "user", "content": "hi"}],
            }),
        ),
    )
    .await
    .unwrap_err();

    match err {
        GatewayError::Upstream { status, body } => {
            assert_eq!(status, 429);
            assert_eq!(&body[..], b"{\"error\":\"slow down\"}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let page = state
        .storage
        .query_request_logs(ccgw_storage::LogFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 1);
    assert_eq!(page.rows[0].status_code, Some(429));
    assert!(page.rows[0].error.as_deref().unwrap().contains("slow down"));
}

#[tokio::test]
async fn anthropic_upstream_json_passes_through_with_usage() {
    let connector = Arc::new(ScriptedConnector::json(
        200,
        r#"{"id":"msg_1","type":"message","role":"assistant","model":"claude-3-5-sonnet","content":[{"type":"text","text":"pong"}],"stop_reason":"end_turn","usage":{"input_tokens":7,"output_tokens":2}}"#,
    ));
    let (state, key, _dir) = state_with(connector.clone()).await;

    let outcome = handle_chat(
        state.clone(),
        anthropic_call(
            &key,
            serde_json::json!({
                "model": "passthrough-claude",
                "messages": [{"role": "user", "content": "ping"}],
            }),
        ),
    )
    .await
    .unwrap();

    let CallOutcome::Json { status, body } = outcome else {
        panic!("expected a json outcome");
    };
    assert_eq!(status, 200);
    // Verbatim relay of the upstream body.
    assert!(String::from_utf8_lossy(&body).contains("\"pong\""));

    let request = connector.last_request.lock().unwrap().take().unwrap();
    assert_eq!(request.url, "https://api.anthropic.com/v1/messages");
    let upstream_body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    // Route target `anthro:*` forwards the caller's model unchanged.
    assert_eq!(upstream_body["model"], "passthrough-claude");

    let page = state
        .storage
        .query_request_logs(ccgw_storage::LogFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.rows[0].input_tokens, Some(7));
    assert_eq!(page.rows[0].output_tokens, Some(2));
    assert_eq!(page.rows[0].ttft_ms, None);
    assert!(page.rows[0].tpot_ms.is_some());
}

#[tokio::test]
async fn empty_stream_reports_upstream_empty() {
    let (state, key, _dir) = state_with(Arc::new(ScriptedConnector::stream(Vec::new()))).await;
    let err = handle_chat(
        state.clone(),
        anthropic_call(
            &key,
            serde_json::json!({
                "model": "claude-3",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}],
            }),
        ),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamEmpty));

    let page = state
        .storage
        .query_request_logs(ccgw_storage::LogFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.rows[0].status_code, Some(500));
}

#[tokio::test]
async fn openai_caller_gets_openai_stream_verbatim() {
    let connector = Arc::new(ScriptedConnector::stream(vec![
        "data: {\"id\":\"chatcmpl-2\",\"model\":\"deepseek-chat\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"}}]}\n\n",
        "data: [DONE]\n\n",
    ]));
    let (state, key, _dir) = state_with(connector).await;

    let outcome = handle_chat(
        state.clone(),
        InboundCall {
            endpoint: "openai".to_string(),
            protocol: ClientProtocol::OpenaiChat,
            api_key: Some(key),
            ip_address: None,
            body: Bytes::from(
                serde_json::json!({
                    "model": "deepseek:deepseek-chat",
                    "stream": true,
                    "messages": [{"role": "user", "content": "hi"}],
                })
                .to_string(),
            ),
        },
    )
    .await
    .unwrap();

    let CallOutcome::Stream { frames } = outcome else {
        panic!("expected a stream outcome");
    };
    let raw = drain(frames).await;
    assert!(raw.contains("\"content\":\"ok\""));
    assert!(raw.trim_end().ends_with("data: [DONE]"));
    // Verbatim relay: no anthropic event framing.
    assert!(!raw.contains("event: message_start"));
}

#[tokio::test]
async fn openai_caller_with_anthropic_upstream_gets_translated_chunks() {
    let connector = Arc::new(ScriptedConnector::stream(vec![
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_9\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-3-5-sonnet\",\"content\":[],\"usage\":{\"input_tokens\":4}}}\n\n",
        "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"pong\"}}\n\n",
        "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":1}}\n\n",
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
    ]));
    let (state, key, _dir) = state_with(connector).await;

    let outcome = handle_chat(
        state.clone(),
        InboundCall {
            endpoint: "openai".to_string(),
            protocol: ClientProtocol::OpenaiChat,
            api_key: Some(key),
            ip_address: None,
            body: Bytes::from(
                serde_json::json!({
                    "model": "anthro:claude-3-5-sonnet",
                    "stream": true,
                    "messages": [{"role": "user", "content": "ping"}],
                })
                .to_string(),
            ),
        },
    )
    .await
    .unwrap();

    let CallOutcome::Stream { frames } = outcome else {
        panic!("expected a stream outcome");
    };
    let raw = drain(frames).await;
    assert!(raw.contains("chat.completion.chunk"));
    assert!(raw.contains("\"content\":\"pong\""));
    assert!(raw.contains("\"finish_reason\":\"stop\""));
    assert!(raw.trim_end().ends_with("data: [DONE]"));

    let page = state
        .storage
        .query_request_logs(ccgw_storage::LogFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.rows[0].input_tokens, Some(4));
    assert_eq!(page.rows[0].output_tokens, Some(1));
}
