//! The per-request pipeline: auth → normalize → route → translate → relay →
//! finalize. One invocation per inbound chat call; every terminal path funnels
//! through the idempotent [`Finalizer`].

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use ccgw_common::{AuthErrorCode, GatewayError};
use ccgw_config::ProviderConfig;
use ccgw_protocol::anthropic::{MessagesRequest, MessagesResponse, StreamEvent};
use ccgw_protocol::estimate;
use ccgw_protocol::internal::ChatPayload;
use ccgw_protocol::openai::{ChatRequest, ChatResponse, ResponsesRequest, StreamOptions};
use ccgw_protocol::sse::SseParser;
use ccgw_provider::{build_provider_request, ProviderBody};
use ccgw_routing::{resolve_route, RouteDecision, RouteError, RouteQuery};
use ccgw_storage::{ApiKeySnapshot, DailyDelta, NewRequestLog, RequestLogFinal};
use ccgw_transform::passthrough::{AnthropicSniffer, OpenAiSniffer};
use ccgw_transform::reverse::AnthropicToOpenAiStream;
use ccgw_transform::stream::OpenAiToAnthropicStream;
use ccgw_transform::{anthropic, latency, openai, reverse};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::state::GatewayState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProtocol {
    Anthropic,
    OpenaiChat,
    OpenaiResponses,
}

impl ClientProtocol {
    fn wants_anthropic_wire(self) -> bool {
        matches!(self, ClientProtocol::Anthropic)
    }
}

#[derive(Debug)]
pub struct InboundCall {
    pub endpoint: String,
    pub protocol: ClientProtocol,
    pub api_key: Option<String>,
    pub ip_address: Option<String>,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum CallOutcome {
    Json { status: u16, body: Bytes },
    /// SSE frames, ready to write. The relay task has already started.
    Stream { frames: mpsc::Receiver<Bytes> },
}

pub async fn handle_chat(
    state: Arc<GatewayState>,
    call: InboundCall,
) -> Result<CallOutcome, GatewayError> {
    let started = Instant::now();
    let config = state.config.snapshot();

    // 1. Auth.
    let key = state
        .keys
        .resolve(call.api_key.as_deref(), &call.endpoint, call.ip_address.as_deref())
        .await
        .map_err(|code| GatewayError::Auth {
            code,
            message: auth_message(code),
        })?;

    // 2. Normalize.
    let (payload, requested_model) = parse_payload(&call)?;

    // 3. Route.
    let token_estimate = estimate::estimate_payload(&payload);
    let decision = resolve_route(
        &config,
        RouteQuery {
            endpoint: &call.endpoint,
            requested_model: requested_model.as_deref(),
            thinking: payload.thinking_enabled(),
            token_estimate,
        },
    )
    .map_err(|err| match err {
        RouteError::NoProviders => GatewayError::Internal("no providers are configured".to_string()),
        RouteError::NoMatch => GatewayError::InvalidRequest(format!(
            "no route for model {} on endpoint {}",
            requested_model.as_deref().unwrap_or("<none>"),
            call.endpoint
        )),
    })?;
    let provider = config
        .provider(&decision.provider_id)
        .cloned()
        .ok_or_else(|| GatewayError::Internal("routed provider is not configured".to_string()))?;

    // 4. Upstream body.
    let upstream_body = build_upstream_body(&payload, &decision, &provider)?;

    // 5. Log row.
    let log_id = state
        .storage
        .insert_request_log(NewRequestLog {
            endpoint: call.endpoint.clone(),
            provider: Some(provider.id.clone()),
            model: Some(decision.model_id.clone()),
            client_model: requested_model.clone(),
            session_id: payload.session_id.clone(),
            stream: payload.stream,
            api_key: Some(ApiKeySnapshot {
                id: key.id,
                name: key.name.clone(),
                value_masked: key.masked.clone(),
            }),
        })
        .await
        .map_err(GatewayError::internal)?;
    state.enter_request();
    info!(
        event = "request_started",
        request_id = log_id,
        endpoint = %call.endpoint,
        provider = %provider.id,
        model = %decision.model_id,
        client_model = requested_model.as_deref().unwrap_or(""),
        stream = payload.stream,
    );

    let mut finalizer = Finalizer {
        state: state.clone(),
        log_id,
        api_key_id: key.id,
        endpoint: call.endpoint.clone(),
        token_estimate,
        stream: payload.stream,
        started,
        store_response: config.store_response_payloads(),
        done: false,
    };

    // 6. Request payload.
    if config.store_request_payloads()
        && let Ok(text) = std::str::from_utf8(&call.body)
        && let Err(err) = state.storage.upsert_request_payload(log_id, Some(text), None).await
    {
        warn!(event = "request_payload_store_failed", request_id = log_id, error = %err);
    }

    // 7. Send.
    let upstream_key = state.config.provider_key(&provider.id);
    let request =
        build_provider_request(&provider, upstream_key.as_deref(), upstream_body, payload.stream);
    let response = match state.connector.send(request).await {
        Ok(response) => response,
        Err(err) => {
            let message = err.to_string();
            finalizer
                .finalize(FinalizeArgs::error(502, message.clone()))
                .await;
            return Err(GatewayError::Upstream {
                status: 502,
                body: error_body("upstream_error", &message),
            });
        }
    };

    if !response.is_success() {
        let body = collect_body(response.body).await;
        let summary = String::from_utf8_lossy(&body);
        finalizer
            .finalize(FinalizeArgs::error(
                response.status,
                truncate(&summary, 2048),
            ))
            .await;
        return Err(GatewayError::Upstream {
            status: response.status,
            body,
        });
    }

    // 8. Non-streaming.
    if !payload.stream {
        let body = collect_body(response.body).await;
        return respond_json(call.protocol, &provider, &decision, body, finalizer).await;
    }

    // 9. Streaming.
    let mut upstream = match response.body {
        ProviderBody::Stream(rx) => rx,
        ProviderBody::Bytes(bytes) if bytes.is_empty() => {
            finalizer
                .finalize(FinalizeArgs::error(500, "empty upstream body".to_string()))
                .await;
            return Err(GatewayError::UpstreamEmpty);
        }
        // Upstream ignored the stream request; fall back to JSON handling.
        ProviderBody::Bytes(bytes) => {
            return respond_json(call.protocol, &provider, &decision, bytes, finalizer).await;
        }
    };

    // Peek the first chunk so a 2xx-with-no-body stream is still reported as
    // a 500 rather than an empty SSE response.
    let Some(first_chunk) = upstream.recv().await else {
        finalizer
            .finalize(FinalizeArgs::error(500, "empty upstream stream".to_string()))
            .await;
        return Err(GatewayError::UpstreamEmpty);
    };

    let relay = StreamRelay::new(call.protocol, &provider, &decision.model_id);
    let frames = spawn_stream_relay(relay, first_chunk, upstream, finalizer);
    Ok(CallOutcome::Stream { frames })
}

fn auth_message(code: AuthErrorCode) -> String {
    match code {
        AuthErrorCode::Missing => "missing api key".to_string(),
        AuthErrorCode::InvalidApiKey => "invalid api key".to_string(),
        AuthErrorCode::Disabled => "api key disabled".to_string(),
        AuthErrorCode::Forbidden => "api key not allowed on this endpoint".to_string(),
    }
}

fn error_body(code: &str, message: &str) -> Bytes {
    Bytes::from(
        serde_json::json!({"error": {"code": code, "message": message}}).to_string(),
    )
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

fn parse_payload(call: &InboundCall) -> Result<(ChatPayload, Option<String>), GatewayError> {
    let invalid = |err: serde_json::Error| GatewayError::InvalidRequest(format!("invalid request body: {err}"));
    match call.protocol {
        ClientProtocol::Anthropic => {
            let request: MessagesRequest = serde_json::from_slice(&call.body).map_err(invalid)?;
            Ok((anthropic::to_internal(&request), request.model))
        }
        ClientProtocol::OpenaiChat => {
            let request: ChatRequest = serde_json::from_slice(&call.body).map_err(invalid)?;
            let payload = openai::to_internal(&request);
            Ok((payload, request.model))
        }
        ClientProtocol::OpenaiResponses => {
            let request: ResponsesRequest = serde_json::from_slice(&call.body).map_err(invalid)?;
            let chat = request.into_chat();
            let payload = openai::to_internal(&chat);
            Ok((payload, chat.model))
        }
    }
}

fn build_upstream_body(
    payload: &ChatPayload,
    decision: &RouteDecision,
    provider: &ProviderConfig,
) -> Result<Bytes, GatewayError> {
    let body = if provider.is_anthropic_family() {
        serde_json::to_vec(&anthropic::from_internal(payload, &decision.model_id))
    } else {
        let mut request = openai::request_from_internal(payload, &decision.model_id, provider.r#type);
        if payload.stream {
            // Ask OpenAI-family upstreams for usage on the final chunk.
            request.stream_options = Some(StreamOptions {
                include_usage: Some(true),
            });
        }
        serde_json::to_vec(&request)
    };
    body.map(Bytes::from).map_err(GatewayError::internal)
}

async fn collect_body(body: ProviderBody) -> Bytes {
    match body {
        ProviderBody::Bytes(bytes) => bytes,
        ProviderBody::Stream(mut rx) => {
            let mut collected = Vec::new();
            while let Some(chunk) = rx.recv().await {
                collected.extend_from_slice(&chunk);
            }
            Bytes::from(collected)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct UsageTotals {
    input: Option<u64>,
    output: Option<u64>,
    cached: Option<u64>,
}

impl UsageTotals {
    fn from_anthropic(usage: &ccgw_protocol::anthropic::Usage) -> Self {
        Self {
            input: usage.input_tokens,
            output: usage.output_tokens,
            cached: usage.cache_read_input_tokens,
        }
    }

    fn from_openai(usage: &ccgw_protocol::openai::ChatUsage) -> Self {
        Self {
            input: usage.prompt_tokens,
            output: usage.completion_tokens,
            cached: usage
                .prompt_tokens_details
                .and_then(|details| details.cached_tokens),
        }
    }
}

/// Step 8: translate a complete upstream JSON body for the caller.
async fn respond_json(
    protocol: ClientProtocol,
    provider: &ProviderConfig,
    decision: &RouteDecision,
    body: Bytes,
    mut finalizer: Finalizer,
) -> Result<CallOutcome, GatewayError> {
    let mut usage = UsageTotals::default();
    let mut output_text = String::new();

    let out = if provider.is_anthropic_family() {
        match serde_json::from_slice::<MessagesResponse>(&body) {
            Ok(message) => {
                usage = UsageTotals::from_anthropic(&message.usage);
                output_text = anthropic_output_text(&message);
                if protocol.wants_anthropic_wire() {
                    body
                } else {
                    let created = OffsetDateTime::now_utc().unix_timestamp();
                    Bytes::from(reverse::response_to_openai(&message, created).to_string())
                }
            }
            // A dialect we can't parse still flows through verbatim.
            Err(_) => body,
        }
    } else {
        match serde_json::from_slice::<ChatResponse>(&body) {
            Ok(response) => {
                usage = response
                    .usage
                    .as_ref()
                    .map(UsageTotals::from_openai)
                    .unwrap_or_default();
                output_text = openai_output_text(&response);
                if protocol.wants_anthropic_wire() {
                    let message = openai::response_to_anthropic(&response, &decision.model_id);
                    Bytes::from(serde_json::to_vec(&message).map_err(GatewayError::internal)?)
                } else {
                    body
                }
            }
            Err(_) => body,
        }
    };

    let response_text = String::from_utf8_lossy(&out).to_string();
    finalizer
        .finalize(FinalizeArgs {
            status: 200,
            usage,
            ttft_ms: None,
            error: None,
            output_text,
            response_text: Some(response_text),
        })
        .await;

    Ok(CallOutcome::Json {
        status: 200,
        body: out,
    })
}

fn anthropic_output_text(message: &MessagesResponse) -> String {
    use ccgw_protocol::anthropic::ResponseBlock;
    let mut text = String::new();
    for block in &message.content {
        match block {
            ResponseBlock::Text { text: t } => text.push_str(t),
            ResponseBlock::Thinking { thinking } => text.push_str(thinking),
            ResponseBlock::ToolUse { input, .. } => text.push_str(&input.to_string()),
        }
    }
    text
}

fn openai_output_text(response: &ChatResponse) -> String {
    let mut text = String::new();
    if let Some(choice) = response.choices.first() {
        if let Some(content) = &choice.message.content {
            text.push_str(content);
        }
        if let Some(reasoning) = &choice.message.reasoning_content {
            text.push_str(reasoning);
        }
        for call in choice.message.tool_calls.as_deref().unwrap_or_default() {
            text.push_str(&call.function.arguments);
        }
    }
    text
}

/// One relay mode per (upstream family, caller wire) pair.
enum StreamRelay {
    /// Anthropic upstream, Anthropic caller: bytes through verbatim.
    AnthropicPassthrough(AnthropicSniffer),
    /// OpenAI upstream, OpenAI caller: bytes through verbatim.
    OpenAiPassthrough(OpenAiSniffer),
    /// OpenAI upstream, Anthropic caller.
    OpenAiToAnthropic {
        parser: SseParser,
        machine: OpenAiToAnthropicStream,
        done: bool,
    },
    /// Anthropic upstream, OpenAI caller.
    AnthropicToOpenAi {
        parser: SseParser,
        machine: AnthropicToOpenAiStream,
        done: bool,
    },
}

impl StreamRelay {
    fn new(protocol: ClientProtocol, provider: &ProviderConfig, model_id: &str) -> Self {
        match (provider.is_anthropic_family(), protocol.wants_anthropic_wire()) {
            (true, true) => StreamRelay::AnthropicPassthrough(AnthropicSniffer::new()),
            (false, false) => StreamRelay::OpenAiPassthrough(OpenAiSniffer::new()),
            (false, true) => StreamRelay::OpenAiToAnthropic {
                parser: SseParser::new(),
                machine: OpenAiToAnthropicStream::new(model_id),
                done: false,
            },
            (true, false) => StreamRelay::AnthropicToOpenAi {
                parser: SseParser::new(),
                machine: AnthropicToOpenAiStream::new(
                    model_id,
                    OffsetDateTime::now_utc().unix_timestamp(),
                ),
                done: false,
            },
        }
    }

    /// Translate one upstream chunk into zero or more client SSE frames.
    fn on_chunk(&mut self, chunk: Bytes) -> Vec<Bytes> {
        match self {
            StreamRelay::AnthropicPassthrough(sniffer) => {
                sniffer.observe(&chunk);
                vec![chunk]
            }
            StreamRelay::OpenAiPassthrough(sniffer) => {
                sniffer.observe(&chunk);
                vec![chunk]
            }
            StreamRelay::OpenAiToAnthropic {
                parser,
                machine,
                done,
            } => {
                let mut frames = Vec::new();
                for event in parser.feed(&chunk) {
                    if event.is_done() {
                        for out in machine.finish() {
                            frames.push(Bytes::from(out.to_sse_frame()));
                        }
                        *done = true;
                        break;
                    }
                    match serde_json::from_str(&event.data) {
                        Ok(parsed) => {
                            for out in machine.on_chunk(&parsed) {
                                frames.push(Bytes::from(out.to_sse_frame()));
                            }
                        }
                        Err(err) => {
                            warn!(event = "upstream_chunk_parse_failed", error = %err);
                        }
                    }
                }
                frames
            }
            StreamRelay::AnthropicToOpenAi {
                parser,
                machine,
                done,
            } => {
                let mut frames = Vec::new();
                for event in parser.feed(&chunk) {
                    let Ok(parsed) = serde_json::from_str::<StreamEvent>(&event.data) else {
                        continue;
                    };
                    let is_stop = matches!(parsed, StreamEvent::MessageStop);
                    for out in machine.on_event(&parsed) {
                        frames.push(data_frame(&out));
                    }
                    if is_stop {
                        frames.push(Bytes::from_static(b"data: [DONE]\n\n"));
                        *done = true;
                        break;
                    }
                }
                frames
            }
        }
    }

    /// Upstream EOF. Translating relays close out the stream for the client;
    /// passthrough relays never invent terminator events.
    fn on_eof(&mut self) -> Vec<Bytes> {
        match self {
            StreamRelay::AnthropicPassthrough(sniffer) => {
                sniffer.finish();
                Vec::new()
            }
            StreamRelay::OpenAiPassthrough(sniffer) => {
                sniffer.finish();
                Vec::new()
            }
            StreamRelay::OpenAiToAnthropic { machine, done, .. } => {
                if *done {
                    return Vec::new();
                }
                *done = true;
                machine
                    .finish()
                    .into_iter()
                    .map(|out| Bytes::from(out.to_sse_frame()))
                    .collect()
            }
            StreamRelay::AnthropicToOpenAi { machine, done, .. } => {
                if *done {
                    return Vec::new();
                }
                *done = true;
                let mut frames: Vec<Bytes> =
                    machine.finish().iter().map(data_frame).collect();
                frames.push(Bytes::from_static(b"data: [DONE]\n\n"));
                frames
            }
        }
    }

    fn is_done(&self) -> bool {
        match self {
            StreamRelay::AnthropicPassthrough(sniffer) => sniffer.message_stopped(),
            StreamRelay::OpenAiPassthrough(sniffer) => sniffer.done(),
            StreamRelay::OpenAiToAnthropic { done, .. }
            | StreamRelay::AnthropicToOpenAi { done, .. } => *done,
        }
    }

    fn first_token_seen(&self) -> bool {
        match self {
            StreamRelay::AnthropicPassthrough(sniffer) => sniffer.first_token_seen(),
            StreamRelay::OpenAiPassthrough(sniffer) => sniffer.first_token_seen(),
            StreamRelay::OpenAiToAnthropic { machine, .. } => machine.first_token_seen(),
            StreamRelay::AnthropicToOpenAi { machine, .. } => machine.first_token_seen(),
        }
    }

    fn usage(&self) -> UsageTotals {
        match self {
            StreamRelay::AnthropicPassthrough(sniffer) => {
                UsageTotals::from_anthropic(sniffer.usage())
            }
            StreamRelay::OpenAiPassthrough(sniffer) => sniffer
                .usage()
                .map(UsageTotals::from_openai)
                .unwrap_or_default(),
            StreamRelay::OpenAiToAnthropic { machine, .. } => machine
                .usage()
                .map(UsageTotals::from_openai)
                .unwrap_or_default(),
            StreamRelay::AnthropicToOpenAi { machine, .. } => {
                UsageTotals::from_anthropic(machine.usage())
            }
        }
    }

    fn output_text(&self) -> String {
        match self {
            StreamRelay::AnthropicPassthrough(sniffer) => sniffer.output_text().to_string(),
            StreamRelay::OpenAiPassthrough(sniffer) => sniffer.output_text().to_string(),
            StreamRelay::OpenAiToAnthropic { machine, .. } => machine.output_text().to_string(),
            StreamRelay::AnthropicToOpenAi { machine, .. } => machine.output_text().to_string(),
        }
    }
}

fn data_frame(chunk: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {chunk}\n\n"))
}

fn spawn_stream_relay(
    mut relay: StreamRelay,
    first_chunk: Bytes,
    mut upstream: mpsc::Receiver<Bytes>,
    mut finalizer: Finalizer,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let started = finalizer.started;

    tokio::spawn(async move {
        let mut ttft_ms: Option<i64> = None;
        let mut client_gone = false;
        let mut pending = Some(first_chunk);

        'relay: loop {
            let chunk = match pending.take() {
                Some(chunk) => chunk,
                None => match upstream.recv().await {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            let frames = relay.on_chunk(chunk);
            if ttft_ms.is_none() && relay.first_token_seen() {
                ttft_ms = Some(started.elapsed().as_millis() as i64);
            }
            for frame in frames {
                if tx.send(frame).await.is_err() {
                    client_gone = true;
                    break 'relay;
                }
            }
            if relay.is_done() {
                break;
            }
        }

        // Upstream finished (or the client left); close out the stream.
        drop(upstream);
        if !client_gone {
            for frame in relay.on_eof() {
                if tx.send(frame).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
        }

        let usage = relay.usage();
        let output_text = relay.output_text();
        finalizer
            .finalize(FinalizeArgs {
                status: 200,
                usage,
                ttft_ms,
                error: client_gone.then(|| "client disconnected".to_string()),
                output_text: output_text.clone(),
                response_text: Some(output_text),
            })
            .await;
    });

    rx
}

#[derive(Debug, Default)]
struct FinalizeArgs {
    status: u16,
    usage: UsageTotals,
    ttft_ms: Option<i64>,
    error: Option<String>,
    /// Accumulated output text; estimator input when usage is absent.
    output_text: String,
    /// What to persist as the response payload blob.
    response_text: Option<String>,
}

impl FinalizeArgs {
    fn error(status: u16, message: String) -> Self {
        Self {
            status,
            error: Some(message),
            ..Self::default()
        }
    }
}

/// Owns the terminal bookkeeping for one request. `finalize` is idempotent;
/// whichever terminal path runs first wins.
struct Finalizer {
    state: Arc<GatewayState>,
    log_id: i64,
    api_key_id: i64,
    endpoint: String,
    token_estimate: u64,
    stream: bool,
    started: Instant,
    store_response: bool,
    done: bool,
}

impl Finalizer {
    async fn finalize(&mut self, args: FinalizeArgs) {
        if self.done {
            return;
        }
        self.done = true;

        let latency_ms = self.started.elapsed().as_millis() as i64;
        let success = args.status < 400;

        let input_tokens = args
            .usage
            .input
            .or(success.then_some(self.token_estimate));
        let output_tokens = args.usage.output.or_else(|| {
            (success && !args.output_text.is_empty())
                .then(|| estimate::estimate_text(&args.output_text))
        });

        let timing = latency::compute(latency_ms, args.ttft_ms, output_tokens, self.stream);

        if let Err(err) = self
            .state
            .storage
            .finalize_request_log(
                self.log_id,
                RequestLogFinal {
                    status_code: args.status as i32,
                    latency_ms: timing.latency_ms,
                    ttft_ms: timing.ttft_ms,
                    tpot_ms: timing.tpot_ms,
                    input_tokens: input_tokens.map(|tokens| tokens as i64),
                    output_tokens: output_tokens.map(|tokens| tokens as i64),
                    cached_tokens: args.usage.cached.map(|tokens| tokens as i64),
                    error: args.error.clone(),
                },
            )
            .await
        {
            warn!(event = "log_finalize_failed", request_id = self.log_id, error = %err);
        }

        if let Err(err) = self
            .state
            .storage
            .bump_daily_metric(
                OffsetDateTime::now_utc().date(),
                &self.endpoint,
                DailyDelta {
                    requests: 1,
                    input_tokens: input_tokens.unwrap_or(0) as i64,
                    output_tokens: output_tokens.unwrap_or(0) as i64,
                    latency_ms,
                },
            )
            .await
        {
            warn!(event = "daily_metric_write_failed", request_id = self.log_id, error = %err);
        }

        self.state
            .keys
            .record_usage(
                self.api_key_id,
                input_tokens.unwrap_or(0) as i64,
                output_tokens.unwrap_or(0) as i64,
            )
            .await;

        if self.store_response
            && success
            && let Some(text) = args.response_text.as_deref().filter(|text| !text.is_empty())
            && let Err(err) = self
                .state
                .storage
                .upsert_request_payload(self.log_id, None, Some(text))
                .await
        {
            warn!(event = "response_payload_store_failed", request_id = self.log_id, error = %err);
        }

        self.state.leave_request();
        info!(
            event = "request_finalized",
            request_id = self.log_id,
            status = args.status,
            latency_ms = timing.latency_ms,
            ttft_ms = timing.ttft_ms,
            input_tokens = input_tokens.unwrap_or(0),
            output_tokens = output_tokens.unwrap_or(0),
            error = args.error.as_deref().unwrap_or(""),
        );
    }
}

#[cfg(test)]
mod tests;
