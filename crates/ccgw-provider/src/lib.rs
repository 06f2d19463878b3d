//! Upstream connectors: build one HTTP request per provider call and expose
//! the response body as bytes or a chunked stream.

mod request;

pub use request::{build_provider_request, ProviderRequest};

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Dns,
    Tls,
    Timeout,
    ReadTimeout,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("upstream transport error ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    #[error("connector setup failed: {0}")]
    Setup(String),
}

pub enum ProviderBody {
    Bytes(Bytes),
    /// Chunked reader fed by a relay task; closes on upstream EOF, error, or
    /// idle timeout.
    Stream(mpsc::Receiver<Bytes>),
}

impl std::fmt::Debug for ProviderBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ProviderBody::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

#[derive(Debug)]
pub struct ProviderResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ProviderBody,
}

impl ProviderResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Uniform upstream contract; tests substitute the transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, ConnectorError>;
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            // Long generations legitimately run for many minutes.
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(120),
        }
    }
}

pub struct WreqConnector {
    config: ConnectorConfig,
    clients: Mutex<HashMap<&'static str, wreq::Client>>,
}

impl WreqConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self) -> Result<wreq::Client, ConnectorError> {
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| ConnectorError::Setup("client cache lock poisoned".to_string()))?;
        if let Some(client) = guard.get("default") {
            return Ok(client.clone());
        }
        let client = wreq::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .read_timeout(self.config.stream_idle_timeout)
            .build()
            .map_err(|err| ConnectorError::Setup(err.to_string()))?;
        guard.insert("default", client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Connector for WreqConnector {
    async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, ConnectorError> {
        let client = self.client()?;
        let mut builder = client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(map_wreq_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        // Errors and non-streaming calls are read fully so callers can
        // mirror or parse the body in one piece.
        if !(200..300).contains(&status) || !request.stream {
            let body = response.bytes().await.map_err(map_wreq_error)?;
            return Ok(ProviderResponse {
                status,
                headers,
                body: ProviderBody::Bytes(body),
            });
        }

        let idle = self.config.stream_idle_timeout;
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                let Ok(item) = next else {
                    tracing::warn!(event = "upstream_stream_idle_timeout");
                    break;
                };
                let Some(item) = item else {
                    break;
                };
                let Ok(chunk) = item else {
                    break;
                };
                if tx.send(chunk).await.is_err() {
                    // Client side dropped the receiver; stop pulling.
                    break;
                }
            }
        });

        Ok(ProviderResponse {
            status,
            headers,
            body: ProviderBody::Stream(rx),
        })
    }
}

fn map_wreq_error(err: wreq::Error) -> ConnectorError {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    let kind = if err.is_timeout() {
        if lowered.contains("read") || lowered.contains("idle") {
            TransportErrorKind::ReadTimeout
        } else {
            TransportErrorKind::Timeout
        }
    } else if err.is_connect() {
        if lowered.contains("dns") || lowered.contains("resolve") {
            TransportErrorKind::Dns
        } else if lowered.contains("tls") || lowered.contains("ssl") {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Connect
        }
    } else if lowered.contains("tls") || lowered.contains("ssl") {
        TransportErrorKind::Tls
    } else {
        TransportErrorKind::Other
    };
    ConnectorError::Transport { kind, message }
}
