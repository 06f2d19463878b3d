use bytes::Bytes;
use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Built-in endpoint ids. Custom endpoints add their own ids at runtime.
pub const ENDPOINT_ANTHROPIC: &str = "anthropic";
pub const ENDPOINT_OPENAI: &str = "openai";

/// Reason an inbound API key was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorCode {
    Missing,
    InvalidApiKey,
    Disabled,
    Forbidden,
}

impl AuthErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorCode::Missing => "missing",
            AuthErrorCode::InvalidApiKey => "invalid_api_key",
            AuthErrorCode::Disabled => "disabled",
            AuthErrorCode::Forbidden => "forbidden",
        }
    }
}

/// Error taxonomy surfaced to gateway clients.
///
/// Upstream non-2xx responses are mirrored verbatim; everything else is
/// rendered as `{"error":{"code":...,"message":...}}`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{message}")]
    Auth {
        code: AuthErrorCode,
        message: String,
    },
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
    #[error("upstream returned status {status}")]
    Upstream { status: u16, body: Bytes },
    #[error("upstream returned an empty body for a streaming call")]
    UpstreamEmpty,
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        GatewayError::Internal(err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::UpstreamEmpty | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Auth { code, .. } => code.as_str(),
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::UpstreamEmpty => "upstream_empty",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Response body bytes. Upstream errors forward the upstream body when it
    /// is present so clients see the provider's own message.
    pub fn body(&self) -> Bytes {
        if let GatewayError::Upstream { body, .. } = self
            && !body.is_empty()
        {
            return body.clone();
        }
        let json = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        Bytes::from(json.to_string())
    }
}

/// Display form of an API key: prefix and suffix with the middle elided.
pub fn mask_key(prefix: &str, suffix: &str) -> String {
    format!("{prefix}\u{2026}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_body_carries_code() {
        let err = GatewayError::Auth {
            code: AuthErrorCode::Disabled,
            message: "api key disabled".to_string(),
        };
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_slice(&err.body()).unwrap();
        assert_eq!(body["error"]["code"], "disabled");
    }

    #[test]
    fn upstream_error_mirrors_status_and_body() {
        let err = GatewayError::Upstream {
            status: 429,
            body: Bytes::from_static(b"{\"error\":\"rate limited\"}"),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(&err.body()[..], b"{\"error\":\"rate limited\"}");
    }

    #[test]
    fn upstream_error_with_empty_body_falls_back_to_json() {
        let err = GatewayError::Upstream {
            status: 502,
            body: Bytes::new(),
        };
        let body: serde_json::Value = serde_json::from_slice(&err.body()).unwrap();
        assert_eq!(body["error"]["code"], "upstream_error");
    }

    #[test]
    fn masked_key_elides_middle() {
        assert_eq!(mask_key("sk-ccgw-ab", "yz"), "sk-ccgw-ab\u{2026}yz");
    }
}
