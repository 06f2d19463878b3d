use bytes::Bytes;
use ccgw_config::{AuthMode, ProviderConfig, ProviderType};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stream: bool,
}

/// Assemble the upstream request for a provider: endpoint URL per provider
/// type, auth header per auth mode, then the provider's extra headers (which
/// may override anything set here).
pub fn build_provider_request(
    provider: &ProviderConfig,
    api_key: Option<&str>,
    body: Bytes,
    stream: bool,
) -> ProviderRequest {
    let base = provider.base_url.trim_end_matches('/');
    let url = match provider.r#type {
        ProviderType::Anthropic => format!("{base}/v1/messages"),
        // Custom providers configure the full endpoint as their base URL.
        ProviderType::Custom => provider.base_url.clone(),
        _ => format!("{base}/chat/completions"),
    };

    let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
    if stream {
        headers.push(("accept".to_string(), "text/event-stream".to_string()));
    }
    if provider.is_anthropic_family() {
        headers.push(("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()));
    }
    if let Some(key) = api_key.filter(|key| !key.is_empty()) {
        match provider.auth_mode {
            AuthMode::ApiKey => headers.push(("x-api-key".to_string(), key.to_string())),
            AuthMode::AuthToken => {
                headers.push(("authorization".to_string(), format!("Bearer {key}")))
            }
        }
    }
    for (name, value) in &provider.extra_headers {
        let name = name.to_ascii_lowercase();
        headers.retain(|(existing, _)| existing != &name);
        headers.push((name, value.clone()));
    }

    ProviderRequest {
        url,
        headers,
        body,
        stream,
    }
}
