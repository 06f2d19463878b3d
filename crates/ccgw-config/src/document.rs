//! The configuration document persisted at `$CC_GW_HOME/config.json`.
//! Field names follow the on-disk camelCase convention.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
    /// Legacy switch covering both payload directions. The split flags win
    /// when they are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_payloads: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_request_payloads: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_response_payloads: Option<bool>,
    #[serde(default)]
    pub enable_routing_fallback: bool,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub endpoint_routing: BTreeMap<String, EndpointRouting>,
    #[serde(default)]
    pub custom_endpoints: Vec<CustomEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_auth: Option<WebAuthConfig>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_body_limit() -> usize {
    DEFAULT_BODY_LIMIT
}

fn default_log_retention_days() -> u32 {
    DEFAULT_LOG_RETENTION_DAYS
}

impl GatewayConfig {
    /// First-boot template: no providers, empty routing tables for the two
    /// built-in endpoints, fallback routing on so a fresh install can serve
    /// as soon as one provider is added.
    pub fn template() -> Self {
        let mut endpoint_routing = BTreeMap::new();
        endpoint_routing.insert("anthropic".to_string(), EndpointRouting::default());
        endpoint_routing.insert("openai".to_string(), EndpointRouting::default());
        Self {
            host: default_host(),
            port: default_port(),
            body_limit: default_body_limit(),
            log_retention_days: default_log_retention_days(),
            store_payloads: None,
            store_request_payloads: Some(true),
            store_response_payloads: Some(true),
            enable_routing_fallback: true,
            providers: Vec::new(),
            endpoint_routing,
            custom_endpoints: Vec::new(),
            web_auth: None,
        }
    }

    pub fn store_request_payloads(&self) -> bool {
        self.store_request_payloads
            .or(self.store_payloads)
            .unwrap_or(false)
    }

    pub fn store_response_payloads(&self) -> bool {
        self.store_response_payloads
            .or(self.store_payloads)
            .unwrap_or(false)
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|provider| provider.id == id)
    }

    /// Routing table for an endpoint id. Custom endpoints with an embedded
    /// routing block shadow the shared tables.
    pub fn routing_for(&self, endpoint: &str) -> Option<&EndpointRouting> {
        if let Some(custom) = self
            .custom_endpoints
            .iter()
            .find(|candidate| candidate.id == endpoint)
            && let Some(routing) = &custom.routing
        {
            return Some(routing);
        }
        self.endpoint_routing.get(endpoint)
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err("provider id must not be empty".to_string());
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(format!("duplicate provider id: {}", provider.id));
            }
            if provider.base_url.trim().is_empty() {
                return Err(format!("provider {} has an empty baseUrl", provider.id));
            }
            if let Some(default_model) = &provider.default_model
                && !provider.models.is_empty()
                && !provider.models.iter().any(|model| &model.id == default_model)
            {
                return Err(format!(
                    "provider {} defaultModel {} is not in its model list",
                    provider.id, default_model
                ));
            }
        }

        let mut endpoint_ids = std::collections::HashSet::new();
        endpoint_ids.insert("anthropic");
        endpoint_ids.insert("openai");
        for endpoint in &self.custom_endpoints {
            if endpoint.id.trim().is_empty() {
                return Err("custom endpoint id must not be empty".to_string());
            }
            if !endpoint_ids.insert(endpoint.id.as_str()) {
                return Err(format!("duplicate endpoint id: {}", endpoint.id));
            }
            if endpoint.paths.is_empty() {
                return Err(format!("custom endpoint {} has no paths", endpoint.id));
            }
            for path in &endpoint.paths {
                if !path.path.starts_with('/') {
                    return Err(format!(
                        "custom endpoint {} path {:?} must start with '/'",
                        endpoint.id, path.path
                    ));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub r#type: ProviderType,
    pub base_url: String,
    /// Encrypted at rest; the store enforces the `v1:` envelope on write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// May be empty for pass-through providers.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_headers: BTreeMap<String, String>,
}

impl ProviderConfig {
    pub fn is_anthropic_family(&self) -> bool {
        matches!(self.r#type, ProviderType::Anthropic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Openai,
    Anthropic,
    Deepseek,
    Kimi,
    Huawei,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    #[default]
    #[serde(rename = "apiKey")]
    ApiKey,
    #[serde(rename = "authToken")]
    AuthToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRouting {
    #[serde(default)]
    pub defaults: RoutingDefaults,
    #[serde(default)]
    pub model_routes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_context_threshold: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEndpoint {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub paths: Vec<CustomPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<EndpointRouting>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomPath {
    pub path: String,
    pub protocol: CustomProtocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomProtocol {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai-chat")]
    OpenaiChat,
    #[serde(rename = "openai-responses")]
    OpenaiResponses,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// SHA-256 of the console password, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_validates() {
        assert!(GatewayConfig::template().validate().is_ok());
    }

    #[test]
    fn duplicate_provider_ids_rejected() {
        let mut config = GatewayConfig::template();
        for _ in 0..2 {
            config.providers.push(ProviderConfig {
                id: "kimi".to_string(),
                label: String::new(),
                r#type: ProviderType::Kimi,
                base_url: "https://api.moonshot.cn".to_string(),
                api_key: None,
                auth_mode: AuthMode::default(),
                default_model: None,
                models: Vec::new(),
                extra_headers: BTreeMap::new(),
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_model_must_be_listed_unless_passthrough() {
        let mut config = GatewayConfig::template();
        config.providers.push(ProviderConfig {
            id: "deepseek".to_string(),
            label: String::new(),
            r#type: ProviderType::Deepseek,
            base_url: "https://api.deepseek.com".to_string(),
            api_key: None,
            auth_mode: AuthMode::default(),
            default_model: Some("deepseek-chat".to_string()),
            models: Vec::new(),
            extra_headers: BTreeMap::new(),
        });
        // Empty model list: pass-through provider, any defaultModel allowed.
        assert!(config.validate().is_ok());

        config.providers[0].models.push(ModelConfig {
            id: "deepseek-reasoner".to_string(),
            label: None,
            max_tokens: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn legacy_store_payloads_applies_to_both_directions() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"storePayloads": true}"#).unwrap();
        assert!(config.store_request_payloads());
        assert!(config.store_response_payloads());

        let config: GatewayConfig =
            serde_json::from_str(r#"{"storePayloads": true, "storeResponsePayloads": false}"#)
                .unwrap();
        assert!(config.store_request_payloads());
        assert!(!config.store_response_payloads());
    }

    #[test]
    fn custom_endpoint_routing_shadows_shared_table() {
        let mut config = GatewayConfig::template();
        config.custom_endpoints.push(CustomEndpoint {
            id: "team-x".to_string(),
            label: String::new(),
            enabled: true,
            paths: vec![CustomPath {
                path: "/team-x/v1/messages".to_string(),
                protocol: CustomProtocol::Anthropic,
            }],
            routing: Some(EndpointRouting::default()),
        });
        assert!(config.routing_for("team-x").is_some());
        assert!(config.routing_for("anthropic").is_some());
        assert!(config.routing_for("nope").is_none());
    }
}
