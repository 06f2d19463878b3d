pub mod document;
pub mod store;

pub use document::{
    AuthMode, CustomEndpoint, CustomPath, CustomProtocol, EndpointRouting, GatewayConfig,
    ModelConfig, ProviderConfig, ProviderType, RoutingDefaults, WebAuthConfig,
};
pub use store::{ConfigError, ConfigStore};
