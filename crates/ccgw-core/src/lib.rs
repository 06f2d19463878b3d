pub mod keys;
pub mod pipeline;
pub mod session;
pub mod state;

pub use keys::{ApiKeyService, CreatedApiKey, KeyServiceError, KeySettingsPatch, ResolvedApiKey};
pub use pipeline::{handle_chat, CallOutcome, ClientProtocol, InboundCall};
pub use session::SessionStore;
pub use state::GatewayState;
