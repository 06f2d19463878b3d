//! Cookie sessions for the management console. Optional: when `webAuth` is
//! disabled in config, every management call passes.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ccgw_config::GatewayConfig;
use rand::RngCore;
use time::{Duration, OffsetDateTime};

use crate::keys::sha256_hex;

const SESSION_TTL: Duration = Duration::hours(12);

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, OffsetDateTime>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(config: &GatewayConfig) -> bool {
        config
            .web_auth
            .as_ref()
            .is_some_and(|auth| auth.enabled && auth.password_hash.is_some())
    }

    /// Verify the console password and mint a session token.
    pub fn login(&self, config: &GatewayConfig, password: &str) -> Option<String> {
        let expected = config.web_auth.as_ref()?.password_hash.as_deref()?;
        if sha256_hex(password) != expected {
            return None;
        }
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(token.clone(), OffsetDateTime::now_utc() + SESSION_TTL);
        }
        Some(token)
    }

    pub fn validate(&self, token: &str) -> bool {
        let Ok(mut sessions) = self.sessions.lock() else {
            return false;
        };
        let now = OffsetDateTime::now_utc();
        // Lazy purge keeps the map bounded without a sweeper task.
        sessions.retain(|_, expires| *expires > now);
        sessions.contains_key(token)
    }

    pub fn logout(&self, token: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccgw_config::WebAuthConfig;

    fn config_with_password(password: &str) -> GatewayConfig {
        let mut config = GatewayConfig::template();
        config.web_auth = Some(WebAuthConfig {
            enabled: true,
            password_hash: Some(sha256_hex(password)),
        });
        config
    }

    #[test]
    fn login_round_trip() {
        let store = SessionStore::new();
        let config = config_with_password("hunter2");
        assert!(SessionStore::required(&config));

        assert!(store.login(&config, "wrong").is_none());
        let token = store.login(&config, "hunter2").unwrap();
        assert!(store.validate(&token));
        store.logout(&token);
        assert!(!store.validate(&token));
    }

    #[test]
    fn auth_not_required_without_password() {
        assert!(!SessionStore::required(&GatewayConfig::template()));
    }
}
