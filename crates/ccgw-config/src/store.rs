use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ccgw_vault::{Vault, VaultError};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::document::GatewayConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write config file: {0}")]
    Write(#[source] std::io::Error),
    #[error("config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Single-writer configuration store.
///
/// Readers take an `Arc` snapshot and never observe a partially-applied
/// update; writers serialize through one async mutex and persist with a
/// temp-file rename so a crash can't leave a torn `config.json`.
pub struct ConfigStore {
    path: PathBuf,
    vault: Vault,
    current: ArcSwap<GatewayConfig>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Load the document, writing the first-boot template when missing.
    pub fn load_or_init(path: impl Into<PathBuf>, vault: Vault) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = match std::fs::read(&path) {
            Ok(bytes) => {
                let config: GatewayConfig = serde_json::from_slice(&bytes)?;
                config.validate().map_err(ConfigError::Invalid)?;
                config
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let template = GatewayConfig::template();
                persist(&path, &template)?;
                info!(event = "config_template_written", path = %path.display());
                template
            }
            Err(err) => return Err(ConfigError::Read(err)),
        };

        let store = Self {
            path,
            vault,
            current: ArcSwap::from_pointee(config),
            write_lock: Mutex::new(()),
        };

        // Encrypt any plaintext provider keys a hand-edited file may carry.
        let snapshot = store.snapshot();
        if snapshot
            .providers
            .iter()
            .any(|provider| matches!(&provider.api_key, Some(key) if !Vault::is_ciphertext(key)))
        {
            let next = (*snapshot).clone();
            reseal_at_bootstrap(&store, next)?;
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        self.current.load_full()
    }

    /// Validate, seal secrets, persist atomically, then publish the snapshot.
    pub async fn update(&self, mut next: GatewayConfig) -> Result<Arc<GatewayConfig>, ConfigError> {
        next.validate().map_err(ConfigError::Invalid)?;
        let _guard = self.write_lock.lock().await;
        self.seal_secrets(&mut next)?;
        persist(&self.path, &next)?;
        let next = Arc::new(next);
        self.current.store(next.clone());
        info!(event = "config_updated", path = %self.path.display());
        Ok(next)
    }

    /// Decrypted upstream key for a provider, if one is configured.
    pub fn provider_key(&self, provider_id: &str) -> Option<String> {
        let snapshot = self.snapshot();
        let provider = snapshot.provider(provider_id)?;
        let stored = provider.api_key.as_deref()?;
        if Vault::is_ciphertext(stored) {
            self.vault.decrypt(stored)
        } else {
            // Pre-encryption value observed mid-migration; still usable.
            warn!(event = "provider_key_plaintext", provider = provider_id);
            Some(stored.to_string())
        }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    fn seal_secrets(&self, config: &mut GatewayConfig) -> Result<(), ConfigError> {
        for provider in &mut config.providers {
            if let Some(key) = &provider.api_key
                && !Vault::is_ciphertext(key)
            {
                provider.api_key = Some(self.vault.encrypt(key)?);
            }
        }
        Ok(())
    }
}

/// Crash-safe write: serialize to a sibling temp file, then rename over the
/// target.
fn persist(path: &Path, config: &GatewayConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(ConfigError::Write)?;
    }
    let json = serde_json::to_vec_pretty(config)?;
    let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, &json).map_err(ConfigError::Write)?;
    std::fs::rename(&tmp, path).map_err(|err| {
        let _ = std::fs::remove_file(&tmp);
        ConfigError::Write(err)
    })?;
    Ok(())
}

// Bootstrap-only synchronous re-seal; avoids making load_or_init async for
// the one rare path where a hand-edited file carries plaintext keys.
fn reseal_at_bootstrap(store: &ConfigStore, mut next: GatewayConfig) -> Result<(), ConfigError> {
    store.seal_secrets(&mut next)?;
    persist(&store.path, &next)?;
    store.current.store(Arc::new(next));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{AuthMode, ProviderConfig, ProviderType};

    fn provider(id: &str, api_key: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            label: String::new(),
            r#type: ProviderType::Openai,
            base_url: "https://api.example.com".to_string(),
            api_key: api_key.map(|key| key.to_string()),
            auth_mode: AuthMode::ApiKey,
            default_model: None,
            models: Vec::new(),
            extra_headers: Default::default(),
        }
    }

    #[tokio::test]
    async fn first_load_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load_or_init(&path, Vault::from_key([1u8; 32])).unwrap();
        assert!(path.exists());
        assert!(store.snapshot().providers.is_empty());

        // Reload sees the persisted template, not a fresh one.
        let reloaded = ConfigStore::load_or_init(&path, Vault::from_key([1u8; 32])).unwrap();
        assert_eq!(reloaded.snapshot().port, store.snapshot().port);
    }

    #[tokio::test]
    async fn update_encrypts_provider_keys_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load_or_init(&path, Vault::from_key([1u8; 32])).unwrap();

        let mut next = (*store.snapshot()).clone();
        next.providers.push(provider("openai", Some("sk-upstream-plain")));
        store.update(next).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("sk-upstream-plain"));
        assert!(raw.contains("v1:"));
        assert_eq!(
            store.provider_key("openai").as_deref(),
            Some("sk-upstream-plain")
        );
    }

    #[tokio::test]
    async fn update_rejects_invalid_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load_or_init(dir.path().join("config.json"), Vault::from_key([1u8; 32]))
            .unwrap();
        let mut next = (*store.snapshot()).clone();
        next.providers.push(provider("dup", None));
        next.providers.push(provider("dup", None));
        assert!(matches!(
            store.update(next).await,
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_is_stable_across_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load_or_init(dir.path().join("config.json"), Vault::from_key([1u8; 32]))
            .unwrap();
        let before = store.snapshot();
        let mut next = (*before).clone();
        next.port = 9999;
        store.update(next).await.unwrap();
        // The old snapshot is unchanged; new readers see the update.
        assert_ne!(before.port, 9999);
        assert_eq!(store.snapshot().port, 9999);
    }
}
