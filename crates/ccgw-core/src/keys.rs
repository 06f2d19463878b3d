//! API key service: generation, resolution, settings, reveal, usage credit.
//!
//! Key material: `sk-ccgw-` followed by 24 random bytes, base64url. Only the
//! SHA-256 hash is queryable; the plaintext survives solely as a vault
//! envelope for reveal.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ccgw_common::{mask_key, AuthErrorCode};
use ccgw_storage::{
    decode_endpoints, ApiKeyPatch, AuditEntry, GatewayStorage, NewApiKey, StorageError,
};
use ccgw_vault::Vault;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::warn;

pub const KEY_PREFIX: &str = "sk-ccgw-";
const KEY_RANDOM_BYTES: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum KeyServiceError {
    #[error("api key not found")]
    NotFound,
    #[error("a wildcard key already exists")]
    WildcardExists,
    #[error("wildcard keys cannot carry endpoint restrictions")]
    WildcardRestricted,
    #[error("wildcard keys cannot be revealed")]
    WildcardReveal,
    #[error("wildcard keys cannot be deleted")]
    WildcardDelete,
    #[error("stored ciphertext cannot be decrypted")]
    RevealUnavailable,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to seal key material: {0}")]
    Vault(#[from] ccgw_vault::VaultError),
}

#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub id: i64,
    /// Returned exactly once, at creation.
    pub plaintext: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedApiKey {
    pub id: i64,
    pub name: String,
    pub masked: String,
    pub is_wildcard: bool,
}

#[derive(Debug, Clone, Default)]
pub struct KeySettingsPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub enabled: Option<bool>,
    /// `Some(None)` clears the restriction; `Some(Some(..))` replaces it.
    pub allowed_endpoints: Option<Option<Vec<String>>>,
}

#[derive(Clone)]
pub struct ApiKeyService {
    storage: GatewayStorage,
    vault: Vault,
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

impl ApiKeyService {
    pub fn new(storage: GatewayStorage, vault: Vault) -> Self {
        Self { storage, vault }
    }

    fn generate_plaintext() -> String {
        let mut bytes = [0u8; KEY_RANDOM_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
    }

    pub async fn create(
        &self,
        name: &str,
        description: Option<String>,
        allowed_endpoints: Option<Vec<String>>,
        is_wildcard: bool,
        operator: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<CreatedApiKey, KeyServiceError> {
        if is_wildcard {
            if allowed_endpoints.is_some() {
                return Err(KeyServiceError::WildcardRestricted);
            }
            if self.storage.find_wildcard_api_key().await?.is_some() {
                return Err(KeyServiceError::WildcardExists);
            }
        }

        let plaintext = Self::generate_plaintext();
        let id = self
            .storage
            .insert_api_key(NewApiKey {
                name: name.to_string(),
                description,
                key_hash: sha256_hex(&plaintext),
                key_ciphertext: self.vault.encrypt(&plaintext)?,
                key_prefix: plaintext[..KEY_PREFIX.len() + 2].to_string(),
                key_suffix: plaintext[plaintext.len() - 4..].to_string(),
                is_wildcard,
                allowed_endpoints,
            })
            .await?;

        self.audit(
            Some(id),
            Some(name),
            "create",
            operator,
            Some(serde_json::json!({"isWildcard": is_wildcard})),
            ip_address,
        )
        .await;

        Ok(CreatedApiKey { id, plaintext })
    }

    /// Resolve a caller-provided key. All rejections write an `auth_failure`
    /// audit row; a provided key is only ever referenced by its hash prefix.
    pub async fn resolve(
        &self,
        provided: Option<&str>,
        endpoint: &str,
        ip_address: Option<&str>,
    ) -> Result<ResolvedApiKey, AuthErrorCode> {
        let provided = provided.map(str::trim).filter(|key| !key.is_empty());

        let Some(provided) = provided else {
            if let Some(wildcard) = self.enabled_wildcard().await {
                return Ok(wildcard);
            }
            self.auth_failure(None, endpoint, ip_address, AuthErrorCode::Missing)
                .await;
            return Err(AuthErrorCode::Missing);
        };

        let hash = sha256_hex(provided);
        match self.storage.find_api_key_by_hash(&hash).await {
            Ok(Some(key)) if key.enabled => {
                if let Some(allowed) = decode_endpoints(key.allowed_endpoints.as_deref())
                    && !allowed.iter().any(|candidate| candidate == endpoint)
                {
                    self.auth_failure(
                        Some(&hash),
                        endpoint,
                        ip_address,
                        AuthErrorCode::Forbidden,
                    )
                    .await;
                    return Err(AuthErrorCode::Forbidden);
                }
                Ok(ResolvedApiKey {
                    id: key.id,
                    name: key.name,
                    masked: mask_key(&key.key_prefix, &key.key_suffix),
                    is_wildcard: key.is_wildcard,
                })
            }
            Ok(Some(_)) => {
                self.auth_failure(Some(&hash), endpoint, ip_address, AuthErrorCode::Disabled)
                    .await;
                Err(AuthErrorCode::Disabled)
            }
            Ok(None) => {
                if let Some(wildcard) = self.enabled_wildcard().await {
                    return Ok(wildcard);
                }
                self.auth_failure(
                    Some(&hash),
                    endpoint,
                    ip_address,
                    AuthErrorCode::InvalidApiKey,
                )
                .await;
                Err(AuthErrorCode::InvalidApiKey)
            }
            Err(err) => {
                warn!(event = "api_key_lookup_failed", error = %err);
                Err(AuthErrorCode::InvalidApiKey)
            }
        }
    }

    async fn enabled_wildcard(&self) -> Option<ResolvedApiKey> {
        match self.storage.find_wildcard_api_key().await {
            Ok(Some(key)) if key.enabled => Some(ResolvedApiKey {
                id: key.id,
                name: key.name,
                masked: mask_key(&key.key_prefix, &key.key_suffix),
                is_wildcard: true,
            }),
            Ok(_) => None,
            Err(err) => {
                warn!(event = "wildcard_lookup_failed", error = %err);
                None
            }
        }
    }

    /// Apply a settings patch, writing one audit row per semantic change.
    pub async fn update_settings(
        &self,
        id: i64,
        patch: KeySettingsPatch,
        operator: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<(), KeyServiceError> {
        let Some(current) = self.storage.get_api_key(id).await? else {
            return Err(KeyServiceError::NotFound);
        };
        if current.is_wildcard && matches!(patch.allowed_endpoints, Some(Some(_))) {
            return Err(KeyServiceError::WildcardRestricted);
        }

        let enabled_change = patch.enabled.filter(|next| *next != current.enabled);
        let endpoints_change = patch.allowed_endpoints.clone();

        self.storage
            .update_api_key(
                id,
                ApiKeyPatch {
                    name: patch.name,
                    description: patch.description,
                    enabled: patch.enabled,
                    allowed_endpoints: patch.allowed_endpoints,
                },
            )
            .await?;

        if let Some(enabled) = enabled_change {
            self.audit(
                Some(id),
                Some(&current.name),
                if enabled { "enable" } else { "disable" },
                operator,
                None,
                ip_address,
            )
            .await;
        }
        if let Some(endpoints) = endpoints_change {
            self.audit(
                Some(id),
                Some(&current.name),
                "update_endpoints",
                operator,
                Some(serde_json::json!({"allowedEndpoints": endpoints})),
                ip_address,
            )
            .await;
        }
        Ok(())
    }

    pub async fn reveal(&self, id: i64) -> Result<String, KeyServiceError> {
        let Some(key) = self.storage.get_api_key(id).await? else {
            return Err(KeyServiceError::NotFound);
        };
        if key.is_wildcard {
            return Err(KeyServiceError::WildcardReveal);
        }
        self.vault
            .decrypt(&key.key_ciphertext)
            .ok_or(KeyServiceError::RevealUnavailable)
    }

    pub async fn delete(
        &self,
        id: i64,
        operator: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<(), KeyServiceError> {
        let Some(key) = self.storage.get_api_key(id).await? else {
            return Err(KeyServiceError::NotFound);
        };
        if key.is_wildcard {
            return Err(KeyServiceError::WildcardDelete);
        }
        self.storage.delete_api_key(id).await?;
        self.audit(Some(id), Some(&key.name), "delete", operator, None, ip_address)
            .await;
        Ok(())
    }

    pub async fn record_usage(&self, id: i64, input_tokens: i64, output_tokens: i64) {
        if let Err(err) = self
            .storage
            .record_api_key_usage(id, input_tokens, output_tokens)
            .await
        {
            warn!(event = "api_key_usage_write_failed", key_id = id, error = %err);
        }
    }

    async fn auth_failure(
        &self,
        hash: Option<&str>,
        endpoint: &str,
        ip_address: Option<&str>,
        code: AuthErrorCode,
    ) {
        let mut details = serde_json::json!({
            "reason": code.as_str(),
            "endpoint": endpoint,
        });
        if let Some(hash) = hash {
            // Redaction rule: at most the first 16 hex chars of the hash.
            details["keyHashPrefix"] = serde_json::Value::String(hash[..16].to_string());
        }
        self.audit(None, None, "auth_failure", None, Some(details), ip_address)
            .await;
    }

    async fn audit(
        &self,
        api_key_id: Option<i64>,
        api_key_name: Option<&str>,
        operation: &str,
        operator: Option<&str>,
        details: Option<serde_json::Value>,
        ip_address: Option<&str>,
    ) {
        let entry = AuditEntry {
            api_key_id,
            api_key_name: api_key_name.map(|name| name.to_string()),
            operation: operation.to_string(),
            operator: operator.map(|operator| operator.to_string()),
            details,
            ip_address: ip_address.map(|ip| ip.to_string()),
        };
        if let Err(err) = self.storage.append_audit(entry).await {
            warn!(event = "audit_write_failed", error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> ApiKeyService {
        let storage = GatewayStorage::connect("sqlite::memory:").await.unwrap();
        storage.sync().await.unwrap();
        ApiKeyService::new(storage, Vault::from_key([3u8; 32]))
    }

    #[tokio::test]
    async fn created_key_resolves_and_reveals() {
        let service = service().await;
        let created = service
            .create("ci", None, None, false, Some("admin"), None)
            .await
            .unwrap();
        assert!(created.plaintext.starts_with(KEY_PREFIX));

        let resolved = service
            .resolve(Some(&created.plaintext), "anthropic", None)
            .await
            .unwrap();
        assert_eq!(resolved.id, created.id);
        assert!(!resolved.is_wildcard);
        assert!(resolved.masked.contains('\u{2026}'));

        assert_eq!(service.reveal(created.id).await.unwrap(), created.plaintext);
    }

    #[tokio::test]
    async fn lifecycle_disable_enable_produces_audit_trail() {
        let service = service().await;
        let created = service.create("k", None, None, false, None, None).await.unwrap();

        service
            .update_settings(
                created.id,
                KeySettingsPatch {
                    enabled: Some(false),
                    ..KeySettingsPatch::default()
                },
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            service
                .resolve(Some(&created.plaintext), "anthropic", None)
                .await
                .unwrap_err(),
            AuthErrorCode::Disabled
        );

        service
            .update_settings(
                created.id,
                KeySettingsPatch {
                    enabled: Some(true),
                    ..KeySettingsPatch::default()
                },
                None,
                None,
            )
            .await
            .unwrap();
        assert!(service
            .resolve(Some(&created.plaintext), "anthropic", None)
            .await
            .is_ok());

        let audit = service.storage.query_audit(50, 0).await.unwrap();
        let operations: Vec<&str> = audit
            .rows
            .iter()
            .rev()
            .filter(|row| row.api_key_id == Some(created.id))
            .map(|row| row.operation.as_str())
            .collect();
        assert_eq!(operations, vec!["create", "disable", "enable"]);
        // The disable window also produced an auth_failure row.
        assert!(audit.rows.iter().any(|row| row.operation == "auth_failure"));
    }

    #[tokio::test]
    async fn endpoint_acl_forbids_other_endpoints() {
        let service = service().await;
        let created = service
            .create("scoped", None, Some(vec!["openai".to_string()]), false, None, None)
            .await
            .unwrap();
        assert!(service
            .resolve(Some(&created.plaintext), "openai", None)
            .await
            .is_ok());
        assert_eq!(
            service
                .resolve(Some(&created.plaintext), "anthropic", None)
                .await
                .unwrap_err(),
            AuthErrorCode::Forbidden
        );
    }

    #[tokio::test]
    async fn wildcard_accepts_empty_and_unknown_keys() {
        let service = service().await;
        assert_eq!(
            service.resolve(None, "anthropic", None).await.unwrap_err(),
            AuthErrorCode::Missing
        );

        let wildcard = service
            .create("wildcard", None, None, true, None, None)
            .await
            .unwrap();
        assert!(service.resolve(None, "anthropic", None).await.is_ok());
        let by_unknown = service
            .resolve(Some("sk-ccgw-not-a-real-key"), "anthropic", None)
            .await
            .unwrap();
        assert_eq!(by_unknown.id, wildcard.id);

        // Disabled wildcard stops accepting.
        service
            .update_settings(
                wildcard.id,
                KeySettingsPatch {
                    enabled: Some(false),
                    ..KeySettingsPatch::default()
                },
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            service.resolve(None, "anthropic", None).await.unwrap_err(),
            AuthErrorCode::Missing
        );
        assert_eq!(
            service
                .resolve(Some("sk-ccgw-unknown"), "anthropic", None)
                .await
                .unwrap_err(),
            AuthErrorCode::InvalidApiKey
        );
    }

    #[tokio::test]
    async fn wildcard_invariants_hold() {
        let service = service().await;
        let wildcard = service
            .create("wildcard", None, None, true, None, None)
            .await
            .unwrap();
        // Only one wildcard row.
        assert!(matches!(
            service.create("second", None, None, true, None, None).await,
            Err(KeyServiceError::WildcardExists)
        ));
        // No deletion, no reveal, no ACL.
        assert!(matches!(
            service.delete(wildcard.id, None, None).await,
            Err(KeyServiceError::WildcardDelete)
        ));
        assert!(matches!(
            service.reveal(wildcard.id).await,
            Err(KeyServiceError::WildcardReveal)
        ));
        assert!(matches!(
            service
                .update_settings(
                    wildcard.id,
                    KeySettingsPatch {
                        allowed_endpoints: Some(Some(vec!["openai".to_string()])),
                        ..KeySettingsPatch::default()
                    },
                    None,
                    None,
                )
                .await,
            Err(KeyServiceError::WildcardRestricted)
        ));
    }

    #[tokio::test]
    async fn auth_failure_audit_carries_only_hash_prefix() {
        let service = service().await;
        let secret = "sk-ccgw-super-secret-value";
        let _ = service.resolve(Some(secret), "anthropic", Some("10.0.0.9")).await;

        let audit = service.storage.query_audit(10, 0).await.unwrap();
        let row = &audit.rows[0];
        assert_eq!(row.operation, "auth_failure");
        assert_eq!(row.ip_address.as_deref(), Some("10.0.0.9"));
        let details = row.details.as_deref().unwrap();
        assert!(!details.contains(secret));
        let parsed: serde_json::Value = serde_json::from_str(details).unwrap();
        let prefix = parsed["keyHashPrefix"].as_str().unwrap();
        assert_eq!(prefix.len(), 16);
        assert!(sha256_hex(secret).starts_with(prefix));
    }
}
