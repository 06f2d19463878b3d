//! Secret vault: an AES-256-GCM envelope over provider keys and API key
//! plaintext, keyed by a per-install master key file.
//!
//! Ciphertext text form: `v1:` followed by base64(nonce ‖ ciphertext ‖ tag).
//! Decryption never raises to callers; a failure (tampered text, foreign
//! master key) yields `None` and a warning in the log.

use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

const CIPHERTEXT_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;
const MASTER_KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("failed to read master key file: {0}")]
    ReadKey(#[source] std::io::Error),
    #[error("failed to create master key file: {0}")]
    WriteKey(#[source] std::io::Error),
    #[error("master key file is {0} bytes, expected {MASTER_KEY_LEN}")]
    KeyLength(usize),
    #[error("encryption failed")]
    Encrypt,
}

#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    /// Open the vault, creating the master key file (0600) on first use.
    pub fn open(key_path: &Path) -> Result<Self, VaultError> {
        let key_bytes = match std::fs::read(key_path) {
            Ok(bytes) => {
                if bytes.len() != MASTER_KEY_LEN {
                    return Err(VaultError::KeyLength(bytes.len()));
                }
                bytes
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let key = Aes256Gcm::generate_key(OsRng);
                write_key_file(key_path, &key)?;
                key.to_vec()
            }
            Err(err) => return Err(VaultError::ReadKey(err)),
        };

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn from_key(key_bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes)),
        }
    }

    pub fn is_ciphertext(text: &str) -> bool {
        text.starts_with(CIPHERTEXT_PREFIX)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(format!("{CIPHERTEXT_PREFIX}{}", BASE64.encode(envelope)))
    }

    /// Decrypt a `v1:` envelope. Any failure is logged and mapped to `None`.
    pub fn decrypt(&self, text: &str) -> Option<String> {
        let encoded = match text.strip_prefix(CIPHERTEXT_PREFIX) {
            Some(rest) => rest,
            None => {
                warn!(event = "vault_decrypt_failed", reason = "missing version prefix");
                return None;
            }
        };
        let envelope = match BASE64.decode(encoded) {
            Ok(bytes) if bytes.len() > NONCE_LEN => bytes,
            _ => {
                warn!(event = "vault_decrypt_failed", reason = "malformed envelope");
                return None;
            }
        };
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let plain = match self.cipher.decrypt(Nonce::from_slice(nonce_bytes), ciphertext) {
            Ok(plain) => plain,
            Err(_) => {
                warn!(event = "vault_decrypt_failed", reason = "authentication failed");
                return None;
            }
        };
        match String::from_utf8(plain) {
            Ok(text) => Some(text),
            Err(_) => {
                warn!(event = "vault_decrypt_failed", reason = "non-utf8 plaintext");
                None
            }
        }
    }
}

fn write_key_file(path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(VaultError::WriteKey)?;
    }
    std::fs::write(path, bytes).map_err(VaultError::WriteKey)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(VaultError::WriteKey)?;
    }
    Ok(())
}
