//! Key material resolution and at-rest protection for the management-plane agent.
//!
//! Two concerns live here:
//!
//! - [`Keyring`] holds the agent's configured [`Key`](agent_types::Key) set and
//!   resolves which key a given bundle's signature should be checked against
//!   (§4.C kid precedence: explicit override, then the configured key name,
//!   then the `kid` carried in the JWS header).
//! - [`encrypt`]/[`decrypt`] and [`StateEncryption`] protect persisted private
//!   key material and other sensitive state at rest using AES-256-GCM with a
//!   PBKDF2-derived key, exactly as shipped for state file encryption.
//!
//! ```
//! use agent_keystore::{encrypt, decrypt};
//!
//! let plaintext = b"Secret data";
//! let passphrase = "my-secret-passphrase";
//!
//! let encrypted = encrypt(plaintext, passphrase).expect("encryption failed");
//! let encrypted_str = String::from_utf8(encrypted).expect("valid UTF-8");
//! let decrypted = decrypt(&encrypted_str, passphrase).expect("decryption failed");
//!
//! assert_eq!(plaintext.to_vec(), decrypted);
//! ```
//!
//! ## Security
//!
//! - AES-256-GCM for authenticated encryption
//! - PBKDF2 with 100,000 iterations for key derivation
//! - Random salt and nonce for each encryption operation
//! - Encrypted data format: base64(salt || nonce || ciphertext || auth_tag)

use std::collections::BTreeMap;
use std::path::Path;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use agent_types::Key;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use pbkdf2::pbkdf2_hmac_array;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Size of the salt for key derivation (16 bytes)
const SALT_SIZE: usize = 16;
/// Size of the nonce for AES-GCM (12 bytes)
const NONCE_SIZE: usize = 12;
/// Number of PBKDF2 iterations
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Size of the derived key (256 bits for AES-256)
const KEY_SIZE: usize = 32;

/// Errors produced while resolving keys or protecting state at rest.
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("no key named {0:?} is configured")]
    UnknownKey(String),

    #[error("signature kid {kid:?} does not match any configured key")]
    UnresolvedKid { kid: String },

    #[error("AES-GCM operation failed: {0}")]
    Crypto(String),

    #[error("invalid base64 in encrypted payload")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("encrypted payload is shorter than the salt+nonce+tag header")]
    TruncatedCiphertext,

    #[error("encryption is enabled but no passphrase is available")]
    NoPassphrase,

    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, KeystoreError>;

/// The agent's resolved set of signing/verification keys (§3 Key, §4.C).
///
/// Keys are looked up by name; [`Keyring::resolve`] implements the
/// precedence rule a signature verifier uses to pick one.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: BTreeMap<String, Key>,
}

impl Keyring {
    pub fn new(keys: impl IntoIterator<Item = Key>) -> Self {
        Self {
            keys: keys.into_iter().map(|k| (k.name.clone(), k)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn get(&self, name: &str) -> Option<&Key> {
        self.keys.get(name)
    }

    /// Resolve the key to verify a bundle signature against.
    ///
    /// Precedence (highest first): a caller-supplied override (e.g. a
    /// command-line flag), then the key name configured for the bundle, then
    /// the `kid` carried in the JWS header itself. The first candidate that
    /// names a key present in the ring wins; a `kid`-only match is accepted
    /// even when no override or configured name is present, since a bundle
    /// with a single configured key is the common case.
    pub fn resolve(
        &self,
        override_key: Option<&str>,
        configured_key: Option<&str>,
        jws_kid: Option<&str>,
    ) -> Result<&Key> {
        for candidate in [override_key, configured_key, jws_kid].into_iter().flatten() {
            if let Some(key) = self.keys.get(candidate) {
                return Ok(key);
            }
        }

        match (override_key, configured_key, jws_kid) {
            (Some(name), _, _) | (None, Some(name), _) => {
                Err(KeystoreError::UnknownKey(name.to_string()))
            }
            (None, None, Some(kid)) => Err(KeystoreError::UnresolvedKid {
                kid: kid.to_string(),
            }),
            (None, None, None) => Err(KeystoreError::UnknownKey(String::new())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.keys.values()
    }
}

/// Encryption configuration for protecting persisted private key material
/// and other sensitive state at rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Whether encryption is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Passphrase for encryption/decryption (if enabled)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Environment variable name to read passphrase from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
}

impl EncryptionConfig {
    pub fn new(passphrase: String) -> Self {
        Self {
            enabled: true,
            passphrase: Some(passphrase),
            env_var: None,
        }
    }

    pub fn from_env(env_var: String) -> Self {
        Self {
            enabled: true,
            passphrase: None,
            env_var: Some(env_var),
        }
    }

    /// Get the passphrase, either directly or from the environment.
    pub fn get_passphrase(&self) -> Option<String> {
        if let Some(passphrase) = &self.passphrase {
            return Some(passphrase.clone());
        }

        self.env_var.as_ref().and_then(|v| std::env::var(v).ok())
    }
}

/// Encrypt data using AES-256-GCM with PBKDF2 key derivation.
///
/// Returns base64-encoded `salt || nonce || ciphertext`.
pub fn encrypt(data: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt);

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| KeystoreError::Crypto(format!("failed to build cipher: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|e| KeystoreError::Crypto(format!("encryption failed: {e:?}")))?;

    let mut result = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&salt);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&result).into_bytes())
}

/// Decrypt a base64-encoded `salt || nonce || ciphertext` payload.
pub fn decrypt(encrypted_data: impl AsRef<str>, passphrase: &str) -> Result<Vec<u8>> {
    let data = BASE64.decode(encrypted_data.as_ref())?;

    if data.len() < SALT_SIZE + NONCE_SIZE + 16 {
        return Err(KeystoreError::TruncatedCiphertext);
    }

    let salt = &data[..SALT_SIZE];
    let nonce_bytes = &data[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let ciphertext = &data[SALT_SIZE + NONCE_SIZE..];

    let key = derive_key(passphrase, salt);

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| KeystoreError::Crypto(format!("failed to build cipher: {e}")))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| KeystoreError::Crypto(format!("wrong passphrase or corrupted data: {e:?}")))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}

/// Heuristic: does `content` look like a base64 `salt || nonce || ciphertext` blob?
pub fn is_encrypted(content: &str) -> bool {
    let Ok(data) = BASE64.decode(content) else {
        return false;
    };
    data.len() >= SALT_SIZE + NONCE_SIZE + 16
}

fn io_err(path: &Path, source: std::io::Error) -> KeystoreError {
    KeystoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Read and decrypt a file.
pub fn read_decrypted(path: &Path, passphrase: &str) -> Result<String> {
    let encrypted = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let decrypted = decrypt(&encrypted, passphrase)?;
    Ok(String::from_utf8(decrypted)?)
}

/// Encrypt data and write it to a file.
pub fn write_encrypted(path: &Path, data: &[u8], passphrase: &str) -> Result<()> {
    let encrypted = encrypt(data, passphrase)?;
    let encrypted_str = String::from_utf8(encrypted)?;
    std::fs::write(path, encrypted_str).map_err(|e| io_err(path, e))
}

/// Transparent encryption wrapper for file operations: used to persist
/// signing private keys and plugin state without the rest of the agent
/// needing to know whether encryption is configured.
pub struct StateEncryption {
    config: EncryptionConfig,
}

impl StateEncryption {
    pub fn new(config: EncryptionConfig) -> Self {
        Self { config }
    }

    fn get_passphrase(&self) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        if let Some(ref env_var) = self.config.env_var
            && let Ok(passphrase) = std::env::var(env_var)
        {
            return Some(passphrase);
        }

        self.config.get_passphrase()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.get_passphrase().is_some()
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let passphrase = self.get_passphrase().ok_or(KeystoreError::NoPassphrase)?;
        encrypt(data, &passphrase)
    }

    /// Decrypt `data`, falling back to it unchanged when encryption is
    /// disabled or the payload does not look encrypted.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if let Some(passphrase) = self.get_passphrase()
            && let Ok(decrypted) = decrypt(String::from_utf8_lossy(data), &passphrase)
        {
            return Ok(decrypted);
        }

        Ok(data.to_vec())
    }

    pub fn read_file(&self, path: &Path) -> Result<String> {
        if !self.is_enabled() {
            return std::fs::read_to_string(path).map_err(|e| io_err(path, e));
        }

        let passphrase = self.get_passphrase().ok_or(KeystoreError::NoPassphrase)?;
        let content = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;

        match decrypt(&content, &passphrase) {
            Ok(decrypted) => Ok(String::from_utf8(decrypted)?),
            Err(_) => Ok(content),
        }
    }

    pub fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        if !self.is_enabled() {
            return std::fs::write(path, data).map_err(|e| io_err(path, e));
        }

        let passphrase = self.get_passphrase().ok_or(KeystoreError::NoPassphrase)?;
        let encrypted = encrypt(data, &passphrase)?;
        let encrypted_str = String::from_utf8(encrypted)?;
        std::fs::write(path, encrypted_str).map_err(|e| io_err(path, e))
    }
}
