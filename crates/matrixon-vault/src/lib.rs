//! Matrixon Token Vault
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! License: Apache 2.0 / MIT
//!
//! Seals upstream access tokens before they are persisted and opens them again
//! when a poller needs to talk to the homeserver. The secret is process-wide and
//! is supplied once at startup. Rotating it makes every stored blob unreadable,
//! which the proxy treats as an expired credential (the device must log in
//! again).
//!
//! Blob layout: `base64(nonce || ciphertext)`, AES-256-GCM with the key derived
//! as SHA-256 of the secret and a random 96-bit nonce per seal.
//!
//! # Examples
//! ```rust
//! use matrixon_vault::TokenVault;
//!
//! let vault = TokenVault::new("correct horse battery staple").unwrap();
//! let blob = vault.seal("syt_secret_token").unwrap();
//! assert_eq!(vault.open(&blob).unwrap(), "syt_secret_token");
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument};

const NONCE_LEN: usize = 12;

/// Errors raised by the vault
#[derive(Debug, Error)]
pub enum VaultError {
    /// The process secret is empty
    #[error("Vault secret must not be empty")]
    EmptySecret,

    /// Encryption failed
    #[error("Failed to seal token")]
    Seal,

    /// The blob was tampered with, truncated, or sealed under another secret
    #[error("Failed to open sealed token: {0}")]
    Decrypt(&'static str),
}

/// Result type for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Stateless crypto wrapper over the process secret
#[derive(Clone)]
pub struct TokenVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVault")
            .field("cipher", &"<Aes256Gcm>")
            .finish()
    }
}

impl TokenVault {
    /// Derive the sealing key from the process secret
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(VaultError::EmptySecret);
        }

        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());

        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Seal a plaintext token into a storable blob
    #[instrument(level = "debug", skip_all)]
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Seal)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        debug!("🔐 Sealed token ({} bytes)", blob.len());
        Ok(STANDARD.encode(blob))
    }

    /// Open a blob produced by [`TokenVault::seal`]
    #[instrument(level = "debug", skip_all)]
    pub fn open(&self, blob: &str) -> Result<String> {
        let raw = STANDARD
            .decode(blob)
            .map_err(|_| VaultError::Decrypt("blob is not valid base64"))?;

        if raw.len() <= NONCE_LEN {
            return Err(VaultError::Decrypt("blob is too short"));
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Decrypt("authentication failed"))?;

        String::from_utf8(plaintext).map_err(|_| VaultError::Decrypt("token is not UTF-8"))
    }
}

/// Seal `plaintext` under `secret`
pub fn seal(secret: &str, plaintext: &str) -> Result<String> {
    TokenVault::new(secret)?.seal(plaintext)
}

/// Open `blob` under `secret`
pub fn open(secret: &str, blob: &str) -> Result<String> {
    TokenVault::new(secret)?.open(blob)
}
