//! Symmetric encryption of at-rest credentials
//!
//! Secrets such as IMAP passwords may be stored encrypted in configuration.
//! The payload format is `hex(iv):hex(ciphertext)`, using AES-256-GCM with a
//! key derived from the caller-supplied secret key via PBKDF2-HMAC-SHA256.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use pbkdf2::pbkdf2_hmac_array;
use rand::RngCore;
use serde_json::json;
use sha2::Sha256;

use crate::errors::{AppError, AppResult};
use crate::redact;

/// Static salt mixed into key derivation
const KEY_SALT: &[u8] = b"mail-accounts-mcp.credential-salt.v1";
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_LENGTH: usize = 32; // AES-256
const NONCE_LENGTH: usize = 12;

/// Reusable cipher bound to one secret key
///
/// Key derivation is the expensive part, so callers decrypting several
/// secrets with the same key should build one `SecretCipher` and reuse it.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Derive the encryption key from `key`
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the key is empty.
    pub fn new(key: &str) -> AppResult<Self> {
        if key.is_empty() {
            return Err(AppError::Configuration(
                "secret key must not be empty".to_owned(),
            ));
        }
        let derived = pbkdf2_hmac_array::<Sha256, KEY_LENGTH>(
            key.as_bytes(),
            KEY_SALT,
            PBKDF2_ITERATIONS,
        );
        let cipher = Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| AppError::Internal(format!("failed to create cipher: {e}")))?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` with a fresh random IV
    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let mut iv = [0u8; NONCE_LENGTH];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| AppError::Internal(format!("encryption failed: {e}")))?;

        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Decrypt a `hex(iv):hex(ciphertext)` payload
    ///
    /// Every failure is reported as the same opaque `Decryption` error; the
    /// reason is only emitted to debug logs.
    pub fn decrypt(&self, payload: &str) -> AppResult<String> {
        let parts: Vec<&str> = payload.split(':').collect();
        let [iv_hex, data_hex] = parts.as_slice() else {
            return Err(decryption_failed(payload, "payload must have exactly two parts"));
        };
        if iv_hex.is_empty() || data_hex.is_empty() {
            return Err(decryption_failed(payload, "payload parts must not be empty"));
        }

        let iv = hex::decode(iv_hex).map_err(|_| decryption_failed(payload, "invalid iv hex"))?;
        if iv.len() != NONCE_LENGTH {
            return Err(decryption_failed(payload, "invalid iv length"));
        }
        let data = hex::decode(data_hex)
            .map_err(|_| decryption_failed(payload, "invalid ciphertext hex"))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), data.as_ref())
            .map_err(|_| decryption_failed(payload, "authentication failed"))?;

        String::from_utf8(plaintext).map_err(|_| decryption_failed(payload, "plaintext is not utf-8"))
    }
}

/// Encrypt `plaintext` with `key`
///
/// # Errors
///
/// Returns `Configuration` if `key` is empty.
pub fn encrypt(plaintext: &str, key: &str) -> AppResult<String> {
    SecretCipher::new(key)?.encrypt(plaintext)
}

/// Decrypt `payload` with `key`
///
/// # Errors
///
/// Returns `Configuration` if `key` is empty, otherwise `Decryption` for any
/// malformed, corrupted, or mismatched payload.
pub fn decrypt(payload: &str, key: &str) -> AppResult<String> {
    SecretCipher::new(key)?.decrypt(payload)
}

fn decryption_failed(payload: &str, reason: &str) -> AppError {
    let iv = payload.split(':').next().unwrap_or_default();
    tracing::debug!(
        detail = %redact::mask(&json!({ "iv": iv }), redact::DEFAULT_SENSITIVE_FIELDS),
        reason,
        "secret decryption failed"
    );
    AppError::Decryption
}
