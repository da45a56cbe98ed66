//! Encryption for environment variable values at rest.
//!
//! Values are stored AES-256-GCM encrypted and decrypted only at injection
//! time into a build or container environment. Wire format is hex-encoded
//! `<12-byte nonce><ciphertext>`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use thiserror::Error;

/// Environment variable holding the 64-hex-char (32 byte) master key.
pub const SECRET_KEY_ENV: &str = "SLIPWAY_SECRET_KEY";

/// Nonce size for AES-256-GCM (96 bits).
const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Cipher for environment variable values.
#[derive(Clone)]
pub struct EnvCipher {
    cipher: Aes256Gcm,
}

impl EnvCipher {
    /// Build a cipher from the `SLIPWAY_SECRET_KEY` environment variable.
    pub fn from_env() -> Result<Self, SecretError> {
        let key_hex = std::env::var(SECRET_KEY_ENV).map_err(|_| {
            SecretError::InvalidKey(format!("environment variable {} not set", SECRET_KEY_ENV))
        })?;
        Self::from_hex_key(&key_hex)
    }

    /// Build a cipher from a 64-character hex key (32 bytes decoded).
    pub fn from_hex_key(key_hex: &str) -> Result<Self, SecretError> {
        let key_bytes = hex::decode(key_hex.trim())
            .map_err(|e| SecretError::InvalidKey(format!("invalid hex key: {}", e)))?;
        if key_bytes.len() != 32 {
            return Err(SecretError::InvalidKey(format!(
                "key must be 32 bytes (64 hex chars), got {} bytes",
                key_bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext value; returns hex with the nonce prepended.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).map_err(|e| SecretError::Encrypt(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SecretError::Encrypt(e.to_string()))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(ciphertext);
        Ok(hex::encode(combined))
    }

    /// Decrypt a hex-encoded value produced by [`EnvCipher::encrypt`].
    pub fn decrypt(&self, ciphertext_hex: &str) -> Result<String, SecretError> {
        let combined = hex::decode(ciphertext_hex)
            .map_err(|e| SecretError::Decrypt(format!("invalid hex: {}", e)))?;
        if combined.len() < NONCE_SIZE {
            return Err(SecretError::Decrypt("ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| SecretError::Decrypt(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| SecretError::Decrypt(format!("invalid UTF-8: {}", e)))
    }
}
