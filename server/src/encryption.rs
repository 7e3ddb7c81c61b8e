//! Field-level encryption for sensitive columns.
//!
//! Values are sealed with AES-256-GCM under a random 96-bit nonce and stored
//! as `ENC:` followed by the URL-safe base64 of `nonce || ciphertext || tag`.
//! Values without the prefix are treated as legacy plaintext and passed
//! through on decryption.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::config::FIELD_KEY_LEN;

/// Prefix marking an encrypted value.
pub const ENCRYPTED_PREFIX: &str = "ENC:";

/// Errors from sealing or opening field values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("invalid encryption key")]
    InvalidKey,

    #[error("failed to generate random bytes")]
    Random,

    #[error("encryption failed")]
    Seal,

    #[error("malformed encrypted value: {0}")]
    Malformed(String),

    #[error("decryption failed")]
    Open,
}

/// AES-256-GCM sealing of individual string fields.
pub struct FieldEncryption {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl FieldEncryption {
    /// Creates an encryptor from a 32-byte key.
    pub fn new(key: &[u8; FIELD_KEY_LEN]) -> Result<Self, EncryptionError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| EncryptionError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Creates an encryptor with a random key that lives only as long as the process.
    pub fn generate() -> Result<Self, EncryptionError> {
        let mut key = [0u8; FIELD_KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| EncryptionError::Random)?;
        Self::new(&key)
    }

    /// Creates an encryptor from a configured key, or a random one when absent.
    pub fn from_config(key: Option<&[u8; FIELD_KEY_LEN]>) -> Result<Self, EncryptionError> {
        match key {
            Some(key) => Self::new(key),
            None => Self::generate(),
        }
    }

    /// Encrypts `plaintext` into an `ENC:`-prefixed string.
    pub fn encrypt_field(&self, plaintext: &str) -> Result<String, EncryptionError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| EncryptionError::Random)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| EncryptionError::Seal)?;

        let mut payload = Vec::with_capacity(NONCE_LEN + in_out.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&in_out);

        Ok(format!("{ENCRYPTED_PREFIX}{}", URL_SAFE_NO_PAD.encode(payload)))
    }

    /// Decrypts an `ENC:` value. Values without the prefix are returned as-is.
    pub fn decrypt_field(&self, value: &str) -> Result<String, EncryptionError> {
        let Some(encoded) = value.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(value.to_string());
        };

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| EncryptionError::Malformed(e.to_string()))?;

        if payload.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(EncryptionError::Malformed("value too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| EncryptionError::Malformed("bad nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| EncryptionError::Open)?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| EncryptionError::Malformed("plaintext is not UTF-8".to_string()))
    }

    /// Decrypts a value, falling back to the stored value when it cannot be opened.
    pub fn decrypt_or_raw(&self, value: &str) -> String {
        match self.decrypt_field(value) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(error = %err, "Failed to decrypt field, returning stored value");
                value.to_string()
            }
        }
    }

    /// Encrypts the named string fields of a JSON object in place.
    ///
    /// Missing and non-string fields are left untouched.
    pub fn encrypt_fields(&self, object: &mut Value, fields: &[&str]) -> Result<(), EncryptionError> {
        for field in fields {
            if let Some(Value::String(s)) = object.get_mut(*field) {
                *s = self.encrypt_field(s)?;
            }
        }
        Ok(())
    }

    /// Decrypts the named string fields of a JSON object in place.
    pub fn decrypt_fields(&self, object: &mut Value, fields: &[&str]) {
        for field in fields {
            if let Some(Value::String(s)) = object.get_mut(*field) {
                *s = self.decrypt_or_raw(s);
            }
        }
    }
}

impl fmt::Debug for FieldEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldEncryption")
            .field("algorithm", &"AES-256-GCM")
            .finish_non_exhaustive()
    }
}

/// Returns `true` if the value carries the encryption prefix.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}
