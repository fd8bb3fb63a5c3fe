//! Data key lifecycle: generation, rotation, caching and retirement.
//!
//! # Lifecycle
//!
//! 1. At startup, [`KeyManager::init`] asks the KMS for a data key under the
//!    resolved master key and installs it as current.
//! 2. The current key is replaced when it expires, either by the scheduled
//!    rotation task or lazily by the first request that finds it expired.
//! 3. Historical keys needed to decrypt older payloads are unwrapped via the
//!    KMS on demand and kept in a TTL-bounded cache.
//!
//! # Security invariants
//!
//! - Plaintext key bytes live only in [`KeyMaterial`], which zeroes itself on
//!   drop and is explicitly zeroed when a key is superseded.
//! - Key material is never logged, serialised, or included in traces. Only
//!   a short fingerprint of the encrypted blob is logged.

pub mod cache;
pub mod manager;

pub use cache::KeyCache;
pub use manager::{KeyManager, KeyPolicy};

use thiserror::Error;
use tokio::time::{Duration, Instant};
use zeroize::Zeroize;

use crate::crypto::KEY_LEN;

/// Errors produced by the key layer.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The KMS could not produce a new data key.
    #[error("data key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// An encrypted data key could not be unwrapped.
    #[error("data key decryption failed: {0}")]
    KeyDecryptionFailed(String),

    /// The KMS returned key material of an unexpected length.
    #[error("key material has invalid length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// Fixed-size buffer holding exactly [`KEY_LEN`] bytes of plaintext key.
///
/// Cloned into handler call stacks when needed. Every copy is overwritten
/// with zeroes when dropped.
#[derive(Clone)]
pub struct KeyMaterial(Box<[u8; KEY_LEN]>);

impl KeyMaterial {
    /// Copy `bytes` into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKeyLength`] if `bytes` is not [`KEY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidKeyLength(bytes.len()));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Zeroize for KeyMaterial {
    fn zeroize(&mut self) {
        self.0.as_mut_slice().zeroize();
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("KeyMaterial([REDACTED])")
    }
}

/// The data key currently used for encryption.
pub struct DataKey {
    plaintext: KeyMaterial,
    encrypted_blob: String,
    generated_at: Instant,
    expires_at: Instant,
}

impl DataKey {
    /// Build a key generated at `generated_at` that stays current for `lifetime`.
    pub fn new(
        plaintext: KeyMaterial,
        encrypted_blob: String,
        generated_at: Instant,
        lifetime: Duration,
    ) -> Self {
        Self {
            plaintext,
            encrypted_blob,
            generated_at,
            expires_at: generated_at + lifetime,
        }
    }

    pub fn plaintext(&self) -> &KeyMaterial {
        &self.plaintext
    }

    /// Base64 KMS ciphertext of this key, as written into payloads.
    pub fn encrypted_blob(&self) -> &str {
        &self.encrypted_blob
    }

    pub fn generated_at(&self) -> Instant {
        self.generated_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// A key is expired once the clock has passed `expires_at`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.generated_at)
    }

    /// Time left before expiry; zero once expired.
    pub fn expires_in_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Short, non-reversible label for logs.
    pub fn fingerprint(&self) -> &str {
        fingerprint(&self.encrypted_blob)
    }

    /// Overwrite the plaintext with zeroes. Called when the key is superseded.
    pub(crate) fn retire(&mut self) {
        self.plaintext.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("plaintext", &self.plaintext)
            .field("fingerprint", &self.fingerprint())
            .field("generated_at", &self.generated_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// First few characters of an encrypted blob, safe to log.
pub fn fingerprint(encrypted_blob: &str) -> &str {
    let end = encrypted_blob
        .char_indices()
        .nth(12)
        .map_or(encrypted_blob.len(), |(i, _)| i);
    &encrypted_blob[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_material_rejects_wrong_length() {
        assert!(matches!(
            KeyMaterial::from_slice(&[1u8; 16]),
            Err(KeyError::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn key_material_zeroize_clears_bytes() {
        let mut k = KeyMaterial::from_slice(&[0xAB; KEY_LEN]).unwrap();
        k.zeroize();
        assert!(k.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn key_material_redacted_in_debug() {
        let k = KeyMaterial::from_slice(&[0xFF; KEY_LEN]).unwrap();
        let s = format!("{k:?}");
        assert!(s.contains("REDACTED"));
        assert!(!s.contains("255"));
    }

    #[test]
    fn retire_zeroes_plaintext() {
        let material = KeyMaterial::from_slice(&[7u8; KEY_LEN]).unwrap();
        let mut key = DataKey::new(material, "blob".into(), Instant::now(), Duration::from_secs(60));
        key.retire();
        assert!(key.plaintext().as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let now = Instant::now();
        let material = KeyMaterial::from_slice(&[7u8; KEY_LEN]).unwrap();
        let key = DataKey::new(material, "blob".into(), now, Duration::from_secs(60));
        assert!(!key.is_expired_at(now + Duration::from_secs(60)));
        assert!(key.is_expired_at(now + Duration::from_secs(61)));
        assert_eq!(key.expires_in_at(now + Duration::from_secs(90)), Duration::ZERO);
        assert_eq!(key.age_at(now + Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn fingerprint_truncates() {
        assert_eq!(fingerprint("AQIDAHh0ZXN0LWtleS1ibG9i"), "AQIDAHh0ZXN0");
        assert_eq!(fingerprint("short"), "short");
    }
}
