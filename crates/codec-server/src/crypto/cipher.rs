//! AES-256-GCM envelope cipher for payload bodies.
//!
//! Each call draws a fresh 96-bit nonce from the OS CSPRNG. GCM nonce reuse
//! under the same key breaks both confidentiality and authentication, so the
//! nonce is never caller-supplied.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use zeroize::Zeroizing;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Algorithm tag written into every encrypted payload.
pub const ALGORITHM: &str = "AES-256-GCM";

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The ciphertext is not base64, or is shorter than a nonce.
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(&'static str),

    /// The authentication tag did not verify.
    #[error("authentication failed: ciphertext was tampered with or the key is wrong")]
    AuthenticationFailed,

    /// The AEAD refused to seal the plaintext.
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Encrypt `plaintext` under `key` and return `base64(nonce || ciphertext || tag)`.
///
/// No associated data is authenticated.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<String, CipherError> {
    let cipher = build_cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(STANDARD.encode(out))
}

/// Decrypt a value produced by [`encrypt`].
///
/// # Errors
///
/// - [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
/// - [`CipherError::MalformedCiphertext`] if the input is not base64 or is
///   shorter than [`NONCE_LEN`].
/// - [`CipherError::AuthenticationFailed`] if the tag does not verify.
pub fn decrypt(ciphertext_b64: &str, key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let cipher = build_cipher(key)?;

    let blob = STANDARD
        .decode(ciphertext_b64)
        .map_err(|_| CipherError::MalformedCiphertext("not valid base64"))?;
    if blob.len() < NONCE_LEN {
        return Err(CipherError::MalformedCiphertext("shorter than nonce"));
    }

    let (nonce, sealed) = blob.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map(Zeroizing::new)
        .map_err(|_| CipherError::AuthenticationFailed)
}

fn build_cipher(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))
}
