//! Request-level error taxonomy shared across crates.

use thiserror::Error;

/// Top-level service error type.
///
/// Every variant fails the whole request; there are no partial batch results.
/// Client-side problems map to 4xx, key-management problems to 5xx:
/// - [`ServiceError::MalformedRequest`], [`ServiceError::MissingKeyMaterial`],
///   [`ServiceError::MalformedCiphertext`] → 400
/// - [`ServiceError::AuthenticationFailed`] → 422
/// - [`ServiceError::KeyGenerationFailed`], [`ServiceError::KeyDecryptionFailed`] → 502
/// - [`ServiceError::InvalidKeyLength`], [`ServiceError::Internal`] → 500
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request body is not valid JSON or does not match the payload shape.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// An encrypted payload arrived without its `encrypted_data_key`.
    #[error("missing key material: {0}")]
    MissingKeyMaterial(String),

    /// Ciphertext is not base64 or is too short to hold a nonce.
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// The AEAD tag did not verify (tampered data or wrong key).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Key material had the wrong length.
    #[error("invalid key length: {0}")]
    InvalidKeyLength(String),

    /// KMS could not generate a new data key.
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// KMS could not unwrap an encrypted data key.
    #[error("key decryption failed: {0}")]
    KeyDecryptionFailed(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::MalformedRequest(_)
            | ServiceError::MissingKeyMaterial(_)
            | ServiceError::MalformedCiphertext(_) => 400,
            ServiceError::AuthenticationFailed(_) => 422,
            ServiceError::KeyGenerationFailed(_) | ServiceError::KeyDecryptionFailed(_) => 502,
            ServiceError::InvalidKeyLength(_) | ServiceError::Internal(_) => 500,
        }
    }

    /// Short machine-readable code used in [`crate::protocol::ErrorResponse`].
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::MalformedRequest(_) => "malformed_request",
            ServiceError::MissingKeyMaterial(_) => "missing_key_material",
            ServiceError::MalformedCiphertext(_) => "malformed_ciphertext",
            ServiceError::AuthenticationFailed(_) => "authentication_failed",
            ServiceError::InvalidKeyLength(_) => "invalid_key_length",
            ServiceError::KeyGenerationFailed(_) => "key_generation_failed",
            ServiceError::KeyDecryptionFailed(_) => "key_decryption_failed",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    /// Returns `true` for errors caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }
}
