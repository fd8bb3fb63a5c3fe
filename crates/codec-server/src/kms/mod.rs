//! Key Management Service seam.
//!
//! The codec only needs three remote operations from the KMS. They are
//! modelled as an async trait so that the key manager can be exercised in
//! tests without AWS, and so that retries stay the SDK client's concern.
//!
//! # Security invariants
//!
//! - Plaintext returned by the KMS is wrapped in [`Zeroizing`] immediately.
//! - Nothing in this module logs key material or ciphertext blobs.

pub mod aws;

#[cfg(test)]
pub mod fake;

pub use aws::AwsKms;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors returned by a [`KeyManagementService`] implementation.
#[derive(Debug, Error)]
pub enum KmsError {
    /// The remote call failed (network, throttling, access denied, ...).
    #[error("KMS {operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    /// The call succeeded but the response lacked a required field.
    #[error("KMS {operation} response missing {field}")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },
}

/// A freshly generated data key as returned by the KMS.
pub struct GeneratedDataKey {
    /// Plaintext key bytes. Zeroed on drop.
    pub plaintext: Zeroizing<Vec<u8>>,
    /// The same key wrapped under the master key.
    pub ciphertext_blob: Vec<u8>,
}

impl std::fmt::Debug for GeneratedDataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedDataKey")
            .field("plaintext", &"[REDACTED]")
            .field("ciphertext_blob_len", &self.ciphertext_blob.len())
            .finish()
    }
}

/// Remote key management operations consumed by the key manager.
///
/// All calls may be slow or rate-limited; callers must not hold locks that
/// block request handling while awaiting them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// Resolve a key alias (e.g. `alias/temporal-codec-latest`) to the
    /// master key identifier (ARN).
    async fn resolve_alias(&self, alias: &str) -> Result<String, KmsError>;

    /// Generate a new 256-bit data key under `master_key_id`.
    async fn generate_data_key(&self, master_key_id: &str) -> Result<GeneratedDataKey, KmsError>;

    /// Unwrap a data key previously produced by [`Self::generate_data_key`].
    async fn decrypt(
        &self,
        ciphertext_blob: &[u8],
        master_key_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError>;
}
