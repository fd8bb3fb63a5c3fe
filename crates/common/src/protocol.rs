//! Request and response types exchanged with codec callers.
//!
//! Field names are part of the compatibility contract with existing workflow
//! workers; do not rename them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata key that classifies a payload's encoding.
pub const ENCODING_KEY: &str = "encoding";

/// Encoding value for unencrypted JSON payloads.
pub const ENCODING_JSON_PLAIN: &str = "json/plain";

/// Encoding value for payloads encrypted by this service.
pub const ENCODING_BINARY_ENCRYPTED: &str = "binary/encrypted";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A single opaque payload as carried over the codec API.
///
/// `data` is always base64 text on the wire. The three key fields are only
/// present on encrypted payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Free-form string metadata; `encoding` drives classification.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Base64-encoded payload bytes (or raw text for lenient callers).
    #[serde(default)]
    pub data: String,

    /// Identifier (ARN) of the master key that wrapped the data key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,

    /// Base64 KMS ciphertext blob of the data key used for `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_data_key: Option<String>,

    /// AEAD algorithm tag, e.g. `"AES-256-GCM"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
}

impl Payload {
    /// Returns the `encoding` metadata value, if any.
    pub fn encoding(&self) -> Option<&str> {
        self.metadata.get(ENCODING_KEY).map(String::as_str)
    }

    /// Returns `true` if this payload is a candidate for encryption.
    ///
    /// Payloads without an `encoding` entry are treated as plain JSON.
    pub fn is_plain(&self) -> bool {
        matches!(self.encoding(), None | Some(ENCODING_JSON_PLAIN))
    }

    /// Returns `true` if this payload was produced by `encode`.
    pub fn is_encrypted(&self) -> bool {
        self.encoding() == Some(ENCODING_BINARY_ENCRYPTED)
    }
}

/// Build a metadata map holding only the given encoding.
pub fn encoding_metadata(encoding: &str) -> HashMap<String, String> {
    HashMap::from([(ENCODING_KEY.to_owned(), encoding.to_owned())])
}

// ---------------------------------------------------------------------------
// Encode / decode endpoints
// ---------------------------------------------------------------------------

/// Request body for `POST /encode` and `POST /decode`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodecRequest {
    #[serde(default)]
    pub payloads: Vec<Payload>,
}

/// Response body for `POST /encode` and `POST /decode`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodecResponse {
    pub payloads: Vec<Payload>,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Response body for `GET /stats`.
///
/// Duration fields are human-readable strings such as `"59m58.5s"`. The
/// current-key fields are omitted when no data key is installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Number of historical data keys held in the decryption cache.
    pub cached_keys_count: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_key_age: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_key_expires_in: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_key_expired: Option<bool>,

    /// Set by the background expiry monitor when the current key is close to
    /// expiry. Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_expiry_warning: Option<bool>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"missing_key_material"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
