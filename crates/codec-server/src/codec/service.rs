//! Batch encode/decode of codec payloads.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::protocol::{
    encoding_metadata, Payload, ENCODING_BINARY_ENCRYPTED, ENCODING_JSON_PLAIN,
};
use common::ServiceError;
use thiserror::Error;
use tracing::debug;

use crate::crypto::{cipher, CipherError, ALGORITHM};
use crate::keys::{DataKey, KeyError, KeyManager};

/// Errors that abort an encode or decode batch.
#[derive(Debug, Error)]
pub enum CodecError {
    /// An encrypted payload has no `encrypted_data_key`.
    #[error("payload {index} is encrypted but carries no encrypted_data_key")]
    MissingKeyMaterial { index: usize },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

impl From<CodecError> for ServiceError {
    fn from(err: CodecError) -> Self {
        let message = err.to_string();
        match err {
            CodecError::MissingKeyMaterial { .. } => ServiceError::MissingKeyMaterial(message),
            CodecError::Key(KeyError::KeyGenerationFailed(_)) => {
                ServiceError::KeyGenerationFailed(message)
            }
            CodecError::Key(KeyError::KeyDecryptionFailed(_)) => {
                ServiceError::KeyDecryptionFailed(message)
            }
            CodecError::Key(KeyError::InvalidKeyLength(_))
            | CodecError::Cipher(CipherError::InvalidKeyLength(_)) => {
                ServiceError::InvalidKeyLength(message)
            }
            CodecError::Cipher(CipherError::MalformedCiphertext(_)) => {
                ServiceError::MalformedCiphertext(message)
            }
            CodecError::Cipher(CipherError::AuthenticationFailed) => {
                ServiceError::AuthenticationFailed(message)
            }
            CodecError::Cipher(CipherError::EncryptionFailed) => ServiceError::Internal(message),
        }
    }
}

/// Encrypts plain payloads and decrypts encrypted ones.
///
/// Batches are all-or-nothing: the first failing payload aborts the request.
#[derive(Clone)]
pub struct CodecService {
    keys: KeyManager,
}

impl CodecService {
    pub fn new(keys: KeyManager) -> Self {
        Self { keys }
    }

    /// Encrypt every plain payload in the batch under the current data key.
    ///
    /// Payloads whose encoding is neither absent nor `json/plain` pass through
    /// unchanged. `data` is base64-decoded when it parses as base64 and used
    /// as raw bytes otherwise, so callers may send either form. A plain text
    /// value that happens to be valid base64 is therefore treated as binary.
    ///
    /// The current key is fetched at most once per batch.
    pub async fn encode(&self, payloads: Vec<Payload>) -> Result<Vec<Payload>, CodecError> {
        let mut current: Option<Arc<DataKey>> = None;
        let mut out = Vec::with_capacity(payloads.len());

        for payload in payloads {
            if !payload.is_plain() {
                out.push(payload);
                continue;
            }

            let key = match &current {
                Some(key) => Arc::clone(key),
                None => {
                    let key = self.keys.get_current_data_key().await?;
                    current = Some(Arc::clone(&key));
                    key
                }
            };

            let plaintext = match STANDARD.decode(&payload.data) {
                Ok(bytes) => bytes,
                Err(_) => payload.data.into_bytes(),
            };
            let ciphertext = cipher::encrypt(&plaintext, key.plaintext().as_bytes())?;

            out.push(Payload {
                metadata: encoding_metadata(ENCODING_BINARY_ENCRYPTED),
                data: ciphertext,
                kms_key_id: Some(self.keys.master_key_id().to_owned()),
                encrypted_data_key: Some(key.encrypted_blob().to_owned()),
                algorithm: Some(ALGORITHM.to_owned()),
            });
        }

        debug!(payloads = out.len(), "encode batch complete");
        Ok(out)
    }

    /// Decrypt every `binary/encrypted` payload in the batch.
    ///
    /// Other payloads pass through unchanged. A payload without a
    /// `kms_key_id` is resolved against this service's own master key.
    pub async fn decode(&self, payloads: Vec<Payload>) -> Result<Vec<Payload>, CodecError> {
        let mut out = Vec::with_capacity(payloads.len());

        for (index, payload) in payloads.into_iter().enumerate() {
            if !payload.is_encrypted() {
                out.push(payload);
                continue;
            }

            let encrypted_data_key = payload
                .encrypted_data_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .ok_or(CodecError::MissingKeyMaterial { index })?;
            let master_key_id = payload
                .kms_key_id
                .as_deref()
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| self.keys.master_key_id());

            let key = self
                .keys
                .decrypt_data_key(encrypted_data_key, master_key_id)
                .await?;
            let plaintext = cipher::decrypt(&payload.data, key.as_bytes())?;

            out.push(Payload {
                metadata: encoding_metadata(ENCODING_JSON_PLAIN),
                data: STANDARD.encode(plaintext.as_slice()),
                ..Payload::default()
            });
        }

        debug!(payloads = out.len(), "decode batch complete");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPolicy;
    use crate::kms::fake::{CountingKms, MASTER_KEY_ARN};

    async fn service() -> (Arc<CountingKms>, CodecService) {
        let kms = Arc::new(CountingKms::default());
        let keys = KeyManager::init(kms.clone(), MASTER_KEY_ARN, KeyPolicy::default())
            .await
            .unwrap();
        (kms, CodecService::new(keys))
    }

    fn plain(data: &str) -> Payload {
        Payload {
            metadata: encoding_metadata(ENCODING_JSON_PLAIN),
            data: data.into(),
            ..Payload::default()
        }
    }

    #[tokio::test]
    async fn encode_attaches_key_metadata() {
        let (_kms, codec) = service().await;
        let out = codec.encode(vec![plain("eyJpZCI6MTIzfQ==")]).await.unwrap();

        assert_eq!(out.len(), 1);
        let p = &out[0];
        assert_eq!(p.encoding(), Some(ENCODING_BINARY_ENCRYPTED));
        assert_eq!(p.kms_key_id.as_deref(), Some(MASTER_KEY_ARN));
        assert!(!p.encrypted_data_key.as_deref().unwrap().is_empty());
        assert_eq!(p.algorithm.as_deref(), Some("AES-256-GCM"));
        assert_ne!(p.data, "eyJpZCI6MTIzfQ==");
    }

    #[tokio::test]
    async fn encode_then_decode_restores_plaintext() {
        let (_kms, codec) = service().await;
        let encoded = codec.encode(vec![plain("eyJpZCI6MTIzfQ==")]).await.unwrap();
        let decoded = codec.decode(encoded).await.unwrap();

        assert_eq!(decoded[0].encoding(), Some(ENCODING_JSON_PLAIN));
        let bytes = STANDARD.decode(&decoded[0].data).unwrap();
        assert_eq!(bytes, br#"{"id":123}"#);
        assert!(decoded[0].encrypted_data_key.is_none());
    }

    #[tokio::test]
    async fn encode_treats_non_base64_data_as_raw_bytes() {
        let (_kms, codec) = service().await;
        let encoded = codec.encode(vec![plain(r#"{"id":123}"#)]).await.unwrap();
        let decoded = codec.decode(encoded).await.unwrap();
        assert_eq!(STANDARD.decode(&decoded[0].data).unwrap(), br#"{"id":123}"#);
    }

    #[tokio::test]
    async fn encode_treats_missing_encoding_as_plain() {
        let (_kms, codec) = service().await;
        let p = Payload {
            data: "aGk=".into(),
            ..Payload::default()
        };
        let out = codec.encode(vec![p]).await.unwrap();
        assert!(out[0].is_encrypted());
    }

    #[tokio::test]
    async fn encode_passes_other_encodings_through() {
        let (_kms, codec) = service().await;
        let proto = Payload {
            metadata: encoding_metadata("binary/protobuf"),
            data: "CgR0ZXN0".into(),
            ..Payload::default()
        };
        let out = codec.encode(vec![proto.clone(), plain("e30=")]).await.unwrap();
        assert_eq!(out[0], proto);
        assert!(out[1].is_encrypted());
    }

    #[tokio::test]
    async fn encode_batch_uses_one_data_key() {
        let (kms, codec) = service().await;
        let out = codec
            .encode(vec![plain("YQ=="), plain("Yg=="), plain("Yw==")])
            .await
            .unwrap();
        let blobs: Vec<_> = out.iter().map(|p| p.encrypted_data_key.clone()).collect();
        assert!(blobs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(kms.generated(), 1);
    }

    #[tokio::test]
    async fn decode_passes_plain_payloads_through() {
        let (kms, codec) = service().await;
        let p = plain("eyJpZCI6MTIzfQ==");
        let out = codec.decode(vec![p.clone()]).await.unwrap();
        assert_eq!(out, vec![p]);
        assert_eq!(kms.decrypted(), 0);
    }

    #[tokio::test]
    async fn decode_without_key_material_fails_whole_batch() {
        let (_kms, codec) = service().await;
        let mut encoded = codec.encode(vec![plain("YQ=="), plain("Yg==")]).await.unwrap();
        encoded[1].encrypted_data_key = None;

        let err = codec.decode(encoded).await.unwrap_err();
        assert!(matches!(err, CodecError::MissingKeyMaterial { index: 1 }));
        assert!(matches!(
            ServiceError::from(err),
            ServiceError::MissingKeyMaterial(_)
        ));
    }

    #[tokio::test]
    async fn decode_after_rotation_unwraps_old_key_via_kms() {
        let (kms, codec) = service().await;
        let encoded = codec.encode(vec![plain("b2xk")]).await.unwrap();
        codec.keys.rotate().await.unwrap();

        let decoded = codec.decode(encoded.clone()).await.unwrap();
        assert_eq!(STANDARD.decode(&decoded[0].data).unwrap(), b"old");
        assert_eq!(kms.decrypted(), 1);

        codec.decode(encoded).await.unwrap();
        assert_eq!(kms.decrypted(), 1);
    }

    #[tokio::test]
    async fn decode_without_kms_key_id_uses_own_master_key() {
        let (_kms, codec) = service().await;
        let mut encoded = codec.encode(vec![plain("YQ==")]).await.unwrap();
        encoded[0].kms_key_id = None;
        codec.keys.rotate().await.unwrap();

        let decoded = codec.decode(encoded).await.unwrap();
        assert_eq!(STANDARD.decode(&decoded[0].data).unwrap(), b"a");
    }

    #[tokio::test]
    async fn decode_tampered_ciphertext_is_authentication_failure() {
        let (_kms, codec) = service().await;
        let mut encoded = codec.encode(vec![plain("YQ==")]).await.unwrap();
        let mut raw = STANDARD.decode(&encoded[0].data).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        encoded[0].data = STANDARD.encode(raw);

        let err = codec.decode(encoded).await.unwrap_err();
        assert!(matches!(err, CodecError::Cipher(CipherError::AuthenticationFailed)));
        assert_eq!(ServiceError::from(err).http_status(), 422);
    }

    #[tokio::test]
    async fn decode_garbage_ciphertext_is_client_error() {
        let (_kms, codec) = service().await;
        let mut encoded = codec.encode(vec![plain("YQ==")]).await.unwrap();
        encoded[0].data = "***".into();

        let err = ServiceError::from(codec.decode(encoded).await.unwrap_err());
        assert!(matches!(err, ServiceError::MalformedCiphertext(_)));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn decode_unknown_data_key_is_key_decryption_failure() {
        let (_kms, codec) = service().await;
        let mut encoded = codec.encode(vec![plain("YQ==")]).await.unwrap();
        encoded[0].encrypted_data_key = Some(STANDARD.encode(b"never-issued"));

        let err = ServiceError::from(codec.decode(encoded).await.unwrap_err());
        assert!(matches!(err, ServiceError::KeyDecryptionFailed(_)));
        assert_eq!(err.http_status(), 502);
    }
}
