//! AWS KMS implementation of [`KeyManagementService`].

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::{error::DisplayErrorContext, primitives::Blob, types::DataKeySpec};
use tracing::debug;
use zeroize::Zeroizing;

use super::{GeneratedDataKey, KeyManagementService, KmsError};

/// Encryption context bound to every data key this service generates.
///
/// KMS requires the identical context on `Decrypt`, so it must stay fixed
/// across releases.
const ENCRYPTION_CONTEXT: [(&str, &str); 2] = [("service", "temporal-codec"), ("version", "1.0")];

/// KMS client built from the standard AWS credential and region chain.
#[derive(Clone, Debug)]
pub struct AwsKms {
    client: aws_sdk_kms::Client,
}

impl AwsKms {
    /// Initialise the KMS client.
    ///
    /// `endpoint_url` overrides the regional endpoint, which is useful for
    /// local KMS emulators. Credentials are resolved via the default chain.
    pub async fn init(endpoint_url: Option<&str>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let mut builder = aws_sdk_kms::config::Builder::from(&config);
        if let Some(url) = endpoint_url {
            debug!(endpoint_url = url, "overriding KMS endpoint");
            builder = builder.endpoint_url(url);
        }

        Self {
            client: aws_sdk_kms::Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl KeyManagementService for AwsKms {
    async fn resolve_alias(&self, alias: &str) -> Result<String, KmsError> {
        let resp = self
            .client
            .describe_key()
            .key_id(alias)
            .send()
            .await
            .map_err(|e| KmsError::Request {
                operation: "DescribeKey",
                message: DisplayErrorContext(&e).to_string(),
            })?;

        resp.key_metadata()
            .and_then(|m| m.arn())
            .map(str::to_owned)
            .ok_or(KmsError::MissingField {
                operation: "DescribeKey",
                field: "KeyMetadata.Arn",
            })
    }

    async fn generate_data_key(&self, master_key_id: &str) -> Result<GeneratedDataKey, KmsError> {
        let mut req = self
            .client
            .generate_data_key()
            .key_id(master_key_id)
            .key_spec(DataKeySpec::Aes256);
        for (k, v) in ENCRYPTION_CONTEXT {
            req = req.encryption_context(k, v);
        }

        let resp = req.send().await.map_err(|e| KmsError::Request {
            operation: "GenerateDataKey",
            message: DisplayErrorContext(&e).to_string(),
        })?;

        let plaintext = resp.plaintext().ok_or(KmsError::MissingField {
            operation: "GenerateDataKey",
            field: "Plaintext",
        })?;
        let ciphertext_blob = resp.ciphertext_blob().ok_or(KmsError::MissingField {
            operation: "GenerateDataKey",
            field: "CiphertextBlob",
        })?;

        Ok(GeneratedDataKey {
            plaintext: Zeroizing::new(plaintext.as_ref().to_vec()),
            ciphertext_blob: ciphertext_blob.as_ref().to_vec(),
        })
    }

    async fn decrypt(
        &self,
        ciphertext_blob: &[u8],
        master_key_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let mut req = self
            .client
            .decrypt()
            .key_id(master_key_id)
            .ciphertext_blob(Blob::new(ciphertext_blob.to_vec()));
        for (k, v) in ENCRYPTION_CONTEXT {
            req = req.encryption_context(k, v);
        }

        let resp = req.send().await.map_err(|e| KmsError::Request {
            operation: "Decrypt",
            message: DisplayErrorContext(&e).to_string(),
        })?;

        resp.plaintext()
            .map(|p| Zeroizing::new(p.as_ref().to_vec()))
            .ok_or(KmsError::MissingField {
                operation: "Decrypt",
                field: "Plaintext",
            })
    }
}
