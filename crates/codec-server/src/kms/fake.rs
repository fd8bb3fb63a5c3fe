//! In-memory [`KeyManagementService`] that counts calls.
//!
//! Used where `mockall` expectations are awkward: concurrent callers, calls
//! that must take simulated time, and end-to-end encode/decode tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use zeroize::Zeroizing;

use super::{GeneratedDataKey, KeyManagementService, KmsError};

pub const MASTER_KEY_ARN: &str = "arn:aws:kms:eu-west-1:111122223333:key/test-master";

#[derive(Default)]
pub struct CountingKms {
    generated: AtomicUsize,
    decrypted: AtomicUsize,
    fail_generation: AtomicBool,
    latency: Duration,
    wrapped: Mutex<HashMap<Vec<u8>, [u8; 32]>>,
}

impl CountingKms {
    /// A fake whose calls take `latency` of (tokio) time.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    pub fn decrypted(&self) -> usize {
        self.decrypted.load(Ordering::SeqCst)
    }

    pub fn set_fail_generation(&self, fail: bool) {
        self.fail_generation.store(fail, Ordering::SeqCst);
    }

    /// Forget every wrapped key, as if this were a different KMS account.
    pub fn forget_wrapped_keys(&self) {
        self.wrapped.lock().unwrap().clear();
    }
}

#[async_trait]
impl KeyManagementService for CountingKms {
    async fn resolve_alias(&self, alias: &str) -> Result<String, KmsError> {
        match alias {
            "alias/temporal-codec-latest" => Ok(MASTER_KEY_ARN.to_owned()),
            _ => Err(KmsError::Request {
                operation: "DescribeKey",
                message: format!("alias {alias} not found"),
            }),
        }
    }

    async fn generate_data_key(&self, _master_key_id: &str) -> Result<GeneratedDataKey, KmsError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_generation.load(Ordering::SeqCst) {
            return Err(KmsError::Request {
                operation: "GenerateDataKey",
                message: "ThrottlingException".into(),
            });
        }

        let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
        let plaintext = [n as u8; 32];
        let blob = format!("wrapped-data-key-{n}").into_bytes();
        self.wrapped.lock().unwrap().insert(blob.clone(), plaintext);

        Ok(GeneratedDataKey {
            plaintext: Zeroizing::new(plaintext.to_vec()),
            ciphertext_blob: blob,
        })
    }

    async fn decrypt(
        &self,
        ciphertext_blob: &[u8],
        _master_key_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.decrypted.fetch_add(1, Ordering::SeqCst);

        self.wrapped
            .lock()
            .unwrap()
            .get(ciphertext_blob)
            .map(|k| Zeroizing::new(k.to_vec()))
            .ok_or(KmsError::Request {
                operation: "Decrypt",
                message: "InvalidCiphertextException".into(),
            })
    }
}
