//! [`KeyManager`]: current-key rotation, historical key resolution, and
//! background maintenance.
//!
//! # Rotation
//!
//! The current key moves through `Missing → Valid → Expired → Valid(new)`.
//! Readers first take a lock-free snapshot; only if it is missing or expired
//! do they enter the rotation section, which re-checks before calling the
//! KMS. Under contention exactly one `GenerateDataKey` is issued per expiry
//! window and every other caller receives the key it installed.
//!
//! KMS-bound work runs on its own Tokio task. A request that is abandoned
//! while waiting cannot cancel a rotation or a cache fill half-way.
//!
//! # Historical keys
//!
//! Cache misses for the same blob are coalesced: the first caller holds a
//! per-entry fill lock across the KMS `Decrypt`, and callers queued behind it
//! re-check the cache before calling the KMS themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{fingerprint, DataKey, KeyCache, KeyError, KeyMaterial};
use crate::kms::KeyManagementService;

/// Timing policy for the key lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPolicy {
    /// How long a data key stays current.
    pub rotation_interval: Duration,
    /// How long an unwrapped historical key stays cached.
    pub decryption_cache_ttl: Duration,
    /// Period of the decryption cache sweep.
    pub cache_sweep_interval: Duration,
    /// Period of the low-expiry check.
    pub expiry_check_interval: Duration,
    /// Remaining lifetime below which the low-expiry warning is raised.
    pub low_expiry_warning_threshold: Duration,
    /// Delay before a failed scheduled rotation is retried.
    pub rotation_retry_interval: Duration,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_secs(3600),
            decryption_cache_ttl: Duration::from_secs(86_400),
            cache_sweep_interval: Duration::from_secs(900),
            expiry_check_interval: Duration::from_secs(60),
            low_expiry_warning_threshold: Duration::from_secs(300),
            rotation_retry_interval: Duration::from_secs(30),
        }
    }
}

/// Read-only snapshot for operational visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStats {
    pub cached_keys_count: usize,
    /// `None` until the first key has been installed.
    pub current: Option<CurrentKeyStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentKeyStats {
    pub age: Duration,
    /// Zero once expired.
    pub expires_in: Duration,
    /// Time since expiry; zero while the key is valid.
    pub overdue: Duration,
    pub expired: bool,
    pub low_expiry_warning: bool,
}

/// Owns the data key lifecycle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct KeyManager {
    inner: Arc<Inner>,
}

struct Inner {
    kms: Arc<dyn KeyManagementService>,
    master_key_id: String,
    policy: KeyPolicy,
    cache: KeyCache,
    /// Serialises rotations. Never taken on the valid-key path.
    rotation: Mutex<()>,
    /// One lock per decryption cache entry being filled.
    fills: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    low_expiry_warning: AtomicBool,
}

impl KeyManager {
    /// Create a manager with no current key. The first caller generates one.
    pub fn new(
        kms: Arc<dyn KeyManagementService>,
        master_key_id: impl Into<String>,
        policy: KeyPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kms,
                master_key_id: master_key_id.into(),
                policy,
                cache: KeyCache::new(),
                rotation: Mutex::new(()),
                fills: Mutex::new(HashMap::new()),
                low_expiry_warning: AtomicBool::new(false),
            }),
        }
    }

    /// Create a manager and generate its first data key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::KeyGenerationFailed`] if the KMS call fails.
    pub async fn init(
        kms: Arc<dyn KeyManagementService>,
        master_key_id: impl Into<String>,
        policy: KeyPolicy,
    ) -> Result<Self, KeyError> {
        let manager = Self::new(kms, master_key_id, policy);
        manager.rotate().await?;
        Ok(manager)
    }

    /// Identifier (ARN) of the master key that wraps new data keys.
    pub fn master_key_id(&self) -> &str {
        &self.inner.master_key_id
    }

    /// Return the current data key, rotating it first if missing or expired.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::KeyGenerationFailed`] if a rotation was needed and
    /// the KMS call failed. The stale key stays installed in that case.
    pub async fn get_current_data_key(&self) -> Result<Arc<DataKey>, KeyError> {
        if let Some(key) = self.inner.cache.current() {
            if !key.is_expired_at(Instant::now()) {
                return Ok(key);
            }
        }

        let inner = Arc::clone(&self.inner);
        join(
            tokio::spawn(async move { inner.rotate_if_expired().await }),
            KeyError::KeyGenerationFailed,
        )
        .await
    }

    /// Unconditionally replace the current key with a new one from the KMS.
    ///
    /// The superseded key is zeroed once no caller still holds it.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::KeyGenerationFailed`] if the KMS call fails.
    pub async fn rotate(&self) -> Result<Arc<DataKey>, KeyError> {
        let inner = Arc::clone(&self.inner);
        join(
            tokio::spawn(async move {
                let _guard = inner.rotation.lock().await;
                inner.install_new_key().await
            }),
            KeyError::KeyGenerationFailed,
        )
        .await
    }

    /// Resolve the plaintext for an encrypted data key.
    ///
    /// Resolution order: the current key (no external call), the decryption
    /// cache, then KMS `Decrypt` whose result is cached for the configured TTL.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::KeyDecryptionFailed`] if `encrypted_blob` is not
    /// base64 or the KMS call fails.
    pub async fn decrypt_data_key(
        &self,
        encrypted_blob: &str,
        master_key_id: &str,
    ) -> Result<KeyMaterial, KeyError> {
        if let Some(current) = self.inner.cache.current() {
            if current.encrypted_blob() == encrypted_blob {
                return Ok(current.plaintext().clone());
            }
        }

        let cache_key = cache_key(master_key_id, encrypted_blob);
        if let Some(hit) = self.inner.cache.get_cached(&cache_key).await {
            debug!(fingerprint = fingerprint(encrypted_blob), "decryption cache hit");
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let blob = encrypted_blob.to_owned();
        let master_key_id = master_key_id.to_owned();
        join(
            tokio::spawn(async move { inner.unwrap_and_cache(blob, master_key_id, cache_key).await }),
            KeyError::KeyDecryptionFailed,
        )
        .await
    }

    /// Drop expired entries from the decryption cache.
    pub async fn sweep_cache(&self) -> usize {
        let removed = self.inner.cache.sweep(Instant::now()).await;
        if removed > 0 {
            info!(removed, "swept expired data keys from decryption cache");
        }
        removed
    }

    /// Raise or clear the low-expiry warning for the current key.
    ///
    /// Advisory only: this never rotates.
    pub fn check_expiry(&self) -> bool {
        let Some(key) = self.inner.cache.current() else {
            self.inner.low_expiry_warning.store(false, Ordering::Relaxed);
            return false;
        };

        let expires_in = key.expires_in_at(Instant::now());
        let soon = expires_in < self.inner.policy.low_expiry_warning_threshold;
        self.inner.low_expiry_warning.store(soon, Ordering::Relaxed);
        if soon {
            warn!(
                fingerprint = key.fingerprint(),
                expires_in_secs = expires_in.as_secs(),
                "current data key is close to expiry"
            );
        }
        soon
    }

    pub async fn stats(&self) -> KeyStats {
        let cached_keys_count = self.inner.cache.len().await;
        let now = Instant::now();
        let current = self.inner.cache.current().map(|key| CurrentKeyStats {
            age: key.age_at(now),
            expires_in: key.expires_in_at(now),
            overdue: now.saturating_duration_since(key.expires_at()),
            expired: key.is_expired_at(now),
            low_expiry_warning: self.inner.low_expiry_warning.load(Ordering::Relaxed),
        });
        KeyStats {
            cached_keys_count,
            current,
        }
    }

    /// Spawn the cache sweep, expiry monitor and scheduled rotation tasks.
    ///
    /// The tasks run until [`MaintenanceHandle::shutdown`] is called.
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        let cancel = CancellationToken::new();
        let tasks = vec![
            sweep_task(self.clone(), cancel.clone()),
            expiry_monitor_task(self.clone(), cancel.clone()),
            rotation_task(self.clone(), cancel.clone()),
        ];
        info!(
            sweep_interval_secs = self.inner.policy.cache_sweep_interval.as_secs(),
            expiry_check_interval_secs = self.inner.policy.expiry_check_interval.as_secs(),
            "key maintenance tasks started"
        );
        MaintenanceHandle { cancel, tasks }
    }
}

impl Inner {
    async fn rotate_if_expired(&self) -> Result<Arc<DataKey>, KeyError> {
        let _guard = self.rotation.lock().await;
        // Another caller may have rotated while we waited for the lock.
        if let Some(key) = self.cache.current() {
            if !key.is_expired_at(Instant::now()) {
                return Ok(key);
            }
        }
        self.install_new_key().await
    }

    /// Rotate only if `expected` is still the current key.
    ///
    /// Only a weak handle is held so the key can still be zeroed on retirement.
    async fn rotate_superseding(&self, expected: &Weak<DataKey>) -> Result<Arc<DataKey>, KeyError> {
        let _guard = self.rotation.lock().await;
        match self.cache.current() {
            Some(key) if !std::ptr::eq(Arc::as_ptr(&key), expected.as_ptr()) => Ok(key),
            _ => self.install_new_key().await,
        }
    }

    /// Generate and install a new key. Caller must hold `self.rotation`.
    async fn install_new_key(&self) -> Result<Arc<DataKey>, KeyError> {
        debug!(master_key_id = %self.master_key_id, "generating new data key");
        let generated = self
            .kms
            .generate_data_key(&self.master_key_id)
            .await
            .map_err(|e| KeyError::KeyGenerationFailed(e.to_string()))?;

        let plaintext = KeyMaterial::from_slice(&generated.plaintext)?;
        let key = Arc::new(DataKey::new(
            plaintext,
            STANDARD.encode(&generated.ciphertext_blob),
            Instant::now(),
            self.policy.rotation_interval,
        ));

        let previous = self.cache.set_current(Arc::clone(&key));
        self.low_expiry_warning.store(false, Ordering::Relaxed);
        info!(
            fingerprint = key.fingerprint(),
            expires_in_secs = self.policy.rotation_interval.as_secs(),
            "new data key installed"
        );

        if let Some(old) = previous {
            retire(old);
        }
        Ok(key)
    }

    /// Fill the decryption cache entry `cache_key`, at most one KMS call at a time.
    async fn unwrap_and_cache(
        &self,
        encrypted_blob: String,
        master_key_id: String,
        cache_key: String,
    ) -> Result<KeyMaterial, KeyError> {
        let fill = Arc::clone(self.fills.lock().await.entry(cache_key.clone()).or_default());
        let result = {
            let _guard = fill.lock().await;
            match self.cache.get_cached(&cache_key).await {
                Some(hit) => Ok(hit),
                None => {
                    self.fetch_and_cache(&encrypted_blob, &master_key_id, cache_key.clone())
                        .await
                }
            }
        };

        let mut fills = self.fills.lock().await;
        // The map and this handle are the only owners once nobody is queued.
        let idle = Arc::strong_count(&fill) == 2;
        if idle && fills.get(&cache_key).is_some_and(|f| Arc::ptr_eq(f, &fill)) {
            fills.remove(&cache_key);
        }
        // Release our handle before the map so the next caller counts correctly.
        drop(fill);
        drop(fills);
        result
    }

    async fn fetch_and_cache(
        &self,
        encrypted_blob: &str,
        master_key_id: &str,
        cache_key: String,
    ) -> Result<KeyMaterial, KeyError> {
        let wrapped = STANDARD.decode(encrypted_blob).map_err(|_| {
            KeyError::KeyDecryptionFailed("encrypted data key is not valid base64".into())
        })?;

        let plaintext = self
            .kms
            .decrypt(&wrapped, master_key_id)
            .await
            .map_err(|e| KeyError::KeyDecryptionFailed(e.to_string()))?;
        let material = KeyMaterial::from_slice(&plaintext)?;

        self.cache
            .put_cached(cache_key, material.clone(), self.policy.decryption_cache_ttl)
            .await;
        info!(
            fingerprint = fingerprint(encrypted_blob),
            ttl_secs = self.policy.decryption_cache_ttl.as_secs(),
            "unwrapped and cached historical data key"
        );
        Ok(material)
    }
}

/// Zero a superseded key if we hold the last reference, returning whether it
/// was zeroed here. Otherwise the last reader's drop zeroes it.
fn retire(old: Arc<DataKey>) -> bool {
    let label = old.fingerprint().to_owned();
    match Arc::try_unwrap(old) {
        Ok(mut key) => {
            key.retire();
            debug!(fingerprint = %label, "superseded data key zeroed");
            true
        }
        Err(_) => {
            debug!(
                fingerprint = %label,
                "superseded data key still borrowed; zeroed on last drop"
            );
            false
        }
    }
}

fn cache_key(master_key_id: &str, encrypted_blob: &str) -> String {
    format!("{master_key_id}:{encrypted_blob}")
}

async fn join<T>(
    task: JoinHandle<Result<T, KeyError>>,
    on_abort: fn(String) -> KeyError,
) -> Result<T, KeyError> {
    task.await
        .map_err(|e| on_abort(format!("key task did not complete: {e}")))?
}

// ---------------------------------------------------------------------------
// Background maintenance
// ---------------------------------------------------------------------------

/// Owns the background key maintenance tasks.
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stop every task and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "key maintenance task ended abnormally");
            }
        }
        info!("key maintenance tasks stopped");
    }
}

fn sweep_task(manager: KeyManager, cancel: CancellationToken) -> JoinHandle<()> {
    let period = manager.inner.policy.cache_sweep_interval;
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        // First tick fires immediately; nothing can have expired yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    manager.sweep_cache().await;
                }
            }
        }
    })
}

fn expiry_monitor_task(manager: KeyManager, cancel: CancellationToken) -> JoinHandle<()> {
    let period = manager.inner.policy.expiry_check_interval;
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    manager.check_expiry();
                }
            }
        }
    })
}

/// Replace the current key when it reaches `expires_at`.
///
/// If a request already rotated it lazily, the task simply re-arms for the
/// new key. On KMS failure the stale key is retained and the rotation is
/// retried after `rotation_retry_interval`.
fn rotation_task(manager: KeyManager, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (watched, deadline) = match manager.inner.cache.current() {
                Some(key) => (Some(Arc::downgrade(&key)), key.expires_at()),
                None => (None, Instant::now()),
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep_until(deadline) => {}
            }

            let outcome = match &watched {
                Some(expected) => manager.inner.rotate_superseding(expected).await,
                None => manager.inner.rotate_if_expired().await,
            };

            if let Err(e) = outcome {
                warn!(error = %e, "scheduled data key rotation failed; retaining previous key");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(manager.inner.policy.rotation_retry_interval) => {}
                }
            }
        }
    })
}
