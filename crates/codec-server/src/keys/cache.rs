//! [`KeyCache`]: the current data key plus a TTL map of unwrapped historical keys.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwapOption;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use super::{DataKey, KeyMaterial};

/// A historical data key unwrapped by the KMS.
struct CachedDecryptedKey {
    plaintext: KeyMaterial,
    expires_at: Instant,
}

impl CachedDecryptedKey {
    fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Two-tier, thread-safe key store.
///
/// - The current key sits behind an [`ArcSwapOption`]: readers on the encode
///   path never block, and a rotation swaps in the new key atomically.
/// - Unwrapped historical keys sit in a map behind a single `RwLock`. Access
///   is read-mostly and contention is low, so the map is not striped.
///
/// The two tiers are guarded independently.
#[derive(Clone)]
pub struct KeyCache {
    current: Arc<ArcSwapOption<DataKey>>,
    decrypted: Arc<RwLock<HashMap<String, CachedDecryptedKey>>>,
}

impl KeyCache {
    /// Create an empty cache with no current key.
    pub fn new() -> Self {
        Self {
            current: Arc::new(ArcSwapOption::empty()),
            decrypted: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Lock-free snapshot of the current key.
    pub fn current(&self) -> Option<Arc<DataKey>> {
        self.current.load_full()
    }

    /// Atomically install `new` and return the key it replaced.
    ///
    /// The caller owns retiring the returned key.
    pub fn set_current(&self, new: Arc<DataKey>) -> Option<Arc<DataKey>> {
        self.current.swap(Some(new))
    }

    /// Return a copy of the cached plaintext if present and unexpired.
    ///
    /// An expired entry is treated as absent and removed.
    pub async fn get_cached(&self, key: &str) -> Option<KeyMaterial> {
        let now = Instant::now();
        {
            let map = self.decrypted.read().await;
            match map.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired_at(now) => return Some(entry.plaintext.clone()),
                Some(_) => {}
            }
        }

        let mut map = self.decrypted.write().await;
        // Another task may have refreshed the entry while we waited.
        let now = Instant::now();
        match map.get(key) {
            Some(entry) if !entry.is_expired_at(now) => Some(entry.plaintext.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert (or refresh) an unwrapped key for `ttl`.
    pub async fn put_cached(&self, key: String, plaintext: KeyMaterial, ttl: Duration) {
        let entry = CachedDecryptedKey {
            plaintext,
            expires_at: Instant::now() + ttl,
        };
        self.decrypted.write().await.insert(key, entry);
    }

    /// Remove every entry expired at `now`, returning how many were dropped.
    ///
    /// Removed plaintext is zeroed as the entries drop.
    pub async fn sweep(&self, now: Instant) -> usize {
        let mut map = self.decrypted.write().await;
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired_at(now));
        before - map.len()
    }

    /// Number of entries in the decryption cache, expired or not.
    pub async fn len(&self) -> usize {
        self.decrypted.read().await.len()
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field(
                "current",
                &self.current.load_full().map(|k| k.fingerprint().to_owned()),
            )
            .finish_non_exhaustive()
    }
}
