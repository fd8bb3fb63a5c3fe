//! Shared application state injected into every Axum handler.

use crate::codec::CodecService;
use crate::keys::KeyManager;

/// Application state shared across all request handlers.
///
/// Both fields are `Arc`-backed handles, so Axum can clone the state per
/// request without copying key material.
#[derive(Clone)]
pub struct AppState {
    /// Payload encode/decode orchestration.
    pub codec: CodecService,
    /// Key lifecycle owner, queried directly by `/stats`.
    pub keys: KeyManager,
}

impl AppState {
    pub fn new(keys: KeyManager) -> Self {
        Self {
            codec: CodecService::new(keys.clone()),
            keys,
        }
    }
}
