//! Axum middleware settings applied to the router.
//!
//! Includes request tracing, timeout enforcement, and response compression.

use std::time::Duration;

/// Default per-request timeout applied to all routes.
///
/// A request that times out still lets any key rotation it triggered finish
/// in the background.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
