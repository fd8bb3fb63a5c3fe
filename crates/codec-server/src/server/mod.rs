//! Axum HTTP server, routing, and middleware.
//!
//! # Responsibilities
//! - Define the Axum router with the codec, stats and health routes.
//! - Inject shared application state (`AppState`) into handlers.
//! - Render [`common::ServiceError`] as JSON error responses.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
