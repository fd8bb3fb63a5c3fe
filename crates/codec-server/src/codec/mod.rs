//! Payload codec: classifies each payload and routes it through the key
//! manager and envelope cipher.
//!
//! # Module invariants
//!
//! - **No AWS dependency.** Key material reaches this module only through
//!   [`crate::keys::KeyManager`].
//! - **No HTTP dependency.** Errors are [`service::CodecError`]s; the server layer maps
//!   them to status codes via [`common::ServiceError`].

pub mod service;

pub use service::CodecService;
