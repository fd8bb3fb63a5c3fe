//! Envelope cipher primitives.
//!
//! This module is intentionally free of AWS and HTTP dependencies.
//!
//! # Ciphertext format
//!
//! ```text
//! base64(nonce[12] || ciphertext || tag[16])
//! ```
//!
//! Standard alphabet with padding, matching what existing workers store.

pub mod cipher;

pub use cipher::{CipherError, ALGORITHM, KEY_LEN};
