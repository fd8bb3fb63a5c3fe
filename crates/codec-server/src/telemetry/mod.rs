//! Tracing setup: structured JSON logs, plus OTLP span export when configured.
//!
//! # Telemetry invariants
//!
//! - **No key material** may appear in any span attribute or log field. Data
//!   keys are only ever logged by fingerprint.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`), overridden by
//!   `RUST_LOG` when set.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
