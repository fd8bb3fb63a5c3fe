//! `codec-server`: KMS envelope-encryption payload codec.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (JSON logs, optional OTLP spans).
//! 3. Initialise the KMS client and resolve the master key alias to its ARN.
//! 4. Generate the first data key and seed the [`KeyManager`].
//! 5. Spawn background tasks: cache sweep, expiry monitor, scheduled rotation.
//! 6. Build the Axum router and serve until SIGINT/SIGTERM.

mod codec;
mod config;
mod crypto;
mod keys;
mod kms;
mod server;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use config::Config;
use keys::KeyManager;
use kms::{AwsKms, KeyManagementService};
use server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.port,
        "codec-server starting"
    );

    // -----------------------------------------------------------------------
    // 3. KMS client + master key
    // -----------------------------------------------------------------------
    let kms: Arc<dyn KeyManagementService> =
        Arc::new(AwsKms::init(cfg.kms_endpoint_url.as_deref()).await);
    let master_key_arn = kms
        .resolve_alias(&cfg.master_key_alias)
        .await
        .with_context(|| format!("failed to resolve master key alias {}", cfg.master_key_alias))?;
    info!(
        alias = %cfg.master_key_alias,
        arn = %master_key_arn,
        "resolved master key"
    );

    // -----------------------------------------------------------------------
    // 4. Initial data key
    // -----------------------------------------------------------------------
    let policy = cfg.key_policy();
    let keys = KeyManager::init(kms, master_key_arn, policy)
        .await
        .context("failed to generate initial data key")?;
    info!(
        rotation_interval_secs = cfg.data_key_rotation_interval_secs,
        decryption_cache_ttl_secs = cfg.decryption_cache_ttl_secs,
        cache_sweep_interval_secs = cfg.cache_sweep_interval_secs,
        "key manager ready"
    );

    // -----------------------------------------------------------------------
    // 5. Background tasks
    // -----------------------------------------------------------------------
    let maintenance = keys.spawn_maintenance();

    // -----------------------------------------------------------------------
    // 6. HTTP server
    // -----------------------------------------------------------------------
    let router = server::router::build(AppState::new(keys));

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %addr,
        endpoints = "POST /encode, POST /decode, GET /stats, GET /health",
        "listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    maintenance.shutdown().await;
    info!("codec-server stopped");
    telemetry::shutdown_telemetry();

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
