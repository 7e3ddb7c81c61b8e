//! VoiceHub Server - Main entry point.
//!
//! This binary starts the VoiceHub API server with:
//! - Structured JSON logging for production
//! - A Supabase readiness check and storage bucket setup at startup
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - Background cleanup of rate limiter and revocation state
//!
//! # Configuration
//!
//! See [`voicehub_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! VOICEHUB_SUPABASE_URL="https://project.supabase.co" \
//! VOICEHUB_SUPABASE_ANON_KEY="anon-key" \
//! VOICEHUB_SUPABASE_SERVICE_KEY="service-role-key" \
//! VOICEHUB_JWT_SECRET="a-secret-of-at-least-thirty-two-bytes" \
//! PORT=8080 \
//! cargo run --release --bin voicehub-server
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use voicehub_server::config::Config;
use voicehub_server::routes::{create_router, AppState};

/// Cleanup interval for stale rate limiter entries (30 seconds).
const RATE_LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Cleanup interval for expired token revocations (1 hour).
const REVOCATION_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  VOICEHUB_SUPABASE_URL         - Supabase project URL");
            eprintln!("  VOICEHUB_SUPABASE_ANON_KEY    - Supabase anon key");
            eprintln!("  VOICEHUB_JWT_SECRET           - Token signing secret (>= 32 bytes)");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                          - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                      - Log level filter (default: info)");
            eprintln!("  VOICEHUB_SUPABASE_SERVICE_KEY - Service role key for data access");
            eprintln!("  VOICEHUB_FIELD_ENCRYPTION_KEY - Base64 AES-256 key for stored content");
            eprintln!("  VOICEHUB_LIVEKIT_URL / _API_KEY / _API_SECRET - Enables voice");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = ?err, "Server terminated with error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        port = config.port,
        voice_enabled = config.livekit.is_some(),
        audio_bucket = %config.audio_bucket,
        files_bucket = %config.files_bucket,
        "VoiceHub server starting"
    );

    let port = config.port;
    let state = AppState::new(config).context("failed to initialise services")?;

    state
        .supabase
        .wait_until_ready()
        .await
        .context("Supabase is not reachable")?;

    if let Err(err) = state.storage.ensure_buckets().await {
        warn!(error = %err, "Could not verify storage buckets");
    }

    let rate_limit_cleanup = state
        .rate_limiter
        .spawn_cleanup_task(RATE_LIMITER_CLEANUP_INTERVAL);
    let revocation_cleanup = state
        .jwt
        .revocations()
        .spawn_cleanup_task(REVOCATION_CLEANUP_INTERVAL);
    info!(
        rate_limiter_interval_secs = RATE_LIMITER_CLEANUP_INTERVAL.as_secs(),
        revocation_interval_secs = REVOCATION_CLEANUP_INTERVAL.as_secs(),
        "Cleanup tasks started"
    );

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(port, address = %bind_addr, "Server listening");

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    info!("Server shutting down gracefully");
    rate_limit_cleanup.abort();
    revocation_cleanup.abort();
    info!("Cleanup tasks stopped");

    result.context("server error")
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info` plus request
/// traces from `tower_http`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
