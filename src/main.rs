#![forbid(unsafe_code)]

//! `paperflow` — document-generation coordination server binary.
//!
//! Bootstraps configuration, the session registry with its eviction
//! sweep, the worker supervisor, and the HTTP/WebSocket surface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use paperflow::channel::server::{self, AppState};
use paperflow::config::GlobalConfig;
use paperflow::registry::{eviction, SessionRegistry};
use paperflow::supervisor::Supervisor;
use paperflow::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "paperflow", about = "Document generation coordination server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured HTTP/WebSocket port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("paperflow server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(port) = args.port {
        config.http_port = port;
    }
    let config = Arc::new(config);
    info!(port = config.http_port, "configuration loaded");

    // ── Build shared state ──────────────────────────────
    let registry = Arc::new(SessionRegistry::new(
        config.retention_window(),
        config.staging_window(),
    ));
    let supervisor = Arc::new(Supervisor::new(Arc::clone(&config)));

    // ── Start eviction sweep ────────────────────────────
    let ct = CancellationToken::new();
    let eviction_handle = eviction::spawn_eviction_task(Arc::clone(&registry), ct.clone());
    info!("eviction sweep started");

    let state = AppState {
        config: Arc::clone(&config),
        registry,
        supervisor,
    };

    // ── Serve until shutdown ────────────────────────────
    let serve_ct = ct.clone();
    let serve_handle = tokio::spawn(async move {
        if let Err(err) = server::serve(state, serve_ct).await {
            error!(%err, "progress channel server failed");
        }
    });

    info!("paperflow server ready");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = tokio::join!(serve_handle, eviction_handle);
    info!("paperflow shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
