//! llmswap - starts and swaps LLM backend servers on demand
//!
//! Loads the model configuration, serves the OpenAI-compatible proxy and stops every backend on
//! SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use llmswap::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    config::Config, manager::ProxyManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llmswap", version)]
#[command(about = "Swap LLM backend servers on demand behind one OpenAI-compatible endpoint")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Address the proxy listens on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// The port on which the metrics server will listen. 0 disables metrics.
    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "llmswap")]
    metrics_prefix: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    // RUST_LOG wins, then --verbose, then the config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("llmswap=debug")
        } else {
            EnvFilter::new(config.log_level.as_deref().unwrap_or("info"))
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    // Config loading runs before the subscriber exists, so its summary is logged here
    info!(
        path = %args.config.display(),
        models = ?config.models.keys().collect::<Vec<_>>(),
        groups = ?config.groups.keys().collect::<Vec<_>>(),
        health_check_timeout = ?config.health_check_timeout,
        "Loaded configuration"
    );

    let manager = Arc::new(ProxyManager::new(config));
    let mut router = build_router(AppState::new(Arc::clone(&manager)));

    if args.metrics_port != 0 {
        let (prometheus_layer, handle) = build_metrics_layer_and_handle(args.metrics_prefix);
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {metrics_addr}"))?;
        info!("Metrics endpoint enabled on {}", metrics_addr);
        let metrics_router = build_metrics_router(handle);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                warn!(error = %e, "Metrics server stopped");
            }
        });
    }

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", args.listen))?;
    info!(addr = %args.listen, "Listening for requests");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&manager)))
        .await
        .context("Server error")?;

    // Covers the case where the server stopped for another reason
    manager.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM after stopping every backend.
#[instrument(skip(manager))]
async fn shutdown_signal(manager: Arc<ProxyManager>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    manager.shutdown().await;
}
