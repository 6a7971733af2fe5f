mod audio;
mod config;
mod connection;
mod engine;
mod error;
mod models;
mod queue;
mod results;
mod server;
mod state;
mod worker;

use anyhow::{Result, anyhow};
use clap::Parser;
use config::Config;
use engine::WhisperLoader;
use server::{Server, ServerOptions};
use state::AppState;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate().map_err(|e| anyhow!(e))?;
    let addr = config.addr()?;

    let workers = config.worker_count();
    let threads = config.inference_threads();
    info!(
        "Models from {}, {} worker(s), {} inference thread(s) each",
        config.models_dir.display(),
        workers,
        threads
    );
    let loader = WhisperLoader::new(&config.models_dir, threads);
    let state = AppState::new(Arc::new(loader), config.max_frame_bytes);
    let options = ServerOptions {
        workers,
        max_connections: config.max_connections,
        shutdown_grace: config.shutdown_grace(),
    };
    let server = Server::bind(addr, state, options).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    server.run(shutdown).await;

    // inference running on blocking threads cannot be interrupted, and the
    // runtime would wait for it on drop
    info!("Exiting");
    std::process::exit(0);
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
