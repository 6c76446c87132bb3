// Service entry point: spawns the compression worker and serves the resource
// gate. The same executable re-invoked with `--worker` becomes the worker
// subprocess; see lib.rs for the library API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use image_compressor::coordinator::{Coordinator, WorkerConfig};
use image_compressor::registry::FileRegistry;
use image_compressor::service::CompressorService;
use image_compressor::{gate, worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "--worker") {
        // stdout carries the message channel; logs must go to stderr
        tracing_subscriber::fmt()
            .with_env_filter(default_filter())
            .with_writer(std::io::stderr)
            .compact()
            .init();
        worker::run_stdio().await?;
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .compact()
        .init();

    info!("=== image compressor service starting ===");

    let temp_root = std::env::temp_dir().join("image-compressor");
    let registry = Arc::new(FileRegistry::init(temp_root).await?);

    let coordinator = Coordinator::spawn(WorkerConfig::current_exe()?).await?;
    let service = Arc::new(CompressorService::new(coordinator, registry));

    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8191".to_string())
        .parse()
        .context("invalid BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("resource gate listening on {}", addr);

    axum::serve(listener, gate::router(service.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    service.shutdown().await;
    // artifacts are ephemeral; drop them all on the way out
    service.registry().sweep(Duration::ZERO).await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
