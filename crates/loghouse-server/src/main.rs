//! Loghouse Server
//!
//! Main entry point for the Loghouse observability backend.
//!
//! ## Overview
//! Accepts logs and business events over HTTP, buffers and batches them in
//! memory, fingerprints log messages into groups, persists everything to a
//! day-partitioned Postgres schema, and pushes coalesced new-data
//! notifications to WebSocket subscribers.
//!
//! ## Configuration
//! All configuration is environment variables; see [`loghouse_server::config`]
//! for the full list. `DATABASE_URL` is the only required one.
//!
//! ## Logging
//! Controlled via `RUST_LOG`:
//! ```bash
//! RUST_LOG=debug cargo run -p loghouse-server    # Detailed logs
//! RUST_LOG=info cargo run -p loghouse-server     # Standard logs (default)
//! ```

use std::sync::Arc;

use loghouse_ingest::IngestBuffer;
use loghouse_server::{create_router, AppState, CleanupJob, ProjectBroadcaster, ServerConfig};
use loghouse_store::{PartitionManager, PostgresStore, ProjectKeyCache};
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;

    tracing::info!("Connecting to Postgres");
    let store = Arc::new(PostgresStore::connect(&config.database_url).await?);

    let partitions = Arc::new(PartitionManager::new(store.clone(), config.partitions()));
    // Awaited before traffic: day partitions must exist before first flush
    partitions.warmup().await;

    let broadcaster = Arc::new(ProjectBroadcaster::default());
    let buffer = IngestBuffer::new(
        store.clone(),
        partitions.clone(),
        broadcaster.clone(),
        config.buffer(),
    );
    let (flush_tx, flush_rx) = oneshot::channel();
    let flush_handle = buffer.start(flush_rx);

    let cleanup = Arc::new(CleanupJob::new(
        store.clone(),
        partitions.clone(),
        config.cleanup(),
    ));
    let (cleanup_tx, cleanup_rx) = oneshot::channel();
    let cleanup_handle = cleanup.start(cleanup_rx);

    let state = AppState {
        buffer: buffer.clone(),
        store: store.clone(),
        keys: Arc::new(ProjectKeyCache::new(store.clone())),
        broadcaster,
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!(addr = %config.addr, "Loghouse server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the background tasks, then drain what is still buffered.
    let _ = flush_tx.send(());
    let _ = cleanup_tx.send(());
    buffer.shutdown().await;
    let _ = flush_handle.await;
    let _ = cleanup_handle.await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown signal handler");
    }
}
