//! Loghouse HTTP Server
//!
//! The outward-facing crate: axum router over the ingest buffer and the
//! storage layer, WebSocket fan-out, and the retention job. Everything
//! stateful lives in [`AppState`] and is shared as `Arc`s so handlers stay
//! cheap to clone.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use loghouse_ingest::IngestBuffer;
use loghouse_store::{EventStore, ProjectKeyCache};
use tower_http::cors::CorsLayer;

pub mod broadcast;
pub mod cleanup;
pub mod config;
pub mod routes;

pub use broadcast::ProjectBroadcaster;
pub use cleanup::{CleanupConfig, CleanupJob};
pub use config::ServerConfig;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub buffer: Arc<IngestBuffer>,
    pub store: Arc<dyn EventStore>,
    pub keys: Arc<ProjectKeyCache>,
    pub broadcaster: Arc<ProjectBroadcaster>,
}

/// Build the router. CORS is permissive - browser SDKs post from arbitrary
/// origins and authentication is the API key, not the origin.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/ingest", post(routes::ingest::ingest))
        .route("/ws", get(routes::ws::websocket))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
