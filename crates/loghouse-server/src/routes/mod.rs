//! HTTP route handlers.

pub mod ingest;
pub mod ws;

use axum::Json;
use serde_json::json;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
