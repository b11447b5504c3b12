//! Ingest Endpoint
//!
//! `POST /ingest` accepts a single item, a bare array, or an envelope
//! `{projectId?, events: [...]}`. The item kind is decided here, exactly
//! once: a payload carrying `eventType` is an event, everything else is a
//! log. Nothing downstream re-inspects payload shape.
//!
//! Ingest is deliberately forgiving about item contents - a malformed
//! timestamp becomes "now", a missing level becomes "info" - but strict
//! about authentication and capacity: requests without a resolvable
//! `x-api-key` are rejected, and a request larger than the buffer's
//! remaining capacity is rejected whole with 429 rather than partially
//! admitted.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, TimeZone, Utc};
use loghouse_core::{EventItem, LogItem, QueueItem, Source};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::AppState;

/// Suggested client backoff: one flush interval.
const RETRY_AFTER_SECS: &str = "2";

/// One raw item as sent by an SDK. Field presence drives normalization;
/// both camelCase and snake_case spellings are accepted.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    data: Option<serde_json::Map<String, Value>>,
    #[serde(default, alias = "trace_id")]
    trace_id: Option<String>,
    #[serde(default, alias = "span_id")]
    span_id: Option<String>,
    #[serde(default, alias = "event_type")]
    event_type: Option<String>,
    #[serde(default, alias = "user_id")]
    user_id: Option<String>,
    #[serde(default, alias = "session_id")]
    session_id: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

/// The three accepted body shapes. Envelope first: it is the only variant
/// distinguished by a required key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestBody {
    Envelope {
        #[serde(rename = "projectId", alias = "project_id", default)]
        project_id: Option<String>,
        events: Vec<RawItem>,
    },
    Batch(Vec<RawItem>),
    Single(Box<RawItem>),
}

impl IngestBody {
    fn into_items(self) -> (Option<String>, Vec<RawItem>) {
        match self {
            IngestBody::Envelope { project_id, events } => (project_id, events),
            IngestBody::Batch(items) => (None, items),
            IngestBody::Single(item) => (None, vec![*item]),
        }
    }
}

pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestBody>,
) -> Response {
    let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing x-api-key header" })),
        )
            .into_response();
    };

    let key = match state.keys.lookup(api_key).await {
        Ok(Some(key)) => key,
        Ok(None) => {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "unknown api key" })),
            )
                .into_response();
        }
        Err(e) => {
            error!(error = %e, "API key lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let (body_project, items) = body.into_items();

    // A claimed project (envelope or header) must match the key's project.
    let claimed = headers
        .get("x-project-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body_project);
    if let Some(claimed) = claimed {
        if claimed != key.project_id {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "api key does not belong to this project" })),
            )
                .into_response();
        }
    }

    // All-or-nothing admission, so a client never has to guess which half
    // of its batch survived.
    if items.len() > state.buffer.remaining_capacity() {
        return queue_full(0);
    }

    let now = Utc::now();
    let mut accepted = 0usize;
    for raw in items {
        let item = normalize(raw, &key.project_id, key.kind, now);
        if !state.buffer.add(item) {
            // Capacity race with a concurrent request
            return queue_full(accepted);
        }
        accepted += 1;
    }

    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))).into_response()
}

fn queue_full(accepted: usize) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
        Json(json!({ "error": "ingest queue full", "accepted": accepted })),
    )
        .into_response()
}

/// Turn one raw payload into a queue item, deciding the kind from the
/// presence of `eventType` and defaulting everything optional.
fn normalize(raw: RawItem, project_id: &str, source: Source, now: DateTime<Utc>) -> QueueItem {
    let timestamp = raw
        .timestamp
        .as_ref()
        .and_then(parse_timestamp)
        .unwrap_or(now);
    let data = raw.data.unwrap_or_default();

    if raw.event_type.is_some() {
        QueueItem::Event(EventItem {
            project_id: project_id.to_string(),
            source,
            trace_id: raw.trace_id,
            span_id: raw.span_id,
            timestamp,
            data,
            message: raw.name.or(raw.message).unwrap_or_default(),
            event_type: raw.event_type,
            user_id: raw.user_id,
            session_id: raw.session_id,
            value: coerce_value(raw.value),
        })
    } else {
        QueueItem::Log(LogItem {
            project_id: project_id.to_string(),
            source,
            trace_id: raw.trace_id,
            span_id: raw.span_id,
            timestamp,
            data,
            level: raw.level.unwrap_or_else(|| "info".to_string()),
            message: raw.message.or(raw.name).unwrap_or_default(),
            fingerprint: None,
        })
    }
}

/// RFC 3339 strings and epoch-millisecond numbers; anything else is `None`
/// and the caller substitutes the arrival time.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => s.parse::<DateTime<Utc>>().ok(),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// Event values arrive as JSON numbers or strings; stored as text so
/// decimal precision survives.
fn coerce_value(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ProjectBroadcaster;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use loghouse_core::{EventRow, GroupDelta, LogRow};
    use loghouse_ingest::{BufferConfig, IngestBuffer};
    use loghouse_store::{
        EventStore, PartitionCatalog, PartitionConfig, PartitionInfo, PartitionManager,
        ProjectKeyCache, ProjectKeyInfo, Result, Table,
    };
    use std::sync::Arc;

    struct KeyOnlyStore;

    #[async_trait]
    impl EventStore for KeyOnlyStore {
        async fn insert_logs(&self, _rows: &[LogRow]) -> Result<()> {
            Ok(())
        }
        async fn insert_events(&self, _rows: &[EventRow]) -> Result<()> {
            Ok(())
        }
        async fn upsert_groups(&self, _deltas: &[GroupDelta]) -> Result<()> {
            Ok(())
        }
        async fn find_project_key(&self, api_key: &str) -> Result<Option<ProjectKeyInfo>> {
            Ok(match api_key {
                "sk-live" => Some(ProjectKeyInfo {
                    project_id: "p1".into(),
                    kind: Source::Server,
                    allowed_referrers: vec![],
                }),
                _ => None,
            })
        }
        async fn project_exists(&self, _project_id: &str) -> Result<bool> {
            Ok(true)
        }
        async fn delete_rows_older_than(&self, _t: Table, _c: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
        async fn delete_oldest_rows(&self, _t: Table, _l: i64) -> Result<u64> {
            Ok(0)
        }
        async fn database_size_bytes(&self) -> Result<i64> {
            Ok(0)
        }
    }

    struct NoopCatalog;

    #[async_trait]
    impl PartitionCatalog for NoopCatalog {
        async fn is_partitioned(&self, _table: Table) -> Result<bool> {
            Ok(false)
        }
        async fn convert_to_partitioned(&self, _table: Table) -> Result<()> {
            Ok(())
        }
        async fn create_day_partition(&self, _t: Table, _d: chrono::NaiveDate) -> Result<()> {
            Ok(())
        }
        async fn list_leaf_partitions(&self, _table: Table) -> Result<Vec<PartitionInfo>> {
            Ok(vec![])
        }
        async fn detach_and_drop_partition(&self, _t: Table, _n: &str) -> Result<()> {
            Ok(())
        }
    }

    fn app_state(capacity: usize) -> AppState {
        let store: Arc<dyn EventStore> = Arc::new(KeyOnlyStore);
        let broadcaster = Arc::new(ProjectBroadcaster::default());
        let partitions = Arc::new(PartitionManager::new(
            Arc::new(NoopCatalog),
            PartitionConfig::default(),
        ));
        let buffer = IngestBuffer::new(
            store.clone(),
            partitions,
            broadcaster.clone(),
            BufferConfig {
                batch_size: 100,
                flush_interval_ms: 60_000,
                capacity,
            },
        );
        AppState {
            buffer,
            store: store.clone(),
            keys: Arc::new(ProjectKeyCache::new(store)),
            broadcaster,
        }
    }

    fn auth_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-live"));
        headers
    }

    fn body(json: Value) -> IngestBody {
        serde_json::from_value(json).expect("test body should deserialize")
    }

    #[test]
    fn body_shapes_all_deserialize() {
        let (_, items) = body(json!({ "message": "hi" })).into_items();
        assert_eq!(items.len(), 1);

        let (_, items) = body(json!([{ "message": "a" }, { "message": "b" }])).into_items();
        assert_eq!(items.len(), 2);

        let (project, items) = body(json!({
            "projectId": "p1",
            "events": [{ "message": "a" }]
        }))
        .into_items();
        assert_eq!(project.as_deref(), Some("p1"));
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn event_type_presence_decides_the_kind() {
        let now = Utc::now();
        let raw: RawItem =
            serde_json::from_value(json!({ "name": "signup", "eventType": "track", "value": 19.99 }))
                .unwrap();
        match normalize(raw, "p1", Source::Browser, now) {
            QueueItem::Event(event) => {
                assert_eq!(event.message, "signup");
                assert_eq!(event.value.as_deref(), Some("19.99"));
            }
            QueueItem::Log(_) => panic!("expected an event"),
        }

        let raw: RawItem = serde_json::from_value(json!({ "message": "boom" })).unwrap();
        match normalize(raw, "p1", Source::Server, now) {
            QueueItem::Log(log) => {
                assert_eq!(log.level, "info");
                assert_eq!(log.message, "boom");
            }
            QueueItem::Event(_) => panic!("expected a log"),
        }
    }

    #[test]
    fn bad_timestamps_fall_back_to_arrival_time() {
        let now = Utc::now();

        let raw: RawItem =
            serde_json::from_value(json!({ "message": "x", "timestamp": "not-a-date" })).unwrap();
        assert_eq!(normalize(raw, "p1", Source::Server, now).timestamp(), now);

        let raw: RawItem = serde_json::from_value(
            json!({ "message": "x", "timestamp": "2025-08-20T10:00:00Z" }),
        )
        .unwrap();
        let parsed = normalize(raw, "p1", Source::Server, now).timestamp();
        assert_eq!(parsed.to_rfc3339(), "2025-08-20T10:00:00+00:00");

        let raw: RawItem =
            serde_json::from_value(json!({ "message": "x", "timestamp": 1755684000000i64 }))
                .unwrap();
        assert_ne!(normalize(raw, "p1", Source::Server, now).timestamp(), now);
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let state = app_state(10);
        let response = ingest(
            State(state),
            HeaderMap::new(),
            Json(body(json!({ "message": "hi" }))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_key_is_forbidden() {
        let state = app_state(10);
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-wrong"));
        let response = ingest(State(state), headers, Json(body(json!({ "message": "hi" })))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn claimed_project_must_match_the_key() {
        let state = app_state(10);
        let response = ingest(
            State(state.clone()),
            auth_headers(),
            Json(body(json!({ "projectId": "p2", "events": [{ "message": "hi" }] }))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(state.buffer.len(), 0);
    }

    #[tokio::test]
    async fn accepted_items_are_queued_under_the_keys_project() {
        let state = app_state(10);
        let response = ingest(
            State(state.clone()),
            auth_headers(),
            Json(body(json!([{ "message": "a" }, { "name": "signup", "eventType": "track" }]))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.buffer.len(), 2);
    }

    #[tokio::test]
    async fn oversized_requests_are_rejected_whole() {
        let state = app_state(2);
        let response = ingest(
            State(state.clone()),
            auth_headers(),
            Json(body(json!([
                { "message": "a" },
                { "message": "b" },
                { "message": "c" }
            ]))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        // Atomic: nothing was admitted
        assert_eq!(state.buffer.len(), 0);
    }
}
