//! Queue Items and Persisted Rows
//!
//! This module defines the unit of ingestion - the [`QueueItem`] - and the
//! row shapes the flush path writes to storage.
//!
//! ## Lifecycle
//!
//! A `QueueItem` is created at the HTTP boundary, owned exclusively by the
//! ingest buffer until flushed, and then converted into a [`LogRow`] or
//! [`EventRow`]. Items are never mutated after creation except for the
//! fingerprint annotation attached to log items during flush.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::Fingerprint;

/// Which SDK produced an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Server,
    Browser,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Server => "server",
            Source::Browser => "browser",
        }
    }
}

/// A single queued item, tagged by kind.
///
/// The kind is decided once at the HTTP boundary: payloads carrying an
/// `event_type` (or posted to the event endpoint) become events, everything
/// else is a log. Nothing deeper in the pipeline re-inspects payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueueItem {
    Log(LogItem),
    Event(EventItem),
}

impl QueueItem {
    pub fn project_id(&self) -> &str {
        match self {
            QueueItem::Log(item) => &item.project_id,
            QueueItem::Event(item) => &item.project_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            QueueItem::Log(item) => item.timestamp,
            QueueItem::Event(item) => item.timestamp,
        }
    }

    /// Best-effort "auto-captured error" classification.
    ///
    /// Clients that auto-capture errors set `error_source: "auto_captured"`
    /// in the attribute map. This is a soft convention, not a schema
    /// contract: a missing or differently-typed key counts as non-critical.
    pub fn is_critical(&self) -> bool {
        let data = match self {
            QueueItem::Log(item) => &item.data,
            QueueItem::Event(item) => &item.data,
        };
        data.get("error_source")
            .and_then(Value::as_str)
            .map(|source| source == "auto_captured")
            .unwrap_or(false)
    }
}

/// A log line queued for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogItem {
    pub project_id: String,
    pub source: Source,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Opaque structured attributes (headers, payload, user id, ...).
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
    /// Free-form severity. "info" when the client sent none.
    pub level: String,
    pub message: String,
    /// Attached by the flush path, never set by callers.
    #[serde(skip)]
    pub fingerprint: Option<Fingerprint>,
}

/// A business event queued for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventItem {
    pub project_id: String,
    pub source: Source,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
    /// Event name.
    pub message: String,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Decimal-as-string so numeric precision survives the trip to storage.
    #[serde(default)]
    pub value: Option<String>,
}

/// A log row ready for bulk insert.
///
/// Carries the fingerprint but not the transient pattern - the pattern lives
/// on the log group, one row per `(project_id, fingerprint)`.
#[derive(Debug, Clone)]
pub struct LogRow {
    pub project_id: String,
    pub source: Source,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub level: String,
    pub message: String,
    pub fingerprint: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// An event row ready for bulk insert.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub project_id: String,
    pub source: Source,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub name: String,
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub value: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// One batch's contribution to a log group.
///
/// Built per `(project_id, fingerprint)` during flush and merged into the
/// stored group with additive count and widened first/last seen bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDelta {
    pub project_id: String,
    pub fingerprint: String,
    pub pattern: String,
    pub example_message: String,
    pub level: String,
    pub count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}
