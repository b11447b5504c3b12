//! Storage-facing types: the closed table set, partition descriptors, and
//! project key info.

use chrono::{DateTime, Utc};
use loghouse_core::Source;
use serde::{Deserialize, Serialize};

/// The append-only tables the lifecycle manager maintains.
///
/// A closed enum on purpose: every identifier that ever reaches DDL is
/// derived from this set plus a date, never from user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Logs,
    Events,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Logs, Table::Events];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Logs => "logs",
            Table::Events => "events",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One leaf partition as reported by the catalog.
///
/// Bounds are half-open `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Cached resolution of an API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectKeyInfo {
    pub project_id: String,
    /// Whether this is the project's server key or its browser key.
    pub kind: Source,
    /// Referrer allow-list for browser keys (matching happens upstream).
    pub allowed_referrers: Vec<String>,
}
