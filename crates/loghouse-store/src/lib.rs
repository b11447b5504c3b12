//! Loghouse Storage Layer
//!
//! This crate owns everything that touches the database: the storage handle
//! traits the ingest buffer writes through, the Postgres implementation, and
//! the partition lifecycle manager that keeps the day-partitioned tables
//! healthy without ever blocking ingestion.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     ensure range      ┌────────────────────┐
//! │ Ingest Buffer │ ────────────────────► │  PartitionManager  │
//! └───────┬───────┘                       └─────────┬──────────┘
//!         │ bulk insert / upsert                    │ DDL, introspection
//!         ▼                                         ▼
//! ┌───────────────┐                       ┌────────────────────┐
//! │  EventStore   │                       │  PartitionCatalog  │
//! └───────┬───────┘                       └─────────┬──────────┘
//!         └────────────── PostgresStore ────────────┘
//! ```
//!
//! Both traits are object-safe and shared as `Arc<dyn ...>` so tests can
//! substitute in-memory implementations.
//!
//! ## Partition model
//!
//! One partition per UTC calendar day per table, half-open `[start, end)`,
//! named by [`partition_name`] - the single source of truth for the naming
//! scheme, used by creation and lifecycle paths alike. Any row outside every
//! explicit range lands in the table's default partition.

pub mod error;
pub mod keys;
pub mod partition;
pub mod postgres;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use loghouse_core::{EventRow, GroupDelta, LogRow};

pub use error::{Result, StoreError};
pub use keys::ProjectKeyCache;
pub use partition::{partition_name, PartitionConfig, PartitionManager};
pub use postgres::PostgresStore;
pub use types::{PartitionInfo, ProjectKeyInfo, Table};

/// Row-level storage operations used by the ingest flush path and the
/// cleanup job's unpartitioned fallbacks.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Bulk-insert log rows. All-or-nothing per call.
    async fn insert_logs(&self, rows: &[LogRow]) -> Result<()>;

    /// Bulk-insert event rows. All-or-nothing per call.
    async fn insert_events(&self, rows: &[EventRow]) -> Result<()>;

    /// Merge group deltas into stored log groups.
    ///
    /// The upsert must be a true merge, safe under concurrent flushes from
    /// other processes: additive `count`, `LEAST` on `first_seen`,
    /// `GREATEST` on `last_seen` - never a blind overwrite.
    async fn upsert_groups(&self, deltas: &[GroupDelta]) -> Result<()>;

    /// Resolve an API key to its project, or `None` when unknown.
    async fn find_project_key(&self, api_key: &str) -> Result<Option<ProjectKeyInfo>>;

    /// Whether a project id exists (used by the WS subscribe handshake).
    async fn project_exists(&self, project_id: &str) -> Result<bool>;

    /// Row-level retention fallback for unpartitioned tables.
    async fn delete_rows_older_than(&self, table: Table, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete the `limit` oldest rows (emergency space reclamation fallback).
    async fn delete_oldest_rows(&self, table: Table, limit: i64) -> Result<u64>;

    /// Current size of the backing database in bytes.
    async fn database_size_bytes(&self) -> Result<i64>;
}

/// Partition catalog operations: DDL and introspection, one calendar day per
/// partition. Consumed only by [`PartitionManager`], which layers caching,
/// configuration, and degrade-on-error semantics on top.
#[async_trait]
pub trait PartitionCatalog: Send + Sync {
    /// Whether the table is range-partitioned. Uncached introspection.
    async fn is_partitioned(&self, table: Table) -> Result<bool>;

    /// Online migration of an unpartitioned table to a day-partitioned one.
    ///
    /// Must be atomic from the perspective of readers: rename aside, create
    /// the partitioned table with the same shape, one partition per day of
    /// existing data plus a trailing day, copy, drop, reindex - in a single
    /// transactional block.
    async fn convert_to_partitioned(&self, table: Table) -> Result<()>;

    /// Create the partition for one UTC day if it does not exist.
    /// Idempotent; concurrent callers racing on the same day must not error.
    async fn create_day_partition(&self, table: Table, day: NaiveDate) -> Result<()>;

    /// List leaf partitions straight from the catalog (never cached), sorted
    /// by start instant. The default partition is not included.
    async fn list_leaf_partitions(&self, table: Table) -> Result<Vec<PartitionInfo>>;

    /// Detach a partition from its parent, then drop it. Detach-then-drop so
    /// in-flight queries against the partition are not corrupted mid-scan.
    async fn detach_and_drop_partition(&self, table: Table, name: &str) -> Result<()>;
}
