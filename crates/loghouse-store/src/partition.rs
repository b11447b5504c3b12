//! Partition Lifecycle Manager
//!
//! Maintains day-granularity range partitions over the `timestamp` column of
//! the append-only tables, transparently to the ingest buffer: partitions
//! are created ahead of need (warm-up, per-flush range hints) and retired by
//! the retention job (oldest-first for emergency space reclamation).
//!
//! ## Failure semantics
//!
//! Every operation here runs on a best-effort background path - buffer
//! startup, the per-flush range hint, the hourly cleanup - where a hard
//! failure must never take down ingestion. Storage errors are caught at
//! every operation, logged, and turned into a conservative value (`false`,
//! zero, empty list). Partitioning is a performance/retention optimization,
//! not a correctness requirement: with it disabled or broken, rows simply
//! land in the unpartitioned table or the default partition.
//!
//! ## Caching
//!
//! "Is this table partitioned" is answered from a tri-state cache
//! (unknown / yes / no) so the hot flush path never repeats catalog
//! introspection. [`PartitionManager::invalidate`] resets it; callers that
//! change the schema out of band hold the manager and can invalidate the
//! specific state. Leaf listings are never cached - they feed retention
//! decisions and must reflect concurrent external changes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::types::{PartitionInfo, Table};
use crate::PartitionCatalog;

/// Derive the partition name for one UTC day of a table.
///
/// The single source of truth for the naming scheme (`logs_p20250826`):
/// creation DDL and lifecycle queries both go through here so they can
/// never drift apart.
pub fn partition_name(table: Table, day: NaiveDate) -> String {
    format!("{}_p{}", table.as_str(), day.format("%Y%m%d"))
}

/// Partitioning configuration, environment-sourced by the server.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Master switch. Off means every operation is a cheap no-op.
    pub enabled: bool,
    /// Convert unpartitioned tables on startup via online migration.
    pub auto_convert: bool,
    /// Days ahead of today to pre-create during warm-up.
    pub lookahead_days: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_convert: true,
            lookahead_days: 1,
        }
    }
}

/// Owns partition existence decisions for all managed tables.
pub struct PartitionManager {
    catalog: Arc<dyn PartitionCatalog>,
    config: PartitionConfig,
    // Tri-state per table: absent = unknown, Some(bool) = introspected.
    partitioned: RwLock<HashMap<Table, bool>>,
}

impl PartitionManager {
    pub fn new(catalog: Arc<dyn PartitionCatalog>, config: PartitionConfig) -> Self {
        Self {
            catalog,
            config,
            partitioned: RwLock::new(HashMap::new()),
        }
    }

    /// Forget cached partitioned-state for all tables.
    pub async fn invalidate(&self) {
        self.partitioned.write().await.clear();
    }

    /// Whether `table` is currently range-partitioned.
    ///
    /// Introspects at most once per table; with partitioning disabled by
    /// configuration this answers `false` without touching storage.
    pub async fn is_partitioned(&self, table: Table) -> bool {
        if !self.config.enabled {
            return false;
        }

        if let Some(&cached) = self.partitioned.read().await.get(&table) {
            return cached;
        }

        let state = match self.catalog.is_partitioned(table).await {
            Ok(state) => {
                if !state {
                    warn!(
                        table = %table,
                        "Partitioning enabled but table is not partitioned, skipping partition maintenance"
                    );
                }
                state
            }
            Err(e) => {
                warn!(table = %table, error = %e, "Unable to inspect table, assuming unpartitioned");
                false
            }
        };

        self.partitioned.write().await.insert(table, state);
        state
    }

    /// Make sure `table` is partitioned, converting it when allowed.
    ///
    /// Returns `true` when the table is (now) partitioned. With
    /// auto-conversion disabled this logs a warning and returns `false`;
    /// ingestion proceeds against the unpartitioned table.
    pub async fn ensure_partitioned_table(&self, table: Table) -> bool {
        if !self.config.enabled {
            return false;
        }

        if self.is_partitioned(table).await {
            return true;
        }

        if !self.config.auto_convert {
            warn!(
                table = %table,
                "Table is not partitioned and auto-conversion is disabled, set LOGHOUSE_PARTITION_AUTOCONVERT=true to migrate"
            );
            return false;
        }

        match self.catalog.convert_to_partitioned(table).await {
            Ok(()) => {
                info!(table = %table, "Converted table to daily range partitions");
            }
            Err(e) => {
                warn!(table = %table, error = %e, "Failed to convert table to partitioned");
            }
        }

        // Re-introspect rather than trust the conversion blindly.
        self.partitioned.write().await.remove(&table);
        self.is_partitioned(table).await
    }

    /// Ensure a partition exists for every UTC day touched by `[from, to]`.
    ///
    /// Idempotent; per-day failures are logged and skipped so one bad day
    /// never blocks the rest of the range.
    pub async fn ensure_partitions_for_range(
        &self,
        table: Table,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) {
        if !self.is_partitioned(table).await {
            return;
        }

        let mut cursor = from.date_naive();
        let last = to.date_naive();

        while cursor <= last {
            if let Err(e) = self.catalog.create_day_partition(table, cursor).await {
                warn!(
                    table = %table,
                    day = %cursor,
                    error = %e,
                    "Failed to ensure day partition"
                );
            } else {
                debug!(table = %table, day = %cursor, "Ensured day partition");
            }
            match cursor.checked_add_days(Days::new(1)) {
                Some(next) => cursor = next,
                None => break,
            }
        }
    }

    /// Startup warm-up: for every managed table, ensure partitioned shape
    /// and pre-create yesterday through `today + lookahead` so ingestion
    /// never hits a missing partition right after a day boundary.
    ///
    /// An explicit, awaitable phase - the server awaits it before accepting
    /// traffic and tests can await readiness deterministically.
    pub async fn warmup(&self) {
        if !self.config.enabled {
            return;
        }

        let today = Utc::now();
        let lookahead = self.config.lookahead_days.max(1) as i64;
        let from = today - chrono::Duration::days(1);
        let to = today + chrono::Duration::days(lookahead);

        for table in Table::ALL {
            if self.ensure_partitioned_table(table).await {
                self.ensure_partitions_for_range(table, from, to).await;
            }
        }
    }

    /// List leaf partitions for `table`, oldest first. Empty on error.
    pub async fn list_leaf_partitions(&self, table: Table) -> Vec<PartitionInfo> {
        if !self.is_partitioned(table).await {
            return Vec::new();
        }

        match self.catalog.list_leaf_partitions(table).await {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!(table = %table, error = %e, "Failed to list leaf partitions");
                Vec::new()
            }
        }
    }

    /// Drop every leaf partition whose end is at or before
    /// `now - retention_days`. Returns the number dropped.
    ///
    /// `now` is passed in by the caller (the cleanup job hands in
    /// `Utc::now()`) so retention decisions are reproducible in tests.
    pub async fn drop_partitions_older_than(
        &self,
        table: Table,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> usize {
        if !self.is_partitioned(table).await {
            return 0;
        }

        let cutoff = now - chrono::Duration::days(retention_days as i64);
        let partitions = self.list_leaf_partitions(table).await;

        let mut dropped = 0;
        for partition in partitions {
            if partition.end <= cutoff {
                if self.drop_partition(table, &partition.name).await {
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            info!(
                table = %table,
                dropped,
                retention_days,
                "Dropped partitions past retention"
            );
        }

        dropped
    }

    /// Drop the single oldest leaf partition.
    ///
    /// Emergency space reclamation. Returns `false` when no leaf partitions
    /// exist - the caller falls back to row-level deletion.
    pub async fn drop_oldest_partition(&self, table: Table) -> bool {
        if !self.is_partitioned(table).await {
            return false;
        }

        let partitions = self.list_leaf_partitions(table).await;
        match partitions.first() {
            Some(oldest) => self.drop_partition(table, &oldest.name).await,
            None => false,
        }
    }

    async fn drop_partition(&self, table: Table, name: &str) -> bool {
        match self.catalog.detach_and_drop_partition(table, name).await {
            Ok(()) => {
                info!(table = %table, partition = %name, "Dropped partition");
                true
            }
            Err(e) => {
                warn!(table = %table, partition = %name, error = %e, "Failed to drop partition");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StoreError};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory catalog: a sorted map of partitions per table plus knobs
    /// for simulating unpartitioned tables and storage failures.
    #[derive(Default)]
    struct MockCatalog {
        partitions: Mutex<HashMap<Table, BTreeMap<NaiveDate, PartitionInfo>>>,
        unpartitioned: AtomicBool,
        fail: AtomicBool,
        introspections: AtomicUsize,
        conversions: AtomicUsize,
    }

    impl MockCatalog {
        fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
            let start = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap());
            (start, start + chrono::Duration::days(1))
        }

        fn check_fail(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                Err(StoreError::Migration("simulated failure".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl PartitionCatalog for MockCatalog {
        async fn is_partitioned(&self, _table: Table) -> Result<bool> {
            self.introspections.fetch_add(1, Ordering::SeqCst);
            self.check_fail()?;
            Ok(!self.unpartitioned.load(Ordering::SeqCst))
        }

        async fn convert_to_partitioned(&self, _table: Table) -> Result<()> {
            self.check_fail()?;
            self.conversions.fetch_add(1, Ordering::SeqCst);
            self.unpartitioned.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn create_day_partition(&self, table: Table, day: NaiveDate) -> Result<()> {
            self.check_fail()?;
            let (start, end) = Self::day_bounds(day);
            self.partitions
                .lock()
                .unwrap()
                .entry(table)
                .or_default()
                .entry(day)
                .or_insert(PartitionInfo {
                    name: partition_name(table, day),
                    start,
                    end,
                });
            Ok(())
        }

        async fn list_leaf_partitions(&self, table: Table) -> Result<Vec<PartitionInfo>> {
            self.check_fail()?;
            Ok(self
                .partitions
                .lock()
                .unwrap()
                .get(&table)
                .map(|days| days.values().cloned().collect())
                .unwrap_or_default())
        }

        async fn detach_and_drop_partition(&self, table: Table, name: &str) -> Result<()> {
            self.check_fail()?;
            let mut partitions = self.partitions.lock().unwrap();
            if let Some(days) = partitions.get_mut(&table) {
                days.retain(|_, p| p.name != name);
            }
            Ok(())
        }
    }

    fn manager(catalog: Arc<MockCatalog>) -> PartitionManager {
        PartitionManager::new(catalog, PartitionConfig::default())
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(day: NaiveDate) -> DateTime<Utc> {
        Utc.from_utc_datetime(&day.and_hms_opt(12, 30, 0).unwrap())
    }

    #[test]
    fn partition_names_are_date_derived() {
        assert_eq!(
            partition_name(Table::Logs, day(2025, 8, 26)),
            "logs_p20250826"
        );
        assert_eq!(
            partition_name(Table::Events, day(2024, 1, 2)),
            "events_p20240102"
        );
    }

    #[tokio::test]
    async fn ensure_range_creates_contiguous_day_partitions() {
        let catalog = Arc::new(MockCatalog::default());
        let manager = manager(catalog.clone());

        let d0 = day(2025, 8, 1);
        let d3 = day(2025, 8, 4);
        manager
            .ensure_partitions_for_range(Table::Logs, at(d0), at(d3))
            .await;

        let leaves = manager.list_leaf_partitions(Table::Logs).await;
        assert_eq!(leaves.len(), 4);
        assert_eq!(leaves[0].name, "logs_p20250801");
        assert_eq!(leaves[3].name, "logs_p20250804");
        // Contiguous and non-overlapping: each end meets the next start
        for pair in leaves.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(leaves[0].start, Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap());
        assert_eq!(leaves[3].end, Utc.with_ymd_and_hms(2025, 8, 5, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn ensure_range_is_idempotent() {
        let catalog = Arc::new(MockCatalog::default());
        let manager = manager(catalog.clone());

        let d0 = day(2025, 8, 1);
        manager
            .ensure_partitions_for_range(Table::Logs, at(d0), at(day(2025, 8, 3)))
            .await;
        manager
            .ensure_partitions_for_range(Table::Logs, at(d0), at(day(2025, 8, 3)))
            .await;

        assert_eq!(manager.list_leaf_partitions(Table::Logs).await.len(), 3);
    }

    #[tokio::test]
    async fn retention_drops_exactly_the_expired_days() {
        let catalog = Arc::new(MockCatalog::default());
        let manager = manager(catalog.clone());

        // Ten days d0..d9
        let d0 = day(2025, 8, 1);
        let d9 = day(2025, 8, 10);
        manager
            .ensure_partitions_for_range(Table::Logs, at(d0), at(d9))
            .await;

        // Retention 7 evaluated at noon on d9: cutoff is noon d2, so only
        // d0 (ends midnight d1) and d1 (ends midnight d2) are at/past it.
        let dropped = manager
            .drop_partitions_older_than(Table::Logs, 7, at(d9))
            .await;
        assert_eq!(dropped, 2);

        let leaves = manager.list_leaf_partitions(Table::Logs).await;
        assert_eq!(leaves.len(), 8);
        assert_eq!(leaves[0].name, "logs_p20250803");
    }

    #[tokio::test]
    async fn drop_oldest_removes_one_and_signals_empty() {
        let catalog = Arc::new(MockCatalog::default());
        let manager = manager(catalog.clone());

        manager
            .ensure_partitions_for_range(Table::Events, at(day(2025, 8, 1)), at(day(2025, 8, 2)))
            .await;

        assert!(manager.drop_oldest_partition(Table::Events).await);
        assert!(manager.drop_oldest_partition(Table::Events).await);
        // Nothing left: caller should fall back to row-level deletion
        assert!(!manager.drop_oldest_partition(Table::Events).await);
    }

    #[tokio::test]
    async fn introspection_is_cached_until_invalidated() {
        let catalog = Arc::new(MockCatalog::default());
        let manager = manager(catalog.clone());

        assert!(manager.is_partitioned(Table::Logs).await);
        assert!(manager.is_partitioned(Table::Logs).await);
        assert_eq!(catalog.introspections.load(Ordering::SeqCst), 1);

        manager.invalidate().await;
        assert!(manager.is_partitioned(Table::Logs).await);
        assert_eq!(catalog.introspections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_partitioning_never_touches_the_catalog() {
        let catalog = Arc::new(MockCatalog::default());
        let manager = PartitionManager::new(
            catalog.clone(),
            PartitionConfig {
                enabled: false,
                ..Default::default()
            },
        );

        assert!(!manager.is_partitioned(Table::Logs).await);
        assert!(!manager.ensure_partitioned_table(Table::Logs).await);
        manager.warmup().await;
        assert_eq!(catalog.introspections.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_convert_migrates_unpartitioned_table() {
        let catalog = Arc::new(MockCatalog::default());
        catalog.unpartitioned.store(true, Ordering::SeqCst);
        let manager = manager(catalog.clone());

        assert!(manager.ensure_partitioned_table(Table::Logs).await);
        assert_eq!(catalog.conversions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conversion_disabled_degrades_to_unpartitioned() {
        let catalog = Arc::new(MockCatalog::default());
        catalog.unpartitioned.store(true, Ordering::SeqCst);
        let manager = PartitionManager::new(
            catalog.clone(),
            PartitionConfig {
                auto_convert: false,
                ..Default::default()
            },
        );

        assert!(!manager.ensure_partitioned_table(Table::Logs).await);
        assert_eq!(catalog.conversions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn storage_failures_degrade_to_safe_values() {
        let catalog = Arc::new(MockCatalog::default());
        let manager = manager(catalog.clone());

        // Warm the cache, then break storage
        manager
            .ensure_partitions_for_range(Table::Logs, at(day(2025, 8, 1)), at(day(2025, 8, 1)))
            .await;
        catalog.fail.store(true, Ordering::SeqCst);

        assert!(manager.list_leaf_partitions(Table::Logs).await.is_empty());
        assert_eq!(
            manager
                .drop_partitions_older_than(Table::Logs, 0, at(day(2025, 9, 1)))
                .await,
            0
        );
        assert!(!manager.drop_oldest_partition(Table::Logs).await);
    }
}
