//! Retention and Space Reclamation
//!
//! Hourly background job with two duties:
//!
//! 1. **Retention**: drop every day partition whose data is entirely older
//!    than the configured retention window. Partition drops are metadata
//!    operations and reclaim disk immediately; when a table is not
//!    partitioned the job falls back to a row-level `DELETE` below the
//!    cutoff.
//! 2. **Emergency reclamation**: when the database exceeds a configured
//!    soft size limit, drop the oldest partition of each table (or, for
//!    unpartitioned tables, delete the oldest rows in bounded batches)
//!    until the next pass re-evaluates.
//!
//! Every operation is best-effort: a failing pass logs and waits for the
//! next tick. The job never touches the ingest path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use loghouse_store::{EventStore, PartitionManager, Table};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Rows deleted per emergency pass on an unpartitioned table. Bounded so a
/// single pass never holds a long-running delete transaction.
const EMERGENCY_DELETE_BATCH: i64 = 5000;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub retention_days: u32,
    /// Database size that triggers emergency reclamation; `0` disables it.
    pub soft_limit_bytes: i64,
}

pub struct CleanupJob {
    store: Arc<dyn EventStore>,
    partitions: Arc<PartitionManager>,
    config: CleanupConfig,
}

impl CleanupJob {
    pub fn new(
        store: Arc<dyn EventStore>,
        partitions: Arc<PartitionManager>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            store,
            partitions,
            config,
        }
    }

    /// Start the hourly tick. The first pass runs immediately so a restart
    /// never postpones overdue retention by an hour.
    pub fn start(self: &Arc<Self>, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        let job = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(CLEANUP_INTERVAL);
            let mut shutdown_rx = shutdown_rx;

            info!(
                retention_days = job.config.retention_days,
                soft_limit_bytes = job.config.soft_limit_bytes,
                "Cleanup job started"
            );

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        job.run_once(Utc::now()).await;
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Cleanup job stopped");
                        break;
                    }
                }
            }
        })
    }

    /// One full pass: retention on both tables, then the soft-limit check.
    ///
    /// `now` is injected so retention decisions are reproducible in tests.
    pub async fn run_once(&self, now: DateTime<Utc>) {
        for table in Table::ALL {
            self.enforce_retention(table, now).await;
        }
        self.reclaim_space().await;
    }

    async fn enforce_retention(&self, table: Table, now: DateTime<Utc>) {
        if self.partitions.is_partitioned(table).await {
            self.partitions
                .drop_partitions_older_than(table, self.config.retention_days, now)
                .await;
            return;
        }

        let cutoff = now - chrono::Duration::days(self.config.retention_days as i64);
        match self.store.delete_rows_older_than(table, cutoff).await {
            Ok(deleted) if deleted > 0 => {
                info!(table = %table, deleted, "Deleted rows past retention");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(table = %table, error = %e, "Row-level retention delete failed");
            }
        }
    }

    async fn reclaim_space(&self) {
        if self.config.soft_limit_bytes <= 0 {
            return;
        }

        let size = match self.store.database_size_bytes().await {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "Unable to read database size, skipping reclamation check");
                return;
            }
        };

        if size <= self.config.soft_limit_bytes {
            return;
        }

        warn!(
            size_bytes = size,
            soft_limit_bytes = self.config.soft_limit_bytes,
            "Database over soft size limit, reclaiming oldest data"
        );

        for table in Table::ALL {
            if self.partitions.drop_oldest_partition(table).await {
                continue;
            }
            // No leaf partitions to drop: delete oldest rows instead
            match self
                .store
                .delete_oldest_rows(table, EMERGENCY_DELETE_BATCH)
                .await
            {
                Ok(deleted) if deleted > 0 => {
                    info!(table = %table, deleted, "Deleted oldest rows to reclaim space");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(table = %table, error = %e, "Emergency row delete failed");
                }
            }
        }
    }
}
