//! In-Memory Ingest Buffer
//!
//! Accepts individual log/event items from the HTTP boundary, batches them,
//! and persists batches through the storage handle. The buffer exclusively
//! owns queued items until they are handed to storage.
//!
//! ## Concurrency model
//!
//! `add` is a synchronous fast path: one short queue-lock acquisition, no
//! suspension, which is why the hard capacity ceiling exists instead of an
//! unbounded queue. `flush` suspends at every storage call; the
//! single-flight flag keeps a second non-forced flush from running while
//! one is in progress. The batch splice happens atomically before the first
//! suspension point, so concurrent `add` calls keep appending to the queue
//! the flush already spliced from.
//!
//! ## Ordering
//!
//! FIFO within a batch; a failed batch is pushed back onto the front of the
//! queue (order preserved) and retried before anything queued behind it.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use loghouse_core::fingerprint::{fingerprint, truncate_chars, MAX_PATTERN_LEN};
use loghouse_core::{EventItem, EventRow, GroupDelta, LogItem, LogRow, QueueItem};
use loghouse_store::{EventStore, PartitionManager, Table};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::BufferConfig;
use crate::notify::{NotificationSink, NotifyAccumulator, NotifyCounts};

/// The ingest queue. Shared as `Arc<IngestBuffer>` between the HTTP
/// handlers, the flush timer, and the shutdown path.
pub struct IngestBuffer {
    queue: Mutex<VecDeque<QueueItem>>,
    flushing: AtomicBool,
    notify_scheduled: AtomicBool,
    notifications: NotifyAccumulator,
    store: Arc<dyn EventStore>,
    partitions: Arc<PartitionManager>,
    sink: Arc<dyn NotificationSink>,
    config: BufferConfig,
}

impl IngestBuffer {
    pub fn new(
        store: Arc<dyn EventStore>,
        partitions: Arc<PartitionManager>,
        sink: Arc<dyn NotificationSink>,
        config: BufferConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            notify_scheduled: AtomicBool::new(false),
            notifications: NotifyAccumulator::default(),
            store,
            partitions,
            sink,
            config,
        })
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        // A panic while holding this lock cannot leave the queue in a
        // torn state, so poisoning is not propagated.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queued item count.
    pub fn len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_queue().is_empty()
    }

    /// Capacity minus current length.
    ///
    /// The boundary layer uses this to reject an entire multi-item request
    /// atomically instead of partially admitting it.
    pub fn remaining_capacity(&self) -> usize {
        self.config.capacity.saturating_sub(self.len())
    }

    /// Enqueue one item.
    ///
    /// Returns `false` without enqueueing when the queue is at capacity -
    /// the backpressure signal. Callers must treat `false` as "retry
    /// later", never as silent success. Reaching the batch-size threshold
    /// triggers an asynchronous flush; the caller is never blocked.
    pub fn add(self: &Arc<Self>, item: QueueItem) -> bool {
        let trigger_flush = {
            let mut queue = self.lock_queue();
            if queue.len() >= self.config.capacity {
                let len = queue.len();
                drop(queue);
                // Expected under load: a warning, not an error.
                warn!(project_id = %item.project_id(), len, "Queue full, rejecting item");
                return false;
            }
            queue.push_back(item);
            queue.len() >= self.config.batch_size
        };

        if trigger_flush {
            self.spawn_flush(false);
        }
        true
    }

    fn spawn_flush(self: &Arc<Self>, force: bool) {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            buffer.flush(force).await;
        });
    }

    /// Drain up to one batch from the head of the queue and persist it.
    ///
    /// Single-flight: a non-forced call while another flush is running is a
    /// no-op; the in-flight flush (or the next timer tick) picks up newly
    /// added items. A forced call waits for the in-flight flush to finish
    /// first, so batches always leave in arrival order even during the
    /// shutdown drain. Nothing propagates out of here - storage failures
    /// re-queue the batch at the front, or drop it with an error log when
    /// re-queueing would exceed capacity.
    pub async fn flush(self: &Arc<Self>, force: bool) {
        if force {
            while self.flushing.swap(true, Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        } else if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        let batch: Vec<QueueItem> = {
            let mut queue = self.lock_queue();
            let take = queue.len().min(self.config.batch_size);
            queue.drain(..take).collect()
        };

        if batch.is_empty() {
            self.flushing.store(false, Ordering::SeqCst);
            return;
        }

        debug!(batch = batch.len(), "Flushing batch");

        // The clone keeps the pristine batch for re-queueing; the write
        // path annotates its own copy with fingerprints.
        match self.write_batch(batch.clone()).await {
            Ok(counts) => {
                info!(flushed = batch.len(), "Flushed batch");
                self.notifications.merge(counts);
                self.schedule_notify_drain();
            }
            Err(e) => {
                error!(error = %e, batch = batch.len(), "Flush failed");
                let mut queue = self.lock_queue();
                if queue.len() + batch.len() <= self.config.capacity {
                    warn!(requeued = batch.len(), "Re-queueing failed batch at the front");
                    for item in batch.into_iter().rev() {
                        queue.push_front(item);
                    }
                } else {
                    // Documented policy: bounded memory beats unbounded
                    // growth under a sustained storage outage.
                    error!(dropped = batch.len(), "Dropping failed batch, queue full");
                }
            }
        }

        self.flushing.store(false, Ordering::SeqCst);

        // Drain fast under sustained load instead of waiting for the timer.
        if self.len() >= self.config.batch_size {
            self.spawn_flush(false);
        }
    }

    /// Fingerprint, ensure partitions, and write one batch.
    async fn write_batch(
        &self,
        mut batch: Vec<QueueItem>,
    ) -> loghouse_store::Result<HashMap<String, NotifyCounts>> {
        let mut log_rows: Vec<LogRow> = Vec::new();
        let mut event_rows: Vec<EventRow> = Vec::new();
        let mut deltas: HashMap<(String, String), GroupDelta> = HashMap::new();
        let mut counts: HashMap<String, NotifyCounts> = HashMap::new();
        let mut span: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

        for item in &mut batch {
            let ts = item.timestamp();
            span = Some(match span {
                Some((min, max)) => (min.min(ts), max.max(ts)),
                None => (ts, ts),
            });

            let project_counts = counts.entry(item.project_id().to_string()).or_default();
            project_counts.count += 1;
            if item.is_critical() {
                project_counts.critical_count += 1;
            }

            match item {
                QueueItem::Log(log) => {
                    let fp = fingerprint(&log.message);
                    match deltas.entry((log.project_id.clone(), fp.hash.clone())) {
                        Entry::Occupied(mut occupied) => {
                            let delta = occupied.get_mut();
                            delta.count += 1;
                            delta.first_seen = delta.first_seen.min(log.timestamp);
                            delta.last_seen = delta.last_seen.max(log.timestamp);
                        }
                        Entry::Vacant(vacant) => {
                            vacant.insert(GroupDelta {
                                project_id: log.project_id.clone(),
                                fingerprint: fp.hash.clone(),
                                pattern: fp.pattern.clone(),
                                example_message: truncate_chars(&log.message, MAX_PATTERN_LEN),
                                level: log.level.clone(),
                                count: 1,
                                first_seen: log.timestamp,
                                last_seen: log.timestamp,
                            });
                        }
                    }
                    log.fingerprint = Some(fp);
                    log_rows.push(log_row(log));
                }
                QueueItem::Event(event) => event_rows.push(event_row(event)),
            }
        }

        // Ensure every day partition touched by the batch span exists
        // before writing anything: a batch straddling midnight or carrying
        // backdated timestamps must never fail on a missing partition.
        if let Some((min, max)) = span {
            if !log_rows.is_empty() {
                self.partitions
                    .ensure_partitions_for_range(Table::Logs, min, max)
                    .await;
            }
            if !event_rows.is_empty() {
                self.partitions
                    .ensure_partitions_for_range(Table::Events, min, max)
                    .await;
            }
        }

        let deltas: Vec<GroupDelta> = deltas.into_values().collect();
        self.store.upsert_groups(&deltas).await?;
        self.store.insert_logs(&log_rows).await?;
        self.store.insert_events(&event_rows).await?;

        Ok(counts)
    }

    /// Schedule one accumulator drain to run after the current flush wave
    /// unwinds, collapsing rapid flushes into one broadcast per project.
    fn schedule_notify_drain(self: &Arc<Self>) {
        if self.notify_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            buffer.notify_scheduled.store(false, Ordering::SeqCst);
            for (project_id, counts) in buffer.notifications.drain() {
                buffer.sink.broadcast(&project_id, "new_logs", counts);
            }
        });
    }

    /// Start the recurring flush timer. Ticks call `flush(false)`
    /// unconditionally so low-traffic batches below the size threshold are
    /// still persisted within a bounded latency.
    pub fn start(self: &Arc<Self>, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(buffer.config.flush_interval_ms));
            let mut shutdown_rx = shutdown_rx;

            info!(
                interval_ms = buffer.config.flush_interval_ms,
                batch_size = buffer.config.batch_size,
                capacity = buffer.config.capacity,
                "Ingest buffer timer started"
            );

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        buffer.flush(false).await;
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Ingest buffer timer stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Final drain on graceful shutdown: forced flushes, awaited, until the
    /// queue is empty or a pass makes no progress (a wedged store must not
    /// hang shutdown forever). The only buffer path that is allowed to
    /// block. Loss on ungraceful termination is accepted.
    pub async fn shutdown(self: &Arc<Self>) {
        info!(remaining = self.len(), "Draining ingest buffer for shutdown");
        loop {
            let before = self.len();
            if before == 0 {
                break;
            }
            self.flush(true).await;
            let after = self.len();
            if after >= before {
                error!(remaining = after, "Shutdown drain made no progress, abandoning buffered items");
                break;
            }
        }
    }
}

fn log_row(item: &LogItem) -> LogRow {
    LogRow {
        project_id: item.project_id.clone(),
        source: item.source,
        trace_id: item.trace_id.clone(),
        span_id: item.span_id.clone(),
        level: item.level.clone(),
        message: item.message.clone(),
        fingerprint: item
            .fingerprint
            .as_ref()
            .map(|fp| fp.hash.clone())
            .unwrap_or_default(),
        data: serde_json::Value::Object(item.data.clone()),
        timestamp: item.timestamp,
    }
}

fn event_row(item: &EventItem) -> EventRow {
    EventRow {
        project_id: item.project_id.clone(),
        source: item.source,
        trace_id: item.trace_id.clone(),
        span_id: item.span_id.clone(),
        name: item.message.clone(),
        event_type: item.event_type.clone(),
        user_id: item.user_id.clone(),
        session_id: item.session_id.clone(),
        value: item.value.clone(),
        data: serde_json::Value::Object(item.data.clone()),
        timestamp: item.timestamp,
    }
}
