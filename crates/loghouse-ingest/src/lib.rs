//! Loghouse Ingest Buffer
//!
//! The central stateful component of the ingest core: an in-memory queue
//! that absorbs bursty write traffic, batches it, fingerprints log messages,
//! hands the partition manager range hints, writes batches to the store, and
//! emits coalesced per-project notifications.
//!
//! ## Data flow
//!
//! ```text
//! HTTP handler ─ add(item) ─► [ VecDeque ] ─ size / timer ─► flush
//!                                               │
//!             fingerprint logs ── ensure day partitions ── upsert groups
//!                                               │
//!                        insert log rows ── insert event rows
//!                                               │
//!                        coalesced counts ──► NotificationSink
//! ```
//!
//! ## Backpressure
//!
//! `add` never suspends and never grows the queue past the capacity
//! ceiling: at capacity it returns `false`, which the HTTP boundary maps to
//! a retryable 429. Under a sustained storage outage the system degrades in
//! that order - growing flush latency, then rejections, then documented
//! drops - never an unhandled crash of the ingest path.

pub mod buffer;
pub mod config;
pub mod notify;

pub use buffer::IngestBuffer;
pub use config::BufferConfig;
pub use notify::{NotificationSink, NotifyCounts};
