//! Loghouse Core Types
//!
//! This crate holds the data model shared by every other Loghouse crate plus
//! the fingerprint engine that turns raw log messages into stable group keys.
//!
//! ## Contents
//!
//! - [`QueueItem`]: the tagged union (log or event) that flows from the HTTP
//!   boundary through the ingest buffer into storage. The kind is decided
//!   exactly once, at the boundary, and never re-inferred downstream.
//! - [`LogRow`] / [`EventRow`] / [`GroupDelta`]: the persisted shapes handed
//!   to the storage layer during a flush.
//! - [`fingerprint`]: pure, deterministic message normalization + hashing.
//!   No I/O, no async, no dependencies on the rest of the workspace.

pub mod fingerprint;
pub mod record;

pub use fingerprint::{fingerprint, Fingerprint, MAX_PATTERN_LEN};
pub use record::{EventItem, EventRow, GroupDelta, LogItem, LogRow, QueueItem, Source};
