//! Buffer Configuration
//!
//! Tunables for the ingest buffer. The defaults match the reference
//! deployment and are not load-bearing for correctness: a smaller batch
//! size just flushes more often, a smaller capacity rejects earlier.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Items per flush batch (default: 1000). Reaching this many queued
    /// items also triggers an immediate asynchronous flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Timer period driving low-traffic flushes (default: 2000ms).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Hard ceiling on queued items (default: 10000). `add` returns `false`
    /// once reached.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            capacity: default_capacity(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_capacity() -> usize {
    10_000
}
