//! Environment-Sourced Configuration
//!
//! All configuration comes from environment variables:
//!
//! - `LOGHOUSE_ADDR`: bind address (default: 0.0.0.0:4000)
//! - `DATABASE_URL`: Postgres connection string (required)
//! - `LOGHOUSE_PARTITIONING`: enable day partitioning (default: true)
//! - `LOGHOUSE_PARTITION_AUTOCONVERT`: migrate unpartitioned tables on
//!   startup (default: true)
//! - `LOGHOUSE_PARTITION_LOOKAHEAD_DAYS`: days pre-created past today
//!   during warm-up (default: 1)
//! - `LOGHOUSE_RETENTION_DAYS`: age at which partitions are dropped
//!   (default: 14)
//! - `LOGHOUSE_BATCH_SIZE`: ingest flush batch size (default: 1000)
//! - `LOGHOUSE_FLUSH_INTERVAL_MS`: ingest flush timer (default: 2000)
//! - `LOGHOUSE_QUEUE_CAPACITY`: ingest queue ceiling (default: 10000)
//! - `LOGHOUSE_SOFT_LIMIT_BYTES`: database size that triggers emergency
//!   space reclamation, 0 disables it (default: 0)
//!
//! Unparseable values fall back to the default with a warning rather than
//! refusing to start.

use std::env;
use std::str::FromStr;

use loghouse_ingest::BufferConfig;
use loghouse_store::PartitionConfig;
use tracing::warn;

use crate::cleanup::CleanupConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub database_url: String,
    pub partitioning: bool,
    pub partition_autoconvert: bool,
    pub partition_lookahead_days: u32,
    pub retention_days: u32,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue_capacity: usize,
    pub soft_limit_bytes: i64,
}

impl ServerConfig {
    /// Read configuration from the environment. Only `DATABASE_URL` is
    /// required.
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Self {
            addr: env::var("LOGHOUSE_ADDR").unwrap_or_else(|_| "0.0.0.0:4000".to_string()),
            database_url: env::var("DATABASE_URL")?,
            partitioning: env_parse("LOGHOUSE_PARTITIONING", true),
            partition_autoconvert: env_parse("LOGHOUSE_PARTITION_AUTOCONVERT", true),
            partition_lookahead_days: env_parse("LOGHOUSE_PARTITION_LOOKAHEAD_DAYS", 1),
            retention_days: env_parse("LOGHOUSE_RETENTION_DAYS", 14),
            batch_size: env_parse("LOGHOUSE_BATCH_SIZE", 1000),
            flush_interval_ms: env_parse("LOGHOUSE_FLUSH_INTERVAL_MS", 2000),
            queue_capacity: env_parse("LOGHOUSE_QUEUE_CAPACITY", 10_000),
            soft_limit_bytes: env_parse("LOGHOUSE_SOFT_LIMIT_BYTES", 0),
        })
    }

    pub fn buffer(&self) -> BufferConfig {
        BufferConfig {
            batch_size: self.batch_size,
            flush_interval_ms: self.flush_interval_ms,
            capacity: self.queue_capacity,
        }
    }

    pub fn partitions(&self) -> PartitionConfig {
        PartitionConfig {
            enabled: self.partitioning,
            auto_convert: self.partition_autoconvert,
            lookahead_days: self.partition_lookahead_days,
        }
    }

    pub fn cleanup(&self) -> CleanupConfig {
        CleanupConfig {
            retention_days: self.retention_days,
            soft_limit_bytes: self.soft_limit_bytes,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, raw, "Unparseable environment value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
