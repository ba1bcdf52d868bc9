//! Engine configuration — sizing, durability, compaction, and replication
//! knobs.
//!
//! All tunables live in one plain struct, [`DbConfig`], passed to
//! [`Engine::open`](crate::engine::Engine::open). Out-of-range values are
//! rejected there with `EngineError::InvalidArgument`.

use std::path::PathBuf;
use std::time::Duration;

/// Durability policy for WAL appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Every append writes and fsyncs before resolving.
    Sync,

    /// Appends are batched; a 100 ms timer (or 100 pending writes) triggers
    /// a single fsync covering the whole batch.
    Group,

    /// Like [`SyncPolicy::Group`] with a 10 ms timer, for latency-sensitive
    /// workloads that still want batching.
    Periodic,
}

impl SyncPolicy {
    /// Flush timer for the batching policies; `None` for [`SyncPolicy::Sync`].
    pub(crate) fn flush_interval(self) -> Option<Duration> {
        match self {
            SyncPolicy::Sync => None,
            SyncPolicy::Group => Some(Duration::from_millis(100)),
            SyncPolicy::Periodic => Some(Duration::from_millis(10)),
        }
    }
}

/// Replication role of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationRole {
    /// No replication.
    Standalone,

    /// Push every committed WAL record to the configured backup.
    Primary {
        /// `host:port` of the backup's replication listener.
        backup_addr: String,

        /// Connect timeout in milliseconds.
        connect_timeout_ms: u64,

        /// Fixed delay between reconnect attempts in milliseconds.
        reconnect_interval_ms: u64,
    },

    /// Accept a single primary connection and apply its records locally.
    Backup {
        /// `host:port` to listen on. Port 0 binds an ephemeral port.
        listen_addr: String,
    },
}

/// Configuration for an [`Engine`](crate::engine::Engine) instance.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Root directory for all persistent state (`wal/`, `sstables/`,
    /// `MANIFEST`).
    pub data_dir: PathBuf,

    /// Max active-memtable footprint (bytes) before it is swapped out and
    /// flushed.
    pub memtable_size_limit: usize,

    /// WAL durability policy.
    pub sync_policy: SyncPolicy,

    /// One sparse-index entry per this many SSTable data entries. Must be
    /// in `1..=1000`.
    pub sparse_index_interval: usize,

    /// Target bloom filter false-positive rate, exclusive `(0, 1)`.
    pub bloom_fpr: f64,

    /// Number of live SSTables that makes a compaction eligible.
    pub compaction_threshold: usize,

    /// Period of the background compaction check, in milliseconds.
    pub compaction_check_interval_ms: u64,

    /// Replication role and peer addressing.
    pub replication: ReplicationRole,
}

impl DbConfig {
    /// Default memtable size limit: 4 MiB.
    pub const DEFAULT_MEMTABLE_SIZE_LIMIT: usize = 4 * 1024 * 1024;

    /// Default sparse index interval.
    pub const DEFAULT_SPARSE_INDEX_INTERVAL: usize = 10;

    /// Default bloom filter false-positive rate.
    pub const DEFAULT_BLOOM_FPR: f64 = 0.01;

    /// Default compaction threshold.
    pub const DEFAULT_COMPACTION_THRESHOLD: usize = 4;

    /// Default compaction check interval: one minute.
    pub const DEFAULT_COMPACTION_CHECK_INTERVAL_MS: u64 = 60_000;

    /// A standalone configuration rooted at `data_dir` with all defaults.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            memtable_size_limit: Self::DEFAULT_MEMTABLE_SIZE_LIMIT,
            sync_policy: SyncPolicy::Group,
            sparse_index_interval: Self::DEFAULT_SPARSE_INDEX_INTERVAL,
            bloom_fpr: Self::DEFAULT_BLOOM_FPR,
            compaction_threshold: Self::DEFAULT_COMPACTION_THRESHOLD,
            compaction_check_interval_ms: Self::DEFAULT_COMPACTION_CHECK_INTERVAL_MS,
            replication: ReplicationRole::Standalone,
        }
    }

    /// Validates every knob, returning a description of the first violation.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.memtable_size_limit == 0 {
            return Err("memtable_size_limit must be positive".into());
        }
        if !(1..=1000).contains(&self.sparse_index_interval) {
            return Err(format!(
                "sparse_index_interval {} out of range 1..=1000",
                self.sparse_index_interval
            ));
        }
        if !(self.bloom_fpr > 0.0 && self.bloom_fpr < 1.0) {
            return Err(format!("bloom_fpr {} out of range (0, 1)", self.bloom_fpr));
        }
        if self.compaction_threshold < 2 {
            return Err("compaction_threshold must be at least 2".into());
        }
        if self.compaction_check_interval_ms == 0 {
            return Err("compaction_check_interval_ms must be positive".into());
        }
        match &self.replication {
            ReplicationRole::Standalone => {}
            ReplicationRole::Primary {
                backup_addr,
                connect_timeout_ms,
                reconnect_interval_ms,
            } => {
                if backup_addr.is_empty() {
                    return Err("primary role requires a backup address".into());
                }
                if *connect_timeout_ms == 0 || *reconnect_interval_ms == 0 {
                    return Err("replication timeouts must be positive".into());
                }
            }
            ReplicationRole::Backup { listen_addr } => {
                if listen_addr.is_empty() {
                    return Err("backup role requires a listen address".into());
                }
            }
        }
        Ok(())
    }
}
