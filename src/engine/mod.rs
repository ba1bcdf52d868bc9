//! # LSM Storage Engine
//!
//! The orchestrator tying every subsystem together: the write path
//! (WAL → active memtable), the read path (active → immutable → SSTables,
//! newest first), double-buffered background flushes, recovery, background
//! compaction, and the optional replication role.
//!
//! ## Write path
//!
//! `put`/`delete`/`batch_put` append to the WAL and return only after the
//! record is durable (one fsync may cover many appends — see
//! [`crate::wal`]). The record is then applied to the active memtable, so
//! a write is visible to readers exactly when its WAL append has resolved.
//!
//! ## Read path
//!
//! `get` consults the active memtable, then the immutable one (if a flush
//! is in flight), then every live SSTable newest-first; the first entry
//! found wins, and a tombstone answers "absent". Range reads merge all
//! layers through the k-way [`merge::MergeIterator`] with the same
//! newest-first priority.
//!
//! ## Flush
//!
//! When the active memtable reaches its size limit, it is swapped for a
//! fresh one and flushed to an SSTable on a background thread — writers
//! never wait on flush I/O. The manifest edit publishes the table, then
//! the WAL is checkpointed: its records are all durable in tables now. A
//! crash between edit and checkpoint merely replays records whose effects
//! the tables already hold — replay is idempotent.
//!
//! ## Recovery
//!
//! [`Engine::open`] loads the manifest, opens every listed table (entries
//! whose file fails to open are retired so state converges), sweeps
//! orphaned table files, replays the WAL into the active memtable, and
//! starts the compactor and the configured replication role.
//!
//! ## Lifecycle
//!
//! `Ready → Closing → Closed`. Every operation checks the state and fails
//! with [`EngineError::State`] outside `Ready`. [`Engine::close`] stops
//! the compactor and replication, drains any in-flight flush, and closes
//! the WAL.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod merge;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::bloom::BloomFilter;
use crate::compaction::{
    CompactionConfig, CompactionError, CompactionOutcome, CompactionStats, Compactor,
};
use crate::config::{DbConfig, ReplicationRole};
use crate::manifest::{Manifest, ManifestEdit, ManifestError};
use crate::memtable::{Memtable, MemtableError};
use crate::replication::{
    BackupMetricsSnapshot, PrimaryMetricsSnapshot, ReplicationBackup, ReplicationError,
    ReplicationPrimary,
};
use crate::sstable::{SsTable, SsTableError, SsTableWriter};
use crate::wal::{LogPayload, LogRecord, Wal, WalError};
use merge::{MergeEntry, MergeIterator, MergeSource};

/// Directory for table files under `data_dir`.
pub const SSTABLE_DIR: &str = "sstables";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A caller-supplied argument was rejected (empty key, invalid config).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine is not in the `Ready` state.
    #[error("engine is {0}")]
    State(&'static str),

    /// Error from the WAL subsystem.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error from the memtable subsystem.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    SsTable(#[from] SsTableError),

    /// Error from the manifest subsystem.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error from the compaction subsystem.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Error from the replication subsystem.
    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Engine state
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Ready,
    Closing,
    Closed,
}

struct EngineInner {
    /// The memtable accepting writes.
    active: Arc<Memtable>,

    /// The swapped-out memtable being flushed; readers consult it between
    /// the active table and the SSTables.
    immutable: Option<Arc<Memtable>>,

    /// Open readers, newest-first by file number, in lock-step with the
    /// manifest.
    sstables: Vec<Arc<SsTable>>,

    /// Guards the single-flush contract.
    flush_in_progress: bool,

    state: EngineState,
}

struct EngineShared {
    config: DbConfig,
    sstable_dir: PathBuf,
    wal: Wal,
    manifest: Arc<Manifest>,
    inner: RwLock<EngineInner>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
    compactor: Mutex<Option<Compactor>>,
    primary: Mutex<Option<ReplicationPrimary>>,
    backup: Mutex<Option<ReplicationBackup>>,
}

/// Snapshot of engine layer sizes returned by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Entries in the active memtable, tombstones included.
    pub active_entries: usize,

    /// Approximate byte footprint of the active memtable.
    pub active_size: usize,

    /// Whether an immutable memtable is awaiting flush.
    pub immutable_present: bool,

    /// Number of live SSTables.
    pub sstable_count: usize,
}

/// The storage engine handle. Cloning shares the same underlying engine.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Engine {
    /// Opens (or creates) the store described by `config`: bootstraps the
    /// directory layout, recovers manifest + tables + WAL, and starts the
    /// background compactor and replication role.
    pub fn open(config: DbConfig) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(EngineError::InvalidArgument)?;

        let sstable_dir = config.data_dir.join(SSTABLE_DIR);
        fs::create_dir_all(&config.data_dir)?;
        fs::create_dir_all(&sstable_dir)?;

        // 1. Manifest first: it names the authoritative table set.
        let manifest = Arc::new(Manifest::open(&config.data_dir)?);

        // 2. Open a reader per listed table; a table that fails to open is
        //    retired so manifest and disk converge.
        let mut sstables = Vec::new();
        let mut retired = Vec::new();
        for meta in manifest.state().sstables {
            match SsTable::open(&meta.file_path) {
                Ok(table) => sstables.push(Arc::new(table)),
                Err(e) => {
                    warn!(
                        path = %meta.file_path.display(),
                        error = %e,
                        "retiring unreadable table from manifest"
                    );
                    retired.push(meta.file_number);
                }
            }
        }
        if !retired.is_empty() {
            manifest.apply_edit(ManifestEdit {
                removed_file_numbers: retired,
                ..Default::default()
            })?;
        }
        sstables.sort_by(|a, b| b.meta.file_number.cmp(&a.meta.file_number));

        // 3. Sweep table files the manifest does not reference (crash
        //    between build and edit, or failed deletes).
        sweep_orphans(&sstable_dir, &manifest)?;

        // 4. WAL replay rebuilds the active memtable; records are applied
        //    directly, never re-appended.
        let (wal, replayed) = Wal::open(&config.data_dir, config.sync_policy)?;
        let active = Arc::new(Memtable::new(config.memtable_size_limit));
        for record in &replayed {
            apply_payload(&active, record)?;
        }
        info!(
            data_dir = %config.data_dir.display(),
            tables = sstables.len(),
            replayed = replayed.len(),
            "engine recovered"
        );

        let shared = Arc::new(EngineShared {
            sstable_dir,
            wal,
            manifest: Arc::clone(&manifest),
            inner: RwLock::new(EngineInner {
                active,
                immutable: None,
                sstables,
                flush_in_progress: false,
                state: EngineState::Ready,
            }),
            flush_handle: Mutex::new(None),
            compactor: Mutex::new(None),
            primary: Mutex::new(None),
            backup: Mutex::new(None),
            config,
        });

        // 5. Background compactor, notifying the engine through a weak
        //    reference so the worker never keeps a closed engine alive.
        let weak = Arc::downgrade(&shared);
        let compactor = Compactor::start(
            manifest,
            CompactionConfig {
                sstable_dir: shared.sstable_dir.clone(),
                threshold: shared.config.compaction_threshold,
                check_interval: Duration::from_millis(shared.config.compaction_check_interval_ms),
                sparse_index_interval: shared.config.sparse_index_interval,
                bloom_fpr: shared.config.bloom_fpr,
            },
            Box::new(move |outcome| {
                if let Some(shared) = weak.upgrade() {
                    shared.absorb_compaction(outcome);
                }
            }),
        )?;
        if let Ok(mut slot) = shared.compactor.lock() {
            *slot = Some(compactor);
        }

        // 6. Replication role.
        match shared.config.replication.clone() {
            ReplicationRole::Standalone => {}
            ReplicationRole::Primary {
                backup_addr,
                connect_timeout_ms,
                reconnect_interval_ms,
            } => {
                let primary = ReplicationPrimary::spawn(
                    backup_addr,
                    Duration::from_millis(connect_timeout_ms),
                    Duration::from_millis(reconnect_interval_ms),
                )?;
                let sender = primary.sender();
                shared
                    .wal
                    .set_commit_listener(Box::new(move |record| sender.enqueue(record.clone())));
                if let Ok(mut slot) = shared.primary.lock() {
                    *slot = Some(primary);
                }
            }
            ReplicationRole::Backup { listen_addr } => {
                let weak = Arc::downgrade(&shared);
                let backup = ReplicationBackup::spawn(
                    &listen_addr,
                    Box::new(move |record: &LogRecord| match weak.upgrade() {
                        Some(shared) => Engine { shared }
                            .apply_replicated_record(record)
                            .map_err(|e| error!(error = %e, "backup apply failed"))
                            .is_ok(),
                        None => false,
                    }),
                )?;
                if let Ok(mut slot) = shared.backup.lock() {
                    *slot = Some(backup);
                }
            }
        }

        Ok(Self { shared })
    }

    /// Inserts or overwrites one key. Resolves once the write is durable.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), EngineError> {
        self.ensure_ready()?;
        validate_key(key)?;

        let record = self.shared.wal.append(LogPayload::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })?;
        self.shared.apply_to_active(&record)?;
        self.shared.maybe_flush()
    }

    /// Deletes one key by writing a tombstone that shadows every layer.
    pub fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.ensure_ready()?;
        validate_key(key)?;

        let record = self
            .shared
            .wal
            .append(LogPayload::Delete { key: key.to_string() })?;
        self.shared.apply_to_active(&record)?;
        self.shared.maybe_flush()
    }

    /// Inserts several keys under one WAL record; entries apply in input
    /// order. Returns the number written.
    pub fn batch_put(&self, entries: &[(String, Vec<u8>)]) -> Result<usize, EngineError> {
        self.ensure_ready()?;
        for (key, _) in entries {
            validate_key(key)?;
        }
        if entries.is_empty() {
            return Ok(0);
        }

        let record = self.shared.wal.append(LogPayload::BatchPut {
            entries: entries.to_vec(),
        })?;
        self.shared.apply_to_active(&record)?;
        self.shared.maybe_flush()?;
        Ok(entries.len())
    }

    /// Point lookup across all layers, newest first. Returns `None` for
    /// missing and deleted keys alike.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        self.ensure_ready()?;
        validate_key(key)?;

        let (active, immutable, tables) = {
            let inner = self.shared.read_inner()?;
            (
                Arc::clone(&inner.active),
                inner.immutable.clone(),
                inner.sstables.clone(),
            )
        };

        if let Some(entry) = active.get(key)? {
            return Ok((!entry.tombstone).then_some(entry.value));
        }
        if let Some(immutable) = immutable {
            if let Some(entry) = immutable.get(key)? {
                return Ok((!entry.tombstone).then_some(entry.value));
            }
        }
        for table in tables {
            if !table.maybe_contains(key) {
                continue;
            }
            if let Some(entry) = table.get(key)? {
                return Ok((!entry.tombstone).then_some(entry.value));
            }
        }
        Ok(None)
    }

    /// All pairs with `start <= key <= end` in ascending order, at most
    /// `limit`, latest value per key, tombstones elided. A reversed range
    /// yields nothing.
    pub fn read_key_range(
        &self,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>, EngineError> {
        self.ensure_ready()?;
        if start > end {
            return Ok(Vec::new());
        }

        let (memtable_layers, tables) = {
            let inner = self.shared.read_inner()?;
            let mut layers = vec![inner.active.range(start, end)?];
            if let Some(immutable) = &inner.immutable {
                layers.push(immutable.range(start, end)?);
            }
            let tables: Vec<Arc<SsTable>> = inner
                .sstables
                .iter()
                .filter(|t| {
                    t.meta.first_key.as_str() <= end && t.meta.last_key.as_str() >= start
                })
                .cloned()
                .collect();
            (layers, tables)
        };

        // Sources newest-first: active, immutable, then tables (already
        // ordered newest-first).
        let mut sources: Vec<MergeSource<'_>> = Vec::new();
        for layer in memtable_layers {
            sources.push(Box::new(layer.into_iter().map(|(key, entry)| MergeEntry {
                key,
                value: entry.value,
                timestamp_ms: entry.timestamp_ms,
                tombstone: entry.tombstone,
            })));
        }
        for table in &tables {
            sources.push(Box::new(table.iter_range(start, end).map(|e| MergeEntry {
                key: e.key,
                value: e.value,
                timestamp_ms: e.timestamp_ms,
                tombstone: e.tombstone,
            })));
        }

        let merged = MergeIterator::new(sources, true);
        let mut out = Vec::new();
        for entry in merged {
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
            out.push((entry.key, entry.value));
        }
        Ok(out)
    }

    /// Backup-side entry point: re-appends the record through the local
    /// WAL (assigning a fresh local sequence) and applies it.
    pub fn apply_replicated_record(&self, record: &LogRecord) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let local = self.shared.wal.append(record.payload.clone())?;
        self.shared.apply_to_active(&local)?;
        self.shared.maybe_flush()
    }

    /// Flushes everything buffered in memory to an SSTable, synchronously.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.ensure_ready()?;
        self.shared.join_flush();

        {
            let mut inner = self.shared.write_inner()?;
            if inner.active.is_empty() && inner.immutable.is_none() {
                return Ok(());
            }
            if inner.flush_in_progress {
                // A background flush slipped in between join and lock; let
                // it finish on its own thread.
                return Ok(());
            }
            if inner.immutable.is_none() {
                let fresh = Arc::new(Memtable::new(self.shared.config.memtable_size_limit));
                let swapped = std::mem::replace(&mut inner.active, fresh);
                inner.immutable = Some(swapped);
            }
            inner.flush_in_progress = true;
        }

        let last_sequence = self.shared.wal.last_sequence();
        let result = self.shared.flush_immutable(last_sequence);
        if result.is_err() {
            if let Ok(mut inner) = self.shared.inner.write() {
                inner.flush_in_progress = false;
            }
        }
        result
    }

    /// Asks the compactor for an immediate round (test hook).
    pub fn trigger_compaction(&self) {
        if let Ok(slot) = self.shared.compactor.lock() {
            if let Some(compactor) = slot.as_ref() {
                compactor.trigger();
            }
        }
    }

    /// Runs one compaction round on the calling thread (test hook).
    pub fn compact_now(&self) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let slot = self
            .shared
            .compactor
            .lock()
            .map_err(|_| EngineError::Internal("mutex poisoned".into()))?;
        match slot.as_ref() {
            Some(compactor) => Ok(compactor.run_now()?),
            None => Ok(()),
        }
    }

    /// Sizes of the in-memory and on-disk layers.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let inner = self.shared.read_inner()?;
        Ok(EngineStats {
            active_entries: inner.active.len(),
            active_size: inner.active.current_size(),
            immutable_present: inner.immutable.is_some(),
            sstable_count: inner.sstables.len(),
        })
    }

    /// Compaction counters, if the compactor is running.
    pub fn compaction_stats(&self) -> Option<CompactionStats> {
        self.shared
            .compactor
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|c| c.stats()))
    }

    /// Primary-side replication counters, when running as a primary.
    pub fn replication_metrics(&self) -> Option<PrimaryMetricsSnapshot> {
        self.shared
            .primary
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|p| p.metrics()))
    }

    /// Backup-side replication counters, when running as a backup.
    pub fn backup_metrics(&self) -> Option<BackupMetricsSnapshot> {
        self.shared
            .backup
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|b| b.metrics()))
    }

    /// The backup's bound replication address, when running as a backup.
    pub fn backup_listen_addr(&self) -> Option<SocketAddr> {
        self.shared
            .backup
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|b| b.local_addr()))
    }

    /// Stops background work, drains any in-flight flush, closes the WAL.
    /// Buffered writes stay in the WAL and are replayed on the next open.
    pub fn close(&self) -> Result<(), EngineError> {
        {
            let mut inner = self.shared.write_inner()?;
            match inner.state {
                EngineState::Closed => return Ok(()),
                EngineState::Closing => return Err(EngineError::State("closing")),
                EngineState::Ready => inner.state = EngineState::Closing,
            }
        }

        if let Ok(mut slot) = self.shared.compactor.lock() {
            if let Some(compactor) = slot.take() {
                compactor.stop();
            }
        }
        if let Ok(mut slot) = self.shared.primary.lock() {
            if let Some(primary) = slot.take() {
                primary.shutdown();
            }
        }
        if let Ok(mut slot) = self.shared.backup.lock() {
            if let Some(backup) = slot.take() {
                backup.shutdown();
            }
        }

        self.shared.join_flush();
        self.shared.wal.close()?;

        {
            let mut inner = self.shared.write_inner()?;
            inner.sstables.clear();
            inner.immutable = None;
            inner.state = EngineState::Closed;
        }
        info!("engine closed");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), EngineError> {
        let inner = self.shared.read_inner()?;
        match inner.state {
            EngineState::Ready => Ok(()),
            EngineState::Closing => Err(EngineError::State("closing")),
            EngineState::Closed => Err(EngineError::State("closed")),
        }
    }
}

impl EngineShared {
    fn read_inner(&self) -> Result<std::sync::RwLockReadGuard<'_, EngineInner>, EngineError> {
        self.inner
            .read()
            .map_err(|_| EngineError::Internal("lock poisoned".into()))
    }

    fn write_inner(&self) -> Result<std::sync::RwLockWriteGuard<'_, EngineInner>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::Internal("lock poisoned".into()))
    }

    /// Applies a committed record to the active memtable.
    fn apply_to_active(&self, record: &LogRecord) -> Result<(), EngineError> {
        let active = Arc::clone(&self.read_inner()?.active);
        apply_payload(&active, record)?;
        Ok(())
    }

    /// Swaps a full active memtable out and schedules the background
    /// flush. A second trigger while one is in flight is dropped with a
    /// warning.
    fn maybe_flush(self: &Arc<Self>) -> Result<(), EngineError> {
        {
            let mut inner = self.write_inner()?;
            if !inner.active.full() {
                return Ok(());
            }
            if inner.flush_in_progress {
                warn!("memtable full while a flush is already in progress");
                return Ok(());
            }
            let fresh = Arc::new(Memtable::new(self.config.memtable_size_limit));
            let swapped = std::mem::replace(&mut inner.active, fresh);
            inner.immutable = Some(swapped);
            inner.flush_in_progress = true;
        }

        let last_sequence = self.wal.last_sequence();
        let shared = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("coraldb-flush".into())
            .spawn(move || {
                if let Err(e) = shared.flush_immutable(last_sequence) {
                    error!(error = %e, "background flush failed");
                    // The data stays readable in the immutable memtable and
                    // durable in the WAL; a later swap retries.
                    if let Ok(mut inner) = shared.inner.write() {
                        inner.flush_in_progress = false;
                    }
                }
            })?;
        if let Ok(mut slot) = self.flush_handle.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Builds one SSTable from the immutable memtable, publishes it, and
    /// checkpoints the WAL. Runs without the engine lock except for the
    /// brief swap windows.
    fn flush_immutable(&self, last_sequence: u64) -> Result<(), EngineError> {
        let snapshot = { self.read_inner()?.immutable.clone() };
        let immutable = match snapshot {
            Some(immutable) => immutable,
            None => {
                let mut inner = self.write_inner()?;
                inner.flush_in_progress = false;
                return Ok(());
            }
        };

        let entries = immutable.sorted_entries()?;
        if entries.is_empty() {
            let mut inner = self.write_inner()?;
            inner.immutable = None;
            inner.flush_in_progress = false;
            return Ok(());
        }

        let file_number = self.manifest.reserve_file_number()?;
        let filter = BloomFilter::with_capacity(entries.len(), self.config.bloom_fpr);
        let mut writer = SsTableWriter::new(
            &self.sstable_dir,
            file_number,
            self.config.sparse_index_interval,
            Some(filter),
        )?;
        for (key, entry) in &entries {
            writer.add(key, &entry.value, entry.timestamp_ms, entry.tombstone)?;
        }
        let meta = writer.build()?;

        // The edit is the commit point; everything after it is cleanup.
        self.manifest.apply_edit(ManifestEdit {
            added: vec![meta.clone()],
            next_file_number: Some(file_number + 1),
            last_flushed_sequence: Some(last_sequence),
            ..Default::default()
        })?;
        let reader = Arc::new(SsTable::open(&meta.file_path)?);

        {
            let mut inner = self.write_inner()?;
            inner.sstables.insert(0, reader);
            inner
                .sstables
                .sort_by(|a, b| b.meta.file_number.cmp(&a.meta.file_number));
        }

        // Everything the WAL holds up to last_sequence is now durable in
        // tables; later records go to the fresh segment.
        self.wal.checkpoint()?;

        {
            let mut inner = self.write_inner()?;
            inner.immutable = None;
            inner.flush_in_progress = false;
        }
        info!(
            file_number,
            entries = meta.entry_count,
            "memtable flushed to SSTable"
        );
        Ok(())
    }

    /// Swaps compaction results into the live reader set.
    fn absorb_compaction(&self, outcome: CompactionOutcome) {
        if let Ok(mut inner) = self.inner.write() {
            inner
                .sstables
                .retain(|t| !outcome.removed.contains(&t.meta.file_number));
            if let Some((_meta, reader)) = outcome.added {
                inner.sstables.insert(0, reader);
                inner
                    .sstables
                    .sort_by(|a, b| b.meta.file_number.cmp(&a.meta.file_number));
            }
        }
    }

    fn join_flush(&self) {
        let handle = self.flush_handle.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn validate_key(key: &str) -> Result<(), EngineError> {
    if key.is_empty() {
        return Err(EngineError::InvalidArgument("empty key".into()));
    }
    Ok(())
}

/// Applies one record's payload to a memtable, using the record's own
/// timestamp so replay reproduces the original entries.
fn apply_payload(memtable: &Memtable, record: &LogRecord) -> Result<(), MemtableError> {
    match &record.payload {
        LogPayload::Put { key, value } => {
            memtable.put(key, value.clone(), record.timestamp_ms)
        }
        LogPayload::Delete { key } => memtable.delete(key, record.timestamp_ms),
        LogPayload::BatchPut { entries } => {
            for (key, value) in entries {
                memtable.put(key, value.clone(), record.timestamp_ms)?;
            }
            Ok(())
        }
    }
}

/// Removes table files (and stale temp files) the manifest does not
/// reference.
fn sweep_orphans(sstable_dir: &PathBuf, manifest: &Manifest) -> Result<(), EngineError> {
    let live: Vec<PathBuf> = manifest
        .state()
        .sstables
        .iter()
        .map(|m| m.file_path.clone())
        .collect();

    for entry in fs::read_dir(sstable_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        let is_table = name.starts_with("sstable-") && name.ends_with(".sst");
        let is_stale_tmp = name.ends_with(".tmp");
        if (is_table || is_stale_tmp) && !live.contains(&path) {
            warn!(path = %path.display(), "removing orphaned table file");
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove orphan");
            }
        }
    }
    Ok(())
}
