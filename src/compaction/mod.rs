//! # Compaction Module
//!
//! Background size-tiered compactor: once the number of live SSTables
//! reaches the configured threshold, every live table is merged into one,
//! dropping tombstones and shadowed versions. Fewer, denser tables mean
//! less read amplification and reclaimed space.
//!
//! ## Execution model
//!
//! A dedicated worker thread wakes every `check_interval` (or on an
//! explicit [`Compactor::trigger`], the test hook) and runs at most one
//! compaction at a time; triggers landing mid-run are ignored.
//!
//! ## Commit protocol
//!
//! 1. Snapshot the manifest's table list (at least two tables required).
//! 2. Open a reader per table and run the merge, tombstones filtered out.
//! 3. Stream survivors into a new table under a reserved file number.
//! 4. Publish with one manifest edit `{add: new, remove: inputs}` — the
//!    edit is the commit point.
//! 5. Notify the engine through the completion callback, then unlink the
//!    retired files (a failed unlink is logged, never fatal).
//!
//! When every input entry is a shadowed version or tombstone, no output
//! table is built: the edit only removes, and the store ends up with zero
//! tables.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bloom::BloomFilter;
use crate::engine::merge::{MergeEntry, MergeIterator, MergeSource};
use crate::manifest::{Manifest, ManifestEdit, ManifestError};
use crate::now_millis;
use crate::sstable::{SsTable, SsTableError, SsTableMeta, SsTableWriter};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by a compaction round.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Error from the manifest subsystem.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error reading an input table or writing the output table.
    #[error("sstable error: {0}")]
    SsTable(#[from] SsTableError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Stats & outcome
// ------------------------------------------------------------------------------------------------

/// Counters exposed by [`Compactor::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Completed compaction rounds.
    pub rounds: u64,

    /// Entries written to merged tables across all rounds.
    pub entries_kept: u64,

    /// Input entries dropped as duplicates or tombstones.
    pub entries_dropped: u64,

    /// Wall-clock time of the last completed round, milliseconds since
    /// epoch. Zero before the first round.
    pub last_run_ms: u64,

    /// Whether a round is currently executing.
    pub in_progress: bool,
}

/// What a completed round changed, handed to the engine callback before the
/// retired files are unlinked.
pub struct CompactionOutcome {
    /// The merged table, already opened — `None` when every input entry was
    /// dropped.
    pub added: Option<(SsTableMeta, Arc<SsTable>)>,

    /// File numbers the manifest no longer references.
    pub removed: Vec<u64>,
}

/// Engine-side hook invoked after the manifest edit of each round.
pub type CompactionCallback = Box<dyn Fn(CompactionOutcome) + Send + Sync>;

/// Tuning for the worker, derived from `DbConfig` by the engine.
pub struct CompactionConfig {
    /// Directory holding the table files.
    pub sstable_dir: PathBuf,

    /// Live-table count that makes a periodic check eligible.
    pub threshold: usize,

    /// Period of the background check.
    pub check_interval: Duration,

    /// Sparse-index interval for merged tables.
    pub sparse_index_interval: usize,

    /// Bloom false-positive rate for merged tables.
    pub bloom_fpr: f64,
}

// ------------------------------------------------------------------------------------------------
// Compactor
// ------------------------------------------------------------------------------------------------

enum Control {
    Trigger,
    Stop,
}

struct CompactorShared {
    manifest: Arc<Manifest>,
    config: CompactionConfig,
    callback: CompactionCallback,
    stats: Mutex<CompactionStats>,
    in_progress: AtomicBool,
}

/// Handle to the background compaction worker.
pub struct Compactor {
    shared: Arc<CompactorShared>,
    control_tx: Sender<Control>,
    worker: Option<JoinHandle<()>>,
}

impl Compactor {
    /// Spawns the worker. `callback` fires after each round's manifest edit
    /// with the tables to swap in and out.
    pub fn start(
        manifest: Arc<Manifest>,
        config: CompactionConfig,
        callback: CompactionCallback,
    ) -> Result<Self, CompactionError> {
        let shared = Arc::new(CompactorShared {
            manifest,
            config,
            callback,
            stats: Mutex::new(CompactionStats::default()),
            in_progress: AtomicBool::new(false),
        });

        let (control_tx, control_rx) = channel::unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("coraldb-compaction".into())
            .spawn(move || {
                let interval = worker_shared.config.check_interval;
                loop {
                    match control_rx.recv_timeout(interval) {
                        Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Ok(Control::Trigger) => worker_shared.run_round(true),
                        Err(RecvTimeoutError::Timeout) => worker_shared.run_round(false),
                    }
                }
            })?;

        Ok(Self {
            shared,
            control_tx,
            worker: Some(worker),
        })
    }

    /// Test hook: requests an immediate round, bypassing the threshold
    /// (two live tables still required).
    pub fn trigger(&self) {
        let _ = self.control_tx.send(Control::Trigger);
    }

    /// Like [`Compactor::trigger`], but runs the round on the calling
    /// thread and propagates its error. A no-op when fewer than two tables
    /// are live or a background round is already running.
    pub fn run_now(&self) -> Result<(), CompactionError> {
        if self.shared.manifest.state().sstables.len() < 2 {
            return Ok(());
        }
        if self.shared.in_progress.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.shared.compact_once();
        self.shared.in_progress.store(false, Ordering::Release);
        result
    }

    /// Snapshot of the worker's counters.
    pub fn stats(&self) -> CompactionStats {
        let mut stats = self
            .shared
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.in_progress = self.shared.in_progress.load(Ordering::Acquire);
        stats
    }

    /// Stops the worker and waits for any in-flight round to finish.
    pub fn stop(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        let _ = self.control_tx.send(Control::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl CompactorShared {
    /// One scheduling decision: run a round if eligible and none is active.
    fn run_round(&self, forced: bool) {
        let live = self.manifest.state().sstables.len();
        if !forced && live < self.config.threshold {
            return;
        }
        if live < 2 {
            return;
        }
        if self.in_progress.swap(true, Ordering::AcqRel) {
            warn!("compaction already in progress, ignoring trigger");
            return;
        }

        let result = self.compact_once();
        self.in_progress.store(false, Ordering::Release);

        if let Err(e) = result {
            error!(error = %e, "compaction round failed");
        }
    }

    /// Merges every live table into one. See the module docs for the
    /// commit protocol.
    fn compact_once(&self) -> Result<(), CompactionError> {
        let snapshot = self.manifest.state().sstables;
        if snapshot.len() < 2 {
            return Ok(());
        }
        let removed: Vec<u64> = snapshot.iter().map(|m| m.file_number).collect();
        let input_entries: u64 = snapshot.iter().map(|m| m.entry_count as u64).sum();
        info!(
            inputs = snapshot.len(),
            input_entries, "compaction round started"
        );

        // Snapshot order is newest-first, which is exactly the merge
        // priority order.
        let mut readers = Vec::with_capacity(snapshot.len());
        for meta in &snapshot {
            readers.push(Arc::new(SsTable::open(&meta.file_path)?));
        }
        let sources: Vec<MergeSource<'_>> = readers
            .iter()
            .map(|table| {
                Box::new(table.iter_all().map(|e| MergeEntry {
                    key: e.key,
                    value: e.value,
                    timestamp_ms: e.timestamp_ms,
                    tombstone: e.tombstone,
                })) as MergeSource<'_>
            })
            .collect();
        let merge = MergeIterator::new(sources, true);

        // The filter is sized to the input total — an upper bound on the
        // survivor count, so the measured false-positive rate only improves.
        let file_number = self.manifest.reserve_file_number()?;
        let filter = BloomFilter::with_capacity(input_entries as usize, self.config.bloom_fpr);
        let mut writer = SsTableWriter::new(
            &self.config.sstable_dir,
            file_number,
            self.config.sparse_index_interval,
            Some(filter),
        )?;

        let mut kept: u64 = 0;
        for entry in merge {
            writer.add(&entry.key, &entry.value, entry.timestamp_ms, entry.tombstone)?;
            kept += 1;
        }

        if kept == 0 {
            // Everything was shadowed or deleted: retire the inputs and
            // build nothing.
            writer.abandon();
            self.manifest.apply_edit(ManifestEdit {
                removed_file_numbers: removed.clone(),
                ..Default::default()
            })?;
            (self.callback)(CompactionOutcome {
                added: None,
                removed: removed.clone(),
            });
            self.delete_files(&snapshot);
            self.finish_round(kept, input_entries);
            info!("compaction dropped every input entry");
            return Ok(());
        }

        let meta = writer.build()?;
        let reader = Arc::new(SsTable::open(&meta.file_path)?);
        self.manifest.apply_edit(ManifestEdit {
            added: vec![meta.clone()],
            removed_file_numbers: removed.clone(),
            next_file_number: Some(file_number + 1),
            ..Default::default()
        })?;

        (self.callback)(CompactionOutcome {
            added: Some((meta.clone(), reader)),
            removed: removed.clone(),
        });
        self.delete_files(&snapshot);
        self.finish_round(kept, input_entries);

        info!(
            output = meta.file_number,
            kept,
            dropped = input_entries - kept,
            "compaction round complete"
        );
        Ok(())
    }

    /// Unlinks retired table files. Only called after the manifest edit is
    /// durable; failure leaves an orphan that the next open sweeps.
    fn delete_files(&self, retired: &[SsTableMeta]) {
        for meta in retired {
            if let Err(e) = fs::remove_file(&meta.file_path) {
                warn!(
                    path = %meta.file_path.display(),
                    error = %e,
                    "failed to delete compacted table"
                );
            } else {
                debug!(path = %meta.file_path.display(), "compacted table deleted");
            }
        }
    }

    fn finish_round(&self, kept: u64, input_entries: u64) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.rounds += 1;
            stats.entries_kept += kept;
            stats.entries_dropped += input_entries.saturating_sub(kept);
            stats.last_run_ms = now_millis();
        }
    }
}
