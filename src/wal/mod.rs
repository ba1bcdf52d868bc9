//! # Write-Ahead Log Module
//!
//! A durable, append-only log of mutations with a **group-commit** pipeline.
//! Every engine write lands here before it is acknowledged; replay after a
//! crash reconstructs exactly the fsynced prefix.
//!
//! # On-disk layout
//!
//! Segments live under `<data_dir>/wal/` as `wal-<timestamp-ms>.log`, scanned
//! in filename order on replay. Each record is framed as:
//!
//! ```text
//! [frame_len:u32 BE][checksum:u32 BE][sequence:u64][timestamp:u64][op:u8][payload]
//! ```
//!
//! `frame_len` counts the bytes after the checksum field, and the CRC32
//! (IEEE, via [`crc32fast`]) covers exactly those bytes. Payloads:
//!
//! - `Put (1)`: `[key_len:u16][key][value_len:u32][value]`
//! - `Delete (2)`: `[key_len:u16][key]`
//! - `BatchPut (3)`: `[count:u32]` then `count` × put payloads
//!
//! # Durability modes
//!
//! - [`SyncPolicy::Sync`] — each append writes and fsyncs before returning.
//! - [`SyncPolicy::Group`] / [`SyncPolicy::Periodic`] — appends enqueue and
//!   block until a batch flush completes. A flusher thread fires every
//!   100 ms / 10 ms, or immediately once 100 appends are pending. One fsync
//!   covers the batch; every waiter resolves together, or all observe the
//!   failure.
//!
//! # Ordering guarantees
//!
//! - `sequence` is assigned under the state mutex and matches on-disk order.
//! - The commit listener (used by replication) fires only after the fsync
//!   that made a record durable, in sequence order.
//!
//! # Replay & truncation
//!
//! Replay stops at the first torn frame (short read, declared length past
//! end-of-file, or CRC mismatch) and reports the surviving prefix; the
//! segment is truncated to its last valid byte before appends resume.
//!
//! # Checkpoint
//!
//! [`Wal::checkpoint`] drains pending appends, rotates to a fresh
//! timestamped segment, and deletes all prior segments. Callers must ensure
//! everything in the deleted segments is already durable in SSTables.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crc32fast::Hasher as Crc32;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, CodecError};
use crate::config::SyncPolicy;
use crate::now_millis;

/// `frame_len` + `checksum`.
const FRAME_HEADER_SIZE: usize = 8;

/// Pending-append count that triggers an implicit group-commit flush.
const GROUP_COMMIT_MAX_PENDING: usize = 100;

/// Op code for [`LogPayload::Put`].
pub const OP_PUT: u8 = 1;
/// Op code for [`LogPayload::Delete`].
pub const OP_DELETE: u8 = 2;
/// Op code for [`LogPayload::BatchPut`].
pub const OP_BATCH_PUT: u8 = 3;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame or payload decoding error.
    #[error("corrupt record: {0}")]
    Codec(#[from] CodecError),

    /// A frame failed its CRC check.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// An op byte that no record kind claims.
    #[error("unknown op code {0}")]
    UnknownOp(u8),

    /// The batch fsync covering this append failed; nothing in the batch is
    /// durable.
    #[error("group commit flush failed")]
    GroupCommitFailed,

    /// Append after [`Wal::close`].
    #[error("WAL is closed")]
    Closed,

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Record types
// ------------------------------------------------------------------------------------------------

/// The mutation carried by a [`LogRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    /// Insert or overwrite one key.
    Put {
        key: String,
        value: Vec<u8>,
    },

    /// Delete one key.
    Delete {
        key: String,
    },

    /// Insert several keys as one atomic log record.
    BatchPut {
        entries: Vec<(String, Vec<u8>)>,
    },
}

impl LogPayload {
    /// The on-disk / wire op code.
    pub fn op_code(&self) -> u8 {
        match self {
            LogPayload::Put { .. } => OP_PUT,
            LogPayload::Delete { .. } => OP_DELETE,
            LogPayload::BatchPut { .. } => OP_BATCH_PUT,
        }
    }
}

/// One committed WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Strictly increasing within one logical log.
    pub sequence: u64,

    /// Wall-clock milliseconds at append time.
    pub timestamp_ms: u64,

    /// The mutation itself.
    pub payload: LogPayload,
}

/// Callback fired after each durable append, in sequence order.
pub type CommitListener = Box<dyn Fn(&LogRecord) + Send + Sync>;

// ------------------------------------------------------------------------------------------------
// Record body codec (shared with the replication wire format)
// ------------------------------------------------------------------------------------------------

/// Encodes `[sequence][timestamp][op][payload]` — the CRC-covered frame body.
pub(crate) fn encode_record_body(record: &LogRecord, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    buf.extend_from_slice(&record.sequence.to_be_bytes());
    buf.extend_from_slice(&record.timestamp_ms.to_be_bytes());
    buf.push(record.payload.op_code());
    match &record.payload {
        LogPayload::Put { key, value } => {
            codec::put_key(buf, key)?;
            codec::put_value(buf, value)?;
        }
        LogPayload::Delete { key } => {
            codec::put_key(buf, key)?;
        }
        LogPayload::BatchPut { entries } => {
            let count = u32::try_from(entries.len()).map_err(|_| {
                CodecError::LengthOverflow(format!("batch of {} entries", entries.len()))
            })?;
            buf.extend_from_slice(&count.to_be_bytes());
            for (key, value) in entries {
                codec::put_key(buf, key)?;
                codec::put_value(buf, value)?;
            }
        }
    }
    Ok(())
}

/// Decodes a frame body produced by [`encode_record_body`].
pub(crate) fn decode_record_body(body: &[u8]) -> Result<LogRecord, WalError> {
    let mut at = 0;
    let sequence = codec::take_u64(body, &mut at)?;
    let timestamp_ms = codec::take_u64(body, &mut at)?;
    let op = codec::take_u8(body, &mut at)?;

    let payload = match op {
        OP_PUT => {
            let key = codec::take_key(body, &mut at)?;
            let value = codec::take_value(body, &mut at)?;
            LogPayload::Put { key, value }
        }
        OP_DELETE => {
            let key = codec::take_key(body, &mut at)?;
            LogPayload::Delete { key }
        }
        OP_BATCH_PUT => {
            let count = codec::take_u32(body, &mut at)? as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let key = codec::take_key(body, &mut at)?;
                let value = codec::take_value(body, &mut at)?;
                entries.push((key, value));
            }
            LogPayload::BatchPut { entries }
        }
        other => return Err(WalError::UnknownOp(other)),
    };

    Ok(LogRecord {
        sequence,
        timestamp_ms,
        payload,
    })
}

fn crc32(body: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(body);
    hasher.finalize()
}

/// Encodes a full frame: `[len][crc][body]`.
fn encode_frame(record: &LogRecord) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::new();
    encode_record_body(record, &mut body)?;
    let len = u32::try_from(body.len())
        .map_err(|_| CodecError::LengthOverflow(format!("frame body of {} bytes", body.len())))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&crc32(&body).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

enum CommitOutcome {
    Durable,
    Failed,
}

struct PendingAppend {
    frame: Vec<u8>,
    record: LogRecord,
    done_tx: Sender<CommitOutcome>,
}

struct WalState {
    file: File,
    segment_path: PathBuf,
    next_sequence: u64,
    pending: Vec<PendingAppend>,
}

struct WalShared {
    dir: PathBuf,
    policy: SyncPolicy,
    state: Mutex<WalState>,
    wake_tx: Sender<()>,
    listener: RwLock<Option<CommitListener>>,
    shutdown: AtomicBool,
}

/// The write-ahead log: one logical writer, group-commit batching, replay.
pub struct Wal {
    shared: Arc<WalShared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Opens the log directory, replays every surviving record, truncates
    /// any torn tail, and readies the newest segment for appends.
    ///
    /// Returns the WAL handle plus the replayed records, oldest first. The
    /// next sequence number continues after the highest replayed one.
    pub fn open(data_dir: &Path, policy: SyncPolicy) -> Result<(Self, Vec<LogRecord>), WalError> {
        let dir = data_dir.join("wal");
        fs::create_dir_all(&dir)?;

        let mut segments = list_segments(&dir)?;
        segments.sort();

        let mut records = Vec::new();
        let mut open_segment: Option<(PathBuf, u64)> = None;

        for (idx, segment) in segments.iter().enumerate() {
            let (mut segment_records, valid_len, clean) = scan_segment(segment)?;
            records.append(&mut segment_records);

            if !clean {
                warn!(
                    segment = %segment.display(),
                    valid_len,
                    "torn tail in WAL segment, truncating and ignoring later segments"
                );
                for stale in &segments[idx + 1..] {
                    warn!(segment = %stale.display(), "removing WAL segment past torn tail");
                    fs::remove_file(stale)?;
                }
                open_segment = Some((segment.clone(), valid_len));
                break;
            }
            open_segment = Some((segment.clone(), valid_len));
        }

        let (segment_path, file) = match open_segment {
            Some((path, valid_len)) => {
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                if file.metadata()?.len() > valid_len {
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                }
                (path, file)
            }
            None => create_segment(&dir, now_millis())?,
        };

        let next_sequence = records.last().map(|r| r.sequence + 1).unwrap_or(1);
        info!(
            dir = %dir.display(),
            segment = %segment_path.display(),
            replayed = records.len(),
            next_sequence,
            "WAL opened"
        );

        let (wake_tx, wake_rx) = channel::bounded::<()>(1);
        let shared = Arc::new(WalShared {
            dir,
            policy,
            state: Mutex::new(WalState {
                file,
                segment_path,
                next_sequence,
                pending: Vec::new(),
            }),
            wake_tx,
            listener: RwLock::new(None),
            shutdown: AtomicBool::new(false),
        });

        let flusher = match policy.flush_interval() {
            Some(interval) => {
                let shared = Arc::clone(&shared);
                let handle = std::thread::Builder::new()
                    .name("coraldb-wal-flush".into())
                    .spawn(move || {
                        loop {
                            match wake_rx.recv_timeout(interval) {
                                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                            shared.flush_pending();
                            if shared.shutdown.load(Ordering::Acquire) {
                                break;
                            }
                        }
                        // Final drain for appends racing shutdown.
                        shared.flush_pending();
                    })?;
                Some(handle)
            }
            None => None,
        };

        Ok((
            Self {
                shared,
                flusher: Mutex::new(flusher),
            },
            records,
        ))
    }

    /// Registers the commit listener. At most one listener is supported;
    /// setting a new one replaces the old.
    pub fn set_commit_listener(&self, listener: CommitListener) {
        if let Ok(mut slot) = self.shared.listener.write() {
            *slot = Some(listener);
        }
    }

    /// Appends one record and resolves once it is durable.
    ///
    /// Under [`SyncPolicy::Sync`] the fsync happens inline; under the group
    /// policies the call blocks until the batch covering it flushes. The
    /// committed record (with its assigned sequence) is returned.
    pub fn append(&self, payload: LogPayload) -> Result<LogRecord, WalError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }

        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;

        let record = LogRecord {
            sequence: state.next_sequence,
            timestamp_ms: now_millis(),
            payload,
        };
        state.next_sequence += 1;
        let frame = encode_frame(&record)?;

        match self.shared.policy {
            SyncPolicy::Sync => {
                state.file.write_all(&frame)?;
                state.file.sync_all()?;
                trace!(sequence = record.sequence, len = frame.len(), "WAL record fsynced");
                self.shared.notify_listener(&record);
                Ok(record)
            }
            SyncPolicy::Group | SyncPolicy::Periodic => {
                let (done_tx, done_rx) = channel::bounded(1);
                state.pending.push(PendingAppend {
                    frame,
                    record: record.clone(),
                    done_tx,
                });
                let backlog = state.pending.len();
                drop(state);

                if backlog >= GROUP_COMMIT_MAX_PENDING {
                    let _ = self.shared.wake_tx.try_send(());
                }

                match done_rx.recv() {
                    Ok(CommitOutcome::Durable) => Ok(record),
                    Ok(CommitOutcome::Failed) => Err(WalError::GroupCommitFailed),
                    Err(_) => Err(WalError::Internal("flusher dropped pending append".into())),
                }
            }
        }
    }

    /// Sequence number of the most recently assigned record.
    pub fn last_sequence(&self) -> u64 {
        self.shared
            .state
            .lock()
            .map(|s| s.next_sequence.saturating_sub(1))
            .unwrap_or(0)
    }

    /// Flushes pending appends, rotates to a fresh segment, and deletes all
    /// prior segments.
    ///
    /// Callers must guarantee that everything in the deleted segments is
    /// already reflected in durable SSTables.
    pub fn checkpoint(&self) -> Result<(), WalError> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;

        self.shared.flush_locked(&mut state)?;

        let old_path = state.segment_path.clone();
        let floor = segment_timestamp(&old_path).map(|t| t + 1).unwrap_or(0);
        let (new_path, new_file) = create_segment(&self.shared.dir, now_millis().max(floor))?;
        state.file = new_file;
        state.segment_path = new_path.clone();

        for segment in list_segments(&self.shared.dir)? {
            if segment != new_path {
                if let Err(e) = fs::remove_file(&segment) {
                    warn!(segment = %segment.display(), error = %e, "failed to delete WAL segment");
                }
            }
        }

        debug!(segment = %new_path.display(), "WAL checkpoint complete");
        Ok(())
    }

    /// Stops the flusher, drains any pending appends, and syncs the file.
    /// Appends after this fail with [`WalError::Closed`].
    pub fn close(&self) -> Result<(), WalError> {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.wake_tx.try_send(());

        let handle = self
            .flusher
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        self.shared.flush_pending();
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
        state.file.sync_all()?;
        info!("WAL closed");
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Ok(state) = self.shared.state.lock() {
            if let Err(e) = state.file.sync_all() {
                error!(error = %e, "WAL sync failed on drop");
            }
        }
    }
}

impl WalShared {
    /// Drains and commits the pending batch, reporting the outcome to every
    /// waiter. Errors are delivered through the waiters, not returned.
    fn flush_pending(&self) {
        if let Ok(mut state) = self.state.lock() {
            let _ = self.flush_locked(&mut state);
        }
    }

    fn flush_locked(&self, state: &mut WalState) -> Result<(), WalError> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut state.pending);

        let result = (|| -> io::Result<()> {
            for entry in &batch {
                state.file.write_all(&entry.frame)?;
            }
            state.file.sync_all()
        })();

        match result {
            Ok(()) => {
                trace!(batch = batch.len(), "group commit flushed");
                for entry in &batch {
                    self.notify_listener(&entry.record);
                }
                for entry in batch {
                    let _ = entry.done_tx.send(CommitOutcome::Durable);
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, batch = batch.len(), "group commit fsync failed");
                for entry in batch {
                    let _ = entry.done_tx.send(CommitOutcome::Failed);
                }
                Err(WalError::Io(e))
            }
        }
    }

    fn notify_listener(&self, record: &LogRecord) {
        if let Ok(slot) = self.listener.read() {
            if let Some(listener) = slot.as_ref() {
                listener(record);
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Segment helpers
// ------------------------------------------------------------------------------------------------

fn list_segments(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && segment_timestamp(&path).is_some() {
            segments.push(path);
        }
    }
    Ok(segments)
}

/// Parses `wal-<timestamp>.log`, returning the timestamp.
fn segment_timestamp(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())?
        .strip_prefix("wal-")
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse::<u64>().ok())
}

/// Creates a fresh segment named after `timestamp`, bumping the timestamp
/// until the name is unused.
fn create_segment(dir: &Path, timestamp: u64) -> Result<(PathBuf, File), WalError> {
    let mut candidate = timestamp;
    loop {
        let path = dir.join(format!("wal-{candidate}.log"));
        if path.exists() {
            candidate += 1;
            continue;
        }
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        file.sync_all()?;
        return Ok((path, file));
    }
}

/// Scans one segment, returning `(records, valid_byte_len, clean)`.
///
/// `clean` is false when the scan stopped at a torn tail; `valid_byte_len`
/// is the offset of the first bad byte either way.
fn scan_segment(path: &Path) -> Result<(Vec<LogRecord>, u64, bool), WalError> {
    let raw = fs::read(path)?;
    let mut records = Vec::new();
    let mut at = 0usize;

    loop {
        if at == raw.len() {
            return Ok((records, at as u64, true));
        }
        if at + FRAME_HEADER_SIZE > raw.len() {
            warn!(path = %path.display(), offset = at, "short frame header at WAL tail");
            return Ok((records, at as u64, false));
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&raw[at..at + 4]);
        let body_len = u32::from_be_bytes(word) as usize;
        word.copy_from_slice(&raw[at + 4..at + 8]);
        let stored_crc = u32::from_be_bytes(word);

        let body_start = at + FRAME_HEADER_SIZE;
        if body_start + body_len > raw.len() {
            warn!(
                path = %path.display(),
                offset = at,
                declared = body_len,
                "frame length exceeds segment size at WAL tail"
            );
            return Ok((records, at as u64, false));
        }

        let body = &raw[body_start..body_start + body_len];
        if crc32(body) != stored_crc {
            warn!(path = %path.display(), offset = at, "CRC mismatch at WAL tail");
            return Ok((records, at as u64, false));
        }

        match decode_record_body(body) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), offset = at, error = %e, "undecodable WAL record");
                return Ok((records, at as u64, false));
            }
        }
        at = body_start + body_len;
    }
}
