//! # Manifest Module
//!
//! The manifest is the authoritative, crash-safe listing of the live
//! SSTable set: which table files exist, the next file number to allocate,
//! and the highest WAL sequence already flushed to tables.
//!
//! ## Durability model
//!
//! The whole state is one small snapshot, rewritten atomically on every
//! edit:
//!
//! 1. Serialize the new state to `MANIFEST.tmp`.
//! 2. fsync the temp file.
//! 3. Rename it over `MANIFEST` and fsync the directory.
//!
//! Readers therefore always observe either the old state or the new one,
//! never a torn mix. A missing file means a fresh store; a file with a bad
//! magic, version, or checksum is fatal — the store cannot know which
//! tables are live.
//!
//! # File layout
//!
//! ```text
//! [magic:u32][format_version:u16]
//! [version:u64][created_at:u64][next_file_number:u64][last_flushed_sequence:u64]
//! [table_count:u32] table_meta*
//! [crc32:u32]   — over everything before it
//! ```
//!
//! All integers big-endian.
//!
//! ## Thread safety
//!
//! The in-memory state sits behind a `Mutex`; [`Manifest::state`] hands out
//! snapshots by clone, and [`Manifest::apply_edit`] performs copy-on-edit —
//! the published struct is replaced wholesale after the file swap succeeds.

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
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{self, CodecError};
use crate::now_millis;
use crate::sstable::SsTableMeta;

const MANIFEST_FILENAME: &str = "MANIFEST";
const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";

/// `b"CMAN"` — identifies a manifest snapshot.
const MANIFEST_MAGIC: u32 = 0x434D_414E;
const MANIFEST_FORMAT_VERSION: u16 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Field-level decoding error.
    #[error("corrupt manifest: {0}")]
    Codec(#[from] CodecError),

    /// The file does not start with the manifest magic.
    #[error("bad manifest magic 0x{0:08X}")]
    BadMagic(u32),

    /// The format version is newer than this build understands.
    #[error("unsupported manifest format version {0}")]
    UnsupportedVersion(u16),

    /// The trailing checksum did not match.
    #[error("manifest checksum mismatch")]
    ChecksumMismatch,

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// State & edits
// ------------------------------------------------------------------------------------------------

/// The full durable state: live tables (newest first), counters, version.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestState {
    /// Live tables ordered newest-first by file number.
    pub sstables: Vec<SsTableMeta>,

    /// Next file number to hand to a writer. Always greater than every live
    /// table's number.
    pub next_file_number: u64,

    /// Highest WAL sequence whose effects are durable in `sstables`.
    pub last_flushed_sequence: u64,

    /// Monotonic state version, bumped on every edit.
    pub version: u64,

    /// Wall-clock time of the last persisted edit, milliseconds since epoch.
    pub created_at_ms: u64,
}

impl ManifestState {
    fn fresh() -> Self {
        Self {
            sstables: Vec::new(),
            next_file_number: 1,
            last_flushed_sequence: 0,
            version: 0,
            created_at_ms: now_millis(),
        }
    }
}

/// One atomic change to the manifest.
#[derive(Debug, Default)]
pub struct ManifestEdit {
    /// Tables to add.
    pub added: Vec<SsTableMeta>,

    /// File numbers of tables to retire.
    pub removed_file_numbers: Vec<u64>,

    /// Explicit new value for the file-number counter; the counter never
    /// moves backwards regardless.
    pub next_file_number: Option<u64>,

    /// New high-water mark for flushed WAL sequences.
    pub last_flushed_sequence: Option<u64>,
}

// ------------------------------------------------------------------------------------------------
// Manifest Core
// ------------------------------------------------------------------------------------------------

/// Handle to the manifest file pair (`MANIFEST` / `MANIFEST.tmp`).
#[derive(Debug)]
pub struct Manifest {
    dir: PathBuf,
    state: Mutex<ManifestState>,
}

impl Manifest {
    /// Loads the manifest under `dir`, or starts empty when the file does
    /// not exist. Corruption (bad magic, version, or checksum) is fatal.
    pub fn open(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILENAME);
        let state = if path.exists() {
            let raw = fs::read(&path)?;
            let state = decode_snapshot(&raw)?;
            info!(
                path = %path.display(),
                tables = state.sstables.len(),
                version = state.version,
                "manifest loaded"
            );
            state
        } else {
            debug!(path = %path.display(), "no manifest found, starting empty");
            ManifestState::fresh()
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> ManifestState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// The file number the next writer should use. See
    /// [`Manifest::reserve_file_number`] for the allocating variant.
    pub fn next_file_number(&self) -> u64 {
        self.state().next_file_number
    }

    /// Allocates a file number for an in-flight table build.
    ///
    /// The bump is in-memory only; the edit that publishes the table
    /// persists the advanced counter. If the build dies before its edit,
    /// the number is reused after restart and the stale file is swept as an
    /// orphan.
    pub fn reserve_file_number(&self) -> Result<u64, ManifestError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ManifestError::Internal("mutex poisoned".into()))?;
        let number = state.next_file_number;
        state.next_file_number += 1;
        Ok(number)
    }

    /// Applies one edit atomically: compute the new state, persist it via
    /// temp + fsync + rename, then publish it. Returns the new state.
    pub fn apply_edit(&self, edit: ManifestEdit) -> Result<ManifestState, ManifestError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| ManifestError::Internal("mutex poisoned".into()))?;

        let mut next = guard.clone();
        next.sstables
            .retain(|meta| !edit.removed_file_numbers.contains(&meta.file_number));
        next.sstables.extend(edit.added.iter().cloned());
        next.sstables
            .sort_by(|a, b| b.file_number.cmp(&a.file_number));

        let highest_live = next
            .sstables
            .first()
            .map(|meta| meta.file_number + 1)
            .unwrap_or(1);
        next.next_file_number = next
            .next_file_number
            .max(edit.next_file_number.unwrap_or(0))
            .max(highest_live);
        if let Some(sequence) = edit.last_flushed_sequence {
            next.last_flushed_sequence = sequence;
        }
        next.version += 1;
        next.created_at_ms = now_millis();

        self.persist(&next)?;
        debug!(
            version = next.version,
            tables = next.sstables.len(),
            next_file_number = next.next_file_number,
            "manifest edit applied"
        );
        *guard = next.clone();
        Ok(next)
    }

    fn persist(&self, state: &ManifestState) -> Result<(), ManifestError> {
        let raw = encode_snapshot(state)?;
        let tmp_path = self.dir.join(MANIFEST_TMP_FILENAME);
        let final_path = self.dir.join(MANIFEST_FILENAME);

        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&raw)?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Snapshot codec
// ------------------------------------------------------------------------------------------------

fn encode_snapshot(state: &ManifestState) -> Result<Vec<u8>, ManifestError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MANIFEST_MAGIC.to_be_bytes());
    buf.extend_from_slice(&MANIFEST_FORMAT_VERSION.to_be_bytes());
    buf.extend_from_slice(&state.version.to_be_bytes());
    buf.extend_from_slice(&state.created_at_ms.to_be_bytes());
    buf.extend_from_slice(&state.next_file_number.to_be_bytes());
    buf.extend_from_slice(&state.last_flushed_sequence.to_be_bytes());
    buf.extend_from_slice(&(state.sstables.len() as u32).to_be_bytes());
    for meta in &state.sstables {
        meta.encode_to(&mut buf)?;
    }

    let mut hasher = Crc32::new();
    hasher.update(&buf);
    let checksum = hasher.finalize();
    buf.extend_from_slice(&checksum.to_be_bytes());
    Ok(buf)
}

fn decode_snapshot(raw: &[u8]) -> Result<ManifestState, ManifestError> {
    if raw.len() < 4 {
        return Err(ManifestError::Codec(CodecError::UnexpectedEof {
            needed: 4,
            available: raw.len(),
        }));
    }

    // Trailing CRC covers everything before it.
    let body = &raw[..raw.len() - 4];
    let mut at = raw.len() - 4;
    let stored_checksum = codec::take_u32(raw, &mut at)?;
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored_checksum {
        return Err(ManifestError::ChecksumMismatch);
    }

    let mut at = 0;
    let magic = codec::take_u32(body, &mut at)?;
    if magic != MANIFEST_MAGIC {
        return Err(ManifestError::BadMagic(magic));
    }
    let format_version = codec::take_u16(body, &mut at)?;
    if format_version != MANIFEST_FORMAT_VERSION {
        return Err(ManifestError::UnsupportedVersion(format_version));
    }

    let version = codec::take_u64(body, &mut at)?;
    let created_at_ms = codec::take_u64(body, &mut at)?;
    let next_file_number = codec::take_u64(body, &mut at)?;
    let last_flushed_sequence = codec::take_u64(body, &mut at)?;
    let count = codec::take_u32(body, &mut at)? as usize;
    let mut sstables = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        sstables.push(SsTableMeta::decode_from(body, &mut at)?);
    }

    Ok(ManifestState {
        sstables,
        next_file_number,
        last_flushed_sequence,
        version,
        created_at_ms,
    })
}
