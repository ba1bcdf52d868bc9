//! # Sorted String Table (SSTable) Module
//!
//! Immutable, sorted, on-disk tables with a sparse index and an optional
//! bloom filter. An SSTable is written once (see [`builder::SsTableWriter`])
//! and then only ever read; updates and deletes become new entries in newer
//! tables and are resolved by layer order at read time.
//!
//! # On-disk layout
//!
//! All integers are big-endian.
//!
//! ```text
//! Data    :  entry*            (strictly key-ascending)
//! Index   :  [count:u32] index_entry*
//! Filter  :  [m:u32][k:u32][bits]            (optional, version >= 2)
//! Footer  :  fields + [footer_size:u32][magic:u32 = 0x5353544C]
//! ```
//!
//! - entry: `[key_len:u16][key][value_len:u32][value][timestamp:u64][tombstone:u8]`
//! - index_entry: `[key_len:u16][key][data_offset:u64]` — one per
//!   `sparse_index_interval` data entries, entry 0 always included.
//! - footer fields, in order: `file_number:u32`, `entry_count:u32`,
//!   `data_offset:u64`, `index_offset:u64`, `filter_offset:u64` (version
//!   ≥ 2; 0 means "no filter"), `first_key_len:u16 + first_key`,
//!   `last_key_len:u16 + last_key`, `created_at:u64`, `version:u16`.
//!
//! The last 8 bytes of the file always carry `footer_size` and `magic`, so a
//! reader locates the footer from the tail without knowing the version.
//!
//! # Concurrency
//!
//! Tables are immutable; the reader memory-maps the file and serves point
//! and range reads lock-free from the mapping. Readers are shared as
//! `Arc<SsTable>` between the engine's read path, range scans, and
//! compaction.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::SsTableWriter;
pub use iterator::SsTableScanIter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

use crate::bloom::{BloomError, BloomFilter};
use crate::codec::{self, CodecError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// `b"SSTL"` — identifies the table format in the 4 trailing bytes.
pub const SST_MAGIC: u32 = 0x5353_544C;

/// Current format version. Version 2 added the filter section.
pub const SST_FORMAT_VERSION: u16 = 2;

/// `footer_size` + `magic` at the very end of the file.
const TAIL_SIZE: usize = 8;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum SsTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Field-level decoding error.
    #[error("corrupt table: {0}")]
    Codec(#[from] CodecError),

    /// The trailing magic did not match [`SST_MAGIC`].
    #[error("bad magic 0x{0:08X}")]
    BadMagic(u32),

    /// The footer declared a version this build cannot read.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    /// Structural corruption: offsets or sizes that cannot be satisfied.
    #[error("corrupt table: {0}")]
    Corrupt(String),

    /// The filter section failed to parse.
    #[error("corrupt filter: {0}")]
    Filter(#[from] BloomError),

    /// The writer received a key not strictly greater than its predecessor.
    #[error("keys must be strictly ascending: {key:?} after {previous:?}")]
    KeyOrder {
        /// The offending key.
        key: String,
        /// The key written immediately before it.
        previous: String,
    },

    /// A table must hold at least one entry.
    #[error("refusing to build an empty table")]
    Empty,
}

// ------------------------------------------------------------------------------------------------
// Metadata & entries
// ------------------------------------------------------------------------------------------------

/// Descriptor of one table: produced by the writer, persisted in the
/// manifest, discarded when compaction retires the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsTableMeta {
    /// Monotonic file number; also names the file (`sstable-%05d.sst`).
    pub file_number: u64,

    /// Full path of the table file.
    pub file_path: PathBuf,

    /// Number of data entries.
    pub entry_count: u32,

    /// Smallest key in the table.
    pub first_key: String,

    /// Largest key in the table.
    pub last_key: String,

    /// Total file size in bytes.
    pub file_size: u64,

    /// Build wall-clock time, milliseconds since epoch.
    pub created_at_ms: u64,

    /// Byte offset of the data section (always 0 in the current layout).
    pub data_offset: u64,

    /// Byte offset of the sparse index section.
    pub index_offset: u64,

    /// Byte offset of the filter section; `None` when the table carries no
    /// filter.
    pub filter_offset: Option<u64>,
}

impl SsTableMeta {
    /// Serializes the metadata for the manifest.
    pub(crate) fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(&self.file_number.to_be_bytes());
        let path = self.file_path.to_string_lossy();
        codec::put_value(buf, path.as_bytes())?;
        buf.extend_from_slice(&self.entry_count.to_be_bytes());
        codec::put_key(buf, &self.first_key)?;
        codec::put_key(buf, &self.last_key)?;
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        buf.extend_from_slice(&self.created_at_ms.to_be_bytes());
        buf.extend_from_slice(&self.data_offset.to_be_bytes());
        buf.extend_from_slice(&self.index_offset.to_be_bytes());
        buf.extend_from_slice(&self.filter_offset.unwrap_or(0).to_be_bytes());
        Ok(())
    }

    /// Parses metadata serialized by [`SsTableMeta::encode_to`].
    pub(crate) fn decode_from(buf: &[u8], at: &mut usize) -> Result<Self, CodecError> {
        let file_number = codec::take_u64(buf, at)?;
        let path_raw = codec::take_value(buf, at)?;
        let file_path = PathBuf::from(String::from_utf8(path_raw)?);
        let entry_count = codec::take_u32(buf, at)?;
        let first_key = codec::take_key(buf, at)?;
        let last_key = codec::take_key(buf, at)?;
        let file_size = codec::take_u64(buf, at)?;
        let created_at_ms = codec::take_u64(buf, at)?;
        let data_offset = codec::take_u64(buf, at)?;
        let index_offset = codec::take_u64(buf, at)?;
        let filter_offset = match codec::take_u64(buf, at)? {
            0 => None,
            offset => Some(offset),
        };
        Ok(Self {
            file_number,
            file_path,
            entry_count,
            first_key,
            last_key,
            file_size,
            created_at_ms,
            data_offset,
            index_offset,
            filter_offset,
        })
    }
}

/// One decoded data entry: a value or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsTableEntry {
    /// The entry's key.
    pub key: String,

    /// The stored value; empty for tombstones.
    pub value: Vec<u8>,

    /// Mutation timestamp, milliseconds since epoch.
    pub timestamp_ms: u64,

    /// Whether the entry deletes its key.
    pub tombstone: bool,
}

/// One sparse-index entry.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) key: String,
    pub(crate) offset: u64,
}

// ------------------------------------------------------------------------------------------------
// Entry codec (shared by builder and reader)
// ------------------------------------------------------------------------------------------------

/// Appends one data entry in the on-disk layout.
pub(crate) fn encode_entry(
    buf: &mut Vec<u8>,
    key: &str,
    value: &[u8],
    timestamp_ms: u64,
    tombstone: bool,
) -> Result<(), CodecError> {
    codec::put_key(buf, key)?;
    codec::put_value(buf, value)?;
    buf.extend_from_slice(&timestamp_ms.to_be_bytes());
    buf.push(tombstone as u8);
    Ok(())
}

/// Decodes one data entry, advancing `at` past it.
pub(crate) fn decode_entry(buf: &[u8], at: &mut usize) -> Result<SsTableEntry, CodecError> {
    let key = codec::take_key(buf, at)?;
    let value = codec::take_value(buf, at)?;
    let timestamp_ms = codec::take_u64(buf, at)?;
    let tombstone = codec::take_u8(buf, at)? != 0;
    Ok(SsTableEntry {
        key,
        value,
        timestamp_ms,
        tombstone,
    })
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// An open, memory-mapped table.
#[derive(Debug)]
pub struct SsTable {
    /// Footer-derived metadata.
    pub meta: SsTableMeta,

    mmap: Mmap,
    index: Vec<IndexEntry>,
    filter: Option<BloomFilter>,
}

impl SsTable {
    /// Opens a table: locates the footer from the 8-byte tail, verifies the
    /// magic, loads the sparse index into memory, and parses the filter if
    /// the version carries one.
    pub fn open(path: &Path) -> Result<Self, SsTableError> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if (file_size as usize) < TAIL_SIZE {
            return Err(SsTableError::Corrupt(format!(
                "file is only {file_size} bytes"
            )));
        }
        // Safety: the mapping is read-only and the file is never modified
        // after build (rename is the publish point).
        let mmap = unsafe { Mmap::map(&file)? };
        let raw: &[u8] = &mmap;

        // Trailing 8 bytes: [footer_size:u32][magic:u32].
        let mut at = raw.len() - TAIL_SIZE;
        let footer_size = codec::take_u32(raw, &mut at)? as usize;
        let magic = codec::take_u32(raw, &mut at)?;
        if magic != SST_MAGIC {
            return Err(SsTableError::BadMagic(magic));
        }
        let footer_end = raw.len() - TAIL_SIZE;
        if footer_size < 2 {
            return Err(SsTableError::Corrupt(format!(
                "footer size {footer_size} too small"
            )));
        }
        let footer_start = footer_end
            .checked_sub(footer_size)
            .ok_or_else(|| SsTableError::Corrupt(format!("footer size {footer_size} overruns file")))?;

        // The version sits in the footer's last two bytes; read it first so
        // the optional fields can be parsed correctly front-to-back.
        let mut version_at = footer_end - 2;
        let version = codec::take_u16(raw, &mut version_at)?;
        if version == 0 || version > SST_FORMAT_VERSION {
            return Err(SsTableError::UnsupportedVersion(version));
        }

        let mut at = footer_start;
        let file_number = codec::take_u32(raw, &mut at)? as u64;
        let entry_count = codec::take_u32(raw, &mut at)?;
        let data_offset = codec::take_u64(raw, &mut at)?;
        let index_offset = codec::take_u64(raw, &mut at)?;
        let filter_offset = if version >= 2 {
            match codec::take_u64(raw, &mut at)? {
                0 => None,
                offset => Some(offset),
            }
        } else {
            None
        };
        let first_key = codec::take_key(raw, &mut at)?;
        let last_key = codec::take_key(raw, &mut at)?;
        let created_at_ms = codec::take_u64(raw, &mut at)?;

        if index_offset >= footer_start as u64 || data_offset > index_offset {
            return Err(SsTableError::Corrupt(format!(
                "inconsistent section offsets: data={data_offset}, index={index_offset}"
            )));
        }

        // Sparse index: [count:u32] then entries.
        let mut at = index_offset as usize;
        let count = codec::take_u32(raw, &mut at)? as usize;
        let mut index = Vec::with_capacity(count);
        for _ in 0..count {
            let key = codec::take_key(raw, &mut at)?;
            let offset = codec::take_u64(raw, &mut at)?;
            index.push(IndexEntry { key, offset });
        }

        let filter = match filter_offset {
            Some(offset) => {
                let section = raw
                    .get(offset as usize..footer_start)
                    .ok_or_else(|| SsTableError::Corrupt("filter offset overruns file".into()))?;
                Some(BloomFilter::from_bytes(section)?)
            }
            None => None,
        };

        let meta = SsTableMeta {
            file_number,
            file_path: path.to_path_buf(),
            entry_count,
            first_key,
            last_key,
            file_size,
            created_at_ms,
            data_offset,
            index_offset,
            filter_offset,
        };
        debug!(
            path = %path.display(),
            file_number,
            entry_count,
            "SSTable opened"
        );

        Ok(Self {
            meta,
            mmap,
            index,
            filter,
        })
    }

    /// Whether `key` could be in this table: the range fence and the filter
    /// must both pass. Either alone is insufficient — the fence prevents
    /// filter false positives outside the key range, the filter prunes
    /// in-range misses.
    pub fn maybe_contains(&self, key: &str) -> bool {
        if key < self.meta.first_key.as_str() || key > self.meta.last_key.as_str() {
            return false;
        }
        match &self.filter {
            Some(filter) => filter.maybe_contains(key),
            None => true,
        }
    }

    /// Point lookup. Returns the entry — tombstones included, so the caller
    /// can let a deletion shadow older layers.
    pub fn get(&self, key: &str) -> Result<Option<SsTableEntry>, SsTableError> {
        if !self.maybe_contains(key) {
            return Ok(None);
        }

        let mut at = self.seek_offset(key);
        let data_end = self.meta.index_offset as usize;
        while at < data_end {
            let entry = decode_entry(&self.mmap, &mut at)?;
            if entry.key.as_str() == key {
                return Ok(Some(entry));
            }
            if entry.key.as_str() > key {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Entries with `start <= key <= end`, in ascending order, tombstones
    /// included.
    pub fn iter_range(self: &Arc<Self>, start: &str, end: &str) -> SsTableScanIter {
        let pos = self.seek_offset(start);
        SsTableScanIter::new(
            Arc::clone(self),
            pos,
            start.to_string(),
            Some(end.to_string()),
        )
    }

    /// Every entry in the table, ascending.
    pub fn iter_all(self: &Arc<Self>) -> SsTableScanIter {
        SsTableScanIter::new(
            Arc::clone(self),
            self.meta.data_offset as usize,
            String::new(),
            None,
        )
    }

    /// Greatest sparse-index offset whose key is `<= key`, or the start of
    /// the data section when every indexed key is greater.
    fn seek_offset(&self, key: &str) -> usize {
        let idx = self.index.partition_point(|e| e.key.as_str() <= key);
        if idx == 0 {
            self.meta.data_offset as usize
        } else {
            self.index[idx - 1].offset as usize
        }
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.mmap
    }
}
