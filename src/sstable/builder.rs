//! SSTable writer — streams sorted entries into an immutable table file.
//!
//! # Input requirements
//!
//! Keys must arrive in **strictly ascending** order; [`SsTableWriter::add`]
//! rejects a key that is `<=` its predecessor. The caller feeds entries from
//! an already-sorted source (a memtable snapshot or a merge iterator), so
//! the writer never buffers more than one encoded entry.
//!
//! # Atomicity
//!
//! 1. Everything is written to `<final>.tmp`.
//! 2. The file is flushed and fsynced.
//! 3. `<final>.tmp` is renamed over the final path and the directory synced.
//!
//! A crash can leave a stale `.tmp` (swept as an orphan on engine open) but
//! never a partially-visible table. Dropping the writer without a successful
//! [`SsTableWriter::build`] removes the temp file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::codec;
use crate::now_millis;

use super::{IndexEntry, SST_FORMAT_VERSION, SST_MAGIC, SsTableError, SsTableMeta, encode_entry};

/// Formats the canonical table filename for a file number.
pub(crate) fn table_file_name(file_number: u64) -> String {
    format!("sstable-{file_number:05}.sst")
}

/// Streaming writer for one table.
pub struct SsTableWriter {
    file_number: u64,
    final_path: PathBuf,
    tmp_path: PathBuf,
    out: BufWriter<File>,
    sparse_interval: usize,
    filter: Option<BloomFilter>,
    index: Vec<IndexEntry>,
    entry_count: u32,
    offset: u64,
    first_key: Option<String>,
    last_key: Option<String>,
    finished: bool,
}

impl SsTableWriter {
    /// Creates the temp file for table `file_number` under `dir`.
    ///
    /// `filter` is pre-sized by the caller (it knows the entry count);
    /// `None` builds a table without a filter section.
    pub fn new(
        dir: &Path,
        file_number: u64,
        sparse_interval: usize,
        filter: Option<BloomFilter>,
    ) -> Result<Self, SsTableError> {
        let final_path = dir.join(table_file_name(file_number));
        let tmp_path = dir.join(format!("{}.tmp", table_file_name(file_number)));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        Ok(Self {
            file_number,
            final_path,
            tmp_path,
            out: BufWriter::new(file),
            sparse_interval: sparse_interval.max(1),
            filter,
            index: Vec::new(),
            entry_count: 0,
            offset: 0,
            first_key: None,
            last_key: None,
            finished: false,
        })
    }

    /// Appends one entry. Keys must be strictly ascending.
    pub fn add(
        &mut self,
        key: &str,
        value: &[u8],
        timestamp_ms: u64,
        tombstone: bool,
    ) -> Result<(), SsTableError> {
        if let Some(previous) = &self.last_key {
            if key <= previous.as_str() {
                return Err(SsTableError::KeyOrder {
                    key: key.to_string(),
                    previous: previous.clone(),
                });
            }
        }

        // Entry 0 is always indexed, then every `sparse_interval`-th entry.
        if self.entry_count as usize % self.sparse_interval == 0 {
            self.index.push(IndexEntry {
                key: key.to_string(),
                offset: self.offset,
            });
        }
        if let Some(filter) = &mut self.filter {
            filter.insert(key);
        }

        let mut buf = Vec::with_capacity(key.len() + value.len() + 16);
        encode_entry(&mut buf, key, value, timestamp_ms, tombstone)?;
        self.write(&buf)?;

        if self.first_key.is_none() {
            self.first_key = Some(key.to_string());
        }
        self.last_key = Some(key.to_string());
        self.entry_count += 1;
        Ok(())
    }

    /// Number of entries added so far.
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Writes the index, filter, and footer, fsyncs, and renames the temp
    /// file into place. Returns the table's metadata.
    ///
    /// On any failure the temp file is removed and the final path is left
    /// untouched.
    pub fn build(mut self) -> Result<SsTableMeta, SsTableError> {
        let meta = self.build_inner()?;
        self.finished = true;
        debug!(
            path = %meta.file_path.display(),
            entries = meta.entry_count,
            size = meta.file_size,
            "SSTable built"
        );
        Ok(meta)
    }

    /// Abandons the build; the temp file is removed. Used when a merge
    /// produces no survivors.
    pub fn abandon(self) {
        // Drop removes the temp file.
    }

    fn build_inner(&mut self) -> Result<SsTableMeta, SsTableError> {
        let (first_key, last_key) = match (self.first_key.clone(), self.last_key.clone()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(SsTableError::Empty),
        };

        // Index section: [count:u32] then entries.
        let index_offset = self.offset;
        let mut section = Vec::new();
        section.extend_from_slice(&(self.index.len() as u32).to_be_bytes());
        for entry in &self.index {
            codec::put_key(&mut section, &entry.key)?;
            section.extend_from_slice(&entry.offset.to_be_bytes());
        }
        self.write(&section)?;

        // Filter section.
        let filter_offset = match &self.filter {
            Some(filter) => {
                let offset = self.offset;
                let raw = filter.to_bytes();
                self.write(&raw)?;
                Some(offset)
            }
            None => None,
        };

        // Footer fields, then the fixed 8-byte tail.
        let created_at_ms = now_millis();
        let file_number = u32::try_from(self.file_number).map_err(|_| {
            SsTableError::Corrupt(format!("file number {} exceeds u32", self.file_number))
        })?;

        let mut footer = Vec::new();
        footer.extend_from_slice(&file_number.to_be_bytes());
        footer.extend_from_slice(&self.entry_count.to_be_bytes());
        footer.extend_from_slice(&0u64.to_be_bytes()); // data_offset
        footer.extend_from_slice(&index_offset.to_be_bytes());
        footer.extend_from_slice(&filter_offset.unwrap_or(0).to_be_bytes());
        codec::put_key(&mut footer, &first_key)?;
        codec::put_key(&mut footer, &last_key)?;
        footer.extend_from_slice(&created_at_ms.to_be_bytes());
        footer.extend_from_slice(&SST_FORMAT_VERSION.to_be_bytes());

        let footer_size = footer.len() as u32;
        footer.extend_from_slice(&footer_size.to_be_bytes());
        footer.extend_from_slice(&SST_MAGIC.to_be_bytes());
        self.write(&footer)?;

        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        if let Some(dir) = self.final_path.parent() {
            File::open(dir)?.sync_all()?;
        }

        Ok(SsTableMeta {
            file_number: self.file_number,
            file_path: self.final_path.clone(),
            entry_count: self.entry_count,
            first_key,
            last_key,
            file_size: self.offset,
            created_at_ms,
            data_offset: 0,
            index_offset,
            filter_offset,
        })
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SsTableError> {
        self.out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }
}

impl Drop for SsTableWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = fs::remove_file(&self.tmp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.tmp_path.display(), error = %e, "failed to remove temp table");
            }
        }
    }
}
