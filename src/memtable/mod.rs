//! # Memtable Module
//!
//! The mutable, in-memory ordered buffer of the storage engine.
//!
//! ## Design Invariants
//!
//! - Entries are keyed by UTF-8 strings compared byte-wise, so ascending
//!   iteration is lexicographic codepoint order.
//! - One entry per key: an overwrite replaces the previous version and the
//!   size counter is adjusted by the footprint delta.
//! - Deletes are tombstone entries, never physical removal — a tombstone
//!   must shadow older versions living in deeper layers.
//! - `current_size` approximates the encoded SSTable footprint of the
//!   contents, so "full" lines up with the size of the flushed file.
//!
//! ## Lifecycle
//!
//! Created by the engine, mutated only while active, frozen (by engine-level
//! swap) when full, destroyed after its contents reach a durable SSTable.
//! Double-buffering is an engine contract: at most one immutable memtable
//! exists at a time and writers always land in the fresh active one.
//!
//! ## Concurrency
//!
//! The map lives behind an `RwLock` so the engine can hand an
//! `Arc<Memtable>` to the background flush while readers keep scanning it.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use thiserror::Error;
use tracing::trace;

/// Fixed per-entry envelope in the encoded form:
/// `key_len(2) + value_len(4) + timestamp(8) + tombstone(1)`.
const ENTRY_OVERHEAD: usize = 15;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Entry
// ------------------------------------------------------------------------------------------------

/// A single entry: a value or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemtableEntry {
    /// The stored value. Empty for tombstones (and legal for live entries —
    /// presence is keyed on the entry, not the value).
    pub value: Vec<u8>,

    /// Wall-clock timestamp of the mutation, milliseconds since epoch.
    pub timestamp_ms: u64,

    /// Whether this entry deletes the key.
    pub tombstone: bool,
}

impl MemtableEntry {
    fn footprint(key: &str, value: &[u8]) -> usize {
        key.len() + value.len() + ENTRY_OVERHEAD
    }
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

struct MemtableInner {
    tree: BTreeMap<String, MemtableEntry>,
    current_size: usize,
}

/// Ordered in-memory buffer with byte accounting and tombstones.
pub struct Memtable {
    inner: RwLock<MemtableInner>,
    size_limit: usize,
}

impl Memtable {
    /// Creates an empty memtable that reports [`Memtable::full`] once its
    /// approximate footprint reaches `size_limit` bytes.
    pub fn new(size_limit: usize) -> Self {
        Self {
            inner: RwLock::new(MemtableInner {
                tree: BTreeMap::new(),
                current_size: 0,
            }),
            size_limit,
        }
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn put(&self, key: &str, value: Vec<u8>, timestamp_ms: u64) -> Result<(), MemtableError> {
        self.write_entry(
            key,
            MemtableEntry {
                value,
                timestamp_ms,
                tombstone: false,
            },
        )
    }

    /// Writes a tombstone for `key`, shadowing any older version.
    pub fn delete(&self, key: &str, timestamp_ms: u64) -> Result<(), MemtableError> {
        self.write_entry(
            key,
            MemtableEntry {
                value: Vec::new(),
                timestamp_ms,
                tombstone: true,
            },
        )
    }

    fn write_entry(&self, key: &str, entry: MemtableEntry) -> Result<(), MemtableError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| MemtableError::Internal("lock poisoned".into()))?;

        let added = MemtableEntry::footprint(key, &entry.value);
        if let Some(previous) = guard.tree.get(key) {
            let removed = MemtableEntry::footprint(key, &previous.value);
            guard.current_size = guard.current_size.saturating_sub(removed);
        }
        guard.current_size += added;
        guard.tree.insert(key.to_string(), entry);

        trace!(key, size = guard.current_size, "memtable entry written");
        Ok(())
    }

    /// Returns the entry for `key`, tombstones included.
    pub fn get(&self, key: &str) -> Result<Option<MemtableEntry>, MemtableError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| MemtableError::Internal("lock poisoned".into()))?;
        Ok(guard.tree.get(key).cloned())
    }

    /// Whether `key` has any entry (live or tombstone).
    pub fn has(&self, key: &str) -> Result<bool, MemtableError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| MemtableError::Internal("lock poisoned".into()))?;
        Ok(guard.tree.contains_key(key))
    }

    /// All entries in ascending key order.
    pub fn sorted_entries(&self) -> Result<Vec<(String, MemtableEntry)>, MemtableError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| MemtableError::Internal("lock poisoned".into()))?;
        Ok(guard
            .tree
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Entries with `start <= key <= end`, ascending.
    pub fn range(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<(String, MemtableEntry)>, MemtableError> {
        if start > end {
            return Ok(Vec::new());
        }
        let guard = self
            .inner
            .read()
            .map_err(|_| MemtableError::Internal("lock poisoned".into()))?;
        Ok(guard
            .tree
            .range::<str, _>((Bound::Included(start), Bound::Included(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Approximate encoded footprint in bytes.
    pub fn current_size(&self) -> usize {
        self.inner.read().map(|g| g.current_size).unwrap_or(0)
    }

    /// Whether the footprint has reached the configured limit.
    pub fn full(&self) -> bool {
        self.current_size() >= self.size_limit
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.tree.len()).unwrap_or(0)
    }

    /// Whether the memtable holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all entries and resets the size counter.
    pub fn clear(&self) -> Result<(), MemtableError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| MemtableError::Internal("lock poisoned".into()))?;
        guard.tree.clear();
        guard.current_size = 0;
        Ok(())
    }
}
