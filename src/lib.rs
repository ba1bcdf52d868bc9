//! # CoralDB
//!
//! A persistent, crash-safe, ordered key-value store built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture, with optional
//! best-effort primary→backup replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                      Engine                           │
//! │  ┌────────────┐  ┌──────────────┐  ┌─────────────┐    │
//! │  │  Active    │  │  Immutable   │  │  SSTables   │    │
//! │  │  Memtable  │  │  Memtable    │  │  (on disk)  │    │
//! │  └─────┬──────┘  └──────┬───────┘  └──────┬──────┘    │
//! │        │    swap        │    flush        │           │
//! │        └─────────►      └────────►        │           │
//! │                                           │           │
//! │  ┌─────────────────────────────────────────┘          │
//! │  │  Compaction (size-tiered, merge-all)               │
//! │  └────────────────────────────────────────────────────┤
//! │                                                       │
//! │  ┌──────────────┐  ┌───────────────────────────────┐  │
//! │  │  WAL (group  │  │  Manifest (live SSTable set)  │  │
//! │  │  commit)     │  │                               │  │
//! │  └──────┬───────┘  └───────────────────────────────┘  │
//! │         │ commit listener                             │
//! │         ▼                                             │
//! │  Replication primary ──TCP──► backup engine           │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Core storage engine — open, read, write, range scan, flush, close |
//! | [`memtable`] | In-memory ordered write buffer with tombstones and size accounting |
//! | [`wal`] | CRC-protected write-ahead log with group-commit fsync batching |
//! | [`sstable`] | Immutable, sorted, on-disk tables with sparse index and bloom filter |
//! | [`manifest`] | Crash-safe listing of the live SSTable set |
//! | [`compaction`] | Background size-tiered compactor |
//! | [`bloom`] | Serializable probabilistic membership filter |
//! | [`replication`] | Best-effort primary→backup push over framed TCP |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every mutation is durable in the WAL before
//!   it is acknowledged; replay recovers the last committed state.
//! - **Group commit** — concurrent appends share a single fsync, resolving
//!   (or failing) together.
//! - **Double-buffered flush** — a full memtable is swapped for a fresh one
//!   and flushed in the background without stalling writers.
//! - **Sparse-indexed SSTables** — one index entry per N data entries plus a
//!   bloom filter keeps point lookups cheap.
//! - **Atomic metadata** — SSTables and the manifest are published with
//!   temp-file + fsync + rename.
//! - **Replication** — a primary streams committed WAL records to a backup;
//!   commits never wait on the network.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use coraldb::{DbConfig, Engine};
//!
//! let config = DbConfig::new("/tmp/my_db");
//! let engine = Engine::open(config).unwrap();
//!
//! engine.put("hello", b"world").unwrap();
//! assert_eq!(engine.get("hello").unwrap(), Some(b"world".to_vec()));
//!
//! engine.delete("hello").unwrap();
//! assert_eq!(engine.get("hello").unwrap(), None);
//!
//! engine.put("a", b"1").unwrap();
//! engine.put("b", b"2").unwrap();
//! let pairs = engine.read_key_range("a", "b", None).unwrap();
//! assert_eq!(pairs.len(), 2);
//!
//! engine.close().unwrap();
//! ```

pub mod bloom;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod replication;
pub mod sstable;
pub mod wal;

pub use config::{DbConfig, ReplicationRole, SyncPolicy};
pub use engine::{Engine, EngineError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch. Clocks before the epoch collapse to 0.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
