use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

use crate::config::SyncPolicy;
use crate::wal::{LogPayload, LogRecord, Wal};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Opens a WAL rooted at `dir` and returns the handle plus replayed records.
pub fn open_wal(dir: &Path, policy: SyncPolicy) -> (Wal, Vec<LogRecord>) {
    Wal::open(dir, policy).unwrap()
}

/// Appends simple `k<i>` / `v<i>` puts.
pub fn append_puts(wal: &Wal, count: usize) -> Vec<LogRecord> {
    (0..count)
        .map(|i| {
            wal.append(LogPayload::Put {
                key: format!("k{i:03}"),
                value: format!("v{i:03}").into_bytes(),
            })
            .unwrap()
        })
        .collect()
}

/// Path of the single WAL segment under `dir` (panics if there are several).
pub fn only_segment(dir: &Path) -> PathBuf {
    let mut segments = segment_paths(dir);
    assert_eq!(segments.len(), 1, "expected exactly one WAL segment");
    segments.remove(0)
}

/// All WAL segment paths under `dir`, in filename order.
pub fn segment_paths(dir: &Path) -> Vec<PathBuf> {
    let mut segments: Vec<PathBuf> = std::fs::read_dir(dir.join("wal"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    segments.sort();
    segments
}
