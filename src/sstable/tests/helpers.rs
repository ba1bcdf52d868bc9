use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::bloom::BloomFilter;
use crate::sstable::{SsTable, SsTableMeta, SsTableWriter};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds a table holding `k000..k<count-1>` with `v<i>` values.
pub fn build_numbered_table(
    dir: &Path,
    file_number: u64,
    count: usize,
    sparse_interval: usize,
) -> SsTableMeta {
    let filter = BloomFilter::with_capacity(count, 0.01);
    let mut writer = SsTableWriter::new(dir, file_number, sparse_interval, Some(filter)).unwrap();
    for i in 0..count {
        writer
            .add(&format!("k{i:03}"), format!("v{i}").as_bytes(), 100 + i as u64, false)
            .unwrap();
    }
    writer.build().unwrap()
}

/// Opens a table and wraps it for the iterator APIs.
pub fn open_table(meta: &SsTableMeta) -> Arc<SsTable> {
    Arc::new(SsTable::open(&meta.file_path).unwrap())
}
