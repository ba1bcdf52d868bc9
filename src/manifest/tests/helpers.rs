use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use crate::sstable::SsTableMeta;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Synthesizes plausible table metadata without touching disk.
pub fn fake_meta(file_number: u64) -> SsTableMeta {
    SsTableMeta {
        file_number,
        file_path: PathBuf::from(format!("/data/sstables/sstable-{file_number:05}.sst")),
        entry_count: 42,
        first_key: "a".to_string(),
        last_key: "z".to_string(),
        file_size: 4096,
        created_at_ms: 1_700_000_000_000 + file_number,
        data_offset: 0,
        index_offset: 3000,
        filter_offset: Some(3500),
    }
}
