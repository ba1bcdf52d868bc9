use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::bloom::BloomFilter;
use crate::compaction::{CompactionConfig, CompactionOutcome, Compactor};
use crate::manifest::{Manifest, ManifestEdit};
use crate::sstable::SsTableWriter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds one table from `(key, value, tombstone)` triples and registers it
/// in the manifest.
pub fn build_table(
    dir: &Path,
    manifest: &Manifest,
    entries: &[(&str, &[u8], bool)],
) -> u64 {
    let file_number = manifest.reserve_file_number().unwrap();
    let filter = BloomFilter::with_capacity(entries.len(), 0.01);
    let mut writer = SsTableWriter::new(dir, file_number, 10, Some(filter)).unwrap();
    for (key, value, tombstone) in entries {
        writer.add(key, value, file_number * 1000, *tombstone).unwrap();
    }
    let meta = writer.build().unwrap();
    manifest
        .apply_edit(ManifestEdit {
            added: vec![meta],
            next_file_number: Some(file_number + 1),
            ..Default::default()
        })
        .unwrap();
    file_number
}

/// Spawns a compactor whose callback records every outcome.
pub fn compactor_with_log(
    dir: &Path,
    manifest: &Arc<Manifest>,
    threshold: usize,
) -> (Compactor, Arc<Mutex<Vec<(Option<u64>, Vec<u64>)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let log_clone = Arc::clone(&log);
    let compactor = Compactor::start(
        Arc::clone(manifest),
        CompactionConfig {
            sstable_dir: dir.to_path_buf(),
            threshold,
            // Long interval: tests drive rounds explicitly.
            check_interval: Duration::from_secs(3600),
            sparse_index_interval: 10,
            bloom_fpr: 0.01,
        },
        Box::new(move |outcome: CompactionOutcome| {
            log_clone.lock().unwrap().push((
                outcome.added.as_ref().map(|(meta, _)| meta.file_number),
                outcome.removed.clone(),
            ));
        }),
    )
    .unwrap();
    (compactor, log)
}
