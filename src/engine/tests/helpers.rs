use std::path::Path;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::config::{DbConfig, SyncPolicy};
use crate::engine::Engine;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config sized so ordinary tests never trigger a flush.
pub fn memtable_only_config(dir: &Path) -> DbConfig {
    init_tracing();
    let mut config = DbConfig::new(dir);
    config.memtable_size_limit = 64 * 1024;
    config.sync_policy = SyncPolicy::Sync;
    // Keep the periodic check out of the way; tests drive compaction
    // explicitly.
    config.compaction_check_interval_ms = 3_600_000;
    config
}

/// Config with a tiny memtable so a handful of writes forces a flush.
pub fn tiny_memtable_config(dir: &Path) -> DbConfig {
    let mut config = memtable_only_config(dir);
    config.memtable_size_limit = 256;
    config
}

/// Opens an engine over `dir` with the given config.
pub fn open_engine(config: DbConfig) -> Engine {
    Engine::open(config).unwrap()
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
