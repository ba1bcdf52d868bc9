use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::replication::ReplicationBackup;
use crate::wal::LogRecord;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spawns a backup that records every applied record.
pub fn recording_backup(listen_addr: &str) -> (ReplicationBackup, Arc<Mutex<Vec<LogRecord>>>) {
    let applied = Arc::new(Mutex::new(Vec::new()));
    let applied_clone = Arc::clone(&applied);
    let backup = ReplicationBackup::spawn(
        listen_addr,
        Box::new(move |record: &LogRecord| {
            applied_clone.lock().unwrap().push(record.clone());
            true
        }),
    )
    .unwrap();
    (backup, applied)
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
