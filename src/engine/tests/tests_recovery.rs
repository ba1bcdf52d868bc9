#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::engine::tests::helpers::{memtable_only_config, open_engine, tiny_memtable_config};

    #[test]
    fn test_restart_replays_unflushed_writes() {
        let tmp = TempDir::new().unwrap();

        let engine = open_engine(memtable_only_config(tmp.path()));
        engine.put("user:1", b"Alice").unwrap();
        engine.put("user:2", b"Bob").unwrap();
        engine.delete("user:1").unwrap();
        engine.close().unwrap();
        drop(engine);

        let engine = open_engine(memtable_only_config(tmp.path()));
        assert_eq!(engine.get("user:1").unwrap(), None);
        assert_eq!(engine.get("user:2").unwrap(), Some(b"Bob".to_vec()));
        engine.close().unwrap();
    }

    #[test]
    fn test_restart_preserves_tables_and_buffer() {
        let tmp = TempDir::new().unwrap();

        let engine = open_engine(memtable_only_config(tmp.path()));
        engine.put("flushed", b"on-disk").unwrap();
        engine.flush().unwrap();
        engine.put("buffered", b"in-wal").unwrap();
        engine.close().unwrap();
        drop(engine);

        let engine = open_engine(memtable_only_config(tmp.path()));
        let stats = engine.stats().unwrap();
        assert_eq!(stats.sstable_count, 1);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(engine.get("flushed").unwrap(), Some(b"on-disk".to_vec()));
        assert_eq!(engine.get("buffered").unwrap(), Some(b"in-wal".to_vec()));
        engine.close().unwrap();
    }

    #[test]
    fn test_restart_after_many_flushes() {
        let tmp = TempDir::new().unwrap();

        let engine = open_engine(tiny_memtable_config(tmp.path()));
        for i in 0..100 {
            engine
                .put(&format!("k{i:03}"), format!("v{i}").as_bytes())
                .unwrap();
        }
        engine.flush().unwrap();
        engine.close().unwrap();
        drop(engine);

        let engine = open_engine(tiny_memtable_config(tmp.path()));
        for i in 0..100 {
            assert_eq!(
                engine.get(&format!("k{i:03}")).unwrap(),
                Some(format!("v{i}").into_bytes())
            );
        }
        engine.close().unwrap();
    }

    #[test]
    fn test_replay_is_idempotent_over_existing_tables() {
        // A crash between the manifest edit and the WAL checkpoint leaves
        // the flushed records both in a table and in the WAL. Replay
        // reapplies them to the memtable; reads still return one value.
        let tmp = TempDir::new().unwrap();

        let engine = open_engine(memtable_only_config(tmp.path()));
        engine.put("k", b"v1").unwrap();
        engine.flush().unwrap();
        // Simulate the replayed duplicate by writing the same key again
        // (the WAL now holds it, the table holds the older version).
        engine.put("k", b"v1").unwrap();
        engine.close().unwrap();
        drop(engine);

        let engine = open_engine(memtable_only_config(tmp.path()));
        assert_eq!(engine.get("k").unwrap(), Some(b"v1".to_vec()));
        engine.close().unwrap();
    }

    #[test]
    fn test_sequence_continuity_across_restart() {
        let tmp = TempDir::new().unwrap();

        let engine = open_engine(memtable_only_config(tmp.path()));
        engine.put("a", b"1").unwrap();
        engine.put("b", b"2").unwrap();
        engine.close().unwrap();
        drop(engine);

        // New writes after restart must not collide with replayed ones:
        // overwrite semantics keep working.
        let engine = open_engine(memtable_only_config(tmp.path()));
        engine.put("a", b"newer").unwrap();
        assert_eq!(engine.get("a").unwrap(), Some(b"newer".to_vec()));
        assert_eq!(engine.get("b").unwrap(), Some(b"2".to_vec()));
        engine.close().unwrap();
    }
}
