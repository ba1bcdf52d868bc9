#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::sstable::tests::helpers::{build_numbered_table, init_tracing, open_table};

    #[test]
    fn test_get_every_key_matches_scan() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 100, 10);
        let table = open_table(&meta);

        let scanned: Vec<_> = table.iter_all().collect();
        assert_eq!(scanned.len(), 100);
        for entry in scanned {
            let direct = table.get(&entry.key).unwrap().unwrap();
            assert_eq!(direct, entry, "get and scan disagree for {}", entry.key);
        }
    }

    #[test]
    fn test_get_absent_key_in_range() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        // Keys k000, k002, k004 ... — odd keys are absent but in range.
        let mut writer =
            crate::sstable::SsTableWriter::new(tmp.path(), 1, 3, None).unwrap();
        for i in (0..20).step_by(2) {
            writer
                .add(&format!("k{i:03}"), format!("v{i}").as_bytes(), 1, false)
                .unwrap();
        }
        let meta = writer.build().unwrap();
        let table = open_table(&meta);

        assert!(table.get("k003").unwrap().is_none());
        assert!(table.get("k015").unwrap().is_none());
        assert_eq!(table.get("k004").unwrap().unwrap().value, b"v4");
    }

    #[test]
    fn test_get_outside_range_is_rejected_without_io() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 10, 5);
        let table = open_table(&meta);

        assert!(!table.maybe_contains("a"));
        assert!(!table.maybe_contains("z"));
        assert!(table.get("a").unwrap().is_none());
        assert!(table.get("z").unwrap().is_none());
    }

    #[test]
    fn test_get_with_interval_one() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        // Dense index: every entry is indexed.
        let meta = build_numbered_table(tmp.path(), 1, 30, 1);
        let table = open_table(&meta);
        for i in 0..30 {
            assert!(table.get(&format!("k{i:03}")).unwrap().is_some());
        }
    }

    #[test]
    fn test_get_boundary_keys() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 50, 7);
        let table = open_table(&meta);

        assert_eq!(table.get("k000").unwrap().unwrap().value, b"v0");
        assert_eq!(table.get("k049").unwrap().unwrap().value, b"v49");
    }
}
