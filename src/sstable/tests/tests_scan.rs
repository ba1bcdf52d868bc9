#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::sstable::tests::helpers::{build_numbered_table, init_tracing, open_table};

    #[test]
    fn test_scan_subrange_inclusive() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 50, 10);
        let table = open_table(&meta);

        let keys: Vec<String> = table
            .iter_range("k010", "k020")
            .map(|e| e.key)
            .collect();
        let expected: Vec<String> = (10..=20).map(|i| format!("k{i:03}")).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_scan_start_between_index_points() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        // Interval 10: k013 sits between indexed k010 and k020; the scan
        // must skip k010..k012 rather than emit them.
        let meta = build_numbered_table(tmp.path(), 1, 30, 10);
        let table = open_table(&meta);

        let keys: Vec<String> = table.iter_range("k013", "k015").map(|e| e.key).collect();
        assert_eq!(keys, vec!["k013", "k014", "k015"]);
    }

    #[test]
    fn test_scan_bounds_outside_table() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 10, 5);
        let table = open_table(&meta);

        // Start before the first key, end after the last.
        let keys: Vec<String> = table.iter_range("a", "z").map(|e| e.key).collect();
        assert_eq!(keys.len(), 10);

        // Entirely below and entirely above yield nothing.
        assert_eq!(table.iter_range("a", "b").count(), 0);
        assert_eq!(table.iter_range("x", "z").count(), 0);
    }

    #[test]
    fn test_scan_single_key_range() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 20, 10);
        let table = open_table(&meta);

        let entries: Vec<_> = table.iter_range("k007", "k007").collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "k007");
    }

    #[test]
    fn test_iter_all_is_ascending_and_complete() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 64, 9);
        let table = open_table(&meta);

        let keys: Vec<String> = table.iter_all().map(|e| e.key).collect();
        assert_eq!(keys.len(), 64);
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
