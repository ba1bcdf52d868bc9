#[cfg(test)]
mod tests {
    use crate::engine::merge::{MergeEntry, MergeIterator, MergeSource};

    fn entry(key: &str, value: &[u8]) -> MergeEntry {
        MergeEntry {
            key: key.to_string(),
            value: value.to_vec(),
            timestamp_ms: 0,
            tombstone: false,
        }
    }

    fn tombstone(key: &str) -> MergeEntry {
        MergeEntry {
            key: key.to_string(),
            value: Vec::new(),
            timestamp_ms: 0,
            tombstone: true,
        }
    }

    fn source(entries: Vec<MergeEntry>) -> MergeSource<'static> {
        Box::new(entries.into_iter())
    }

    #[test]
    fn test_single_source_passes_through() {
        let merged: Vec<_> = MergeIterator::new(
            vec![source(vec![entry("a", b"1"), entry("b", b"2")])],
            false,
        )
        .collect();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key, "a");
        assert_eq!(merged[1].key, "b");
    }

    #[test]
    fn test_output_is_globally_sorted() {
        let merged: Vec<_> = MergeIterator::new(
            vec![
                source(vec![entry("b", b"1"), entry("d", b"2")]),
                source(vec![entry("a", b"3"), entry("c", b"4"), entry("e", b"5")]),
            ],
            false,
        )
        .collect();
        let keys: Vec<&str> = merged.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_lowest_source_index_wins_duplicates() {
        // Source 0 is newest; its version of "k" must win everywhere.
        let merged: Vec<_> = MergeIterator::new(
            vec![
                source(vec![entry("k", b"newest")]),
                source(vec![entry("k", b"middle")]),
                source(vec![entry("k", b"oldest")]),
            ],
            false,
        )
        .collect();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].value, b"newest");
    }

    #[test]
    fn test_exactly_one_emission_per_key() {
        let merged: Vec<_> = MergeIterator::new(
            vec![
                source(vec![entry("a", b"0a"), entry("b", b"0b")]),
                source(vec![entry("a", b"1a"), entry("c", b"1c")]),
                source(vec![entry("b", b"2b"), entry("c", b"2c"), entry("d", b"2d")]),
            ],
            false,
        )
        .collect();
        let keys: Vec<&str> = merged.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
        assert_eq!(merged[0].value, b"0a");
        assert_eq!(merged[1].value, b"0b");
        assert_eq!(merged[2].value, b"1c");
        assert_eq!(merged[3].value, b"2d");
    }

    #[test]
    fn test_duplicate_streak_does_not_starve_sources() {
        // After discarding a duplicate, the losing source must advance and
        // keep contributing its later keys.
        let merged: Vec<_> = MergeIterator::new(
            vec![
                source(vec![entry("a", b"new")]),
                source(vec![entry("a", b"old"), entry("b", b"kept")]),
            ],
            false,
        )
        .collect();
        let keys: Vec<&str> = merged.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(merged[1].value, b"kept");
    }

    #[test]
    fn test_tombstone_filtering_removes_deleted_keys() {
        let merged: Vec<_> = MergeIterator::new(
            vec![
                source(vec![tombstone("a"), entry("b", b"2")]),
                source(vec![entry("a", b"shadowed"), entry("c", b"3")]),
            ],
            true,
        )
        .collect();
        let keys: Vec<&str> = merged.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn test_tombstones_kept_when_not_filtering() {
        let merged: Vec<_> = MergeIterator::new(
            vec![
                source(vec![tombstone("a")]),
                source(vec![entry("a", b"shadowed")]),
            ],
            false,
        )
        .collect();
        assert_eq!(merged.len(), 1);
        assert!(merged[0].tombstone);
    }

    #[test]
    fn test_old_tombstone_shadowed_by_newer_put() {
        // Newest source resurrects the key; the older tombstone loses and
        // must not suppress the value even with filtering on.
        let merged: Vec<_> = MergeIterator::new(
            vec![
                source(vec![entry("a", b"alive")]),
                source(vec![tombstone("a")]),
            ],
            true,
        )
        .collect();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].value, b"alive");
    }

    #[test]
    fn test_empty_sources() {
        let merged: Vec<_> = MergeIterator::new(
            vec![source(vec![]), source(vec![entry("a", b"1")]), source(vec![])],
            false,
        )
        .collect();
        assert_eq!(merged.len(), 1);

        let empty: Vec<_> = MergeIterator::new(vec![], true).collect();
        assert!(empty.is_empty());
    }
}
