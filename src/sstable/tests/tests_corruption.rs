#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use tempfile::TempDir;

    use crate::sstable::tests::helpers::{build_numbered_table, init_tracing};
    use crate::sstable::{SsTable, SsTableError};

    #[test]
    fn test_bad_magic_is_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 10, 5);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&meta.file_path)
            .unwrap();
        file.seek(SeekFrom::End(-4)).unwrap();
        file.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        file.sync_all().unwrap();

        let err = SsTable::open(&meta.file_path).unwrap_err();
        assert!(matches!(err, SsTableError::BadMagic(0xDEADBEEF)));
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 10, 5);
        // The version is the last footer field, 10 bytes from the end
        // (version:u16 + footer_size:u32 + magic:u32).
        let mut file = OpenOptions::new()
            .write(true)
            .open(&meta.file_path)
            .unwrap();
        file.seek(SeekFrom::End(-10)).unwrap();
        file.write_all(&99u16.to_be_bytes()).unwrap();
        file.sync_all().unwrap();

        let err = SsTable::open(&meta.file_path).unwrap_err();
        assert!(matches!(err, SsTableError::UnsupportedVersion(99)));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 10, 5);
        let file = OpenOptions::new()
            .write(true)
            .open(&meta.file_path)
            .unwrap();
        file.set_len(4).unwrap();
        file.sync_all().unwrap();

        let err = SsTable::open(&meta.file_path).unwrap_err();
        assert!(matches!(err, SsTableError::Corrupt(_)));
    }

    #[test]
    fn test_oversized_footer_size_is_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let meta = build_numbered_table(tmp.path(), 1, 10, 5);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&meta.file_path)
            .unwrap();
        file.seek(SeekFrom::End(-8)).unwrap();
        file.write_all(&u32::MAX.to_be_bytes()).unwrap();
        file.sync_all().unwrap();

        let err = SsTable::open(&meta.file_path).unwrap_err();
        assert!(matches!(err, SsTableError::Corrupt(_)));
    }
}
