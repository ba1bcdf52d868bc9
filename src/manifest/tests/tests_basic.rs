#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use tempfile::TempDir;

    use crate::manifest::tests::helpers::{fake_meta, init_tracing};
    use crate::manifest::{Manifest, ManifestEdit, ManifestError};

    #[test]
    fn test_fresh_directory_starts_empty() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let manifest = Manifest::open(tmp.path()).unwrap();
        let state = manifest.state();
        assert!(state.sstables.is_empty());
        assert_eq!(state.next_file_number, 1);
        assert_eq!(state.last_flushed_sequence, 0);
        assert_eq!(state.version, 0);
    }

    #[test]
    fn test_state_survives_reopen() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let manifest = Manifest::open(tmp.path()).unwrap();
        manifest
            .apply_edit(ManifestEdit {
                added: vec![fake_meta(1), fake_meta(2)],
                last_flushed_sequence: Some(17),
                ..Default::default()
            })
            .unwrap();
        let before = manifest.state();
        drop(manifest);

        let manifest = Manifest::open(tmp.path()).unwrap();
        assert_eq!(manifest.state(), before);
    }

    #[test]
    fn test_fresh_state_is_not_persisted_until_first_edit() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let _manifest = Manifest::open(tmp.path()).unwrap();
        assert!(!tmp.path().join("MANIFEST").exists());
    }

    #[test]
    fn test_no_tmp_file_left_after_edit() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let manifest = Manifest::open(tmp.path()).unwrap();
        manifest
            .apply_edit(ManifestEdit {
                added: vec![fake_meta(1)],
                ..Default::default()
            })
            .unwrap();

        assert!(tmp.path().join("MANIFEST").exists());
        assert!(!tmp.path().join("MANIFEST.tmp").exists());
    }

    #[test]
    fn test_corrupt_checksum_is_fatal() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let manifest = Manifest::open(tmp.path()).unwrap();
        manifest
            .apply_edit(ManifestEdit {
                added: vec![fake_meta(1)],
                ..Default::default()
            })
            .unwrap();
        drop(manifest);

        let path = tmp.path().join("MANIFEST");
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(20)).unwrap();
        file.write_all(&[0xFF, 0xFF]).unwrap();
        file.sync_all().unwrap();

        let err = Manifest::open(tmp.path()).unwrap_err();
        assert!(matches!(err, ManifestError::ChecksumMismatch));
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let manifest = Manifest::open(tmp.path()).unwrap();
        manifest
            .apply_edit(ManifestEdit {
                added: vec![fake_meta(1)],
                ..Default::default()
            })
            .unwrap();
        drop(manifest);

        // Rewriting the magic also breaks the checksum, so patch both: the
        // simplest honest corruption is truncating to a garbage prefix.
        let path = tmp.path().join("MANIFEST");
        std::fs::write(&path, b"NOT A MANIFEST AT ALL").unwrap();

        let err = Manifest::open(tmp.path()).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::ChecksumMismatch | ManifestError::BadMagic(_)
        ));
    }
}
