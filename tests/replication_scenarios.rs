//! End-to-end replicator scenarios (spec.md §8, S1-S4).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use replicatord::config::DestinationSpec;
use replicatord::destination::{DestinationAdapter, FilesystemAdapter};
use replicatord::error::AdapterError;
use replicatord::replicator::{ConfiguredDestination, Replicator};

fn fs_dest(base: std::path::PathBuf) -> ConfiguredDestination {
    ConfiguredDestination {
        spec: DestinationSpec::Filesystem { base_path: base.clone() },
        adapter: Box::new(FilesystemAdapter::new(base)),
    }
}

#[test]
fn s1_single_filesystem_target() {
    let ingest = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = ingest.path().join("a/b.txt");
    std::fs::create_dir_all(source.parent().unwrap()).unwrap();
    std::fs::write(&source, b"hello").unwrap();

    let replicator =
        Replicator::new(ingest.path().to_path_buf(), vec![fs_dest(out.path().to_path_buf())], 3);
    replicator.replicate(&source).unwrap();

    assert_eq!(std::fs::read(out.path().join("a/b.txt")).unwrap(), b"hello");
    assert!(!source.exists());
}

#[test]
fn s2_fan_out_two_filesystems_identical_bytes() {
    let ingest = tempfile::tempdir().unwrap();
    let out1 = tempfile::tempdir().unwrap();
    let out2 = tempfile::tempdir().unwrap();
    let source = ingest.path().join("x.bin");
    let content: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&source, &content).unwrap();

    let replicator = Replicator::new(
        ingest.path().to_path_buf(),
        vec![fs_dest(out1.path().to_path_buf()), fs_dest(out2.path().to_path_buf())],
        3,
    );
    replicator.replicate(&source).unwrap();

    assert_eq!(std::fs::read(out1.path().join("x.bin")).unwrap(), content);
    assert_eq!(std::fs::read(out2.path().join("x.bin")).unwrap(), content);
    assert!(!source.exists());
}

#[test]
fn s3_one_destination_failing_retains_source_and_names_it() {
    let ingest = tempfile::tempdir().unwrap();
    let out_good = tempfile::tempdir().unwrap();
    let source = ingest.path().join("x.txt");
    std::fs::write(&source, b"hello").unwrap();

    // A base path nested inside a plain file can never be created.
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let unwritable_base = blocker.path().join("nested/dir");

    let replicator = Replicator::new(
        ingest.path().to_path_buf(),
        vec![fs_dest(out_good.path().to_path_buf()), fs_dest(unwritable_base.clone())],
        3,
    );
    let err = replicator.replicate(&source).unwrap_err();

    assert!(source.exists(), "source must be retained on partial failure");
    assert_eq!(std::fs::read(out_good.path().join("x.txt")).unwrap(), b"hello");
    assert_eq!(err.failures.len(), 1);
    assert!(err.failures[0].destination.contains(&unwritable_base.display().to_string()));
}

/// Wraps a real [`FilesystemAdapter`] and mutates the shared source file the
/// first time `put` is called, deterministically producing the
/// initial/final checksum mismatch S4 describes without relying on timing.
struct MutatingAdapter {
    inner: FilesystemAdapter,
    mutated: AtomicBool,
    new_content: Mutex<Vec<u8>>,
}

impl DestinationAdapter for MutatingAdapter {
    fn ensure(&self) -> Result<(), AdapterError> {
        self.inner.ensure()
    }

    fn put(&self, source_path: &Path, rel_path: &str) -> Result<(), AdapterError> {
        self.inner.put(source_path, rel_path)?;
        if !self.mutated.swap(true, Ordering::SeqCst) {
            let new_content = self.new_content.lock().unwrap().clone();
            std::fs::write(source_path, new_content).map_err(|e| AdapterError::from_io(&e))?;
        }
        Ok(())
    }

    fn delete(&self, rel_path: &str) -> Result<(), AdapterError> {
        self.inner.delete(rel_path)
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

#[test]
fn s4_mid_flight_modification_retries_then_succeeds() {
    let ingest = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = ingest.path().join("x.txt");
    std::fs::write(&source, b"v1").unwrap();

    let adapter = MutatingAdapter {
        inner: FilesystemAdapter::new(out.path().to_path_buf()),
        mutated: AtomicBool::new(false),
        new_content: Mutex::new(b"v2".to_vec()),
    };
    let destinations = vec![ConfiguredDestination {
        spec: DestinationSpec::Filesystem { base_path: out.path().to_path_buf() },
        adapter: Box::new(adapter),
    }];

    let replicator = Replicator::new(ingest.path().to_path_buf(), destinations, 3);
    replicator.replicate(&source).unwrap();

    assert!(!source.exists());
    assert_eq!(std::fs::read(out.path().join("x.txt")).unwrap(), b"v2");
}
