//! Per-file fan-out replicator (spec.md §4.F).

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::checksum::sha256_file;
use crate::config::DestinationSpec;
use crate::destination::DestinationAdapter;
use crate::error::{DestinationFailure, ErrorKind, ReplicationError, failure_from};

/// One configured sink paired with the adapter built for it, held for the
/// lifetime of the process (spec.md §4.A).
pub struct ConfiguredDestination {
    pub spec: DestinationSpec,
    pub adapter: Box<dyn DestinationAdapter>,
}

pub struct Replicator {
    ingest_root: PathBuf,
    destinations: Vec<ConfiguredDestination>,
    checksum_retry_limit: usize,
}

impl Replicator {
    pub fn new(
        ingest_root: PathBuf,
        destinations: Vec<ConfiguredDestination>,
        checksum_retry_limit: usize,
    ) -> Self {
        Replicator { ingest_root, destinations, checksum_retry_limit }
    }

    /// Run the full contract for one source path. Removes the source on
    /// verified success; leaves it in place on any failure (spec.md
    /// invariants I1/I2).
    pub fn replicate(&self, source_path: &Path) -> Result<(), ReplicationError> {
        let rel_path = self.rel_path(source_path)?;

        let mut attempt = 0usize;
        loop {
            match self.attempt(source_path, &rel_path) {
                AttemptOutcome::Success => {
                    if let Err(e) = std::fs::remove_file(source_path) {
                        warn!(?source_path, "failed to remove source after successful replication: {e}");
                        return Err(ReplicationError::new(
                            rel_path,
                            vec![DestinationFailure {
                                destination: "source".to_string(),
                                kind: ErrorKind::PermanentOther,
                                message: format!("source removal failed: {e}"),
                            }],
                        ));
                    }
                    return Ok(());
                }
                AttemptOutcome::Failures(failures) => {
                    return Err(ReplicationError::new(rel_path, failures));
                }
                AttemptOutcome::ChecksumMismatch => {
                    attempt += 1;
                    warn!(%rel_path, attempt, "checksum mismatch, source mutated mid-flight, retrying");
                    if attempt > self.checksum_retry_limit {
                        return Err(ReplicationError::new(
                            rel_path,
                            vec![DestinationFailure {
                                destination: "*".to_string(),
                                kind: ErrorKind::ChecksumMismatch,
                                message: format!(
                                    "source did not stabilise after {} retries",
                                    self.checksum_retry_limit
                                ),
                            }],
                        ));
                    }
                }
            }
        }
    }

    /// Step 1 (spec.md §4.F): rel_path relative to ingest_root, forced to
    /// `/`-separated form for destination URIs (spec.md §6). Failure (source
    /// outside root) is fatal for this attempt.
    fn rel_path(&self, source_path: &Path) -> Result<String, ReplicationError> {
        let rel = source_path.strip_prefix(&self.ingest_root).map_err(|e| {
            ReplicationError::new(
                source_path.display().to_string(),
                vec![DestinationFailure {
                    destination: "ingest_root".to_string(),
                    kind: ErrorKind::PermanentOther,
                    message: format!("source is not under ingest root: {e}"),
                }],
            )
        })?;
        Ok(rel.to_string_lossy().replace('\\', "/"))
    }

    fn attempt(&self, source_path: &Path, rel_path: &str) -> AttemptOutcome {
        // Steps 2-3: initial checksum and source stat. Both failures are
        // fatal for this attempt (source retained, re-examined on the next
        // watcher event).
        let initial_checksum = match sha256_file(source_path) {
            Ok(c) => c,
            Err(e) => {
                return AttemptOutcome::Failures(vec![DestinationFailure {
                    destination: "source".to_string(),
                    kind: ErrorKind::IntegrityRead,
                    message: format!("failed to checksum source: {e}"),
                }]);
            }
        };

        // Step 4: fan out to every destination, never short-circuiting.
        let mut failures = Vec::new();
        for dest in &self.destinations {
            if let Err(e) = dest.adapter.ensure() {
                failures.push(failure_from(&dest.spec, &e));
                continue;
            }
            if let Err(e) = dest.adapter.put(source_path, rel_path) {
                failures.push(failure_from(&dest.spec, &e));
            }
        }

        if !failures.is_empty() {
            // Step 5: at least one destination failed. Source stays in place,
            // successful destinations are not rolled back (spec.md §9).
            return AttemptOutcome::Failures(failures);
        }

        // Step 6: every destination succeeded. Verify the source did not
        // mutate underneath us.
        let final_checksum = match sha256_file(source_path) {
            Ok(c) => c,
            Err(e) => {
                return AttemptOutcome::Failures(vec![DestinationFailure {
                    destination: "source".to_string(),
                    kind: ErrorKind::IntegrityRead,
                    message: format!("failed to re-checksum source: {e}"),
                }]);
            }
        };

        if initial_checksum != final_checksum {
            for dest in &self.destinations {
                if let Err(e) = dest.adapter.delete(rel_path) {
                    warn!(destination = dest.spec.describe(), "cleanup delete after checksum mismatch failed: {e}");
                }
            }
            return AttemptOutcome::ChecksumMismatch;
        }

        info!(%rel_path, "replication complete");
        AttemptOutcome::Success
    }
}

enum AttemptOutcome {
    Success,
    Failures(Vec<DestinationFailure>),
    ChecksumMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::FilesystemAdapter;
    use std::path::PathBuf;

    fn dest(base: PathBuf) -> ConfiguredDestination {
        ConfiguredDestination {
            spec: DestinationSpec::Filesystem { base_path: base.clone() },
            adapter: Box::new(FilesystemAdapter::new(base)),
        }
    }

    #[test]
    fn single_destination_success_removes_source() {
        let ingest = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let source = ingest.path().join("a/b.txt");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"hello").unwrap();

        let replicator = Replicator::new(
            ingest.path().to_path_buf(),
            vec![dest(out.path().to_path_buf())],
            3,
        );
        replicator.replicate(&source).unwrap();

        assert!(!source.exists());
        assert_eq!(std::fs::read(out.path().join("a/b.txt")).unwrap(), b"hello");
    }

    #[test]
    fn fan_out_to_two_destinations_both_receive_file() {
        let ingest = tempfile::tempdir().unwrap();
        let out1 = tempfile::tempdir().unwrap();
        let out2 = tempfile::tempdir().unwrap();
        let source = ingest.path().join("x.bin");
        std::fs::write(&source, vec![7u8; 1024]).unwrap();

        let replicator = Replicator::new(
            ingest.path().to_path_buf(),
            vec![dest(out1.path().to_path_buf()), dest(out2.path().to_path_buf())],
            3,
        );
        replicator.replicate(&source).unwrap();

        assert!(!source.exists());
        assert_eq!(std::fs::read(out1.path().join("x.bin")).unwrap(), vec![7u8; 1024]);
        assert_eq!(std::fs::read(out2.path().join("x.bin")).unwrap(), vec![7u8; 1024]);
    }

    #[test]
    fn one_failing_destination_retains_source_and_reports_both() {
        let ingest = tempfile::tempdir().unwrap();
        let out_good = tempfile::tempdir().unwrap();
        let source = ingest.path().join("x.txt");
        std::fs::write(&source, b"hello").unwrap();

        // A filesystem base path that does not exist and cannot be created:
        // point inside a file, so create_dir_all fails.
        let blocker_file = tempfile::NamedTempFile::new().unwrap();
        let bad_base = blocker_file.path().join("nested");

        let replicator = Replicator::new(
            ingest.path().to_path_buf(),
            vec![dest(out_good.path().to_path_buf()), dest(bad_base)],
            3,
        );
        let err = replicator.replicate(&source).unwrap_err();

        assert!(source.exists());
        assert_eq!(err.failures.len(), 1);
        assert!(std::fs::read(out_good.path().join("x.txt")).is_ok());
    }

    #[test]
    fn rel_path_outside_ingest_root_is_fatal() {
        let ingest = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let source = outside.path().join("a.txt");
        std::fs::write(&source, b"hi").unwrap();

        let out = tempfile::tempdir().unwrap();
        let replicator =
            Replicator::new(ingest.path().to_path_buf(), vec![dest(out.path().to_path_buf())], 3);
        assert!(replicator.replicate(&source).is_err());
        assert!(source.exists());
    }
}
