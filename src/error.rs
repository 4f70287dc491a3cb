//! Error taxonomy shared by every destination adapter and the replicator.

use std::fmt;

use crate::config::DestinationSpec;

/// Classification used to decide whether a failure is fatal for the current
/// attempt, silently treated as success (not-found on delete), or a signal
/// to retry the whole fan-out (checksum mismatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    IoNotFound,
    IoPermission,
    NetTransient,
    Auth,
    ChecksumMismatch,
    IntegrityRead,
    PermanentOther,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::IoNotFound => "io_not_found",
            ErrorKind::IoPermission => "io_permission",
            ErrorKind::NetTransient => "net_transient",
            ErrorKind::Auth => "auth",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::IntegrityRead => "integrity_read",
            ErrorKind::PermanentOther => "permanent_other",
        };
        f.write_str(s)
    }
}

/// Error surfaced by a single destination adapter operation.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        AdapterError { kind, message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::IoNotFound
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::IoNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::IoPermission,
            _ => ErrorKind::PermanentOther,
        };
        AdapterError::new(kind, err.to_string())
    }
}

/// One destination's contribution to a failed fan-out attempt.
#[derive(Debug)]
pub struct DestinationFailure {
    pub destination: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Composite, per-file error returned when at least one destination in the
/// fan-out failed. Carries every failure so operators can diagnose a
/// multi-target outage from a single log line (spec.md §4.F step 4).
#[derive(Debug, thiserror::Error)]
pub struct ReplicationError {
    pub rel_path: String,
    pub failures: Vec<DestinationFailure>,
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replication of {} failed at {} destination(s): ", self.rel_path, self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} ({}: {})", failure.destination, failure.kind, failure.message)?;
        }
        Ok(())
    }
}

impl ReplicationError {
    pub fn new(rel_path: impl Into<String>, failures: Vec<DestinationFailure>) -> Self {
        ReplicationError { rel_path: rel_path.into(), failures }
    }
}

pub fn failure_from(spec: &DestinationSpec, err: &AdapterError) -> DestinationFailure {
    DestinationFailure {
        destination: spec.describe(),
        kind: err.kind,
        message: err.message.clone(),
    }
}

/// Top-level error surfaced at startup for a fatal configuration problem.
/// The only error kind that maps directly to a non-zero process exit.
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);
