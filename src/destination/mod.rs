//! Destination adapters: a uniform `ensure`/`put`/`delete` capability set
//! parameterized by one [`DestinationSpec`] (spec.md §4.A).

mod filesystem;
mod ftp;
mod s3;
mod sftp;

use std::path::Path;
use std::sync::Arc;

pub use filesystem::FilesystemAdapter;
pub use ftp::FtpAdapter;
pub use s3::S3Adapter;
pub use sftp::SftpAdapter;

use crate::config::DestinationSpec;
use crate::error::AdapterError;
use crate::s3_cache::S3ClientCache;

/// Capability set every destination kind implements identically in shape,
/// divergently in wire protocol. Built once per [`DestinationSpec`] and
/// shared (`Arc`) across worker threads.
pub trait DestinationAdapter: Send + Sync {
    /// Create the destination container (directory/bucket) if absent.
    fn ensure(&self) -> Result<(), AdapterError>;

    /// Stream `source_path`'s bytes to `rel_path` at this destination.
    fn put(&self, source_path: &Path, rel_path: &str) -> Result<(), AdapterError>;

    /// Remove `rel_path`. Not-found is success (spec.md §4.A, idempotent).
    fn delete(&self, rel_path: &str) -> Result<(), AdapterError>;

    /// Identity used in logs and composite errors. Never includes credentials.
    fn describe(&self) -> String;
}

/// Construct the adapter for one destination spec. S3 adapters share a
/// client through `s3_cache` (spec.md §4.B).
pub fn build(
    spec: &DestinationSpec,
    s3_cache: &Arc<S3ClientCache>,
) -> Result<Box<dyn DestinationAdapter>, AdapterError> {
    match spec {
        DestinationSpec::Filesystem { base_path } => {
            Ok(Box::new(FilesystemAdapter::new(base_path.clone())))
        }
        DestinationSpec::S3 { .. } => Ok(Box::new(S3Adapter::new(spec.clone(), s3_cache.clone())?)),
        DestinationSpec::Ftp { host, port, username, password, remote_path } => Ok(Box::new(
            FtpAdapter::new(host.clone(), *port, username.clone(), password.clone(), remote_path.clone()),
        )),
        DestinationSpec::Sftp { host, port, username, password, remote_path, known_hosts_path } => {
            Ok(Box::new(SftpAdapter::new(
                host.clone(),
                *port,
                username.clone(),
                password.clone(),
                remote_path.clone(),
                known_hosts_path.clone(),
            )))
        }
    }
}

/// Content-type inferred from a file extension (spec.md §4.A, S3 variant).
pub(crate) fn content_type_for(rel_path: &str) -> &'static str {
    match rel_path.rsplit('.').next().unwrap_or("") {
        "txt" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Normalise a relative path to forward slashes for remote destinations
/// (spec.md §6: "relative paths at destinations always use `/`").
pub(crate) fn normalize_separators(rel_path: &str) -> String {
    rel_path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_matches_known_extensions() {
        assert_eq!(content_type_for("a/b.txt"), "text/plain");
        assert_eq!(content_type_for("a/b.json"), "application/json");
        assert_eq!(content_type_for("a/b.pdf"), "application/pdf");
        assert_eq!(content_type_for("a/b.bin"), "application/octet-stream");
        assert_eq!(content_type_for("a/b"), "application/octet-stream");
    }

    #[test]
    fn normalize_separators_replaces_backslashes() {
        assert_eq!(normalize_separators("a\\b\\c.txt"), "a/b/c.txt");
        assert_eq!(normalize_separators("a/b/c.txt"), "a/b/c.txt");
    }
}
