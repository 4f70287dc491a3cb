use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::warn;

use super::DestinationAdapter;
use crate::error::{AdapterError, ErrorKind};

pub struct FilesystemAdapter {
    base_path: PathBuf,
}

impl FilesystemAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        FilesystemAdapter { base_path }
    }

    fn resolve(&self, rel_path: &str) -> PathBuf {
        self.base_path.join(super::normalize_separators(rel_path))
    }
}

impl DestinationAdapter for FilesystemAdapter {
    fn ensure(&self) -> Result<(), AdapterError> {
        fs::create_dir_all(&self.base_path).map_err(|e| AdapterError::from_io(&e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o755);
            let _ = fs::set_permissions(&self.base_path, perms);
        }
        Ok(())
    }

    fn put(&self, source_path: &Path, rel_path: &str) -> Result<(), AdapterError> {
        let target = self.resolve(rel_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| AdapterError::from_io(&e))?;
        }
        // Fresh file each time: a stale partial write at `target` must never
        // be observed as a successful put (spec.md invariant I3, idempotence).
        let mut dest = File::create(&target).map_err(|e| AdapterError::from_io(&e))?;
        let mut src = File::open(source_path).map_err(|e| AdapterError::from_io(&e))?;
        io::copy(&mut src, &mut dest).map_err(|e| AdapterError::from_io(&e))?;
        drop(dest);

        if let Ok(meta) = fs::metadata(source_path) {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(&target, fs::Permissions::from_mode(meta.permissions().mode()))
                {
                    warn!(?target, "best-effort chmod failed: {e}");
                }
            }
            let atime = FileTime::from_last_access_time(&meta);
            let mtime = FileTime::from_last_modification_time(&meta);
            if let Err(e) = filetime::set_file_times(&target, atime, mtime) {
                warn!(?target, "best-effort mtime/atime preservation failed: {e}");
            }
        }
        Ok(())
    }

    fn delete(&self, rel_path: &str) -> Result<(), AdapterError> {
        let target = self.resolve(rel_path);
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AdapterError::from_io(&e)),
        }
    }

    fn describe(&self) -> String {
        format!("filesystem:{}", self.base_path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_creates_parent_dirs_and_preserves_content() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let source_path = src_dir.path().join("a.txt");
        std::fs::write(&source_path, b"hello").unwrap();

        let adapter = FilesystemAdapter::new(dst_dir.path().to_path_buf());
        adapter.ensure().unwrap();
        adapter.put(&source_path, "sub/dir/a.txt").unwrap();

        let written = std::fs::read(dst_dir.path().join("sub/dir/a.txt")).unwrap();
        assert_eq!(written, b"hello");
    }

    #[test]
    fn put_is_idempotent_by_path() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let source_path = src_dir.path().join("a.txt");
        std::fs::write(&source_path, b"v1").unwrap();

        let adapter = FilesystemAdapter::new(dst_dir.path().to_path_buf());
        adapter.put(&source_path, "a.txt").unwrap();
        std::fs::write(&source_path, b"v2-longer").unwrap();
        adapter.put(&source_path, "a.txt").unwrap();

        let written = std::fs::read(dst_dir.path().join("a.txt")).unwrap();
        assert_eq!(written, b"v2-longer");
    }

    #[test]
    fn delete_of_missing_file_is_success() {
        let dst_dir = tempfile::tempdir().unwrap();
        let adapter = FilesystemAdapter::new(dst_dir.path().to_path_buf());
        adapter.delete("does/not/exist.txt").unwrap();
    }
}
