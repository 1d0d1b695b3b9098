/*!
Local snapshot directory resolution.

Restores land in a directory owned by the embedding application. The store
only asks for it once a snapshot has actually been fetched, so a failed
fetch never creates directories on disk.
*/

use std::io;
use std::path::{Path, PathBuf};

use crate::Result;

/// Resolves the writable local directory that holds snapshots
pub trait SnapshotDirResolver: Send + Sync {
    /// Return the snapshot directory, creating it first when `create` is set
    fn snapshot_dir(&self, create: bool) -> Result<PathBuf>;
}

/// Snapshot directory at a fixed filesystem path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSnapshotDir {
    root: PathBuf,
}

impl LocalSnapshotDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl SnapshotDirResolver for LocalSnapshotDir {
    fn snapshot_dir(&self, create: bool) -> Result<PathBuf> {
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(self.root.clone()),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", self.root.display()),
            )
            .into()),
            Err(e) if create && e.kind() == io::ErrorKind::NotFound => {
                create_private_dir(&self.root)?;
                Ok(self.root.clone())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CofferError;
    use tempfile::TempDir;

    #[test]
    fn test_existing_directory_is_returned() {
        let temp_dir = TempDir::new().unwrap();
        let resolver = LocalSnapshotDir::new(temp_dir.path());

        assert_eq!(resolver.snapshot_dir(false).unwrap(), temp_dir.path());
        assert_eq!(resolver.snapshot_dir(true).unwrap(), temp_dir.path());
    }

    #[test]
    fn test_missing_directory_without_create_fails() {
        let temp_dir = TempDir::new().unwrap();
        let resolver = LocalSnapshotDir::new(temp_dir.path().join("missing"));

        let err = resolver.snapshot_dir(false).unwrap_err();
        assert!(matches!(err, CofferError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
        assert!(!resolver.path().exists());
    }

    #[test]
    fn test_missing_directory_is_created() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("server").join("db").join("snapshots");
        let resolver = LocalSnapshotDir::new(&root);

        assert_eq!(resolver.snapshot_dir(true).unwrap(), root);
        assert!(root.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&root).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_file_in_place_of_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("snapshots");
        std::fs::write(&file, b"not a dir").unwrap();

        let resolver = LocalSnapshotDir::new(&file);
        assert!(resolver.snapshot_dir(true).is_err());
    }
}
