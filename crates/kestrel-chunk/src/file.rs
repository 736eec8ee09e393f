//! File abstraction used by chunk storage.
//!
//! Chunk files are written once and then only read, so the interface is
//! positional: `read_at` and `write_at` never depend on a shared cursor.

use crate::constants::LOCK_FILE_NAME;
use kestrel_common::{KestrelError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Random access to one file.
pub trait FileStorage: Send + Sync {
    /// Reads exactly `len` bytes at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Writes all of `data` at `offset`, extending the file if needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current file length.
    fn size(&self) -> Result<u64>;

    fn truncate(&self, len: u64) -> Result<()>;

    /// Flushes file contents to stable storage.
    fn sync(&self) -> Result<()>;

    fn path(&self) -> &Path;
}

/// Directory-level operations.
pub trait FileSystem: Send + Sync {
    /// Opens a file for reading and writing, creating it if `create` is set.
    fn open(&self, path: &Path, create: bool) -> Result<Arc<dyn FileStorage>>;

    fn remove(&self, path: &Path) -> Result<()>;

    /// Lists the regular files directly inside `dir`.
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    fn create_dir_all(&self, dir: &Path) -> Result<()>;

    /// Deletes a directory and everything in it.
    fn remove_dir_all(&self, dir: &Path) -> Result<()>;

    /// Takes the exclusive lock of a directory.
    fn lock(&self, dir: &Path) -> Result<DirLock>;
}

/// A file on the local file system.
pub struct LocalFileStorage {
    path: PathBuf,
    file: Mutex<File>,
}

impl LocalFileStorage {
    /// Opens or creates a file.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl FileStorage for LocalFileStorage {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file.lock().set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// The local file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn open(&self, path: &Path, create: bool) -> Result<Arc<dyn FileStorage>> {
        Ok(Arc::new(LocalFileStorage::open(path, create)?))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    fn remove_dir_all(&self, dir: &Path) -> Result<()> {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self, dir: &Path) -> Result<DirLock> {
        let path = dir.join(LOCK_FILE_NAME);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(DirLock { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(KestrelError::Locked(dir.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Held while a directory is open; the lock file is removed on drop.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_positional_read_write() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem;
        let file = fs.open(&dir.path().join("a.chunk"), true).unwrap();

        file.write_at(0, b"hello").unwrap();
        file.write_at(10, b"world").unwrap();
        assert_eq!(file.size().unwrap(), 15);
        assert_eq!(file.read_at(10, 5).unwrap(), b"world");
        assert_eq!(file.read_at(0, 5).unwrap(), b"hello");
        file.sync().unwrap();

        file.truncate(5).unwrap();
        assert_eq!(file.size().unwrap(), 5);
        assert!(file.read_at(3, 10).is_err());
    }

    #[test]
    fn test_list_and_remove() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem;
        fs.open(&dir.path().join("b"), true).unwrap();
        fs.open(&dir.path().join("a"), true).unwrap();
        fs.create_dir_all(&dir.path().join("sub")).unwrap();

        let names: Vec<_> = fs
            .list(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        fs.remove(&dir.path().join("a")).unwrap();
        fs.remove(&dir.path().join("a")).unwrap();
        assert_eq!(fs.list(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempdir().unwrap();
        let err = LocalFileSystem
            .open(&dir.path().join("missing"), false)
            .err()
            .unwrap();
        assert!(matches!(err, KestrelError::Io(_)));
    }

    #[test]
    fn test_dir_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem;
        let lock = fs.lock(dir.path()).unwrap();
        assert!(lock.path().exists());
        assert!(matches!(fs.lock(dir.path()), Err(KestrelError::Locked(_))));
        drop(lock);
        assert!(fs.lock(dir.path()).is_ok());
    }
}
