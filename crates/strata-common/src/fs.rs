//! File-system seam used by the storage engine.
//!
//! The engine only needs named files with positional I/O. Any backend that
//! honours this contract (local disk, tiered storage, object storage) can be
//! plugged in; a write is considered durable once `sync` returns.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// How a file should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    /// Create the file if it does not exist.
    pub create: bool,
    /// Discard existing contents.
    pub truncate: bool,
}

impl OpenMode {
    /// Open an existing file for reading and writing.
    pub const READ_WRITE: OpenMode = OpenMode {
        create: false,
        truncate: false,
    };
    /// Open or create a file, keeping existing contents.
    pub const CREATE: OpenMode = OpenMode {
        create: true,
        truncate: false,
    };
    /// Open or create a file and discard its contents.
    pub const CREATE_TRUNCATE: OpenMode = OpenMode {
        create: true,
        truncate: true,
    };
}

/// File metadata returned by `FileSystem::stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File length in bytes.
    pub len: u64,
}

/// An open file with positional I/O.
pub trait FileHandle: Send {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read, which is short only at end of file.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes all of `buf` at `offset`, extending the file if needed.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Returns the current file length.
    fn len(&mut self) -> Result<u64>;

    /// Returns true if the file has no contents.
    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncates or extends the file.
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Flushes file contents to durable storage.
    fn sync(&mut self) -> Result<()>;
}

/// A named-file storage backend.
pub trait FileSystem: Send + Sync {
    /// Opens a file for reading and writing.
    fn open_file(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>>;

    /// Creates a directory and all of its parents.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Removes a file. Removing a missing file is not an error.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Atomically replaces `to` with `from`.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Returns metadata for a file, or None if it does not exist.
    fn stat(&self, path: &Path) -> Result<Option<FileStat>>;

    /// Lists the entry names of a directory. A missing directory is empty.
    fn read_dir(&self, path: &Path) -> Result<Vec<String>>;
}

/// Local-disk backend over `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    /// Creates a new local file system.
    pub fn new() -> Self {
        Self
    }
}

/// Handle for a local file.
struct LocalFile {
    file: File,
}

impl FileHandle for LocalFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl FileSystem for LocalFileSystem {
    fn open_file(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(mode.create)
            .truncate(mode.truncate)
            .open(path)?;
        Ok(Box::new(LocalFile { file }))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn stat(&self, path: &Path) -> Result<Option<FileStat>> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(FileStat { len: meta.len() })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let result = fs.open_file(&dir.path().join("missing"), OpenMode::READ_WRITE);
        assert!(result.is_err());
    }

    #[test]
    fn test_write_read_at() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let path = dir.path().join("data");

        let mut file = fs.open_file(&path, OpenMode::CREATE).unwrap();
        file.write_at(b"hello", 10).unwrap();
        assert_eq!(file.len().unwrap(), 15);

        let mut buf = [0xFFu8; 15];
        let n = file.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 15);
        assert_eq!(&buf[..10], &[0u8; 10]);
        assert_eq!(&buf[10..], b"hello");
    }

    #[test]
    fn test_short_read_at_end_of_file() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let mut file = fs.open_file(&dir.path().join("data"), OpenMode::CREATE).unwrap();
        file.write_at(b"abc", 0).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 1).unwrap(), 2);
        assert_eq!(file.read_at(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn test_set_len_and_truncate_mode() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let path = dir.path().join("data");

        let mut file = fs.open_file(&path, OpenMode::CREATE).unwrap();
        file.write_at(&[1u8; 100], 0).unwrap();
        file.set_len(40).unwrap();
        assert_eq!(file.len().unwrap(), 40);
        drop(file);

        let mut file = fs.open_file(&path, OpenMode::CREATE_TRUNCATE).unwrap();
        assert!(file.is_empty().unwrap());
    }

    #[test]
    fn test_stat_remove_and_read_dir() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let nested = dir.path().join("a/b");
        fs.create_dir_all(&nested).unwrap();

        assert!(fs.stat(&nested.join("x")).unwrap().is_none());
        let mut file = fs.open_file(&nested.join("x"), OpenMode::CREATE).unwrap();
        file.write_at(&[7u8; 12], 0).unwrap();
        file.sync().unwrap();

        assert_eq!(fs.stat(&nested.join("x")).unwrap(), Some(FileStat { len: 12 }));
        assert_eq!(fs.read_dir(&nested).unwrap(), vec!["x".to_string()]);

        fs.remove_file(&nested.join("x")).unwrap();
        fs.remove_file(&nested.join("x")).unwrap();
        assert!(fs.read_dir(&nested).unwrap().is_empty());
        assert!(fs.read_dir(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_rename_replaces_target() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let from = dir.path().join("next");
        let to = dir.path().join("current");

        fs.open_file(&to, OpenMode::CREATE).unwrap().write_at(b"old contents", 0).unwrap();
        fs.open_file(&from, OpenMode::CREATE).unwrap().write_at(b"new", 0).unwrap();
        fs.rename(&from, &to).unwrap();

        assert!(fs.stat(&from).unwrap().is_none());
        assert_eq!(std::fs::read(&to).unwrap(), b"new");
    }
}
