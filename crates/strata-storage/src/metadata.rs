//! Per-branch database metadata.

use bytes::{Buf, BufMut, BytesMut};
use log::warn;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::page::size_for_pages;
use strata_common::{FileHandle, FileSystem, OpenMode, Result, StrataError};

/// File name of the metadata file inside a branch directory.
pub const METADATA_FILE_NAME: &str = "_METADATA";

struct MetadataInner {
    file: Option<Box<dyn FileHandle>>,
    page_count: i64,
}

/// Page count of the logical database file, persisted as 8 little-endian bytes.
pub struct DatabaseMetadata {
    path: PathBuf,
    page_size: usize,
    fsync_enabled: bool,
    inner: Mutex<MetadataInner>,
}

impl DatabaseMetadata {
    /// Opens the metadata file in `branch_dir`. An unreadable or short file
    /// yields a page count of 0.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        branch_dir: &Path,
        page_size: usize,
        fsync_enabled: bool,
    ) -> Result<Self> {
        fs.create_dir_all(branch_dir)?;
        let path = branch_dir.join(METADATA_FILE_NAME);
        let mut file = fs.open_file(&path, OpenMode::CREATE)?;
        let page_count = match Self::load(file.as_mut()) {
            Ok(page_count) => page_count,
            Err(e) => {
                warn!("failed to load database metadata {}, starting empty: {}", path.display(), e);
                0
            }
        };

        Ok(Self {
            path,
            page_size,
            fsync_enabled,
            inner: Mutex::new(MetadataInner {
                file: Some(file),
                page_count,
            }),
        })
    }

    fn load(file: &mut dyn FileHandle) -> Result<i64> {
        let mut raw = [0u8; 8];
        let n = file.read_at(&mut raw, 0)?;
        if n == 0 {
            return Ok(0);
        }
        if n < raw.len() {
            return Err(StrataError::IndexCorrupted(format!(
                "metadata holds {} bytes, expected 8",
                n
            )));
        }
        let page_count = (&raw[..]).get_i64_le();
        if page_count < 0 {
            return Err(StrataError::IndexCorrupted(format!(
                "negative page count {}",
                page_count
            )));
        }
        Ok(page_count)
    }

    /// Returns the metadata file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of pages in the logical file.
    pub fn page_count(&self) -> i64 {
        self.inner.lock().page_count
    }

    /// Returns the logical file size in bytes.
    pub fn file_size(&self) -> Result<i64> {
        size_for_pages(self.page_count(), self.page_size)
    }

    /// Sets the page count and persists it. The resulting file size must fit
    /// in an i64.
    pub fn set_page_count(&self, page_count: i64) -> Result<()> {
        if page_count < 0 {
            return Err(StrataError::invalid_parameter("page_count", page_count));
        }
        size_for_pages(page_count, self.page_size)?;
        let mut inner = self.inner.lock();
        inner.page_count = page_count;
        Self::save_locked(&mut inner, &self.path, self.fsync_enabled)
    }

    /// Persists the current page count.
    pub fn save(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::save_locked(&mut inner, &self.path, self.fsync_enabled)
    }

    fn save_locked(inner: &mut MetadataInner, path: &Path, fsync_enabled: bool) -> Result<()> {
        let mut raw = BytesMut::with_capacity(8);
        raw.put_i64_le(inner.page_count);
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| StrataError::Closed(format!("metadata {:?}", path)))?;
        file.write_at(&raw, 0)?;
        if fsync_enabled {
            file.sync()?;
        }
        Ok(())
    }

    /// Saves and releases the file. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Ok(());
        }
        Self::save_locked(&mut inner, &self.path, true)?;
        inner.file = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::LocalFileSystem;
    use tempfile::tempdir;

    fn fs() -> Arc<dyn FileSystem> {
        Arc::new(LocalFileSystem::new())
    }

    #[test]
    fn test_new_metadata_is_empty() {
        let dir = tempdir().unwrap();
        let metadata = DatabaseMetadata::open(fs(), dir.path(), 4096, false).unwrap();
        assert_eq!(metadata.page_count(), 0);
        assert_eq!(metadata.file_size().unwrap(), 0);
    }

    #[test]
    fn test_page_count_persists() {
        let dir = tempdir().unwrap();
        {
            let metadata = DatabaseMetadata::open(fs(), dir.path(), 4096, false).unwrap();
            metadata.set_page_count(12).unwrap();
            metadata.close().unwrap();
        }
        let raw = std::fs::read(dir.path().join(METADATA_FILE_NAME)).unwrap();
        assert_eq!(raw, 12i64.to_le_bytes());

        let metadata = DatabaseMetadata::open(fs(), dir.path(), 4096, false).unwrap();
        assert_eq!(metadata.page_count(), 12);
        assert_eq!(metadata.file_size().unwrap(), 12 * 4096);
    }

    #[test]
    fn test_corrupt_metadata_starts_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE_NAME), [1, 2, 3]).unwrap();
        let metadata = DatabaseMetadata::open(fs(), dir.path(), 4096, false).unwrap();
        assert_eq!(metadata.page_count(), 0);

        metadata.set_page_count(2).unwrap();
        let raw = std::fs::read(dir.path().join(METADATA_FILE_NAME)).unwrap();
        assert_eq!(raw, 2i64.to_le_bytes());
    }

    #[test]
    fn test_rejects_negative_page_count() {
        let dir = tempdir().unwrap();
        let metadata = DatabaseMetadata::open(fs(), dir.path(), 4096, false).unwrap();
        assert!(metadata.set_page_count(-1).is_err());
    }

    #[test]
    fn test_oversized_page_count() {
        let dir = tempdir().unwrap();
        let metadata = DatabaseMetadata::open(fs(), dir.path(), 4096, false).unwrap();
        assert!(matches!(
            metadata.set_page_count(i64::MAX),
            Err(StrataError::InvalidParameter { .. })
        ));
        assert_eq!(metadata.page_count(), 0);
        metadata.close().unwrap();

        // A count written by someone else still fails instead of wrapping.
        std::fs::write(dir.path().join(METADATA_FILE_NAME), i64::MAX.to_le_bytes()).unwrap();
        let metadata = DatabaseMetadata::open(fs(), dir.path(), 4096, false).unwrap();
        assert_eq!(metadata.page_count(), i64::MAX);
        assert!(metadata.file_size().is_err());
    }
}
