//! Persistent map from range number to current range version.
//!
//! The index file is a flat array of little-endian i64 versions: the entry
//! for range `n` lives at byte `(n - 1) * 8`. A missing or zero entry means
//! the range has never been written back and its current version is 0.

use bytes::{Buf, BufMut, BytesMut};
use log::debug;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::{FileHandle, FileSystem, OpenMode, RangeNumber, Result, StrataError};

/// File name of the range index inside the ranges directory.
pub const RANGE_INDEX_FILE_NAME: &str = "RANGE_INDEX";

/// Bytes per index entry.
pub const RANGE_INDEX_ENTRY_SIZE: usize = 8;

struct IndexInner {
    file: Option<Box<dyn FileHandle>>,
    /// Cached versions, slot `n - 1` for range `n`.
    versions: Vec<i64>,
}

/// Range number to current version.
pub struct DataRangeIndex {
    path: PathBuf,
    fsync_enabled: bool,
    inner: Mutex<IndexInner>,
}

impl DataRangeIndex {
    /// Opens the index in `ranges_dir`, creating it if missing.
    pub fn open(fs: Arc<dyn FileSystem>, ranges_dir: &Path, fsync_enabled: bool) -> Result<Self> {
        fs.create_dir_all(ranges_dir)?;
        let path = ranges_dir.join(RANGE_INDEX_FILE_NAME);
        let mut file = fs.open_file(&path, OpenMode::CREATE)?;

        let len = file.len()? as usize;
        let mut raw = vec![0u8; len - len % RANGE_INDEX_ENTRY_SIZE];
        let n = file.read_at(&mut raw, 0)?;
        raw.truncate(n - n % RANGE_INDEX_ENTRY_SIZE);

        let mut buf = raw.as_slice();
        let mut versions = Vec::with_capacity(raw.len() / RANGE_INDEX_ENTRY_SIZE);
        while buf.remaining() >= RANGE_INDEX_ENTRY_SIZE {
            versions.push(buf.get_i64_le());
        }
        debug!("loaded range index {} with {} entries", path.display(), versions.len());

        Ok(Self {
            path,
            fsync_enabled,
            inner: Mutex::new(IndexInner {
                file: Some(file),
                versions,
            }),
        })
    }

    /// Returns the index file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn slot(range_number: RangeNumber) -> Result<usize> {
        if range_number < 1 {
            return Err(StrataError::invalid_parameter("range_number", range_number));
        }
        Ok((range_number - 1) as usize)
    }

    fn closed(&self) -> StrataError {
        StrataError::Closed(format!("range index {:?}", self.path))
    }

    /// Returns the current version of a range, 0 if it was never set.
    pub fn get(&self, range_number: RangeNumber) -> Result<i64> {
        let slot = Self::slot(range_number)?;
        let inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(self.closed());
        }
        Ok(inner.versions.get(slot).copied().unwrap_or(0))
    }

    /// Records the current version of a range.
    pub fn set(&self, range_number: RangeNumber, version: i64) -> Result<()> {
        let slot = Self::slot(range_number)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let file = inner.file.as_mut().ok_or_else(|| self.closed())?;

        let mut entry = BytesMut::with_capacity(RANGE_INDEX_ENTRY_SIZE);
        entry.put_i64_le(version);
        file.write_at(&entry, (slot * RANGE_INDEX_ENTRY_SIZE) as u64)?;
        if self.fsync_enabled {
            file.sync()?;
        }

        if inner.versions.len() <= slot {
            inner.versions.resize(slot + 1, 0);
        }
        inner.versions[slot] = version;
        Ok(())
    }

    /// Returns every range with a non-zero version.
    pub fn ranges(&self) -> Vec<(RangeNumber, i64)> {
        self.inner
            .lock()
            .versions
            .iter()
            .enumerate()
            .filter(|(_, version)| **version != 0)
            .map(|(slot, version)| (slot as RangeNumber + 1, *version))
            .collect()
    }

    /// Flushes the index file.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or_else(|| self.closed())?;
        file.sync()
    }

    /// Flushes and releases the index file. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        match self.inner.lock().file.take() {
            Some(mut file) => file.sync(),
            None => Ok(()),
        }
    }
}
