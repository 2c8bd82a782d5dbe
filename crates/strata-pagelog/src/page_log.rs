//! Append-only page log for one page group generation.

use crate::constants::{ENTRY_EXTENSION, LOG_EXTENSION};
use crate::entry::PageLogEntry;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::{
    FileHandle, FileSystem, OpenMode, PageGroup, PageGroupVersion, PageNumber, PageVersion,
    Result, StrataError,
};

/// Options shared by every page log of a logger.
#[derive(Debug, Clone, Copy)]
pub struct PageLogOptions {
    /// Size of every record in bytes.
    pub page_size: usize,
    /// Sync both files after every append.
    pub fsync_enabled: bool,
}

/// Lifecycle of a page log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogState {
    Open,
    Closed,
    Deleted,
}

struct PageLogInner {
    state: LogState,
    data: Option<Box<dyn FileHandle>>,
    index: Option<Box<dyn FileHandle>>,
    /// Entries in append order; position i lives at byte i * ENTRY_SIZE of the entry file.
    entries: Vec<PageLogEntry>,
    /// Page number to entry positions, in append order.
    pages: HashMap<PageNumber, Vec<usize>>,
    /// End of the data file.
    write_offset: u64,
}

/// A single page log file pair.
///
/// The data file holds raw `page_size` records back to back. The entry file
/// holds one `PageLogEntry` per record in the same order.
pub struct PageLog {
    fs: Arc<dyn FileSystem>,
    group: PageGroup,
    version: PageGroupVersion,
    options: PageLogOptions,
    data_path: PathBuf,
    index_path: PathBuf,
    inner: Mutex<PageLogInner>,
}

impl PageLog {
    /// Returns the directory holding the logs of a group.
    pub fn group_dir(logs_dir: &Path, group: PageGroup) -> PathBuf {
        logs_dir.join(group.to_string())
    }

    /// Returns the data and entry file paths of a log.
    pub fn paths(logs_dir: &Path, group: PageGroup, version: PageGroupVersion) -> (PathBuf, PathBuf) {
        let dir = Self::group_dir(logs_dir, group);
        (
            dir.join(format!("{}.{}", version, LOG_EXTENSION)),
            dir.join(format!("{}.{}", version, ENTRY_EXTENSION)),
        )
    }

    /// Opens a log, creating its files if needed.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        logs_dir: &Path,
        group: PageGroup,
        version: PageGroupVersion,
        options: PageLogOptions,
    ) -> Result<Self> {
        fs.create_dir_all(&Self::group_dir(logs_dir, group))?;
        Self::open_with_mode(fs, logs_dir, group, version, options, OpenMode::CREATE)
    }

    /// Opens a log only if its files exist.
    pub fn open_existing(
        fs: Arc<dyn FileSystem>,
        logs_dir: &Path,
        group: PageGroup,
        version: PageGroupVersion,
        options: PageLogOptions,
    ) -> Result<Option<Self>> {
        let (data_path, index_path) = Self::paths(logs_dir, group, version);
        if fs.stat(&data_path)?.is_none() || fs.stat(&index_path)?.is_none() {
            return Ok(None);
        }

        match Self::open_with_mode(fs, logs_dir, group, version, options, OpenMode::READ_WRITE) {
            Ok(log) => Ok(Some(log)),
            Err(StrataError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn open_with_mode(
        fs: Arc<dyn FileSystem>,
        logs_dir: &Path,
        group: PageGroup,
        version: PageGroupVersion,
        options: PageLogOptions,
        mode: OpenMode,
    ) -> Result<Self> {
        let (data_path, index_path) = Self::paths(logs_dir, group, version);
        let mut data = fs.open_file(&data_path, mode)?;
        let mut index = fs.open_file(&index_path, mode)?;

        // Drop a torn trailing record.
        let page_size = options.page_size as u64;
        let data_len = data.len()?;
        let write_offset = data_len - data_len % page_size;
        if write_offset != data_len {
            data.set_len(write_offset)?;
        }

        let index_len = index.len()? as usize;
        let mut raw = vec![0u8; index_len - index_len % PageLogEntry::SIZE];
        let n = index.read_at(&mut raw, 0)?;
        raw.truncate(n - n % PageLogEntry::SIZE);

        let mut entries = Vec::with_capacity(raw.len() / PageLogEntry::SIZE);
        for chunk in raw.chunks_exact(PageLogEntry::SIZE) {
            let mut buf = [0u8; PageLogEntry::SIZE];
            buf.copy_from_slice(chunk);
            let entry = PageLogEntry::from_bytes(&buf);
            if entry.offset < 0 || entry.offset as u64 + page_size > write_offset {
                break;
            }
            entries.push(entry);
        }

        let valid_index_len = (entries.len() * PageLogEntry::SIZE) as u64;
        if valid_index_len != index_len as u64 {
            index.set_len(valid_index_len)?;
        }

        let mut pages: HashMap<PageNumber, Vec<usize>> = HashMap::new();
        for (position, entry) in entries.iter().enumerate() {
            pages.entry(entry.page_number).or_default().push(position);
        }

        debug!(
            "opened page log group={} version={} entries={}",
            group,
            version,
            entries.len()
        );

        Ok(Self {
            fs,
            group,
            version,
            options,
            data_path,
            index_path,
            inner: Mutex::new(PageLogInner {
                state: LogState::Open,
                data: Some(data),
                index: Some(index),
                entries,
                pages,
                write_offset,
            }),
        })
    }

    /// Returns the page group of this log.
    pub fn group(&self) -> PageGroup {
        self.group
    }

    /// Returns the generation of this log.
    pub fn version(&self) -> PageGroupVersion {
        self.version
    }

    fn closed_error(&self, state: LogState) -> StrataError {
        let what = if state == LogState::Deleted {
            "deleted"
        } else {
            "closed"
        };
        StrataError::Closed(format!(
            "page log {}/{} is {}",
            self.group, self.version, what
        ))
    }

    /// Appends a page record. `data` must be exactly one page.
    pub fn append(&self, page_number: PageNumber, version: PageVersion, data: &[u8]) -> Result<usize> {
        if data.len() != self.options.page_size {
            return Err(StrataError::PageSizeMismatch {
                expected: self.options.page_size,
                actual: data.len(),
            });
        }

        let mut inner = self.inner.lock();
        if inner.state != LogState::Open {
            return Err(self.closed_error(inner.state));
        }

        let offset = inner.write_offset;
        let position = inner.entries.len();
        let entry = PageLogEntry::new(page_number, version, offset as i64);
        let fsync = self.options.fsync_enabled;

        let inner = &mut *inner;
        let (Some(data_file), Some(index_file)) = (inner.data.as_mut(), inner.index.as_mut()) else {
            return Err(self.closed_error(LogState::Closed));
        };

        data_file.write_at(data, offset)?;
        index_file.write_at(&entry.to_bytes(), (position * PageLogEntry::SIZE) as u64)?;
        if fsync {
            data_file.sync()?;
            index_file.sync()?;
        }

        inner.write_offset += data.len() as u64;
        inner.entries.push(entry);
        inner.pages.entry(page_number).or_default().push(position);

        Ok(data.len())
    }

    /// Reads the newest live record of a page whose version does not exceed
    /// `version` into `buf`. Returns the record's version, or None if there is
    /// no such record.
    pub fn get(
        &self,
        page_number: PageNumber,
        version: PageVersion,
        buf: &mut [u8],
    ) -> Result<Option<PageVersion>> {
        let mut inner = self.inner.lock();
        if inner.state != LogState::Open {
            return Err(self.closed_error(inner.state));
        }

        let Some(positions) = inner.pages.get(&page_number) else {
            return Ok(None);
        };

        let mut best: Option<PageLogEntry> = None;
        for &position in positions {
            let entry = inner.entries[position];
            if entry.tombstoned || entry.version > version {
                continue;
            }
            // Later appends at the same version win.
            if best.map_or(true, |b| entry.version >= b.version) {
                best = Some(entry);
            }
        }

        let Some(entry) = best else {
            return Ok(None);
        };

        let page_size = self.options.page_size;
        let data_file = inner
            .data
            .as_mut()
            .ok_or_else(|| StrataError::Closed(format!("page log {}/{}", self.group, self.version)))?;
        let len = buf.len().min(page_size);
        let n = data_file.read_at(&mut buf[..len], entry.offset as u64)?;
        if n < len {
            return Err(StrataError::IndexCorrupted(format!(
                "page log {}/{} record for page {} is truncated",
                self.group, self.version, page_number
            )));
        }

        Ok(Some(entry.version))
    }

    /// Marks every record written at exactly `version` as discarded.
    ///
    /// Returns the pages that no longer have any live record in this log.
    pub fn tombstone(&self, version: PageVersion) -> Result<Vec<PageNumber>> {
        self.tombstone_matching(|entry| entry.version == version)
    }

    /// Marks every record of the pages at or after `first_page` as
    /// discarded. Returns the pages that lost their records.
    pub fn discard_pages_from(&self, first_page: PageNumber) -> Result<Vec<PageNumber>> {
        self.tombstone_matching(|entry| entry.page_number >= first_page)
    }

    fn tombstone_matching<F>(&self, matches: F) -> Result<Vec<PageNumber>>
    where
        F: Fn(&PageLogEntry) -> bool,
    {
        let mut inner = self.inner.lock();
        if inner.state != LogState::Open {
            return Err(self.closed_error(inner.state));
        }

        let inner = &mut *inner;
        let index_file = inner
            .index
            .as_mut()
            .ok_or_else(|| StrataError::Closed(format!("page log {}/{}", self.group, self.version)))?;

        let mut touched = Vec::new();
        for (position, entry) in inner.entries.iter_mut().enumerate() {
            if entry.tombstoned || !matches(&*entry) {
                continue;
            }
            entry.tombstoned = true;
            let flag_offset = (position * PageLogEntry::SIZE + PageLogEntry::SIZE - 1) as u64;
            index_file.write_at(&[1u8], flag_offset)?;
            if !touched.contains(&entry.page_number) {
                touched.push(entry.page_number);
            }
        }

        if !touched.is_empty() && self.options.fsync_enabled {
            index_file.sync()?;
        }

        let entries = &inner.entries;
        let emptied = touched
            .into_iter()
            .filter(|page| {
                inner.pages.get(page).map_or(true, |positions| {
                    positions.iter().all(|&p| entries[p].tombstoned)
                })
            })
            .collect();

        Ok(emptied)
    }

    /// Returns the pages that have at least one live record, ascending.
    pub fn live_pages(&self) -> Vec<PageNumber> {
        let inner = self.inner.lock();
        let mut pages: Vec<PageNumber> = inner
            .pages
            .iter()
            .filter(|(_, positions)| positions.iter().any(|&p| !inner.entries[p].tombstoned))
            .map(|(&page, _)| page)
            .collect();
        pages.sort_unstable();
        pages
    }

    /// Returns the newest version among live records.
    pub fn max_version(&self) -> Option<PageVersion> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|e| !e.tombstoned)
            .map(|e| e.version)
            .max()
    }

    /// Returns true if the log holds no live record.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.entries.iter().all(|e| e.tombstoned)
    }

    /// Returns the number of records appended, including discarded ones.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Flushes both files to durable storage.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != LogState::Open {
            return Err(self.closed_error(inner.state));
        }
        if let Some(data) = inner.data.as_mut() {
            data.sync()?;
        }
        if let Some(index) = inner.index.as_mut() {
            index.sync()?;
        }
        Ok(())
    }

    /// Flushes and releases the file handles. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != LogState::Open {
            return Ok(());
        }
        if let Some(mut data) = inner.data.take() {
            data.sync()?;
        }
        if let Some(mut index) = inner.index.take() {
            index.sync()?;
        }
        inner.state = LogState::Closed;
        Ok(())
    }

    /// Closes the log and removes both of its files. The log cannot be used
    /// afterwards.
    pub fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.data = None;
        inner.index = None;
        inner.entries.clear();
        inner.pages.clear();
        inner.state = LogState::Deleted;
        drop(inner);

        self.fs.remove_file(&self.data_path)?;
        self.fs.remove_file(&self.index_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::LocalFileSystem;
    use tempfile::tempdir;

    const PAGE: usize = 64;

    fn options() -> PageLogOptions {
        PageLogOptions {
            page_size: PAGE,
            fsync_enabled: false,
        }
    }

    fn open_log(dir: &Path, version: PageGroupVersion) -> PageLog {
        PageLog::open(Arc::new(LocalFileSystem::new()), dir, 1, version, options()).unwrap()
    }

    #[test]
    fn test_append_rejects_wrong_size() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), 1);

        let result = log.append(1, 1, &[0u8; PAGE - 1]);
        assert!(matches!(
            result,
            Err(StrataError::PageSizeMismatch { expected: PAGE, actual: 63 })
        ));
        assert_eq!(log.entry_count(), 0);
    }

    #[test]
    fn test_append_and_get() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), 1);

        assert_eq!(log.append(5, 10, &[0xAB; PAGE]).unwrap(), PAGE);
        let mut buf = [0u8; PAGE];
        assert_eq!(log.get(5, 10, &mut buf).unwrap(), Some(10));
        assert_eq!(buf, [0xAB; PAGE]);

        assert_eq!(log.get(5, 9, &mut buf).unwrap(), None);
        assert_eq!(log.get(6, 10, &mut buf).unwrap(), None);
    }

    #[test]
    fn test_get_picks_newest_not_exceeding() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), 1);
        log.append(1, 1, &[0x00; PAGE]).unwrap();
        log.append(1, 2, &[0xFF; PAGE]).unwrap();
        log.append(1, 4, &[0xAA; PAGE]).unwrap();

        let mut buf = [0u8; PAGE];
        assert_eq!(log.get(1, 3, &mut buf).unwrap(), Some(2));
        assert_eq!(buf, [0xFF; PAGE]);
        assert_eq!(log.get(1, 100, &mut buf).unwrap(), Some(4));
        assert_eq!(buf, [0xAA; PAGE]);
    }

    #[test]
    fn test_rewrite_at_same_version_wins() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), 1);
        log.append(1, 7, &[1; PAGE]).unwrap();
        log.append(1, 7, &[2; PAGE]).unwrap();

        let mut buf = [0u8; PAGE];
        assert_eq!(log.get(1, 7, &mut buf).unwrap(), Some(7));
        assert_eq!(buf, [2; PAGE]);
    }

    #[test]
    fn test_tombstone_hides_version() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), 1);
        log.append(1, 1, &[1; PAGE]).unwrap();
        log.append(1, 2, &[2; PAGE]).unwrap();
        log.append(2, 2, &[3; PAGE]).unwrap();

        let emptied = log.tombstone(2).unwrap();
        assert_eq!(emptied, vec![2]);

        let mut buf = [0u8; PAGE];
        assert_eq!(log.get(1, 2, &mut buf).unwrap(), Some(1));
        assert_eq!(buf, [1; PAGE]);
        assert_eq!(log.get(2, 2, &mut buf).unwrap(), None);
        assert_eq!(log.live_pages(), vec![1]);
        assert_eq!(log.max_version(), Some(1));
    }

    #[test]
    fn test_discard_pages_from() {
        let dir = tempdir().unwrap();
        {
            let log = open_log(dir.path(), 1);
            log.append(1, 1, &[1; PAGE]).unwrap();
            log.append(4, 1, &[4; PAGE]).unwrap();
            log.append(4, 2, &[5; PAGE]).unwrap();
            log.append(9, 2, &[9; PAGE]).unwrap();

            let mut discarded = log.discard_pages_from(4).unwrap();
            discarded.sort_unstable();
            assert_eq!(discarded, vec![4, 9]);
            assert_eq!(log.live_pages(), vec![1]);
            assert_eq!(log.max_version(), Some(1));
            log.close().unwrap();
        }

        let log = open_log(dir.path(), 1);
        let mut buf = [0u8; PAGE];
        assert_eq!(log.get(4, 2, &mut buf).unwrap(), None);
        assert_eq!(log.get(1, 2, &mut buf).unwrap(), Some(1));
        assert!(log.discard_pages_from(4).unwrap().is_empty());
    }

    #[test]
    fn test_tombstone_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let log = open_log(dir.path(), 3);
            log.append(9, 3, &[9; PAGE]).unwrap();
            log.tombstone(3).unwrap();
            log.close().unwrap();
        }

        let log = open_log(dir.path(), 3);
        let mut buf = [0u8; PAGE];
        assert_eq!(log.get(9, 3, &mut buf).unwrap(), None);
        assert!(log.is_empty());
        assert_eq!(log.entry_count(), 1);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempdir().unwrap();
        {
            let log = open_log(dir.path(), 1);
            log.append(1, 1, &[0x11; PAGE]).unwrap();
            log.append(2, 1, &[0x22; PAGE]).unwrap();
            log.close().unwrap();
        }

        let log = open_log(dir.path(), 1);
        assert_eq!(log.live_pages(), vec![1, 2]);
        let mut buf = [0u8; PAGE];
        assert_eq!(log.get(2, 1, &mut buf).unwrap(), Some(1));
        assert_eq!(buf, [0x22; PAGE]);

        log.append(3, 2, &[0x33; PAGE]).unwrap();
        assert_eq!(log.get(3, 2, &mut buf).unwrap(), Some(2));
        assert_eq!(buf, [0x33; PAGE]);
    }

    #[test]
    fn test_reopen_drops_torn_records() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
        {
            let log = PageLog::open(fs.clone(), dir.path(), 1, 1, options()).unwrap();
            log.append(1, 1, &[1; PAGE]).unwrap();
            log.append(2, 1, &[2; PAGE]).unwrap();
            log.close().unwrap();
        }

        // Simulate a crash that lost half of the second record.
        let (data_path, _) = PageLog::paths(dir.path(), 1, 1);
        let mut data = fs.open_file(&data_path, OpenMode::READ_WRITE).unwrap();
        data.set_len((PAGE + PAGE / 2) as u64).unwrap();
        drop(data);

        let log = PageLog::open(fs, dir.path(), 1, 1, options()).unwrap();
        assert_eq!(log.entry_count(), 1);
        assert_eq!(log.live_pages(), vec![1]);
    }

    #[test]
    fn test_open_existing_missing() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
        let log = PageLog::open_existing(fs, dir.path(), 1, 42, options()).unwrap();
        assert!(log.is_none());
    }

    #[test]
    fn test_delete_removes_files_and_blocks_use() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), 1);
        log.append(1, 1, &[1; PAGE]).unwrap();
        log.delete().unwrap();

        let (data_path, index_path) = PageLog::paths(dir.path(), 1, 1);
        assert!(!data_path.exists());
        assert!(!index_path.exists());

        assert!(matches!(log.sync(), Err(StrataError::Closed(_))));
        assert!(matches!(log.append(1, 2, &[0; PAGE]), Err(StrataError::Closed(_))));
        let mut buf = [0u8; PAGE];
        assert!(log.get(1, 1, &mut buf).is_err());
    }

    #[test]
    fn test_closed_log_rejects_reads() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), 1);
        log.close().unwrap();
        log.close().unwrap();

        let mut buf = [0u8; PAGE];
        assert!(matches!(log.get(1, 1, &mut buf), Err(StrataError::Closed(_))));
    }
}
