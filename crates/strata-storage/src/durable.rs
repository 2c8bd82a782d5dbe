//! The durable database file: one logical, byte-addressable file per
//! database branch, stored across hot page logs and cold range files.
//!
//! Writes always go through the page logger. Reads check the page logger
//! first and fall back to the range holding the page. Compaction moves log
//! values into new range versions.

use crate::metadata::DatabaseMetadata;
use crate::range::RangeOptions;
use crate::range_manager::DataRangeManager;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::page::{
    first_page_of_range, page_number_for_offset, pages_for_size, range_number_for_page,
};
use strata_common::{
    FileSystem, PageNumber, RangeNumber, Result, StorageConfig, StrataError, TimestampLease,
};
use strata_pagelog::{
    CompactedPage, CompactionStats, CompactionTarget, PageLogger, PageLoggerConfig,
};

/// Callback receiving the byte offset and prior contents of a page about to
/// be overwritten.
pub type WriteHook = Box<dyn Fn(i64, &[u8]) + Send + Sync>;

/// Relative path of the page logs inside a branch directory.
const PAGE_LOGS_DIR: &str = "logs/page";

/// Relative path of the range files inside a branch directory.
const RANGES_DIR: &str = "ranges";

/// Durable storage of one database branch.
pub struct DurableDatabaseFileSystem {
    database_id: String,
    branch_id: String,
    branch_dir: PathBuf,
    page_size: usize,
    range_max_pages: i64,
    page_logger: PageLogger,
    ranges: DataRangeManager,
    metadata: DatabaseMetadata,
    write_hook: RwLock<Option<WriteHook>>,
    /// Serializes writes against truncation.
    write_lock: Mutex<()>,
}

impl DurableDatabaseFileSystem {
    /// Opens the storage of `database_id`/`branch_id` under
    /// `config.data_dir`, creating it if needed.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        config: &StorageConfig,
        database_id: &str,
        branch_id: &str,
    ) -> Result<Self> {
        config.validate()?;
        for (name, value) in [("database_id", database_id), ("branch_id", branch_id)] {
            if value.is_empty() || value.contains(['/', '\\']) || value == "." || value == ".." {
                return Err(StrataError::invalid_parameter(name, value));
            }
        }

        let branch_dir = config.data_dir.join(database_id).join(branch_id);
        fs.create_dir_all(&branch_dir)?;

        let page_logger = PageLogger::open(
            Arc::clone(&fs),
            &branch_dir.join(PAGE_LOGS_DIR),
            PageLoggerConfig::from(config),
        )?;
        let ranges = DataRangeManager::open(
            Arc::clone(&fs),
            &branch_dir.join(RANGES_DIR),
            RangeOptions {
                page_size: config.page_size,
                range_max_pages: config.range_max_pages,
                fsync_enabled: config.fsync_enabled,
            },
        )?;
        let metadata = DatabaseMetadata::open(
            Arc::clone(&fs),
            &branch_dir,
            config.page_size,
            config.fsync_enabled,
        )?;

        info!(
            "opened database {}/{} at {} with {} pages",
            database_id,
            branch_id,
            branch_dir.display(),
            metadata.page_count()
        );

        Ok(Self {
            database_id: database_id.to_string(),
            branch_id: branch_id.to_string(),
            branch_dir,
            page_size: config.page_size,
            range_max_pages: config.range_max_pages,
            page_logger,
            ranges,
            metadata,
            write_hook: RwLock::new(None),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the database identifier.
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Returns the branch identifier.
    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    /// Returns the branch directory.
    pub fn branch_dir(&self) -> &Path {
        &self.branch_dir
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the page logger.
    pub fn page_logger(&self) -> &PageLogger {
        &self.page_logger
    }

    /// Returns the range manager.
    pub fn range_manager(&self) -> &DataRangeManager {
        &self.ranges
    }

    /// Returns the database metadata.
    pub fn metadata(&self) -> &DatabaseMetadata {
        &self.metadata
    }

    fn range_number(&self, page_number: PageNumber) -> RangeNumber {
        range_number_for_page(page_number, self.range_max_pages)
    }

    /// Reads the value of a page visible at `timestamp` into `buf`, which
    /// must be one page long. Pages never written read as zeros.
    fn read_page(&self, timestamp: i64, page_number: PageNumber, buf: &mut [u8]) -> Result<()> {
        if self.page_logger.read(page_number, timestamp, buf)?.is_some() {
            return Ok(());
        }
        let range_number = self.range_number(page_number);
        loop {
            let range = self.ranges.get(range_number, timestamp)?;
            match range.read_at(page_number, buf) {
                Ok(n) => {
                    buf[n..].fill(0);
                    return Ok(());
                }
                // Collected after we resolved it; the manager no longer returns it.
                Err(StrataError::Closed(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads `length` bytes starting at `offset` as of `timestamp`.
    ///
    /// The read may start inside a page and span several pages. Returns the
    /// number of bytes copied into `buf`.
    pub fn read_at(&self, timestamp: i64, buf: &mut [u8], offset: i64, length: i64) -> Result<usize> {
        if offset < 0 {
            return Err(StrataError::invalid_parameter("offset", offset));
        }
        if length < 0 || length as u64 > buf.len() as u64 {
            return Err(StrataError::invalid_parameter("length", length));
        }
        if offset.checked_add(length).is_none() {
            return Err(StrataError::invalid_parameter("offset", offset));
        }

        let page_size = self.page_size as i64;
        let length = length as usize;
        let mut page = vec![0u8; self.page_size];
        let mut done = 0usize;

        while done < length {
            let position = offset
                .checked_add(done as i64)
                .ok_or_else(|| StrataError::invalid_parameter("offset", offset))?;
            let page_number = page_number_for_offset(position, self.page_size);
            let in_page = (position % page_size) as usize;
            let n = (self.page_size - in_page).min(length - done);

            self.read_page(timestamp, page_number, &mut page)?;
            buf[done..done + n].copy_from_slice(&page[in_page..in_page + n]);
            done += n;
        }

        Ok(done)
    }

    /// Writes one page at the page-aligned `offset` as of `timestamp`.
    /// Returns the number of bytes written.
    pub fn write_at(&self, timestamp: i64, data: &[u8], offset: i64) -> Result<usize> {
        let page_size = self.page_size as i64;
        // The end of the page must stay addressable for `size()`.
        if offset < 0 || offset % page_size != 0 || offset.checked_add(page_size).is_none() {
            return Err(StrataError::invalid_parameter("offset", offset));
        }
        if data.len() != self.page_size {
            return Err(StrataError::PageSizeMismatch {
                expected: self.page_size,
                actual: data.len(),
            });
        }

        let page_number = page_number_for_offset(offset, self.page_size);
        let _writer = self.write_lock.lock();

        if let Some(hook) = self.write_hook.read().as_ref() {
            let mut prior = vec![0u8; self.page_size];
            self.read_page(timestamp, page_number, &mut prior)?;
            hook(offset, &prior);
        }

        let written = self.page_logger.write(page_number, timestamp, data)?;
        if page_number > self.metadata.page_count() {
            self.metadata.set_page_count(page_number)?;
        }
        Ok(written)
    }

    /// Installs a hook called with the prior contents of every page before
    /// it is overwritten.
    pub fn set_write_hook<F>(&self, hook: F)
    where
        F: Fn(i64, &[u8]) + Send + Sync + 'static,
    {
        *self.write_hook.write() = Some(Box::new(hook));
    }

    /// Removes the write hook.
    pub fn clear_write_hook(&self) {
        *self.write_hook.write() = None;
    }

    /// Returns the logical file size in bytes.
    pub fn size(&self) -> Result<i64> {
        self.metadata.file_size()
    }

    /// Sets the logical file size to `size` bytes.
    ///
    /// Shrinking discards logged values of the removed pages, deletes every
    /// range past the new end and truncates the range holding the new last
    /// page.
    pub fn truncate(&self, size: i64) -> Result<()> {
        let new_pages = pages_for_size(size, self.page_size)?;
        let _writer = self.write_lock.lock();

        let current_pages = self.metadata.page_count();
        if new_pages >= current_pages {
            return self.metadata.set_page_count(new_pages);
        }

        // Before touching ranges, so compaction cannot write them back.
        self.page_logger.discard_pages_from(new_pages + 1)?;

        let mut range_number = self.range_number(current_pages.max(1));
        while range_number >= 1 {
            let first_page = first_page_of_range(range_number, self.range_max_pages);
            if first_page > new_pages {
                self.ranges.delete_range(range_number)?;
                self.metadata.set_page_count(first_page - 1)?;
            } else {
                let keep = (new_pages - first_page + 1) as u64 * self.page_size as u64;
                let range = self.ranges.get(range_number, i64::MAX)?;
                if range.size()? > keep {
                    range.truncate(keep)?;
                }
                self.metadata.set_page_count(new_pages)?;
                break;
            }
            range_number -= 1;
        }

        debug!(
            "truncated {}/{} from {} to {} pages",
            self.database_id, self.branch_id, current_pages, new_pages
        );
        Ok(())
    }

    /// Compacts the page logs into ranges if the compaction interval has
    /// elapsed.
    pub fn compact(&self) -> Result<CompactionStats> {
        self.page_logger.compact(self)
    }

    /// Compacts the page logs into ranges now.
    pub fn force_compact(&self) -> Result<CompactionStats> {
        self.page_logger.force_compact(self)
    }

    /// Deletes range versions no reader can see. Returns the number deleted.
    pub fn run_garbage_collection(&self) -> Result<usize> {
        self.ranges.run_garbage_collection()
    }

    /// Marks `timestamp` in use on both storage tiers.
    pub fn acquire(&self, timestamp: i64) {
        self.page_logger.acquire(timestamp);
        self.ranges.acquire(timestamp);
    }

    /// Releases a timestamp acquired with [`acquire`](Self::acquire).
    pub fn release(&self, timestamp: i64) {
        self.page_logger.release(timestamp);
        self.ranges.release(timestamp);
    }

    /// Pins `timestamp` on both tiers until the returned guard is dropped.
    pub fn snapshot(&self, timestamp: i64) -> SnapshotGuard<'_> {
        SnapshotGuard {
            fs: self,
            timestamp,
            _log_lease: self.page_logger.lease(timestamp),
            _range_lease: self.ranges.lease(timestamp),
        }
    }

    /// Flushes logs, ranges and metadata.
    pub fn sync(&self) -> Result<()> {
        self.page_logger.sync()?;
        self.ranges.sync()?;
        self.metadata.save()
    }

    /// Closes every open log, range and the metadata file.
    pub fn shutdown(&self) -> Result<()> {
        self.page_logger.close()?;
        self.ranges.close()?;
        self.metadata.close()?;
        info!("closed database {}/{}", self.database_id, self.branch_id);
        Ok(())
    }
}

impl CompactionTarget for DurableDatabaseFileSystem {
    fn write_to_range(&self, pages: &[CompactedPage]) -> Result<()> {
        let mut by_range: BTreeMap<RangeNumber, Vec<&CompactedPage>> = BTreeMap::new();
        for page in pages {
            by_range
                .entry(self.range_number(page.page_number))
                .or_default()
                .push(page);
        }

        for (range_number, pages) in by_range {
            let newest = pages.iter().map(|page| page.version).max().unwrap_or(0);
            let current = self.ranges.current_version(range_number)?;
            let version = newest.max(current + 1);

            self.ranges.copy_range(range_number, version, |range| {
                for page in &pages {
                    range.write_at(page.page_number, &page.data)?;
                }
                Ok(())
            })?;
            debug!(
                "wrote {} pages to range {} version {}",
                pages.len(),
                range_number,
                version
            );
        }
        Ok(())
    }
}

/// Reader pinned at one timestamp on both storage tiers.
pub struct SnapshotGuard<'a> {
    fs: &'a DurableDatabaseFileSystem,
    timestamp: i64,
    _log_lease: TimestampLease,
    _range_lease: TimestampLease,
}

impl SnapshotGuard<'_> {
    /// Returns the pinned timestamp.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Reads at the pinned timestamp.
    pub fn read_at(&self, buf: &mut [u8], offset: i64, length: i64) -> Result<usize> {
        self.fs.read_at(self.timestamp, buf, offset, length)
    }
}
