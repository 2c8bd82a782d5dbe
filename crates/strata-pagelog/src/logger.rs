//! Page logger: versioned page writes and reads across sharded page logs.

use crate::compaction::{
    plan_compaction, CompactedPage, CompactionStats, CompactionTarget, LogSummary,
};
use crate::constants::{ENTRY_EXTENSION, INDEX_FILE_NAME};
use crate::index::{IndexEntries, PageLoggerIndex};
use crate::page_log::{PageLog, PageLogOptions};
use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_common::clock::now_nanos;
use strata_common::page::page_group_for_page;
use strata_common::{
    FileSystem, PageGroup, PageGroupVersion, PageNumber, PageVersion, Result, StorageConfig,
    StrataError, TimestampLease, TimestampLeases,
};

/// Configuration for the page logger.
#[derive(Debug, Clone)]
pub struct PageLoggerConfig {
    /// Size of every page record.
    pub page_size: usize,
    /// Pages per group.
    pub page_group_size: i64,
    /// Minimum time between two non-forced compactions.
    pub compact_interval: Duration,
    /// Sync logs after every append.
    pub fsync_enabled: bool,
}

impl Default for PageLoggerConfig {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl PageLoggerConfig {
    /// Rejects sizes the logger cannot shard or record pages with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(StrataError::ConfigError(
                "page_size must be positive, got 0".to_string(),
            ));
        }
        if self.page_group_size <= 0 {
            return Err(StrataError::ConfigError(format!(
                "page_group_size must be positive, got {}",
                self.page_group_size
            )));
        }
        Ok(())
    }
}

impl From<&StorageConfig> for PageLoggerConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            page_size: config.page_size,
            page_group_size: config.page_group_size,
            compact_interval: config.compact_interval(),
            fsync_enabled: config.fsync_enabled,
        }
    }
}

type LogMap = HashMap<PageGroup, BTreeMap<PageGroupVersion, Arc<PageLog>>>;

/// Thread-safe page logger for one database branch.
///
/// Pages are sharded into groups; each group holds one log per generation.
/// A write lands in the newest generation not newer than its timestamp that
/// already holds the page, or opens a new generation at its own timestamp.
pub struct PageLogger {
    fs: Arc<dyn FileSystem>,
    /// Directory holding the index file and one directory per group.
    logs_dir: PathBuf,
    config: PageLoggerConfig,
    index: RwLock<PageLoggerIndex>,
    /// Open logs.
    logs: RwLock<LogMap>,
    /// Timestamps pinned by readers.
    leases: Arc<TimestampLeases>,
    /// Serializes writers and tombstoning against compaction.
    write_lock: Mutex<()>,
    /// Held by the single running compaction.
    compaction_barrier: Mutex<()>,
    /// Wall-clock nanos of the last finished compaction.
    compacted_at: AtomicI64,
    /// Wall-clock nanos of the last write.
    written_at: AtomicI64,
}

impl PageLogger {
    /// Opens the page logger stored under `logs_dir`.
    ///
    /// A missing or undecodable index is rebuilt from the log files.
    pub fn open(fs: Arc<dyn FileSystem>, logs_dir: &Path, config: PageLoggerConfig) -> Result<Self> {
        config.validate()?;
        fs.create_dir_all(logs_dir)?;

        let mut index = PageLoggerIndex::new(
            fs.clone(),
            &logs_dir.join(INDEX_FILE_NAME),
            config.fsync_enabled,
        );
        let loaded = if index.exists()? {
            match index.load() {
                Ok(()) => true,
                Err(StrataError::IndexCorrupted(reason)) => {
                    warn!("rebuilding page logger index in {}: {}", logs_dir.display(), reason);
                    false
                }
                Err(e) => return Err(e),
            }
        } else {
            false
        };

        let logger = Self {
            fs,
            logs_dir: logs_dir.to_path_buf(),
            config,
            index: RwLock::new(index),
            logs: RwLock::new(HashMap::new()),
            leases: Arc::new(TimestampLeases::new()),
            write_lock: Mutex::new(()),
            compaction_barrier: Mutex::new(()),
            compacted_at: AtomicI64::new(0),
            written_at: AtomicI64::new(0),
        };

        if !loaded {
            logger.rebuild_index()?;
        }

        Ok(logger)
    }

    /// Returns the directory holding the logs.
    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    fn log_options(&self) -> PageLogOptions {
        PageLogOptions {
            page_size: self.config.page_size,
            fsync_enabled: self.config.fsync_enabled,
        }
    }

    fn group_for(&self, page_number: PageNumber) -> PageGroup {
        page_group_for_page(page_number, self.config.page_group_size)
    }

    /// Rebuilds the index by scanning every log on disk.
    fn rebuild_index(&self) -> Result<()> {
        let mut entries = IndexEntries::new();

        for name in self.fs.read_dir(&self.logs_dir)? {
            let Ok(group) = name.parse::<PageGroup>() else {
                continue;
            };
            let group_dir = PageLog::group_dir(&self.logs_dir, group);
            for file_name in self.fs.read_dir(&group_dir)? {
                let Some(version) = file_name
                    .strip_suffix(ENTRY_EXTENSION)
                    .and_then(|stem| stem.strip_suffix('.'))
                    .and_then(|stem| stem.parse::<PageGroupVersion>().ok())
                else {
                    continue;
                };
                let Some(log) = PageLog::open_existing(
                    self.fs.clone(),
                    &self.logs_dir,
                    group,
                    version,
                    self.log_options(),
                )?
                else {
                    continue;
                };
                entries
                    .entry(group)
                    .or_default()
                    .insert(version, log.live_pages().into_iter().collect());
                log.close()?;
            }
        }

        let mut index = self.index.write();
        index.replace(entries);
        if index.version_count() > 0 || index.exists()? {
            index.store()?;
        }
        debug!(
            "rebuilt page logger index in {} with {} logs",
            self.logs_dir.display(),
            index.version_count()
        );
        Ok(())
    }

    /// Returns the open log for a generation, creating it if needed.
    fn get_or_create_log(&self, group: PageGroup, version: PageGroupVersion) -> Result<Arc<PageLog>> {
        if let Some(log) = self.logs.read().get(&group).and_then(|v| v.get(&version)) {
            return Ok(log.clone());
        }

        let mut logs = self.logs.write();
        let versions = logs.entry(group).or_default();
        if let Some(log) = versions.get(&version) {
            return Ok(log.clone());
        }

        let log = Arc::new(PageLog::open(
            self.fs.clone(),
            &self.logs_dir,
            group,
            version,
            self.log_options(),
        )?);
        versions.insert(version, log.clone());
        Ok(log)
    }

    /// Returns the log for a generation if its files exist.
    fn existing_log(&self, group: PageGroup, version: PageGroupVersion) -> Result<Option<Arc<PageLog>>> {
        if let Some(log) = self.logs.read().get(&group).and_then(|v| v.get(&version)) {
            return Ok(Some(log.clone()));
        }

        let mut logs = self.logs.write();
        if let Some(log) = logs.get(&group).and_then(|v| v.get(&version)) {
            return Ok(Some(log.clone()));
        }

        let Some(log) = PageLog::open_existing(
            self.fs.clone(),
            &self.logs_dir,
            group,
            version,
            self.log_options(),
        )?
        else {
            return Ok(None);
        };

        let log = Arc::new(log);
        logs.entry(group).or_default().insert(version, log.clone());
        Ok(Some(log))
    }

    /// Drops a log from the open set and deletes its files.
    fn remove_log(&self, group: PageGroup, version: PageGroupVersion) -> Result<()> {
        let mut logs = self.logs.write();
        let cached = logs.get_mut(&group).and_then(|versions| versions.remove(&version));
        if logs.get(&group).is_some_and(|versions| versions.is_empty()) {
            logs.remove(&group);
        }

        let log = match cached {
            Some(log) => log,
            None => match PageLog::open_existing(
                self.fs.clone(),
                &self.logs_dir,
                group,
                version,
                self.log_options(),
            )? {
                Some(log) => Arc::new(log),
                None => return Ok(()),
            },
        };

        // Deleted under the map lock so a concurrent reader cannot reopen it.
        log.delete()
    }

    /// Appends a page value valid from `timestamp`. Returns bytes written.
    pub fn write(&self, page_number: PageNumber, timestamp: PageVersion, data: &[u8]) -> Result<usize> {
        if page_number < 1 {
            return Err(StrataError::invalid_parameter("page_number", page_number));
        }

        let _writer = self.write_lock.lock();
        let group = self.group_for(page_number);
        let version = self
            .index
            .read()
            .find(group, page_number, timestamp)
            .unwrap_or(timestamp);

        let log = self.get_or_create_log(group, version)?;
        let written = log.append(page_number, timestamp, data)?;

        {
            let mut index = self.index.write();
            if index.push(group, version, page_number) {
                index.store()?;
            }
        }

        self.written_at.store(now_nanos(), Ordering::SeqCst);
        Ok(written)
    }

    /// Reads the newest value of a page visible at `timestamp` into `buf`.
    ///
    /// Returns the version of the value, or None if no log holds one.
    pub fn read(&self, page_number: PageNumber, timestamp: PageVersion, buf: &mut [u8]) -> Result<Option<PageVersion>> {
        let group = self.group_for(page_number);
        let versions = self.index.read().versions_with_page(group, page_number);

        for version in versions.into_iter().rev().filter(|v| *v <= timestamp) {
            let Some(log) = self.existing_log(group, version)? else {
                continue;
            };
            match log.get(page_number, timestamp, buf) {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => continue,
                // Compacted away while we were reading.
                Err(StrataError::Closed(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Discards every record written at exactly `timestamp`.
    pub fn tombstone(&self, timestamp: PageVersion) -> Result<()> {
        let _writer = self.write_lock.lock();
        let pairs = self.index.read().versions_upto(timestamp);

        let mut changed = false;
        for (group, version) in pairs {
            let Some(log) = self.existing_log(group, version)? else {
                continue;
            };
            let emptied = log.tombstone(timestamp)?;
            if !emptied.is_empty() {
                changed |= self.index.write().remove_pages(group, version, &emptied);
            }
        }

        if changed {
            self.index.read().store()?;
        }
        Ok(())
    }

    /// Discards every record of the pages at or after `first_page`, at any
    /// version. Returns the number of pages dropped from the index.
    ///
    /// Used when the logical file shrinks so compaction never writes the
    /// removed pages back.
    pub fn discard_pages_from(&self, first_page: PageNumber) -> Result<usize> {
        if first_page < 1 {
            return Err(StrataError::invalid_parameter("first_page", first_page));
        }

        let _writer = self.write_lock.lock();
        let first_group = self.group_for(first_page);
        let index = self.index.read();
        let pairs: Vec<(PageGroup, PageGroupVersion)> = index
            .entries()
            .range(first_group..)
            .flat_map(|(group, versions)| {
                versions
                    .iter()
                    .filter(|(_, pages)| pages.range(first_page..).next().is_some())
                    .map(move |(version, _)| (*group, *version))
            })
            .collect();
        drop(index);

        let mut discarded = 0;
        for (group, version) in pairs {
            if let Some(log) = self.existing_log(group, version)? {
                log.discard_pages_from(first_page)?;
            }
            let mut index = self.index.write();
            let stale: Vec<PageNumber> = index
                .pages(group, version)
                .into_iter()
                .filter(|page| *page >= first_page)
                .collect();
            index.remove_pages(group, version, &stale);
            discarded += stale.len();
        }

        if discarded > 0 {
            self.index.read().store()?;
            debug!(
                "discarded {} pages at or after page {} in {}",
                discarded,
                first_page,
                self.logs_dir.display()
            );
        }
        Ok(discarded)
    }

    /// Marks a timestamp as in use by a reader.
    pub fn acquire(&self, timestamp: i64) {
        self.leases.acquire(timestamp);
    }

    /// Releases a timestamp acquired with `acquire`.
    pub fn release(&self, timestamp: i64) {
        self.leases.release(timestamp);
    }

    /// Acquires a timestamp for the lifetime of the returned guard.
    pub fn lease(&self, timestamp: i64) -> TimestampLease {
        self.leases.lease(timestamp)
    }

    /// Returns the oldest timestamp in use.
    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.leases.oldest()
    }

    /// Returns the last compaction time in wall-clock nanos (0 if never).
    pub fn compacted_at(&self) -> i64 {
        self.compacted_at.load(Ordering::SeqCst)
    }

    /// Returns the number of log generations known to the index.
    pub fn log_count(&self) -> usize {
        self.index.read().version_count()
    }

    /// Returns the number of logs currently open.
    pub fn open_log_count(&self) -> usize {
        self.logs.read().values().map(|versions| versions.len()).sum()
    }

    fn should_compact(&self, now: i64) -> bool {
        let compacted_at = self.compacted_at.load(Ordering::SeqCst);
        let interval = self.config.compact_interval.as_nanos().min(i64::MAX as u128) as i64;
        if now.saturating_sub(compacted_at) < interval {
            return false;
        }
        self.written_at.load(Ordering::SeqCst) > compacted_at || self.log_count() > 0
    }

    /// Compacts logs into range storage if the interval has elapsed and
    /// there is something to do.
    ///
    /// Fails with `CompactionInProgress` if another compaction is running.
    pub fn compact(&self, target: &dyn CompactionTarget) -> Result<CompactionStats> {
        self.run_compaction(target, false)
    }

    /// Compacts regardless of the interval and recent activity.
    pub fn force_compact(&self, target: &dyn CompactionTarget) -> Result<CompactionStats> {
        self.run_compaction(target, true)
    }

    fn run_compaction(&self, target: &dyn CompactionTarget, force: bool) -> Result<CompactionStats> {
        let Some(_barrier) = self.compaction_barrier.try_lock() else {
            return Err(StrataError::CompactionInProgress);
        };

        if !force && !self.should_compact(now_nanos()) {
            return Ok(CompactionStats::default());
        }

        let _writer = self.write_lock.lock();
        let started_at = now_nanos();

        // Other processes may have changed the logs.
        let pairs: Vec<(PageGroup, PageGroupVersion)> = {
            let mut index = self.index.write();
            index.load()?;
            index
                .entries()
                .iter()
                .flat_map(|(group, versions)| versions.keys().map(move |version| (*group, *version)))
                .collect()
        };

        let boundary = self.leases.oldest().unwrap_or(PageVersion::MAX);
        let mut summaries = Vec::with_capacity(pairs.len());
        for (group, version) in pairs {
            let max_version = match self.existing_log(group, version)? {
                Some(log) => log.max_version(),
                None => None,
            };
            summaries.push(LogSummary {
                group,
                version,
                max_version,
            });
        }

        let plan = plan_compaction(&summaries, boundary);
        let mut stats = CompactionStats::default();

        if !plan.compact.is_empty() {
            let mut pages: BTreeMap<PageNumber, CompactedPage> = BTreeMap::new();
            for &(group, version) in &plan.compact {
                let log = self.existing_log(group, version)?.ok_or_else(|| {
                    StrataError::Closed(format!("page log {}/{} disappeared", group, version))
                })?;

                for page_number in log.live_pages() {
                    let mut buf = vec![0u8; self.config.page_size];
                    let Some(found) = log.get(page_number, PageVersion::MAX, &mut buf)? else {
                        continue;
                    };
                    let newer = pages
                        .get(&page_number)
                        .map_or(true, |existing| found >= existing.version);
                    if newer {
                        pages.insert(
                            page_number,
                            CompactedPage {
                                page_number,
                                version: found,
                                data: Bytes::from(buf),
                            },
                        );
                    }
                }
            }

            let pages: Vec<CompactedPage> = pages.into_values().collect();
            if let Err(e) = target.write_to_range(&pages) {
                error!(
                    "page log compaction in {} failed: {}",
                    self.logs_dir.display(),
                    e
                );
                return Err(e);
            }
            stats.logs_compacted = plan.compact.len();
            stats.pages_written = pages.len();
        }
        stats.empty_logs_removed = plan.empty.len();

        {
            let mut index = self.index.write();
            for &(group, version) in plan.compact.iter().chain(plan.empty.iter()) {
                if let Err(e) = self.remove_log(group, version) {
                    warn!("failed to delete page log {}/{}: {}", group, version, e);
                }
                index.remove_version(group, version);
            }
            index.store()?;
        }

        self.compacted_at.store(started_at, Ordering::SeqCst);
        if !stats.is_noop() {
            info!(
                "compacted page logs in {}: {} drained, {} empty removed, {} pages written",
                self.logs_dir.display(),
                stats.logs_compacted,
                stats.empty_logs_removed,
                stats.pages_written
            );
        }

        Ok(stats)
    }

    /// Flushes every open log and the index.
    pub fn sync(&self) -> Result<()> {
        let logs: Vec<Arc<PageLog>> = self
            .logs
            .read()
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect();
        for log in logs {
            match log.sync() {
                Ok(()) | Err(StrataError::Closed(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.index.read().store()
    }

    /// Flushes and closes every open log. Later calls reopen logs on demand.
    pub fn close(&self) -> Result<()> {
        let _writer = self.write_lock.lock();
        let logs: LogMap = std::mem::take(&mut *self.logs.write());
        for log in logs.into_values().flat_map(|versions| versions.into_values()) {
            log.close()?;
        }
        self.index.read().store()
    }
}
