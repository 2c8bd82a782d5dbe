//! Versioned range storage.
//!
//! Every write-back produces a new version of a range by copying the current
//! version and applying the compacted pages to the copy. Older versions stay
//! readable for snapshots until garbage collection removes them.

use crate::range::{Range, RangeOptions};
use crate::range_index::DataRangeIndex;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::{
    FileSystem, RangeNumber, Result, StrataError, TimestampLease, TimestampLeases,
};

type RangeVersions = BTreeMap<i64, Arc<Range>>;

/// Owns every open range of one database branch.
pub struct DataRangeManager {
    fs: Arc<dyn FileSystem>,
    ranges_dir: PathBuf,
    options: RangeOptions,
    index: DataRangeIndex,
    /// Open range handles, by range number then version.
    ranges: Mutex<HashMap<RangeNumber, RangeVersions>>,
    leases: Arc<TimestampLeases>,
}

impl DataRangeManager {
    /// Opens the ranges directory and removes range files the index no
    /// longer references.
    pub fn open(fs: Arc<dyn FileSystem>, ranges_dir: &Path, options: RangeOptions) -> Result<Self> {
        let index = DataRangeIndex::open(Arc::clone(&fs), ranges_dir, options.fsync_enabled)?;
        let manager = Self {
            fs,
            ranges_dir: ranges_dir.to_path_buf(),
            options,
            index,
            ranges: Mutex::new(HashMap::new()),
            leases: Arc::new(TimestampLeases::new()),
        };
        manager.sweep_stale_files()?;
        Ok(manager)
    }

    /// Returns the ranges directory.
    pub fn ranges_dir(&self) -> &Path {
        &self.ranges_dir
    }

    /// Returns the range index.
    pub fn index(&self) -> &DataRangeIndex {
        &self.index
    }

    /// Returns the current version of a range.
    pub fn current_version(&self, range_number: RangeNumber) -> Result<i64> {
        self.index.get(range_number)
    }

    fn sweep_stale_files(&self) -> Result<()> {
        let mut removed = 0;
        for name in self.fs.read_dir(&self.ranges_dir)? {
            let Some((range_number, version)) = Range::parse_file_name(&name) else {
                continue;
            };
            if range_number < 1 || self.index.get(range_number)? == version {
                continue;
            }
            let path = self.ranges_dir.join(&name);
            match self.fs.remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("failed to remove stale range file {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            info!("removed {} stale range files from {}", removed, self.ranges_dir.display());
        }
        Ok(())
    }

    /// Opens a version named by the index. Version 0 is the implicit empty
    /// range and is created on demand; any other version must exist.
    fn open_version(&self, range_number: RangeNumber, version: i64) -> Result<Arc<Range>> {
        let fs = Arc::clone(&self.fs);
        let range = if version == 0 {
            Range::open(fs, &self.ranges_dir, range_number, version, self.options)?
        } else {
            Range::open_existing(fs, &self.ranges_dir, range_number, version, self.options)?
        };
        Ok(Arc::new(range))
    }

    /// Returns the range version visible at `timestamp`.
    ///
    /// This is the newest open version at or before `timestamp`, or the
    /// current version when that is newer still. When every known version is
    /// newer than `timestamp` the current version is returned.
    pub fn get(&self, range_number: RangeNumber, timestamp: i64) -> Result<Arc<Range>> {
        // Read under the lock so a concurrent copy and collection cannot
        // leave us holding a deleted version.
        let mut ranges = self.ranges.lock();
        let current = self.index.get(range_number)?;
        let versions = ranges.entry(range_number).or_default();

        let cached = versions.range(..=timestamp).next_back().map(|(v, _)| *v);
        let version = match cached {
            Some(cached) if current <= timestamp => cached.max(current),
            Some(cached) => cached,
            None => current,
        };

        if let Some(range) = versions.get(&version) {
            return Ok(Arc::clone(range));
        }
        let range = self.open_version(range_number, version)?;
        versions.insert(version, Arc::clone(&range));
        Ok(range)
    }

    /// Creates version `new_timestamp` of a range from the current version,
    /// lets `mutate` modify the copy, and makes it current.
    ///
    /// Fails with an invariant violation if `new_timestamp` is not newer than
    /// the current version or a handle for it is already open.
    pub fn copy_range<F>(&self, range_number: RangeNumber, new_timestamp: i64, mutate: F) -> Result<Arc<Range>>
    where
        F: FnOnce(&Range) -> Result<()>,
    {
        let mut ranges = self.ranges.lock();
        let current = self.index.get(range_number)?;

        if new_timestamp <= current {
            error!(
                "range index corrupted: range {} copy at {} is not newer than current version {}",
                range_number, new_timestamp, current
            );
            return Err(StrataError::InvariantViolation(format!(
                "range {} copy at {} is not newer than current version {}",
                range_number, new_timestamp, current
            )));
        }

        let versions = ranges.entry(range_number).or_default();
        if versions.contains_key(&new_timestamp) {
            error!(
                "range {} version {} already has an open handle",
                range_number, new_timestamp
            );
            return Err(StrataError::InvariantViolation(format!(
                "range {} version {} already has an open handle",
                range_number, new_timestamp
            )));
        }

        let source = match versions.get(&current) {
            Some(range) => Arc::clone(range),
            None => {
                let range = self.open_version(range_number, current)?;
                versions.insert(current, Arc::clone(&range));
                range
            }
        };

        let target = Range::create(
            Arc::clone(&self.fs),
            &self.ranges_dir,
            range_number,
            new_timestamp,
            self.options,
        )?;
        let built = target
            .copy_from(&source)
            .and_then(|_| mutate(&target))
            .and_then(|_| target.sync());
        if let Err(e) = built {
            if let Err(cleanup) = target.delete() {
                warn!("failed to remove partial range {}: {}", target.file_path().display(), cleanup);
            }
            return Err(e);
        }

        self.index.set(range_number, new_timestamp)?;
        let target = Arc::new(target);
        versions.insert(new_timestamp, Arc::clone(&target));
        debug!(
            "copied range {} from version {} to {}",
            range_number, current, new_timestamp
        );
        Ok(target)
    }

    /// Marks a timestamp as in use by a reader.
    pub fn acquire(&self, timestamp: i64) {
        self.leases.acquire(timestamp);
    }

    /// Releases a timestamp acquired with [`acquire`](Self::acquire).
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

    /// Removes range versions no reader can see any more.
    ///
    /// For each range the floor is the newest version at or before the oldest
    /// leased timestamp. Versions older than the floor are deleted, except the
    /// current version. Returns the number of versions deleted.
    pub fn run_garbage_collection(&self) -> Result<usize> {
        let boundary = self.leases.oldest().unwrap_or(i64::MAX);
        let mut ranges = self.ranges.lock();
        let mut removed = 0;

        for (range_number, versions) in ranges.iter_mut() {
            let current = self.index.get(*range_number)?;
            let cached_floor = versions.range(..=boundary).next_back().map(|(v, _)| *v);
            let floor = match cached_floor {
                Some(floor) if current <= boundary => floor.max(current),
                Some(floor) => floor,
                None if current <= boundary => current,
                None => continue,
            };

            let doomed: Vec<i64> = versions
                .range(..floor)
                .map(|(v, _)| *v)
                .filter(|v| *v != current)
                .collect();
            for version in doomed {
                if let Some(range) = versions.remove(&version) {
                    match range.delete() {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(
                            "Failed to delete range {} version {}: {}",
                            range_number, version, e
                        ),
                    }
                }
            }
        }

        if removed > 0 {
            info!("garbage collected {} range versions below {}", removed, boundary);
        }
        Ok(removed)
    }

    /// Closes and deletes one open version of a range.
    pub fn remove(&self, range_number: RangeNumber, timestamp: i64) -> Result<()> {
        let range = self
            .ranges
            .lock()
            .get_mut(&range_number)
            .and_then(|versions| versions.remove(&timestamp))
            .ok_or(StrataError::RangeNotFound {
                range_number,
                version: timestamp,
            })?;
        range.delete()
    }

    /// Deletes every version of a range and resets it to empty.
    pub fn delete_range(&self, range_number: RangeNumber) -> Result<()> {
        let mut ranges = self.ranges.lock();
        let current = self.index.get(range_number)?;
        if let Some(versions) = ranges.remove(&range_number) {
            for (_, range) in versions {
                range.delete()?;
            }
        }
        self.fs
            .remove_file(&Range::path(&self.ranges_dir, range_number, current))?;
        if current != 0 {
            self.index.set(range_number, 0)?;
        }
        debug!("deleted range {}", range_number);
        Ok(())
    }

    /// Returns the open versions of a range in ascending order.
    pub fn open_versions(&self, range_number: RangeNumber) -> Vec<i64> {
        self.ranges
            .lock()
            .get(&range_number)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Flushes every open range and the index.
    pub fn sync(&self) -> Result<()> {
        for versions in self.ranges.lock().values() {
            for range in versions.values() {
                if !range.is_closed() {
                    range.sync()?;
                }
            }
        }
        self.index.sync()
    }

    /// Closes every open range and the index.
    pub fn close(&self) -> Result<()> {
        let ranges: Vec<RangeVersions> = self.ranges.lock().drain().map(|(_, v)| v).collect();
        for range in ranges.into_iter().flat_map(|versions| versions.into_values()) {
            if !range.is_closed() {
                range.close()?;
            }
        }
        self.index.close()
    }
}
