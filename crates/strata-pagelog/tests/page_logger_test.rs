//! Page logger integration tests.
//!
//! Exercises the logger through its public API against real files:
//! - Snapshot reads across log generations
//! - Tombstones and reopen
//! - Index rebuild and torn-append recovery
//! - Compaction gating and lease boundaries

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use strata_common::{FileSystem, LocalFileSystem, PageNumber, Result};
use strata_pagelog::constants::INDEX_FILE_NAME;
use strata_pagelog::{
    CompactedPage, CompactionTarget, PageLog, PageLogger, PageLoggerConfig,
};

const PAGE: usize = 128;

// =============================================================================
// Helpers
// =============================================================================

/// In-memory stand-in for range storage.
#[derive(Default)]
struct MemoryRanges {
    pages: Mutex<BTreeMap<PageNumber, CompactedPage>>,
    batches: Mutex<usize>,
}

impl CompactionTarget for MemoryRanges {
    fn write_to_range(&self, pages: &[CompactedPage]) -> Result<()> {
        let mut stored = self.pages.lock();
        for page in pages {
            stored.insert(page.page_number, page.clone());
        }
        *self.batches.lock() += 1;
        Ok(())
    }
}

fn config(compact_interval: Duration) -> PageLoggerConfig {
    PageLoggerConfig {
        page_size: PAGE,
        page_group_size: 16,
        compact_interval,
        fsync_enabled: false,
    }
}

fn open(dir: &Path) -> PageLogger {
    open_with(dir, Duration::ZERO)
}

fn open_with(dir: &Path, compact_interval: Duration) -> PageLogger {
    let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    PageLogger::open(fs, dir, config(compact_interval)).unwrap()
}

fn read(logger: &PageLogger, page: PageNumber, timestamp: i64) -> Option<(i64, Vec<u8>)> {
    let mut buf = vec![0u8; PAGE];
    logger
        .read(page, timestamp, &mut buf)
        .unwrap()
        .map(|version| (version, buf))
}

// =============================================================================
// Snapshot reads
// =============================================================================

#[test]
fn test_read_resolves_newest_version_at_snapshot() {
    let dir = tempdir().unwrap();
    let logger = open(dir.path());

    logger.write(1, 1, &[0x00; PAGE]).unwrap();
    logger.write(1, 2, &[0xFF; PAGE]).unwrap();
    logger.write(1, 4, &[0xAA; PAGE]).unwrap();

    assert_eq!(read(&logger, 1, 3), Some((2, vec![0xFF; PAGE])));
    assert_eq!(read(&logger, 1, 1), Some((1, vec![0x00; PAGE])));
    assert_eq!(read(&logger, 1, 4), Some((4, vec![0xAA; PAGE])));
    assert_eq!(read(&logger, 1, 0), None);
    assert_eq!(read(&logger, 2, 10), None);
}

#[test]
fn test_writes_land_in_generation_holding_page() {
    let dir = tempdir().unwrap();
    let logger = open(dir.path());

    logger.write(1, 10, &[1; PAGE]).unwrap();
    logger.write(1, 20, &[2; PAGE]).unwrap();
    logger.write(2, 20, &[3; PAGE]).unwrap();
    logger.write(3, 5, &[4; PAGE]).unwrap();

    // Page 1 reuses generation 10; pages 2 and 3 open their own.
    assert_eq!(logger.log_count(), 3);
    assert_eq!(read(&logger, 2, 19), None);
    assert_eq!(read(&logger, 3, 5), Some((5, vec![4; PAGE])));
}

#[test]
fn test_pages_in_different_groups() {
    let dir = tempdir().unwrap();
    let logger = open(dir.path());

    for page in [1, 15, 16, 40] {
        logger.write(page, 7, &[page as u8; PAGE]).unwrap();
    }
    for page in [1, 15, 16, 40] {
        assert_eq!(read(&logger, page, 7), Some((7, vec![page as u8; PAGE])));
    }
    assert!(PageLog::group_dir(dir.path(), 1).is_dir());
    assert!(PageLog::group_dir(dir.path(), 2).is_dir());
    assert!(PageLog::group_dir(dir.path(), 3).is_dir());
}

#[test]
fn test_write_rejects_wrong_page_size() {
    let dir = tempdir().unwrap();
    let logger = open(dir.path());
    assert!(logger.write(1, 1, &[0; PAGE + 1]).is_err());
    assert!(logger.write(0, 1, &[0; PAGE]).is_err());
    assert_eq!(logger.log_count(), 0);
}

// =============================================================================
// Durability
// =============================================================================

#[test]
fn test_reopen_preserves_values() {
    let dir = tempdir().unwrap();
    {
        let logger = open(dir.path());
        logger.write(3, 100, &[9; PAGE]).unwrap();
        logger.write(3, 200, &[8; PAGE]).unwrap();
        logger.close().unwrap();
    }

    let logger = open(dir.path());
    assert_eq!(read(&logger, 3, 150), Some((100, vec![9; PAGE])));
    assert_eq!(read(&logger, 3, 250), Some((200, vec![8; PAGE])));
}

#[test]
fn test_tombstone_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let logger = open(dir.path());
        logger.write(1, 10, &[1; PAGE]).unwrap();
        logger.write(1, 20, &[2; PAGE]).unwrap();
        logger.write(2, 20, &[3; PAGE]).unwrap();
        logger.tombstone(20).unwrap();

        assert_eq!(read(&logger, 1, 25), Some((10, vec![1; PAGE])));
        assert_eq!(read(&logger, 2, 25), None);
        logger.close().unwrap();
    }

    let logger = open(dir.path());
    assert_eq!(read(&logger, 1, 25), Some((10, vec![1; PAGE])));
    assert_eq!(read(&logger, 2, 25), None);
}

#[test]
fn test_missing_index_is_rebuilt() {
    let dir = tempdir().unwrap();
    {
        let logger = open(dir.path());
        logger.write(1, 10, &[1; PAGE]).unwrap();
        logger.write(20, 11, &[2; PAGE]).unwrap();
        logger.close().unwrap();
    }
    std::fs::remove_file(dir.path().join(INDEX_FILE_NAME)).unwrap();

    let logger = open(dir.path());
    assert_eq!(logger.log_count(), 2);
    assert_eq!(read(&logger, 1, 10), Some((10, vec![1; PAGE])));
    assert_eq!(read(&logger, 20, 11), Some((11, vec![2; PAGE])));
}

#[test]
fn test_corrupt_index_is_rebuilt() {
    let dir = tempdir().unwrap();
    {
        let logger = open(dir.path());
        logger.write(5, 10, &[5; PAGE]).unwrap();
        logger.close().unwrap();
    }
    std::fs::write(dir.path().join(INDEX_FILE_NAME), [0xDE, 0xAD]).unwrap();

    let logger = open(dir.path());
    assert_eq!(read(&logger, 5, 10), Some((10, vec![5; PAGE])));
}

#[test]
fn test_torn_append_is_dropped() {
    let dir = tempdir().unwrap();
    {
        let logger = open(dir.path());
        logger.write(1, 10, &[1; PAGE]).unwrap();
        logger.write(1, 11, &[2; PAGE]).unwrap();
        logger.close().unwrap();
    }

    // Lose half of the second record.
    let (data_path, _) = PageLog::paths(dir.path(), 1, 10);
    let file = std::fs::OpenOptions::new().write(true).open(&data_path).unwrap();
    file.set_len((PAGE + PAGE / 2) as u64).unwrap();
    drop(file);

    let logger = open(dir.path());
    assert_eq!(read(&logger, 1, 11), Some((10, vec![1; PAGE])));
    logger.write(1, 12, &[3; PAGE]).unwrap();
    assert_eq!(read(&logger, 1, 12), Some((12, vec![3; PAGE])));
}

// =============================================================================
// Compaction
// =============================================================================

#[test]
fn test_compaction_drains_newest_values() {
    let dir = tempdir().unwrap();
    let logger = open(dir.path());
    let ranges = MemoryRanges::default();

    logger.write(1, 10, &[1; PAGE]).unwrap();
    logger.write(1, 12, &[2; PAGE]).unwrap();
    logger.write(30, 11, &[3; PAGE]).unwrap();

    let stats = logger.compact(&ranges).unwrap();
    assert_eq!(stats.logs_compacted, 2);
    assert_eq!(stats.pages_written, 2);
    assert_eq!(logger.log_count(), 0);
    assert_eq!(logger.open_log_count(), 0);
    assert_eq!(read(&logger, 1, 12), None);

    let pages = ranges.pages.lock();
    assert_eq!(pages[&1].version, 12);
    assert_eq!(&pages[&1].data[..], &[2; PAGE]);
    assert_eq!(pages[&30].version, 11);
}

#[test]
fn test_compaction_is_idempotent() {
    let dir = tempdir().unwrap();
    let logger = open(dir.path());
    let ranges = MemoryRanges::default();

    logger.write(1, 10, &[1; PAGE]).unwrap();
    assert!(!logger.compact(&ranges).unwrap().is_noop());
    let batches = *ranges.batches.lock();

    assert!(logger.compact(&ranges).unwrap().is_noop());
    assert_eq!(*ranges.batches.lock(), batches);
    assert_eq!(logger.log_count(), 0);
}

#[test]
fn test_compaction_waits_for_interval() {
    let dir = tempdir().unwrap();
    let logger = open_with(dir.path(), Duration::from_secs(3600));
    let ranges = MemoryRanges::default();

    logger.write(1, 10, &[1; PAGE]).unwrap();
    // Never compacted before, so the interval has elapsed.
    assert!(!logger.compact(&ranges).unwrap().is_noop());
    assert!(logger.compacted_at() > 0);

    logger.write(1, 20, &[2; PAGE]).unwrap();
    assert!(logger.compact(&ranges).unwrap().is_noop());
    assert_eq!(logger.log_count(), 1);

    assert!(!logger.force_compact(&ranges).unwrap().is_noop());
    assert_eq!(logger.log_count(), 0);
}

#[test]
fn test_lease_holds_back_compaction() {
    let dir = tempdir().unwrap();
    let logger = open(dir.path());
    let ranges = MemoryRanges::default();

    logger.write(1, 10, &[1; PAGE]).unwrap();
    logger.write(40, 30, &[2; PAGE]).unwrap();

    {
        let _lease = logger.lease(20);
        let stats = logger.force_compact(&ranges).unwrap();
        assert_eq!(stats.logs_compacted, 1);
        assert_eq!(read(&logger, 40, 30), Some((30, vec![2; PAGE])));
        assert!(ranges.pages.lock().contains_key(&1));
        assert!(!ranges.pages.lock().contains_key(&40));
    }

    assert_eq!(logger.oldest_timestamp(), None);
    logger.force_compact(&ranges).unwrap();
    assert!(ranges.pages.lock().contains_key(&40));
}

#[test]
fn test_tombstoned_log_is_removed_as_empty() {
    let dir = tempdir().unwrap();
    let logger = open(dir.path());
    let ranges = MemoryRanges::default();

    logger.write(1, 10, &[1; PAGE]).unwrap();
    logger.tombstone(10).unwrap();

    let stats = logger.force_compact(&ranges).unwrap();
    assert_eq!(stats.logs_compacted, 0);
    assert_eq!(stats.empty_logs_removed, 1);
    assert!(ranges.pages.lock().is_empty());

    let (data_path, index_path) = PageLog::paths(dir.path(), 1, 10);
    assert!(!data_path.exists());
    assert!(!index_path.exists());
}
