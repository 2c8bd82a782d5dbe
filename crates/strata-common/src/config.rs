//! Configuration structures for Strata.

use crate::error::{Result, StrataError};
use crate::page::{DEFAULT_PAGE_GROUP_SIZE, DEFAULT_PAGE_SIZE, DEFAULT_RANGE_MAX_PAGES};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage configuration for one Strata node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory under which every database/branch tree lives.
    pub data_dir: PathBuf,
    /// Page size in bytes.
    pub page_size: usize,
    /// Number of pages held by one range file.
    pub range_max_pages: i64,
    /// Number of pages sharing one page-log group.
    pub page_group_size: i64,
    /// Minimum time between two non-forced page logger compactions.
    pub page_logger_compact_interval_ms: u64,
    /// Period of the background compactor.
    pub compaction_tick_ms: u64,
    /// Sync file handles after every write.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: DEFAULT_PAGE_SIZE,
            range_max_pages: DEFAULT_RANGE_MAX_PAGES,
            page_group_size: DEFAULT_PAGE_GROUP_SIZE,
            page_logger_compact_interval_ms: 10_000,
            compaction_tick_ms: 10_000,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the page logger compaction interval.
    pub fn compact_interval(&self) -> Duration {
        Duration::from_millis(self.page_logger_compact_interval_ms)
    }

    /// Returns the background compactor period.
    pub fn compaction_tick(&self) -> Duration {
        Duration::from_millis(self.compaction_tick_ms)
    }

    /// Returns the size of a full range file in bytes.
    pub fn range_size_bytes(&self) -> i64 {
        self.range_max_pages * self.page_size as i64
    }

    /// Checks that the sizes describe a usable layout.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(StrataError::ConfigError(format!(
                "page_size must be a non-zero power of two, got {}",
                self.page_size
            )));
        }
        if self.range_max_pages <= 0 {
            return Err(StrataError::ConfigError(format!(
                "range_max_pages must be positive, got {}",
                self.range_max_pages
            )));
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
