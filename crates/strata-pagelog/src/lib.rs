//! Write-ahead page logs for Strata.
//!
//! Recent page writes land in append-only page logs sharded by page group and
//! versioned by timestamp. Reads resolve the newest value visible at a
//! snapshot timestamp; compaction drains old logs into range storage.

pub mod compaction;
pub mod constants;
pub mod entry;
pub mod index;
pub mod logger;
pub mod page_log;

pub use compaction::{CompactedPage, CompactionStats, CompactionTarget};
pub use entry::PageLogEntry;
pub use index::{decode_index, encode_index, IndexEntries, PageLoggerIndex};
pub use logger::{PageLogger, PageLoggerConfig};
pub use page_log::{PageLog, PageLogOptions};
