//! Compaction hand-off between the page logger and durable range storage.

use bytes::Bytes;
use strata_common::{PageGroup, PageGroupVersion, PageNumber, PageVersion, Result};

/// The newest value of a page drained from the page logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactedPage {
    /// Page number.
    pub page_number: PageNumber,
    /// Version of the record the value came from.
    pub version: PageVersion,
    /// Full page contents.
    pub data: Bytes,
}

/// Destination of compacted pages.
///
/// Implementations must make the pages durable and visible to readers before
/// returning `Ok`; the logs holding them are deleted right after.
pub trait CompactionTarget {
    /// Writes the pages into range storage. Pages arrive sorted by page number.
    fn write_to_range(&self, pages: &[CompactedPage]) -> Result<()>;
}

/// Summary of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Logs whose pages were written back.
    pub logs_compacted: usize,
    /// Logs removed without write-back because they held no live record.
    pub empty_logs_removed: usize,
    /// Distinct pages written back.
    pub pages_written: usize,
}

impl CompactionStats {
    /// Returns true if the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.logs_compacted == 0 && self.empty_logs_removed == 0
    }
}

/// Logs selected by one compaction pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CompactionPlan {
    /// Logs to drain, per group in ascending version order.
    pub compact: Vec<(PageGroup, PageGroupVersion)>,
    /// Logs to remove without write-back.
    pub empty: Vec<(PageGroup, PageGroupVersion)>,
}

/// State of one log as seen by the planner.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogSummary {
    pub group: PageGroup,
    pub version: PageGroupVersion,
    /// Newest live record version, None if the log holds no live record.
    pub max_version: Option<PageVersion>,
}

/// Selects logs to compact below `boundary`, the oldest in-use timestamp.
///
/// `logs` must be sorted by group then version. Within a group, logs are
/// drained in version order and the first log holding a record at or after
/// the boundary stops the group, so an older log never shadows a value that
/// has already moved to range storage.
pub(crate) fn plan_compaction(logs: &[LogSummary], boundary: PageVersion) -> CompactionPlan {
    let mut plan = CompactionPlan::default();
    let mut blocked_group: Option<PageGroup> = None;

    for log in logs {
        if log.version >= boundary {
            continue;
        }
        match log.max_version {
            None => plan.empty.push((log.group, log.version)),
            Some(max_version) => {
                if blocked_group == Some(log.group) {
                    continue;
                }
                if max_version < boundary {
                    plan.compact.push((log.group, log.version));
                } else {
                    blocked_group = Some(log.group);
                }
            }
        }
    }

    plan
}
