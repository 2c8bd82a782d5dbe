//! Page addressing for Strata storage.
//!
//! Pages are numbered from 1. A byte offset maps to page `offset / page_size + 1`.
//! Pages are sharded into page-log groups and stored cold in fixed-capacity ranges:
//!
//! ```text
//! page:   1 .. 4096 | 4097 .. 8192 | ...
//! range:      1     |      2       | ...
//! ```

use crate::error::{Result, StrataError};

/// Default page size in bytes (4 KB).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default number of pages in a range file.
pub const DEFAULT_RANGE_MAX_PAGES: i64 = 4096;

/// Default number of pages sharing a page-log group.
pub const DEFAULT_PAGE_GROUP_SIZE: i64 = 4096;

/// Logical page identifier (1-based).
pub type PageNumber = i64;

/// Timestamp (UTC nanoseconds) at which a page value became valid.
pub type PageVersion = i64;

/// Shard identifier for page logs.
pub type PageGroup = i64;

/// Timestamp identifying one page log within a group.
pub type PageGroupVersion = i64;

/// Range identifier (1-based).
pub type RangeNumber = i64;

/// Returns the page holding the byte at `offset`.
pub fn page_number_for_offset(offset: i64, page_size: usize) -> PageNumber {
    offset / page_size as i64 + 1
}

/// Returns the byte offset at which `page_number` starts in the logical file.
pub fn offset_for_page(page_number: PageNumber, page_size: usize) -> i64 {
    (page_number - 1) * page_size as i64
}

/// Returns the page-log group for a page.
pub fn page_group_for_page(page_number: PageNumber, group_size: i64) -> PageGroup {
    page_number / group_size + 1
}

/// Returns the range holding a page.
pub fn range_number_for_page(page_number: PageNumber, range_max_pages: i64) -> RangeNumber {
    (page_number - 1) / range_max_pages + 1
}

/// Returns the first page held by a range.
pub fn first_page_of_range(range_number: RangeNumber, range_max_pages: i64) -> PageNumber {
    (range_number - 1) * range_max_pages + 1
}

/// Returns the byte offset of a page inside its range file.
pub fn page_offset_in_range(page_number: PageNumber, range_max_pages: i64, page_size: usize) -> u64 {
    ((page_number - 1).rem_euclid(range_max_pages) as u64) * page_size as u64
}

/// Number of pages needed to hold `size` bytes.
///
/// Fails if `size` is negative or rounding it up to a whole page overflows.
pub fn pages_for_size(size: i64, page_size: usize) -> Result<i64> {
    let page_size = page_size as i64;
    if size < 0 {
        return Err(StrataError::invalid_parameter("size", size));
    }
    size.checked_add(page_size - 1)
        .map(|end| end / page_size)
        .ok_or_else(|| StrataError::invalid_parameter("size", size))
}

/// Byte length of `page_count` whole pages. Fails on overflow.
pub fn size_for_pages(page_count: i64, page_size: usize) -> Result<i64> {
    page_count
        .checked_mul(page_size as i64)
        .ok_or_else(|| StrataError::invalid_parameter("page_count", page_count))
}
