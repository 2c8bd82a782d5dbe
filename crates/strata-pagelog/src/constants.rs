//! Page log constants for on-disk formats and file naming.

// Page log entry constants

/// Size of one page log entry in bytes.
pub const ENTRY_SIZE: usize = 25;

/// Offset of the page number field in an entry.
pub const OFF_PAGE_NUMBER: usize = 0;

/// Offset of the page version field in an entry.
pub const OFF_VERSION: usize = 8;

/// Offset of the data offset field in an entry.
pub const OFF_OFFSET: usize = 16;

/// Offset of the tombstone flag in an entry.
pub const OFF_TOMBSTONED: usize = 24;

// Page logger index constants

/// Current page logger index format version.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// File name of the persisted page logger index.
pub const INDEX_FILE_NAME: &str = "PAGE_LOGGER_INDEX";

/// Extension of the index file while a new copy is being written.
pub const INDEX_TEMP_EXTENSION: &str = "tmp";

// File naming

/// Extension of page log data files.
pub const LOG_EXTENSION: &str = "log";

/// Extension of page log entry files.
pub const ENTRY_EXTENSION: &str = "idx";
