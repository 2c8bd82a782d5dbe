//! Strata common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Strata components.

pub mod clock;
pub mod config;
pub mod error;
pub mod fs;
pub mod lease;
pub mod page;

pub use config::StorageConfig;
pub use error::{Result, StrataError};
pub use fs::{FileHandle, FileStat, FileSystem, LocalFileSystem, OpenMode};
pub use lease::{TimestampLease, TimestampLeases};
pub use page::{PageGroup, PageGroupVersion, PageNumber, PageVersion, RangeNumber};
