//! Durable storage for Strata.
//!
//! This crate provides:
//! - Range files holding pages at fixed offsets
//! - The range index and copy-on-write range versioning
//! - Database metadata (logical page count)
//! - The durable database file system joining page logs and ranges
//! - A background compactor

mod compactor;
mod durable;
mod metadata;
mod range;
mod range_index;
mod range_manager;

pub use compactor::{Compactor, CompactorHandle};
pub use durable::{DurableDatabaseFileSystem, SnapshotGuard, WriteHook};
pub use metadata::{DatabaseMetadata, METADATA_FILE_NAME};
pub use range::{Range, RangeOptions};
pub use range_index::{DataRangeIndex, RANGE_INDEX_ENTRY_SIZE, RANGE_INDEX_FILE_NAME};
pub use range_manager::DataRangeManager;
