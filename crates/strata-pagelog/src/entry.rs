//! Page log entry format.

use crate::constants::{ENTRY_SIZE, OFF_OFFSET, OFF_PAGE_NUMBER, OFF_TOMBSTONED, OFF_VERSION};
use strata_common::{PageNumber, PageVersion};

/// Location of one page record inside a page log.
///
/// Entry format on disk (25 bytes, little-endian):
/// - page_number: 8 bytes
/// - version: 8 bytes
/// - offset: 8 bytes (byte offset of the record in the data file)
/// - tombstoned: 1 byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLogEntry {
    /// Page this record holds.
    pub page_number: PageNumber,
    /// Timestamp at which the record became valid.
    pub version: PageVersion,
    /// Byte offset of the record in the data file.
    pub offset: i64,
    /// True once the record has been discarded.
    pub tombstoned: bool,
}

impl PageLogEntry {
    /// Size of an entry in bytes.
    pub const SIZE: usize = ENTRY_SIZE;

    /// Creates a live entry.
    pub fn new(page_number: PageNumber, version: PageVersion, offset: i64) -> Self {
        Self {
            page_number,
            version,
            offset,
            tombstoned: false,
        }
    }

    /// Serializes the entry to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[OFF_PAGE_NUMBER..OFF_VERSION].copy_from_slice(&self.page_number.to_le_bytes());
        buf[OFF_VERSION..OFF_OFFSET].copy_from_slice(&self.version.to_le_bytes());
        buf[OFF_OFFSET..OFF_TOMBSTONED].copy_from_slice(&self.offset.to_le_bytes());
        buf[OFF_TOMBSTONED] = self.tombstoned as u8;
        buf
    }

    /// Deserializes an entry from bytes.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let read_i64 = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            i64::from_le_bytes(raw)
        };

        Self {
            page_number: read_i64(OFF_PAGE_NUMBER),
            version: read_i64(OFF_VERSION),
            offset: read_i64(OFF_OFFSET),
            tombstoned: buf[OFF_TOMBSTONED] != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_layout() {
        let entry = PageLogEntry {
            page_number: 3,
            version: 0x0102_0304,
            offset: 8192,
            tombstoned: true,
        };
        let bytes = entry.to_bytes();

        assert_eq!(bytes.len(), 25);
        assert_eq!(&bytes[0..8], &3i64.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x0102_0304i64.to_le_bytes());
        assert_eq!(&bytes[16..24], &8192i64.to_le_bytes());
        assert_eq!(bytes[24], 1);
        assert_eq!(PageLogEntry::from_bytes(&bytes), entry);
    }

    #[test]
    fn test_new_entry_is_live() {
        let entry = PageLogEntry::new(1, 2, 0);
        assert!(!entry.tombstoned);
        assert_eq!(entry.to_bytes()[24], 0);
    }
}
