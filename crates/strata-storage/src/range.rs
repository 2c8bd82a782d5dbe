//! Range files: fixed-capacity page containers.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::page::{page_offset_in_range, range_number_for_page};
use strata_common::{
    FileHandle, FileSystem, OpenMode, PageNumber, RangeNumber, Result, StrataError,
};

/// Sizing shared by every range of a database.
#[derive(Debug, Clone, Copy)]
pub struct RangeOptions {
    /// Page size in bytes.
    pub page_size: usize,
    /// Pages per range.
    pub range_max_pages: i64,
    /// Sync after every write.
    pub fsync_enabled: bool,
}

/// One version of one range.
///
/// Holds pages `first_page_of_range(n) ..` at fixed offsets; pages never
/// written read as zeros. A range is closed at most once and every operation
/// after that fails.
pub struct Range {
    fs: Arc<dyn FileSystem>,
    range_number: RangeNumber,
    version: i64,
    options: RangeOptions,
    path: PathBuf,
    file: Mutex<Option<Box<dyn FileHandle>>>,
}

impl std::fmt::Debug for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Range")
            .field("range_number", &self.range_number)
            .field("version", &self.version)
            .field("options", &self.options)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Range {
    /// Returns the file path of a range version.
    pub fn path(ranges_dir: &Path, range_number: RangeNumber, version: i64) -> PathBuf {
        ranges_dir.join(format!("{:010}_{:020}.range", range_number, version))
    }

    /// Parses a range file name into `(range_number, version)`.
    pub fn parse_file_name(name: &str) -> Option<(RangeNumber, i64)> {
        let stem = name.strip_suffix(".range")?;
        let (range_number, version) = stem.split_once('_')?;
        Some((range_number.parse().ok()?, version.parse().ok()?))
    }

    /// Opens a range version, creating an empty file if needed.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        ranges_dir: &Path,
        range_number: RangeNumber,
        version: i64,
        options: RangeOptions,
    ) -> Result<Self> {
        Self::open_with_mode(fs, ranges_dir, range_number, version, options, OpenMode::CREATE)
    }

    /// Opens a range version whose file must already exist.
    pub fn open_existing(
        fs: Arc<dyn FileSystem>,
        ranges_dir: &Path,
        range_number: RangeNumber,
        version: i64,
        options: RangeOptions,
    ) -> Result<Self> {
        match Self::open_with_mode(fs, ranges_dir, range_number, version, options, OpenMode::READ_WRITE) {
            Err(StrataError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StrataError::RangeNotFound {
                    range_number,
                    version,
                })
            }
            result => result,
        }
    }

    /// Creates a range version, discarding any previous file at its path.
    pub fn create(
        fs: Arc<dyn FileSystem>,
        ranges_dir: &Path,
        range_number: RangeNumber,
        version: i64,
        options: RangeOptions,
    ) -> Result<Self> {
        Self::open_with_mode(
            fs,
            ranges_dir,
            range_number,
            version,
            options,
            OpenMode::CREATE_TRUNCATE,
        )
    }

    fn open_with_mode(
        fs: Arc<dyn FileSystem>,
        ranges_dir: &Path,
        range_number: RangeNumber,
        version: i64,
        options: RangeOptions,
        mode: OpenMode,
    ) -> Result<Self> {
        if range_number < 1 {
            return Err(StrataError::invalid_parameter("range_number", range_number));
        }
        let path = Self::path(ranges_dir, range_number, version);
        let file = fs.open_file(&path, mode)?;

        Ok(Self {
            fs,
            range_number,
            version,
            options,
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// Returns the range number.
    pub fn range_number(&self) -> RangeNumber {
        self.range_number
    }

    /// Returns the version timestamp.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Returns the file path.
    pub fn file_path(&self) -> &Path {
        &self.path
    }

    fn closed(&self) -> StrataError {
        StrataError::Closed(format!("range {} version {}", self.range_number, self.version))
    }

    fn page_offset(&self, page_number: PageNumber) -> Result<u64> {
        if page_number < 1
            || range_number_for_page(page_number, self.options.range_max_pages) != self.range_number
        {
            return Err(StrataError::InvalidParameter {
                name: "page_number".to_string(),
                value: format!("{} (range {})", page_number, self.range_number),
            });
        }
        Ok(page_offset_in_range(
            page_number,
            self.options.range_max_pages,
            self.options.page_size,
        ))
    }

    /// Reads a page into `buf`. Returns the number of bytes read, which is
    /// short when the page lies past the end of the file.
    pub fn read_at(&self, page_number: PageNumber, buf: &mut [u8]) -> Result<usize> {
        let offset = self.page_offset(page_number)?;
        let mut file = self.file.lock();
        let file = file.as_mut().ok_or_else(|| self.closed())?;
        let len = buf.len().min(self.options.page_size);
        file.read_at(&mut buf[..len], offset)
    }

    /// Writes one page. Returns the number of bytes written.
    pub fn write_at(&self, page_number: PageNumber, data: &[u8]) -> Result<usize> {
        if data.len() != self.options.page_size {
            return Err(StrataError::PageSizeMismatch {
                expected: self.options.page_size,
                actual: data.len(),
            });
        }
        let offset = self.page_offset(page_number)?;
        let mut file = self.file.lock();
        let file = file.as_mut().ok_or_else(|| self.closed())?;
        file.write_at(data, offset)?;
        if self.options.fsync_enabled {
            file.sync()?;
        }
        Ok(data.len())
    }

    /// Returns the file size in bytes.
    pub fn size(&self) -> Result<u64> {
        let mut file = self.file.lock();
        let file = file.as_mut().ok_or_else(|| self.closed())?;
        file.len()
    }

    /// Returns the number of pages the file covers.
    pub fn page_count(&self) -> Result<i64> {
        Ok((self.size()? / self.options.page_size as u64) as i64)
    }

    /// Truncates the file to `size` bytes.
    pub fn truncate(&self, size: u64) -> Result<()> {
        let max = self.options.range_max_pages as u64 * self.options.page_size as u64;
        if size > max {
            return Err(StrataError::invalid_parameter("size", size));
        }
        let mut file = self.file.lock();
        let file = file.as_mut().ok_or_else(|| self.closed())?;
        file.set_len(size)?;
        if self.options.fsync_enabled {
            file.sync()?;
        }
        Ok(())
    }

    /// Replaces this range's contents with a byte copy of `source`.
    pub fn copy_from(&self, source: &Range) -> Result<()> {
        let page_size = self.options.page_size;
        let source_len = source.size()?;
        let mut buf = vec![0u8; page_size];

        let mut src = source.file.lock();
        let src = src.as_mut().ok_or_else(|| source.closed())?;
        let mut dst = self.file.lock();
        let dst = dst.as_mut().ok_or_else(|| self.closed())?;

        dst.set_len(0)?;
        let mut offset = 0u64;
        while offset < source_len {
            let n = src.read_at(&mut buf, offset)?;
            if n == 0 {
                break;
            }
            dst.write_at(&buf[..n], offset)?;
            offset += n as u64;
        }
        Ok(())
    }

    /// Flushes the file to durable storage.
    pub fn sync(&self) -> Result<()> {
        let mut file = self.file.lock();
        let file = file.as_mut().ok_or_else(|| self.closed())?;
        file.sync()
    }

    /// Returns true once the range has been closed.
    pub fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }

    /// Flushes and releases the file handle.
    pub fn close(&self) -> Result<()> {
        let mut file = self.file.lock();
        match file.take() {
            Some(mut handle) => handle.sync(),
            None => Err(self.closed()),
        }
    }

    /// Closes the range and removes its file.
    pub fn delete(&self) -> Result<()> {
        self.file.lock().take();
        self.fs.remove_file(&self.path)
    }
}
