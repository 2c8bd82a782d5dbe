//! Page logger index.
//!
//! Maps each page group to its log generations and, per generation, the set
//! of pages that have a live record in that log. The whole map is encoded in a
//! single buffer so it can be stored and reloaded in one step.
//!
//! Layout (little-endian):
//! ```text
//! u32 format_version
//! u32 group_count
//! per group:   i64 group | u32 body_len | body
//! body entry:  i64 version | u32 pages_len | i64 page * (pages_len / 8)
//! ```

use crate::constants::{INDEX_FORMAT_VERSION, INDEX_TEMP_EXTENSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::{
    FileSystem, OpenMode, PageGroup, PageGroupVersion, PageNumber, PageVersion, Result,
    StrataError,
};

/// Group -> generation -> pages with a live record.
pub type IndexEntries = BTreeMap<PageGroup, BTreeMap<PageGroupVersion, BTreeSet<PageNumber>>>;

/// Encodes index entries into the on-disk layout.
pub fn encode_index(entries: &IndexEntries) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(INDEX_FORMAT_VERSION);
    buf.put_u32_le(entries.len() as u32);

    for (group, versions) in entries {
        let mut body = BytesMut::new();
        for (version, pages) in versions {
            body.put_i64_le(*version);
            body.put_u32_le((pages.len() * 8) as u32);
            for page in pages {
                body.put_i64_le(*page);
            }
        }

        buf.put_i64_le(*group);
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
    }

    buf.freeze()
}

fn corrupted(reason: &str) -> StrataError {
    StrataError::IndexCorrupted(format!("page logger index: {}", reason))
}

/// Decodes index entries from the on-disk layout.
pub fn decode_index(mut data: &[u8]) -> Result<IndexEntries> {
    let mut entries = IndexEntries::new();
    if data.is_empty() {
        return Ok(entries);
    }

    if data.remaining() < 8 {
        return Err(corrupted("header too short"));
    }
    let format_version = data.get_u32_le();
    if format_version != INDEX_FORMAT_VERSION {
        return Err(corrupted(&format!(
            "unsupported format version {}",
            format_version
        )));
    }
    let group_count = data.get_u32_le();

    for _ in 0..group_count {
        if data.remaining() < 12 {
            return Err(corrupted("truncated group header"));
        }
        let group = data.get_i64_le();
        let body_len = data.get_u32_le() as usize;
        if data.remaining() < body_len {
            return Err(corrupted("truncated group body"));
        }

        let mut body = &data[..body_len];
        data.advance(body_len);

        let versions = entries.entry(group).or_default();
        while body.has_remaining() {
            if body.remaining() < 12 {
                return Err(corrupted("truncated version header"));
            }
            let version = body.get_i64_le();
            let pages_len = body.get_u32_le() as usize;
            if pages_len % 8 != 0 || body.remaining() < pages_len {
                return Err(corrupted("truncated page list"));
            }

            let pages = versions.entry(version).or_default();
            for _ in 0..pages_len / 8 {
                pages.insert(body.get_i64_le());
            }
        }
    }

    if data.has_remaining() {
        return Err(corrupted("trailing bytes"));
    }

    Ok(entries)
}

/// In-memory page logger index backed by one file.
///
/// The file is only ever replaced whole: a new copy is written next to it
/// and renamed over it.
pub struct PageLoggerIndex {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    temp_path: PathBuf,
    fsync_enabled: bool,
    entries: IndexEntries,
}

impl PageLoggerIndex {
    /// Creates an empty index persisted at `path`. Nothing is read.
    pub fn new(fs: Arc<dyn FileSystem>, path: &Path, fsync_enabled: bool) -> Self {
        Self {
            fs,
            path: path.to_path_buf(),
            temp_path: path.with_extension(INDEX_TEMP_EXTENSION),
            fsync_enabled,
            entries: IndexEntries::new(),
        }
    }

    /// Returns true if a persisted index exists.
    pub fn exists(&self) -> Result<bool> {
        Ok(self.fs.stat(&self.path)?.is_some())
    }

    /// Replaces the in-memory entries with the persisted ones. A missing file
    /// loads as empty.
    pub fn load(&mut self) -> Result<()> {
        let Some(stat) = self.fs.stat(&self.path)? else {
            self.entries.clear();
            return Ok(());
        };

        let mut file = self.fs.open_file(&self.path, OpenMode::READ_WRITE)?;
        let mut raw = vec![0u8; stat.len as usize];
        let n = file.read_at(&mut raw, 0)?;
        raw.truncate(n);

        self.entries = decode_index(&raw)?;
        debug!(
            "loaded page logger index groups={} from {}",
            self.entries.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Persists the in-memory entries. A crash leaves either the previous
    /// or the new index in place, never a mix of both.
    pub fn store(&self) -> Result<()> {
        let encoded = encode_index(&self.entries);
        {
            let mut file = self.fs.open_file(&self.temp_path, OpenMode::CREATE_TRUNCATE)?;
            file.write_at(&encoded, 0)?;
            if self.fsync_enabled {
                file.sync()?;
            }
        }
        self.fs.rename(&self.temp_path, &self.path)
    }

    /// Replaces all entries.
    pub fn replace(&mut self, entries: IndexEntries) {
        self.entries = entries;
    }

    /// Returns all entries.
    pub fn entries(&self) -> &IndexEntries {
        &self.entries
    }

    /// Finds the newest generation of `group` not newer than `ceiling` whose
    /// log holds `page_number`.
    pub fn find(
        &self,
        group: PageGroup,
        page_number: PageNumber,
        ceiling: PageVersion,
    ) -> Option<PageGroupVersion> {
        self.entries.get(&group).and_then(|versions| {
            versions
                .range(..=ceiling)
                .rev()
                .find(|(_, pages)| pages.contains(&page_number))
                .map(|(version, _)| *version)
        })
    }

    /// Records that the log `(group, version)` holds `page_number`.
    /// Returns true if the index changed.
    pub fn push(&mut self, group: PageGroup, version: PageGroupVersion, page_number: PageNumber) -> bool {
        self.entries
            .entry(group)
            .or_default()
            .entry(version)
            .or_default()
            .insert(page_number)
    }

    /// Removes pages from a generation, keeping the generation itself.
    /// Returns true if the index changed.
    pub fn remove_pages(
        &mut self,
        group: PageGroup,
        version: PageGroupVersion,
        pages: &[PageNumber],
    ) -> bool {
        let Some(set) = self
            .entries
            .get_mut(&group)
            .and_then(|versions| versions.get_mut(&version))
        else {
            return false;
        };

        let mut changed = false;
        for page in pages {
            changed |= set.remove(page);
        }
        changed
    }

    /// Removes a generation. Returns true if it was present.
    pub fn remove_version(&mut self, group: PageGroup, version: PageGroupVersion) -> bool {
        let Some(versions) = self.entries.get_mut(&group) else {
            return false;
        };
        let removed = versions.remove(&version).is_some();
        if versions.is_empty() {
            self.entries.remove(&group);
        }
        removed
    }

    /// Returns the generations of a group, ascending.
    pub fn group_versions(&self, group: PageGroup) -> Vec<PageGroupVersion> {
        self.entries
            .get(&group)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the generations of a group whose log holds `page_number`,
    /// ascending.
    pub fn versions_with_page(&self, group: PageGroup, page_number: PageNumber) -> Vec<PageGroupVersion> {
        self.entries
            .get(&group)
            .map(|versions| {
                versions
                    .iter()
                    .filter(|(_, pages)| pages.contains(&page_number))
                    .map(|(version, _)| *version)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns every `(group, version)` pair with `version <= ceiling`.
    pub fn versions_upto(&self, ceiling: PageVersion) -> Vec<(PageGroup, PageGroupVersion)> {
        self.entries
            .iter()
            .flat_map(|(group, versions)| {
                versions
                    .range(..=ceiling)
                    .map(move |(version, _)| (*group, *version))
            })
            .collect()
    }

    /// Returns the pages recorded for a generation, ascending.
    pub fn pages(&self, group: PageGroup, version: PageGroupVersion) -> Vec<PageNumber> {
        self.entries
            .get(&group)
            .and_then(|versions| versions.get(&version))
            .map(|pages| pages.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the number of generations across all groups.
    pub fn version_count(&self) -> usize {
        self.entries.values().map(|versions| versions.len()).sum()
    }
}
