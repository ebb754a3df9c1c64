//! Segment tree: a flat, growable sequence of blocks
//!
//! Each segment is one leaf page holding a [`Block`]. Segments are ordered
//! by key and linked through the page header `next` pointer; the first
//! segment's page is the meta root. A directory of `(page, count, size,
//! min, max)` records is kept in memory so a lookup only loads the blocks
//! it touches.
//!
//! # Directory file
//!
//! The directory is persisted next to the page file on flush, written with
//! write-fsync-rename:
//!
//! ```text
//! +------------------+
//! | Magic: "TPSD"    | 4 bytes
//! | Version          | 4 bytes (u32 LE)
//! | Key Type         | 1 byte
//! | Entry Count      | 8 bytes (u64 LE)
//! | Segments         | 4 bytes (u32 LE)
//! | Segment records  | page u64, count u32, size u32, min key, max key
//! | CRC32            | 4 bytes
//! +------------------+
//! ```
//!
//! A missing, corrupt or stale directory is rebuilt on open by following the
//! page chain.
//!
//! # Structure changes
//!
//! A block that grows past the page payload is split at its byte midpoint
//! into a new segment. After a removal a segment is merged with a neighbour
//! when both fit in [`MERGE_CHECK`] of a payload, and an empty segment is
//! released. Resident blocks beyond the cache capacity are unloaded, least
//! recently used first.

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info, warn};

use crate::block::{Block, Entry};
use crate::config::StorageKind;
use crate::error::{Result, StorageError};
use crate::file::PageFile;
use crate::index::{above_lower, below_upper, IndexStorage, ScanDirection};
use crate::key::{IndexKey, KeyType};
use crate::page::PageId;

/// Neighbouring segments merge when their combined size is at most this
/// fraction of a page payload
pub const MERGE_CHECK: f64 = 0.8;

/// Directory file magic bytes: "TPSD"
pub const DIRECTORY_MAGIC: [u8; 4] = *b"TPSD";

/// Current directory format version
pub const DIRECTORY_VERSION: u32 = 1;

#[derive(Debug)]
struct Segment {
    page: PageId,
    min: IndexKey,
    max: IndexKey,
    count: usize,
    size: usize,
    block: Option<Block>,
    dirty: bool,
    last_used: u64,
}

impl Segment {
    fn from_block(page: PageId, block: Block, now: u64) -> Result<Self> {
        let (min, max) = match (block.min_key(), block.max_key()) {
            (Some(min), Some(max)) => (min.clone(), max.clone()),
            _ => {
                return Err(StorageError::Corruption(format!(
                    "segment page {} is empty",
                    page
                )))
            }
        };
        Ok(Segment {
            page,
            min,
            max,
            count: block.count(),
            size: block.occupied_memory(),
            block: Some(block),
            dirty: true,
            last_used: now,
        })
    }

    fn block(&self) -> Result<&Block> {
        self.block.as_ref().ok_or_else(|| {
            StorageError::Corruption(format!("segment page {} is not loaded", self.page))
        })
    }

    fn block_mut(&mut self) -> Result<&mut Block> {
        let page = self.page;
        self.block
            .as_mut()
            .ok_or_else(|| StorageError::Corruption(format!("segment page {} is not loaded", page)))
    }

    /// Mark dirty and update the summary from the resident block
    fn touch(&mut self) -> Result<()> {
        let block = self.block()?;
        let count = block.count();
        let size = block.occupied_memory();
        let bounds = block.min_key().cloned().zip(block.max_key().cloned());
        self.count = count;
        self.size = size;
        if let Some((min, max)) = bounds {
            self.min = min;
            self.max = max;
        }
        self.dirty = true;
        Ok(())
    }
}

/// Shape of a segment tree as found by [`SegmentTree::check_invariants`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Segments in the sequence
    pub segments: usize,
    /// Entries in all segments
    pub entries: u64,
    /// Distinct keys
    pub unique_keys: u64,
}

/// Flat segment index over a page file
#[derive(Debug)]
pub struct SegmentTree {
    file: PageFile,
    directory: PathBuf,
    segments: Vec<Segment>,
    capacity: usize,
    clock: u64,
    count: u64,
    unique: u64,
}

impl SegmentTree {
    /// Create an empty segment tree, replacing any file at `path`
    pub fn create(
        path: impl AsRef<Path>,
        key_type: KeyType,
        page_size: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        let file = PageFile::create(path, page_size, key_type, StorageKind::SegmentTree)?;
        let directory = file.path().with_extension("dir");
        let mut tree = SegmentTree {
            file,
            directory,
            segments: Vec::new(),
            capacity: cache_capacity.max(1),
            clock: 0,
            count: 0,
            unique: 0,
        };
        tree.flush()?;
        info!(path = %tree.file.path().display(), %key_type, page_size, "created segment tree");
        Ok(tree)
    }

    /// Open an existing segment tree
    pub fn open(path: impl AsRef<Path>, cache_capacity: usize) -> Result<Self> {
        let mut file = PageFile::open(path)?;
        let meta = file.meta().clone();
        if meta.kind != StorageKind::SegmentTree {
            return Err(StorageError::InvalidConfig(format!(
                "{} holds a {:?}, not a segment tree",
                file.path().display(),
                meta.kind
            )));
        }
        let directory = file.path().with_extension("dir");
        let segments = match read_directory(&directory, meta.key_type) {
            Ok((count, segments))
                if count == meta.count
                    && segments.first().map_or(0, |s| s.page) == meta.root =>
            {
                segments
            }
            Ok(_) => {
                warn!(path = %directory.display(), "segment directory is stale, rebuilding");
                rebuild_directory(&mut file)?
            }
            Err(e) => {
                warn!(
                    path = %directory.display(),
                    error = %e,
                    "segment directory unreadable, rebuilding"
                );
                rebuild_directory(&mut file)?
            }
        };
        info!(
            path = %file.path().display(),
            entries = meta.count,
            segments = segments.len(),
            "opened segment tree"
        );
        Ok(SegmentTree {
            file,
            directory,
            segments,
            capacity: cache_capacity.max(1),
            clock: 0,
            count: meta.count,
            unique: meta.unique,
        })
    }

    /// Declared key type
    pub fn key_type(&self) -> KeyType {
        self.file.key_type()
    }

    /// Number of entries
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Number of distinct keys
    pub fn unique_indices_count(&self) -> u64 {
        self.unique
    }

    /// Number of segments
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segments whose block is in memory
    pub fn resident_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.block.is_some()).count()
    }

    /// Path of the directory file
    pub fn directory_path(&self) -> &Path {
        &self.directory
    }

    /// Largest accepted entry
    pub fn max_entry_size(&self) -> usize {
        self.file.payload_size() / 8
    }

    fn merge_limit(&self) -> usize {
        (self.file.payload_size() as f64 * MERGE_CHECK) as usize
    }

    // =========================================================================
    // Block cache
    // =========================================================================

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn load(&mut self, i: usize) -> Result<&mut Segment> {
        let now = self.tick();
        let key_type = self.file.key_type();
        let segment = self
            .segments
            .get_mut(i)
            .ok_or_else(|| StorageError::Corruption(format!("no segment {}", i)))?;
        if segment.block.is_none() {
            let page = self.file.read_page(segment.page)?;
            let (block, _) = Block::from_page(&page, key_type)?;
            if block.count() != segment.count {
                return Err(StorageError::Corruption(format!(
                    "segment page {} holds {} entries, directory says {}",
                    segment.page,
                    block.count(),
                    segment.count
                )));
            }
            segment.block = Some(block);
        }
        segment.last_used = now;
        Ok(segment)
    }

    fn write_back(&mut self, i: usize) -> Result<()> {
        let next = self.segments.get(i + 1).map_or(0, |s| s.page);
        let key_type = self.file.key_type();
        let (page_id, page) = match self.segments.get(i) {
            Some(segment) => (segment.page, segment.block()?.to_page(key_type, next)?),
            None => return Ok(()),
        };
        self.file.write_page(page_id, &page)
    }

    fn evict(&mut self) -> Result<()> {
        while self.resident_segments() > self.capacity {
            let victim = self
                .segments
                .iter()
                .enumerate()
                .filter(|(_, s)| s.block.is_some())
                .min_by_key(|(_, s)| s.last_used)
                .map(|(i, _)| i);
            let i = match victim {
                Some(i) => i,
                None => break,
            };
            let dirty = self.segments[i].dirty;
            if dirty {
                self.write_back(i)?;
            }
            let segment = &mut self.segments[i];
            segment.block = None;
            segment.dirty = false;
            debug!(page = segment.page, dirty, "unloaded segment");
        }
        Ok(())
    }

    /// Write dirty segments, the meta page and the directory, then sync
    pub fn flush(&mut self) -> Result<()> {
        let mut written = 0;
        for i in 0..self.segments.len() {
            if self.segments[i].dirty {
                self.write_back(i)?;
                self.segments[i].dirty = false;
                written += 1;
            }
        }
        let root = self.segments.first().map_or(0, |s| s.page);
        let meta = self.file.meta_mut();
        meta.root = root;
        meta.height = 0;
        meta.count = self.count;
        meta.unique = self.unique;
        self.file.sync()?;
        self.write_directory()?;
        debug!(pages = written, segments = self.segments.len(), "flushed segment tree");
        self.evict()
    }

    fn write_directory(&self) -> Result<()> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&DIRECTORY_MAGIC);
        bytes.write_u32::<LittleEndian>(DIRECTORY_VERSION)?;
        bytes.write_u8(self.file.key_type().to_u8())?;
        bytes.write_u64::<LittleEndian>(self.count)?;
        bytes.write_u32::<LittleEndian>(self.segments.len() as u32)?;
        for segment in &self.segments {
            bytes.write_u64::<LittleEndian>(segment.page)?;
            bytes.write_u32::<LittleEndian>(segment.count as u32)?;
            bytes.write_u32::<LittleEndian>(segment.size as u32)?;
            segment.min.write_to(&mut bytes)?;
            segment.max.write_to(&mut bytes)?;
        }
        let crc = crc32fast::hash(&bytes);
        bytes.write_u32::<LittleEndian>(crc)?;

        let temp_path = self.directory.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &self.directory)?;

        if let Some(parent) = self.directory.parent() {
            if parent.exists() {
                let dir = File::open(parent)?;
                dir.sync_all()?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Visit entries within bounds in key order until `visit` returns false
    fn walk<F>(
        &mut self,
        lower: Bound<&IndexKey>,
        upper: Bound<&IndexKey>,
        direction: ScanDirection,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&Entry) -> bool,
    {
        match direction {
            ScanDirection::Ascending => {
                let start = match lower {
                    Bound::Included(k) => self.segments.partition_point(|s| s.max < *k),
                    Bound::Excluded(k) => self.segments.partition_point(|s| s.max <= *k),
                    Bound::Unbounded => 0,
                };
                for i in start..self.segments.len() {
                    let block = self.load(i)?.block()?;
                    let from = match lower {
                        Bound::Included(k) => block.lower_index(k),
                        Bound::Excluded(k) => block.upper_index(k),
                        Bound::Unbounded => 0,
                    };
                    for entry in &block.entries()[from..] {
                        if !below_upper(&entry.key, upper) || !visit(entry) {
                            return Ok(());
                        }
                    }
                }
            }
            ScanDirection::Descending => {
                let end = match upper {
                    Bound::Included(k) => self.segments.partition_point(|s| s.min <= *k),
                    Bound::Excluded(k) => self.segments.partition_point(|s| s.min < *k),
                    Bound::Unbounded => self.segments.len(),
                };
                for i in (0..end).rev() {
                    let block = self.load(i)?.block()?;
                    let to = match upper {
                        Bound::Included(k) => block.upper_index(k),
                        Bound::Excluded(k) => block.lower_index(k),
                        Bound::Unbounded => block.count(),
                    };
                    for entry in block.entries()[..to].iter().rev() {
                        if !above_lower(&entry.key, lower) || !visit(entry) {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Segment and position of the entry matching key and item
    fn locate(&mut self, key: &IndexKey, item: &[u8]) -> Result<Option<(usize, usize)>> {
        let start = self.segments.partition_point(|s| s.max < *key);
        for i in start..self.segments.len() {
            if self.segments[i].min > *key {
                break;
            }
            let block = self.load(i)?.block()?;
            let from = block.lower_index(key);
            for (offset, entry) in block.entries()[from..].iter().enumerate() {
                if entry.key != *key {
                    return Ok(None);
                }
                if entry.item == item {
                    return Ok(Some((i, from + offset)));
                }
            }
        }
        Ok(None)
    }

    /// (some entry has `key`, an entry matches `key` and `item`)
    fn probe(&mut self, key: &IndexKey, item: &[u8]) -> Result<(bool, bool)> {
        let mut any = false;
        let mut exact = false;
        self.walk(
            Bound::Included(key),
            Bound::Included(key),
            ScanDirection::Ascending,
            |entry| {
                any = true;
                exact = entry.item == item;
                !exact
            },
        )?;
        Ok((any, exact))
    }

    fn key_present(&mut self, key: &IndexKey) -> Result<bool> {
        let mut found = false;
        self.walk(
            Bound::Included(key),
            Bound::Included(key),
            ScanDirection::Ascending,
            |_| {
                found = true;
                false
            },
        )?;
        Ok(found)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// True if some entry has `key`
    pub fn contains_index(&mut self, key: &IndexKey) -> Result<bool> {
        let found = self.key_present(key)?;
        self.evict()?;
        Ok(found)
    }

    /// True if an entry matches both key and item
    pub fn contains(&mut self, key: &IndexKey, item: &[u8]) -> Result<bool> {
        let (_, exact) = self.probe(key, item)?;
        self.evict()?;
        Ok(exact)
    }

    /// Entries within bounds, in key order for `direction`
    pub fn scan(
        &mut self,
        lower: Bound<&IndexKey>,
        upper: Bound<&IndexKey>,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        if limit > 0 {
            self.walk(lower, upper, direction, |entry| {
                out.push(entry.clone());
                out.len() < limit
            })?;
        }
        self.evict()?;
        Ok(out)
    }

    /// Items stored under `key`, in insertion order
    pub fn find(&mut self, key: &IndexKey) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .scan(
                Bound::Included(key),
                Bound::Included(key),
                ScanDirection::Ascending,
                None,
            )?
            .into_iter()
            .map(|entry| entry.item)
            .collect())
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Insert an entry; returns false if the exact entry already exists
    pub fn insert(&mut self, key: IndexKey, item: &[u8]) -> Result<bool> {
        key.check_type(self.key_type())?;
        let size = Entry::size_of(&key, item);
        let max = self.max_entry_size();
        if size > max {
            return Err(StorageError::EntryTooLarge { size, max });
        }
        let (key_exists, exact) = self.probe(&key, item)?;
        if exact {
            self.evict()?;
            return Ok(false);
        }

        if self.segments.is_empty() {
            let page = self.file.allocate()?;
            let mut block = Block::new(self.file.page_size());
            block.push_sorted(Entry::new(key, item));
            let now = self.tick();
            self.segments.push(Segment::from_block(page, block, now)?);
            debug!(page, "started first segment");
        } else {
            let i = self
                .segments
                .partition_point(|s| s.min <= key)
                .saturating_sub(1);
            let payload = self.file.payload_size();
            let segment = self.load(i)?;
            segment.block_mut()?.push_sorted(Entry::new(key, item));
            segment.touch()?;
            if segment.size > payload {
                self.split_segment(i)?;
            }
        }
        self.count += 1;
        if !key_exists {
            self.unique += 1;
        }
        self.evict()?;
        Ok(true)
    }

    fn split_segment(&mut self, i: usize) -> Result<()> {
        let segment = self.load(i)?;
        let right = segment.block_mut()?.split_half();
        segment.touch()?;
        let left_page = segment.page;
        let page = self.file.allocate()?;
        let now = self.tick();
        let right = Segment::from_block(page, right, now)?;
        debug!(
            left = left_page,
            right = page,
            left_entries = self.segments[i].count,
            right_entries = right.count,
            "split segment"
        );
        self.segments.insert(i + 1, right);
        Ok(())
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Remove the first entry matching key and item
    pub fn remove(&mut self, key: &IndexKey, item: &[u8]) -> Result<bool> {
        key.check_type(self.key_type())?;
        let (i, pos) = match self.locate(key, item)? {
            Some(found) => found,
            None => {
                self.evict()?;
                return Ok(false);
            }
        };
        let segment = self.load(i)?;
        segment.block_mut()?.remove_at(pos);
        segment.touch()?;
        self.count -= 1;
        self.settle(i)?;
        if !self.key_present(key)? {
            self.unique -= 1;
        }
        self.evict()?;
        Ok(true)
    }

    /// Remove every entry with `key`; returns how many were removed
    pub fn remove_index(&mut self, key: &IndexKey) -> Result<usize> {
        key.check_type(self.key_type())?;
        let mut removed = 0;
        loop {
            let i = self.segments.partition_point(|s| s.max < *key);
            if i >= self.segments.len() || self.segments[i].min > *key {
                break;
            }
            let segment = self.load(i)?;
            let n = segment.block_mut()?.remove_index(key);
            if n == 0 {
                break;
            }
            segment.touch()?;
            removed += n;
            self.settle(i)?;
        }
        if removed > 0 {
            self.count -= removed as u64;
            self.unique -= 1;
        }
        self.evict()?;
        Ok(removed)
    }

    /// Release segment `i` if empty, or merge it with a small neighbour
    fn settle(&mut self, i: usize) -> Result<()> {
        if self.segments[i].count == 0 {
            let segment = self.segments.remove(i);
            self.file.free(segment.page)?;
            debug!(page = segment.page, "released empty segment");
            if i > 0 {
                self.load(i - 1)?.dirty = true;
            }
            return Ok(());
        }
        let limit = self.merge_limit();
        let size = self.segments[i].size;
        if self
            .segments
            .get(i + 1)
            .map_or(false, |next| size + next.size <= limit)
        {
            self.merge_segments(i)
        } else if i > 0 && self.segments[i - 1].size + size <= limit {
            self.merge_segments(i - 1)
        } else {
            Ok(())
        }
    }

    /// Move segment `i + 1` into segment `i`
    fn merge_segments(&mut self, i: usize) -> Result<()> {
        self.load(i + 1)?;
        let absorbed = self.segments.remove(i + 1);
        let block = absorbed.block.ok_or_else(|| {
            StorageError::Corruption(format!("segment page {} is not loaded", absorbed.page))
        })?;
        let segment = self.load(i)?;
        segment.block_mut()?.merge(block);
        segment.touch()?;
        let page = segment.page;
        self.file.free(absorbed.page)?;
        debug!(left = page, right = absorbed.page, "merged segments");
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Check ordering, sizes and totals across every segment
    pub fn check_invariants(&mut self) -> Result<SegmentStats> {
        let payload = self.file.payload_size();
        let mut stats = SegmentStats {
            segments: self.segments.len(),
            ..SegmentStats::default()
        };
        let mut last: Option<IndexKey> = None;
        for i in 0..self.segments.len() {
            let segment = self.load(i)?;
            let page = segment.page;
            let (min, max, count, size) = (
                segment.min.clone(),
                segment.max.clone(),
                segment.count,
                segment.size,
            );
            let block = segment.block()?;
            let corrupt = |msg: String| {
                Err(StorageError::Corruption(format!("segment page {}: {}", page, msg)))
            };
            if block.is_empty() {
                return corrupt("empty segment".to_string());
            }
            if block.count() != count || block.occupied_memory() != size {
                return corrupt("summary does not match the block".to_string());
            }
            if size > payload {
                return corrupt(format!("{} bytes overflow the page", size));
            }
            if block.min_key() != Some(&min) || block.max_key() != Some(&max) {
                return corrupt("key bounds do not match the block".to_string());
            }
            for entry in block.entries() {
                match last.as_ref() {
                    Some(prev) if *prev > entry.key => {
                        return corrupt(format!("key {} after {}", entry.key, prev));
                    }
                    Some(prev) if *prev == entry.key => {}
                    _ => stats.unique_keys += 1,
                }
                last = Some(entry.key.clone());
            }
            stats.entries += count as u64;
        }
        if stats.entries != self.count {
            return Err(StorageError::Corruption(format!(
                "segments hold {} entries, count says {}",
                stats.entries, self.count
            )));
        }
        if stats.unique_keys != self.unique {
            return Err(StorageError::Corruption(format!(
                "segments hold {} distinct keys, counter says {}",
                stats.unique_keys, self.unique
            )));
        }
        self.evict()?;
        Ok(stats)
    }
}

/// Read the directory file; returns the recorded entry count and segments
fn read_directory(path: &Path, key_type: KeyType) -> Result<(u64, Vec<Segment>)> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 4 + 4 + 1 + 8 + 4 + 4 {
        return Err(StorageError::Corruption("directory too short".to_string()));
    }
    if bytes[0..4] != DIRECTORY_MAGIC {
        return Err(StorageError::Corruption("invalid directory magic".to_string()));
    }
    let (data, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = Cursor::new(crc_bytes).read_u32::<LittleEndian>()?;
    let computed = crc32fast::hash(data);
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "directory checksum mismatch: expected {:08x}, computed {:08x}",
            stored, computed
        )));
    }

    let mut cursor = Cursor::new(&data[4..]);
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != DIRECTORY_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported directory version {}",
            version
        )));
    }
    let tag = cursor.read_u8()?;
    if tag != key_type.to_u8() {
        return Err(StorageError::Corruption(format!(
            "directory key type {} does not match index key type {}",
            tag, key_type
        )));
    }
    let count = cursor.read_u64::<LittleEndian>()?;
    let n = cursor.read_u32::<LittleEndian>()? as usize;
    let mut segments = Vec::with_capacity(n.min(1 << 16));
    for _ in 0..n {
        let page = cursor.read_u64::<LittleEndian>()?;
        let entries = cursor.read_u32::<LittleEndian>()? as usize;
        let size = cursor.read_u32::<LittleEndian>()? as usize;
        let min = IndexKey::read_from(&mut cursor, key_type)?;
        let max = IndexKey::read_from(&mut cursor, key_type)?;
        segments.push(Segment {
            page,
            min,
            max,
            count: entries,
            size,
            block: None,
            dirty: false,
            last_used: 0,
        });
    }
    Ok((count, segments))
}

/// Rebuild the directory by following the page chain from the meta root
fn rebuild_directory(file: &mut PageFile) -> Result<Vec<Segment>> {
    let key_type = file.key_type();
    let page_count = file.meta().page_count;
    let mut segments = Vec::new();
    let mut entries = 0u64;
    let mut next = file.meta().root;
    while next != 0 {
        if segments.len() as u64 >= page_count {
            return Err(StorageError::Corruption("segment chain cycle".to_string()));
        }
        let page = file.read_page(next)?;
        let (block, following) = Block::from_page(&page, key_type)?;
        entries += block.count() as u64;
        let mut segment = Segment::from_block(next, block, 0)?;
        segment.block = None;
        segment.dirty = false;
        segments.push(segment);
        next = following;
    }
    if entries != file.meta().count {
        return Err(StorageError::Corruption(format!(
            "segment chain holds {} entries, meta says {}",
            entries,
            file.meta().count
        )));
    }
    Ok(segments)
}

impl Drop for SegmentTree {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to flush segment tree on drop");
        }
    }
}

impl IndexStorage for SegmentTree {
    fn key_type(&self) -> KeyType {
        SegmentTree::key_type(self)
    }

    fn insert(&mut self, key: IndexKey, item: &[u8]) -> Result<bool> {
        SegmentTree::insert(self, key, item)
    }

    fn remove(&mut self, key: &IndexKey, item: &[u8]) -> Result<bool> {
        SegmentTree::remove(self, key, item)
    }

    fn remove_index(&mut self, key: &IndexKey) -> Result<usize> {
        SegmentTree::remove_index(self, key)
    }

    fn contains_index(&mut self, key: &IndexKey) -> Result<bool> {
        SegmentTree::contains_index(self, key)
    }

    fn contains(&mut self, key: &IndexKey, item: &[u8]) -> Result<bool> {
        SegmentTree::contains(self, key, item)
    }

    fn scan(
        &mut self,
        lower: Bound<&IndexKey>,
        upper: Bound<&IndexKey>,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        SegmentTree::scan(self, lower, upper, direction, limit)
    }

    fn count(&self) -> u64 {
        SegmentTree::count(self)
    }

    fn unique_indices_count(&self) -> u64 {
        SegmentTree::unique_indices_count(self)
    }

    fn flush(&mut self) -> Result<()> {
        SegmentTree::flush(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(n: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; 12];
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        bytes
    }

    fn small_tree(dir: &TempDir, capacity: usize) -> SegmentTree {
        SegmentTree::create(dir.path().join("segments"), KeyType::Int32, 512, capacity).unwrap()
    }

    fn all_keys(tree: &mut SegmentTree) -> Vec<i32> {
        tree.scan(
            Bound::Unbounded,
            Bound::Unbounded,
            ScanDirection::Ascending,
            None,
        )
        .unwrap()
        .into_iter()
        .map(|e| match e.key {
            IndexKey::Int32(v) => v,
            other => panic!("unexpected key {:?}", other),
        })
        .collect()
    }

    #[test]
    fn test_empty_tree() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 4);
        assert_eq!(tree.count(), 0);
        assert_eq!(tree.segment_count(), 0);
        assert!(tree.find(&IndexKey::Int32(1)).unwrap().is_empty());
        assert!(!tree.remove(&IndexKey::Int32(1), &id(1)).unwrap());
        assert!(tree.directory_path().exists());
        assert_eq!(tree.check_invariants().unwrap(), SegmentStats::default());
    }

    #[test]
    fn test_insert_and_find() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 4);
        assert!(tree.insert(IndexKey::Int32(5), &id(1)).unwrap());
        assert!(tree.insert(IndexKey::Int32(3), &id(2)).unwrap());
        assert!(!tree.insert(IndexKey::Int32(5), &id(1)).unwrap());
        assert_eq!(tree.count(), 2);
        assert_eq!(tree.unique_indices_count(), 2);
        assert_eq!(tree.find(&IndexKey::Int32(5)).unwrap(), vec![id(1)]);
        assert!(tree.contains(&IndexKey::Int32(3), &id(2)).unwrap());
        assert!(!tree.contains(&IndexKey::Int32(3), &id(1)).unwrap());
        assert!(tree.contains_index(&IndexKey::Int32(3)).unwrap());
    }

    #[test]
    fn test_segments_split_and_merge() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 4);
        for v in 0..1000 {
            tree.insert(IndexKey::Int32((v * 7919) % 1000), &id(v as u32))
                .unwrap();
        }
        let stats = tree.check_invariants().unwrap();
        assert!(stats.segments > 10, "segments {}", stats.segments);
        assert_eq!(stats.entries, 1000);
        assert_eq!(all_keys(&mut tree), (0..1000).collect::<Vec<_>>());

        let grown = tree.segment_count();
        for v in 0..900 {
            assert!(tree
                .remove(&IndexKey::Int32((v * 7919) % 1000), &id(v as u32))
                .unwrap());
        }
        tree.check_invariants().unwrap();
        assert!(tree.segment_count() < grown);
        assert_eq!(tree.count(), 100);

        for v in 900..1000 {
            tree.remove(&IndexKey::Int32((v * 7919) % 1000), &id(v as u32))
                .unwrap();
        }
        assert_eq!(tree.segment_count(), 0);
        assert_eq!(tree.unique_indices_count(), 0);
    }

    #[test]
    fn test_duplicates_span_segments() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 2);
        for v in 0..60u32 {
            tree.insert(IndexKey::Int32(1), &id(v)).unwrap();
            tree.insert(IndexKey::Int32(0), &id(v)).unwrap();
        }
        let stats = tree.check_invariants().unwrap();
        assert!(stats.segments > 2);
        assert_eq!(stats.unique_keys, 2);
        assert_eq!(
            tree.find(&IndexKey::Int32(1)).unwrap(),
            (0..60).map(id).collect::<Vec<_>>()
        );
        assert_eq!(tree.remove_index(&IndexKey::Int32(1)).unwrap(), 60);
        assert_eq!(tree.count(), 60);
        assert_eq!(tree.unique_indices_count(), 1);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_descending_scan() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 4);
        for v in 0..200 {
            tree.insert(IndexKey::Int32(v), &id(v as u32)).unwrap();
        }
        let hi = IndexKey::Int32(150);
        let lo = IndexKey::Int32(140);
        let keys: Vec<IndexKey> = tree
            .scan(
                Bound::Excluded(&lo),
                Bound::Included(&hi),
                ScanDirection::Descending,
                Some(5),
            )
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, (146..=150).rev().map(IndexKey::Int32).collect::<Vec<_>>());
    }

    #[test]
    fn test_resident_blocks_bounded() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 2);
        for v in 0..600 {
            tree.insert(IndexKey::Int32(v), &id(v as u32)).unwrap();
            assert!(tree.resident_segments() <= 2);
        }
        assert_eq!(all_keys(&mut tree).len(), 600);
        assert!(tree.resident_segments() <= 2);
    }

    #[test]
    fn test_reopen_uses_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segments");
        {
            let mut tree = SegmentTree::create(&path, KeyType::String, 512, 2).unwrap();
            for v in 0..300u32 {
                tree.insert(IndexKey::String(format!("k{:04}", v)), &id(v))
                    .unwrap();
            }
        }
        let mut tree = SegmentTree::open(&path, 2).unwrap();
        assert_eq!(tree.count(), 300);
        assert_eq!(tree.resident_segments(), 0);
        assert_eq!(tree.find(&IndexKey::from("k0123")).unwrap(), vec![id(123)]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_reopen_rebuilds_lost_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segments");
        let directory = {
            let mut tree = SegmentTree::create(&path, KeyType::Int32, 512, 2).unwrap();
            for v in 0..300 {
                tree.insert(IndexKey::Int32(v), &id(v as u32)).unwrap();
            }
            tree.directory_path().to_path_buf()
        };

        std::fs::remove_file(&directory).unwrap();
        let mut tree = SegmentTree::open(&path, 2).unwrap();
        assert_eq!(all_keys(&mut tree), (0..300).collect::<Vec<_>>());
        tree.check_invariants().unwrap();
        drop(tree);

        let mut bytes = std::fs::read(&directory).unwrap();
        bytes[10] ^= 0xFF;
        std::fs::write(&directory, &bytes).unwrap();
        let mut tree = SegmentTree::open(&path, 2).unwrap();
        assert_eq!(tree.count(), 300);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_freed_pages_reused() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 4);
        for v in 0..400 {
            tree.insert(IndexKey::Int32(v), &id(v as u32)).unwrap();
        }
        for v in 0..400 {
            tree.remove(&IndexKey::Int32(v), &id(v as u32)).unwrap();
        }
        tree.flush().unwrap();
        let pages = tree.file.meta().page_count;
        for v in 0..400 {
            tree.insert(IndexKey::Int32(v), &id(v as u32)).unwrap();
        }
        tree.flush().unwrap();
        assert_eq!(tree.file.meta().page_count, pages);
    }

    #[test]
    fn test_open_rejects_btree_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages");
        PageFile::create(&path, 512, KeyType::Int32, StorageKind::BTree).unwrap();
        assert!(matches!(
            SegmentTree::open(&path, 4),
            Err(StorageError::InvalidConfig(_))
        ));
    }
}
