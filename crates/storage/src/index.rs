//! Disk index over one document field
//!
//! [`IndexDisk`] is the public indexing API. It owns an index directory:
//!
//! ```text
//! <dir>/
//!   index.toml    # IndexConfig
//!   index.pages   # page file (b+tree or segment tree)
//!   index.dir     # segment directory (segment tree only)
//! ```
//!
//! Entries map an [`IndexKey`] to a 12-byte [`ObjectId`]. Comparison
//! operators resolve to one or two [`KeyRange`]s; `Ne` is the union of the
//! ranges below and above the value.

use std::fmt;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use tapedb_core::{Document, ObjectId};
use tracing::{debug, info};

use crate::block::Entry;
use crate::btree::BTree;
use crate::config::{FlushMode, IndexConfig, StorageKind, CONFIG_FILE_NAME};
use crate::error::{Result, StorageError};
use crate::key::{IndexKey, KeyExtractor, KeyType};
use crate::segment_tree::SegmentTree;

/// Page file name inside an index directory
pub const PAGES_FILE_NAME: &str = "index.pages";

/// Order in which a scan yields entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    /// Smallest key first
    #[default]
    Ascending,
    /// Largest key first
    Descending,
}

/// True if `key` satisfies the lower bound
pub(crate) fn above_lower(key: &IndexKey, lower: Bound<&IndexKey>) -> bool {
    match lower {
        Bound::Included(lo) => key >= lo,
        Bound::Excluded(lo) => key > lo,
        Bound::Unbounded => true,
    }
}

/// True if `key` satisfies the upper bound
pub(crate) fn below_upper(key: &IndexKey, upper: Bound<&IndexKey>) -> bool {
    match upper {
        Bound::Included(hi) => key <= hi,
        Bound::Excluded(hi) => key < hi,
        Bound::Unbounded => true,
    }
}

/// Persistent ordered multimap from keys to item bytes
///
/// Implemented by [`BTree`] and [`SegmentTree`]. Entries sharing a key keep
/// insertion order; an exact `(key, item)` pair is stored at most once.
pub trait IndexStorage: Send + fmt::Debug {
    /// Declared key type
    fn key_type(&self) -> KeyType;

    /// Insert an entry; returns false if it already exists
    fn insert(&mut self, key: IndexKey, item: &[u8]) -> Result<bool>;

    /// Remove the entry matching key and item; returns false if absent
    fn remove(&mut self, key: &IndexKey, item: &[u8]) -> Result<bool>;

    /// Remove every entry with `key`; returns how many were removed
    fn remove_index(&mut self, key: &IndexKey) -> Result<usize>;

    /// True if some entry has `key`
    fn contains_index(&mut self, key: &IndexKey) -> Result<bool>;

    /// True if an entry matches key and item
    fn contains(&mut self, key: &IndexKey, item: &[u8]) -> Result<bool>;

    /// Entries within bounds in `direction` order, at most `limit`
    fn scan(
        &mut self,
        lower: Bound<&IndexKey>,
        upper: Bound<&IndexKey>,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>>;

    /// Number of entries
    fn count(&self) -> u64;

    /// Number of distinct keys
    fn unique_indices_count(&self) -> u64;

    /// Write modified state to disk and sync
    fn flush(&mut self) -> Result<()>;
}

/// Comparison operator of a query predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=`
    Gte,
    /// `<=`
    Lte,
}

/// Key interval produced by a comparison
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    /// Lower bound
    pub lower: Bound<IndexKey>,
    /// Upper bound
    pub upper: Bound<IndexKey>,
}

impl KeyRange {
    /// Range of all keys
    pub fn all() -> Self {
        KeyRange {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// True if `key` lies in the range
    pub fn contains(&self, key: &IndexKey) -> bool {
        above_lower(key, self.lower.as_ref()) && below_upper(key, self.upper.as_ref())
    }

    /// Ranges matching `key op value`, in ascending key order
    pub fn for_op(op: CompareOp, value: IndexKey) -> Vec<KeyRange> {
        let range = |lower, upper| KeyRange { lower, upper };
        match op {
            CompareOp::Eq => vec![range(Bound::Included(value.clone()), Bound::Included(value))],
            CompareOp::Ne => vec![
                range(Bound::Unbounded, Bound::Excluded(value.clone())),
                range(Bound::Excluded(value), Bound::Unbounded),
            ],
            CompareOp::Gt => vec![range(Bound::Excluded(value), Bound::Unbounded)],
            CompareOp::Gte => vec![range(Bound::Included(value), Bound::Unbounded)],
            CompareOp::Lt => vec![range(Bound::Unbounded, Bound::Excluded(value))],
            CompareOp::Lte => vec![range(Bound::Unbounded, Bound::Included(value))],
        }
    }
}

fn item_to_id(item: &[u8]) -> Result<ObjectId> {
    let bytes: [u8; ObjectId::SIZE] = item.try_into().map_err(|_| {
        StorageError::Corruption(format!(
            "index item of {} bytes is not an object id",
            item.len()
        ))
    })?;
    Ok(ObjectId::from_bytes(bytes))
}

fn entries_to_ids(entries: Vec<Entry>) -> Result<Vec<ObjectId>> {
    entries.iter().map(|entry| item_to_id(&entry.item)).collect()
}

/// Index of one document field stored in a directory
#[derive(Debug)]
pub struct IndexDisk {
    dir: PathBuf,
    config: IndexConfig,
    extractor: KeyExtractor,
    storage: Box<dyn IndexStorage>,
}

impl IndexDisk {
    /// Open the index in `dir`, creating it if needed
    ///
    /// A new index writes `config` to `index.toml`. An existing index keeps
    /// its stored config; asking for a different key type is an error.
    pub fn open(dir: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let config_path = dir.join(CONFIG_FILE_NAME);
        let config = if config_path.exists() {
            let stored = IndexConfig::from_file(&config_path)?;
            if stored.key_type != config.key_type {
                return Err(StorageError::InvalidConfig(format!(
                    "index at {} has key type {}, requested {}",
                    dir.display(),
                    stored.key_type,
                    config.key_type
                )));
            }
            stored
        } else {
            config.write_to_file(&config_path)?;
            config
        };

        let pages = dir.join(PAGES_FILE_NAME);
        let exists = pages.exists();
        let storage: Box<dyn IndexStorage> = match (config.storage, exists) {
            (StorageKind::BTree, false) => Box::new(BTree::create(
                &pages,
                config.key_type,
                config.page_size,
                config.cache_capacity,
            )?),
            (StorageKind::BTree, true) => Box::new(BTree::open(&pages, config.cache_capacity)?),
            (StorageKind::SegmentTree, false) => Box::new(SegmentTree::create(
                &pages,
                config.key_type,
                config.page_size,
                config.cache_capacity,
            )?),
            (StorageKind::SegmentTree, true) => {
                Box::new(SegmentTree::open(&pages, config.cache_capacity)?)
            }
        };
        if storage.key_type() != config.key_type {
            return Err(StorageError::KeyTypeMismatch {
                expected: config.key_type,
                actual: storage.key_type(),
            });
        }

        info!(
            dir = %dir.display(),
            field = %config.field,
            key_type = %config.key_type,
            storage = ?config.storage,
            entries = storage.count(),
            created = !exists,
            "opened index"
        );
        Ok(IndexDisk {
            extractor: KeyExtractor::new(config.field.clone(), config.key_type),
            dir,
            config,
            storage,
        })
    }

    /// Index directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Effective configuration
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Declared key type
    pub fn key_type(&self) -> KeyType {
        self.config.key_type
    }

    /// Key extractor for the indexed field
    pub fn extractor(&self) -> &KeyExtractor {
        &self.extractor
    }

    fn after_write(&mut self) -> Result<()> {
        if self.config.flush == FlushMode::Always {
            self.storage.flush()?;
        }
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Index `id` under `key`; returns false if already indexed
    pub fn insert(&mut self, key: impl Into<IndexKey>, id: ObjectId) -> Result<bool> {
        let inserted = self.storage.insert(key.into(), id.as_bytes())?;
        if inserted {
            self.after_write()?;
        }
        Ok(inserted)
    }

    /// Index a document by its configured field
    ///
    /// Returns false without error when the field is missing or has an
    /// incompatible type.
    pub fn insert_document(&mut self, doc: &Document, id: ObjectId) -> Result<bool> {
        match self.extractor.extract(doc) {
            Some(key) => self.insert(key, id),
            None => Ok(false),
        }
    }

    /// Remove `id` from under `key`; returns false if it was not indexed
    pub fn remove(&mut self, key: impl Into<IndexKey>, id: ObjectId) -> Result<bool> {
        let key = key.into();
        let removed = self.storage.remove(&key, id.as_bytes())?;
        if removed {
            self.after_write()?;
        }
        Ok(removed)
    }

    /// Remove a document indexed by its configured field
    pub fn remove_document(&mut self, doc: &Document, id: ObjectId) -> Result<bool> {
        match self.extractor.extract(doc) {
            Some(key) => self.remove(key, id),
            None => Ok(false),
        }
    }

    /// Remove every id under `key`; returns how many were removed
    pub fn remove_key(&mut self, key: impl Into<IndexKey>) -> Result<usize> {
        let key = key.into();
        let removed = self.storage.remove_index(&key)?;
        if removed > 0 {
            debug!(%key, removed, "removed key");
            self.after_write()?;
        }
        Ok(removed)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// True if some id is indexed under `key`
    pub fn contains_index(&mut self, key: impl Into<IndexKey>) -> Result<bool> {
        self.storage.contains_index(&key.into())
    }

    /// True if `id` is indexed under `key`
    pub fn contains(&mut self, key: impl Into<IndexKey>, id: ObjectId) -> Result<bool> {
        self.storage.contains(&key.into(), id.as_bytes())
    }

    /// Ids under `key` in insertion order; empty when there are none
    pub fn find(&mut self, key: impl Into<IndexKey>) -> Result<Vec<ObjectId>> {
        let key = key.into();
        let entries = self.storage.scan(
            Bound::Included(&key),
            Bound::Included(&key),
            ScanDirection::Ascending,
            None,
        )?;
        entries_to_ids(entries)
    }

    /// Ids with keys strictly below `value`, ascending by key
    pub fn lower_bound(&mut self, value: impl Into<IndexKey>) -> Result<Vec<ObjectId>> {
        self.collect(CompareOp::Lt, value)
    }

    /// Ids with keys strictly above `value`, ascending by key
    pub fn upper_bound(&mut self, value: impl Into<IndexKey>) -> Result<Vec<ObjectId>> {
        self.collect(CompareOp::Gt, value)
    }

    /// Key ranges matching `key op value`
    ///
    /// Fails if `value` does not have the index key type.
    pub fn search(&self, op: CompareOp, value: impl Into<IndexKey>) -> Result<Vec<KeyRange>> {
        let value = value.into();
        value.check_type(self.key_type())?;
        Ok(KeyRange::for_op(op, value))
    }

    /// Ids whose keys satisfy `key op value`, ascending by key
    pub fn collect(&mut self, op: CompareOp, value: impl Into<IndexKey>) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for range in self.search(op, value)? {
            ids.extend(self.scan_range(&range, ScanDirection::Ascending, None)?);
        }
        Ok(ids)
    }

    /// Ids within `range` in `direction` order, at most `limit`
    pub fn scan_range(
        &mut self,
        range: &KeyRange,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<ObjectId>> {
        let entries =
            self.storage
                .scan(range.lower.as_ref(), range.upper.as_ref(), direction, limit)?;
        entries_to_ids(entries)
    }

    /// Number of indexed ids
    pub fn count(&self) -> u64 {
        self.storage.count()
    }

    /// Number of distinct keys
    pub fn unique_keys(&self) -> u64 {
        self.storage.unique_indices_count()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Write all pending changes to disk
    pub fn flush(&mut self) -> Result<()> {
        self.storage.flush()?;
        info!(dir = %self.dir.display(), entries = self.count(), "flushed index");
        Ok(())
    }

    /// Close the index and delete its directory
    pub fn drop_index(self) -> Result<()> {
        let IndexDisk { dir, storage, .. } = self;
        drop(storage);
        std::fs::remove_dir_all(&dir)?;
        info!(dir = %dir.display(), "dropped index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gen_id(n: u32) -> ObjectId {
        ObjectId::from_hex(&format!("{:0>24}", n)).unwrap()
    }

    fn int_config(storage: StorageKind) -> IndexConfig {
        IndexConfig::new("value", KeyType::Int32)
            .with_storage(storage)
            .with_page_size(512)
            .with_cache_capacity(4)
            .with_flush(FlushMode::Manual)
    }

    #[test]
    fn test_bounds_helpers() {
        let k = IndexKey::Int32(5);
        let lo = IndexKey::Int32(5);
        assert!(above_lower(&k, Bound::Included(&lo)));
        assert!(!above_lower(&k, Bound::Excluded(&lo)));
        assert!(above_lower(&k, Bound::Unbounded));
        assert!(below_upper(&k, Bound::Included(&lo)));
        assert!(!below_upper(&k, Bound::Excluded(&lo)));
        assert!(below_upper(&k, Bound::Unbounded));
    }

    #[test]
    fn test_ranges_for_ops() {
        let v = IndexKey::Int32(10);
        assert_eq!(KeyRange::for_op(CompareOp::Eq, v.clone()).len(), 1);
        let ne = KeyRange::for_op(CompareOp::Ne, v.clone());
        assert_eq!(ne.len(), 2);
        assert!(ne[0].contains(&IndexKey::Int32(9)));
        assert!(!ne[0].contains(&v));
        assert!(!ne[1].contains(&v));
        assert!(ne[1].contains(&IndexKey::Int32(11)));

        let gte = &KeyRange::for_op(CompareOp::Gte, v.clone())[0];
        assert!(gte.contains(&v));
        assert!(!gte.contains(&IndexKey::Int32(9)));
        let lt = &KeyRange::for_op(CompareOp::Lt, v.clone())[0];
        assert!(!lt.contains(&v));
        assert!(KeyRange::all().contains(&v));
    }

    #[test]
    fn test_open_writes_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idx");
        let index = IndexDisk::open(&path, int_config(StorageKind::BTree)).unwrap();
        assert!(path.join(CONFIG_FILE_NAME).exists());
        assert!(path.join(PAGES_FILE_NAME).exists());
        assert_eq!(index.key_type(), KeyType::Int32);
        assert_eq!(index.extractor().path(), "value");
        assert_eq!(index.dir(), path.as_path());
    }

    #[test]
    fn test_compare_ops() {
        for storage in [StorageKind::BTree, StorageKind::SegmentTree] {
            let dir = TempDir::new().unwrap();
            let mut index = IndexDisk::open(dir.path(), int_config(storage)).unwrap();
            for v in 1..=20i32 {
                index.insert(v, gen_id(v as u32)).unwrap();
            }
            assert_eq!(index.collect(CompareOp::Eq, 5i32).unwrap(), vec![gen_id(5)]);
            assert_eq!(index.collect(CompareOp::Ne, 5i32).unwrap().len(), 19);
            assert_eq!(index.collect(CompareOp::Gt, 15i32).unwrap().len(), 5);
            assert_eq!(index.collect(CompareOp::Gte, 15i32).unwrap().len(), 6);
            assert_eq!(index.collect(CompareOp::Lt, 3i32).unwrap(), vec![gen_id(1), gen_id(2)]);
            assert_eq!(index.collect(CompareOp::Lte, 3i32).unwrap().len(), 3);
            assert!(index.collect(CompareOp::Eq, 50i32).unwrap().is_empty());
        }
    }

    #[test]
    fn test_search_rejects_wrong_type() {
        let dir = TempDir::new().unwrap();
        let index = IndexDisk::open(dir.path(), int_config(StorageKind::BTree)).unwrap();
        assert!(matches!(
            index.search(CompareOp::Eq, "text"),
            Err(StorageError::KeyTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_document_insert_skips_missing_field() {
        let dir = TempDir::new().unwrap();
        let mut index = IndexDisk::open(dir.path(), int_config(StorageKind::BTree)).unwrap();
        let doc = Document::from_json(r#"{"value": 7}"#).unwrap();
        let other = Document::from_json(r#"{"name": "x"}"#).unwrap();
        let wrong = Document::from_json(r#"{"value": "seven"}"#).unwrap();
        assert!(index.insert_document(&doc, gen_id(1)).unwrap());
        assert!(!index.insert_document(&other, gen_id(2)).unwrap());
        assert!(!index.insert_document(&wrong, gen_id(3)).unwrap());
        assert_eq!(index.count(), 1);
        assert!(index.remove_document(&doc, gen_id(1)).unwrap());
        assert_eq!(index.count(), 0);
    }

    #[test]
    fn test_scan_range_descending_with_limit() {
        let dir = TempDir::new().unwrap();
        let mut index = IndexDisk::open(dir.path(), int_config(StorageKind::BTree)).unwrap();
        for v in 0..50i32 {
            index.insert(v, gen_id(v as u32)).unwrap();
        }
        let range = KeyRange {
            lower: Bound::Included(IndexKey::Int32(10)),
            upper: Bound::Excluded(IndexKey::Int32(20)),
        };
        let ids = index
            .scan_range(&range, ScanDirection::Descending, Some(3))
            .unwrap();
        assert_eq!(ids, vec![gen_id(19), gen_id(18), gen_id(17)]);
    }

    #[test]
    fn test_remove_key_and_unique_count() {
        let dir = TempDir::new().unwrap();
        let mut index = IndexDisk::open(dir.path(), int_config(StorageKind::BTree)).unwrap();
        for n in 0..6u32 {
            index.insert((n % 2) as i32, gen_id(n)).unwrap();
        }
        assert_eq!(index.unique_keys(), 2);
        assert_eq!(index.remove_key(0i32).unwrap(), 3);
        assert_eq!(index.unique_keys(), 1);
        assert_eq!(index.count(), 3);
        assert!(!index.contains_index(0i32).unwrap());
        assert!(index.contains(1i32, gen_id(1)).unwrap());
    }
}
