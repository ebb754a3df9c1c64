//! Disk-backed B+tree
//!
//! Leaves are [`Block`]s; internal nodes hold separator keys and child page
//! ids. Every node is one page of a [`PageFile`].
//!
//! # Ordering
//!
//! Entries sharing a key keep insertion order, and a run of equal keys may
//! span several leaves. Child `i` of an internal node holds keys in the
//! inclusive range `[keys[i - 1], keys[i]]`, so:
//! - inserts descend to the last child whose lower separator is `<= key`,
//!   which appends to the end of the key's run
//! - lookups descend to the first child whose upper separator is `>= key`
//!   and walk right
//!
//! # Structure changes
//!
//! Nodes are sized in encoded bytes. A node that grows past the page
//! payload splits at its byte midpoint and pushes a separator into its
//! parent; a root split is the only way the height grows. A non-root node
//! below a quarter of the payload is merged with a sibling when both fit in
//! one page, otherwise entries are redistributed between the two. A root
//! with a single child is replaced by that child.
//!
//! Descent records the path of `(page, child index)` pairs, so nodes need
//! no parent or sibling pointers. The same path walks leaves in order for
//! range scans.
//!
//! # Caching
//!
//! Nodes are cached by page id. The cache is trimmed back to its capacity
//! at the end of every public operation, writing dirty victims back first.
//! [`BTree::flush`] writes every dirty node and the meta page and syncs.

use std::collections::hash_map;
use std::io::Cursor;
use std::ops::Bound;
use std::path::Path as FsPath;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::block::{Block, Entry};
use crate::config::StorageKind;
use crate::error::{Result, StorageError};
use crate::file::{Meta, PageFile};
use crate::index::{above_lower, below_upper, IndexStorage, ScanDirection};
use crate::key::{IndexKey, KeyType};
use crate::page::{decode_page, encode_page, PageHeader, PageId, PageType};

/// Descent path: `(internal page, chosen child index)` from the root down
type Path = SmallVec<[(PageId, usize); 8]>;

/// Separator keys and child pointers
#[derive(Debug, Clone, PartialEq)]
pub struct InternalNode {
    /// Separator keys, non-decreasing
    pub keys: Vec<IndexKey>,
    /// Child pages, one more than keys
    pub children: Vec<PageId>,
}

impl InternalNode {
    /// Encoded size of keys and child pointers
    pub fn size(&self) -> usize {
        self.keys.iter().map(IndexKey::encoded_len).sum::<usize>() + 8 * self.children.len()
    }

    /// Split at the byte midpoint; returns the promoted key and right half
    fn split(&mut self) -> (IndexKey, InternalNode) {
        let len = self.keys.len();
        let total = self.size();
        let mut acc = 8;
        let mut mid = len / 2;
        for (i, key) in self.keys.iter().enumerate() {
            acc += key.encoded_len() + 8;
            if acc * 2 >= total {
                mid = i;
                break;
            }
        }
        let mid = if len >= 3 { mid.clamp(1, len - 2) } else { len / 2 };
        let right_keys = self.keys.split_off(mid + 1);
        let promoted = self.keys.remove(mid);
        let right_children = self.children.split_off(mid + 1);
        (
            promoted,
            InternalNode {
                keys: right_keys,
                children: right_children,
            },
        )
    }

    /// Encode as an internal page
    ///
    /// Body: child ids as u64 LE, then the keys.
    pub fn to_page(&self, key_type: KeyType, page_size: usize) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.size());
        for child in &self.children {
            body.write_u64::<LittleEndian>(*child)?;
        }
        for key in &self.keys {
            key.write_to(&mut body)?;
        }
        let header = PageHeader {
            page_type: PageType::Internal,
            key_type: key_type.to_u8(),
            count: self.keys.len() as u32,
            next: 0,
        };
        encode_page(&header, &body, page_size)
    }

    fn from_body(count: usize, body: &[u8], key_type: KeyType) -> Result<Self> {
        let mut cursor = Cursor::new(body);
        let mut children = Vec::with_capacity(count + 1);
        for _ in 0..=count {
            children.push(cursor.read_u64::<LittleEndian>()?);
        }
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(IndexKey::read_from(&mut cursor, key_type)?);
        }
        Ok(InternalNode { keys, children })
    }
}

/// Tree node
#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf(Block),
    Internal(InternalNode),
}

impl Node {
    fn size(&self) -> usize {
        match self {
            Node::Leaf(block) => block.occupied_memory(),
            Node::Internal(node) => node.size(),
        }
    }

    fn decode(page: &[u8], key_type: KeyType) -> Result<Self> {
        let (header, body) = decode_page(page)?;
        if header.key_type != key_type.to_u8() {
            return Err(StorageError::Corruption(format!(
                "page key type {} does not match index key type {}",
                header.key_type, key_type
            )));
        }
        match header.page_type {
            PageType::Leaf => Ok(Node::Leaf(Block::from_page(page, key_type)?.0)),
            PageType::Internal => Ok(Node::Internal(InternalNode::from_body(
                header.count as usize,
                body,
                key_type,
            )?)),
            PageType::Free => Err(StorageError::Corruption(
                "tree points at a free page".to_string(),
            )),
        }
    }

    fn encode(&self, key_type: KeyType, page_size: usize) -> Result<Vec<u8>> {
        match self {
            Node::Leaf(block) => block.to_page(key_type, 0),
            Node::Internal(node) => node.to_page(key_type, page_size),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedNode {
    node: Node,
    dirty: bool,
    last_used: u64,
}

/// State to restore if a mutation fails part way
#[derive(Debug)]
struct Undo {
    root: PageId,
    height: u32,
    count: u64,
    unique: u64,
    meta: Meta,
    /// Cache entry of each touched page before the mutation, `None` if the
    /// page was allocated by it
    nodes: FxHashMap<PageId, Option<CachedNode>>,
}

/// Shape of a tree as found by [`BTree::check_invariants`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Levels, leaves included
    pub height: u32,
    /// Leaf nodes
    pub leaves: usize,
    /// Internal nodes
    pub internal_nodes: usize,
    /// Entries in all leaves
    pub entries: u64,
    /// Distinct keys
    pub unique_keys: u64,
}

/// B+tree index over a page file
#[derive(Debug)]
pub struct BTree {
    file: PageFile,
    cache: FxHashMap<PageId, CachedNode>,
    capacity: usize,
    clock: u64,
    root: PageId,
    height: u32,
    count: u64,
    unique: u64,
    undo: Option<Undo>,
}

impl BTree {
    /// Create an empty tree, replacing any file at `path`
    pub fn create(
        path: impl AsRef<FsPath>,
        key_type: KeyType,
        page_size: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        let mut file = PageFile::create(path, page_size, key_type, StorageKind::BTree)?;
        let root = file.allocate()?;
        let mut tree = BTree {
            file,
            cache: FxHashMap::default(),
            capacity: cache_capacity.max(1),
            clock: 0,
            root,
            height: 1,
            count: 0,
            unique: 0,
            undo: None,
        };
        tree.put(root, Node::Leaf(Block::new(page_size)));
        tree.flush()?;
        info!(path = %tree.file.path().display(), %key_type, page_size, "created b+tree");
        Ok(tree)
    }

    /// Open an existing tree
    pub fn open(path: impl AsRef<FsPath>, cache_capacity: usize) -> Result<Self> {
        let file = PageFile::open(path)?;
        let meta = file.meta().clone();
        if meta.kind != StorageKind::BTree {
            return Err(StorageError::InvalidConfig(format!(
                "{} holds a {:?}, not a b+tree",
                file.path().display(),
                meta.kind
            )));
        }
        if meta.root == 0 || meta.height == 0 {
            return Err(StorageError::Corruption("b+tree has no root".to_string()));
        }
        info!(
            path = %file.path().display(),
            entries = meta.count,
            height = meta.height,
            "opened b+tree"
        );
        Ok(BTree {
            file,
            cache: FxHashMap::default(),
            capacity: cache_capacity.max(1),
            clock: 0,
            root: meta.root,
            height: meta.height,
            count: meta.count,
            unique: meta.unique,
            undo: None,
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

    /// Levels, leaves included
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Nodes currently cached
    pub fn cached_nodes(&self) -> usize {
        self.cache.len()
    }

    /// Largest accepted entry
    pub fn max_entry_size(&self) -> usize {
        self.file.payload_size() / 8
    }

    fn min_fill(&self) -> usize {
        self.file.payload_size() / 4
    }

    // =========================================================================
    // Node cache
    // =========================================================================

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn load(&mut self, id: PageId) -> Result<&mut CachedNode> {
        let now = self.tick();
        let key_type = self.file.key_type();
        let file = &mut self.file;
        match self.cache.entry(id) {
            hash_map::Entry::Occupied(entry) => {
                let cached = entry.into_mut();
                cached.last_used = now;
                Ok(cached)
            }
            hash_map::Entry::Vacant(entry) => {
                let page = file.read_page(id)?;
                let node = Node::decode(&page, key_type)?;
                Ok(entry.insert(CachedNode {
                    node,
                    dirty: false,
                    last_used: now,
                }))
            }
        }
    }

    fn node(&mut self, id: PageId) -> Result<&Node> {
        Ok(&self.load(id)?.node)
    }

    fn leaf(&mut self, id: PageId) -> Result<&Block> {
        match self.node(id)? {
            Node::Leaf(block) => Ok(block),
            Node::Internal(_) => Err(StorageError::Corruption(format!(
                "page {} should be a leaf",
                id
            ))),
        }
    }

    fn take(&mut self, id: PageId) -> Result<Node> {
        if let Some(cached) = self.cache.remove(&id) {
            self.remember(id, || Some(cached.clone()));
            return Ok(cached.node);
        }
        let page = self.file.read_page(id)?;
        let node = Node::decode(&page, self.file.key_type())?;
        self.remember(id, || {
            Some(CachedNode {
                node: node.clone(),
                dirty: false,
                last_used: 0,
            })
        });
        Ok(node)
    }

    /// Record the state of page `id` before the running mutation first touches it
    fn remember<F>(&mut self, id: PageId, prior: F)
    where
        F: FnOnce() -> Option<CachedNode>,
    {
        if let Some(undo) = self.undo.as_mut() {
            undo.nodes.entry(id).or_insert_with(prior);
        }
    }

    fn take_leaf(&mut self, id: PageId) -> Result<Block> {
        match self.take(id)? {
            Node::Leaf(block) => Ok(block),
            Node::Internal(_) => Err(StorageError::Corruption(format!(
                "page {} should be a leaf",
                id
            ))),
        }
    }

    fn take_internal(&mut self, id: PageId) -> Result<InternalNode> {
        match self.take(id)? {
            Node::Internal(node) => Ok(node),
            Node::Leaf(_) => Err(StorageError::Corruption(format!(
                "page {} should be an internal node",
                id
            ))),
        }
    }

    fn put(&mut self, id: PageId, node: Node) {
        let cache = &self.cache;
        if let Some(undo) = self.undo.as_mut() {
            undo.nodes
                .entry(id)
                .or_insert_with(|| cache.get(&id).cloned());
        }
        let now = self.tick();
        self.cache.insert(
            id,
            CachedNode {
                node,
                dirty: true,
                last_used: now,
            },
        );
    }

    fn discard(&mut self, id: PageId) -> Result<()> {
        self.cache.remove(&id);
        self.file.free(id)
    }

    /// Run a mutation, restoring the tree and cache if it fails
    ///
    /// Pages taken out of the cache are put back as they were and the
    /// counters, root and free list return to their old values. Restored
    /// nodes are marked dirty since a page freed by the failed mutation no
    /// longer holds them on disk.
    fn atomically<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.undo = Some(Undo {
            root: self.root,
            height: self.height,
            count: self.count,
            unique: self.unique,
            meta: self.file.meta().clone(),
            nodes: FxHashMap::default(),
        });
        let result = op(self);
        let undo = self.undo.take();
        if let (Err(e), Some(undo)) = (&result, undo) {
            warn!(error = %e, pages = undo.nodes.len(), "rolled back b+tree mutation");
            self.roll_back(undo);
        }
        result
    }

    fn roll_back(&mut self, undo: Undo) {
        for (id, prior) in undo.nodes {
            match prior {
                Some(mut cached) => {
                    cached.dirty = true;
                    self.cache.insert(id, cached);
                }
                None => {
                    self.cache.remove(&id);
                }
            }
        }
        self.root = undo.root;
        self.height = undo.height;
        self.count = undo.count;
        self.unique = undo.unique;
        *self.file.meta_mut() = undo.meta;
    }

    fn evict(&mut self) -> Result<()> {
        while self.cache.len() > self.capacity {
            let victim = self
                .cache
                .iter()
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(id, cached)| (*id, cached.dirty));
            let (id, dirty) = match victim {
                Some(victim) => victim,
                None => break,
            };
            // Written before removal so a failed write keeps the node cached.
            if dirty {
                let page = match self.cache.get(&id) {
                    Some(cached) => cached
                        .node
                        .encode(self.file.key_type(), self.file.page_size())?,
                    None => break,
                };
                self.file.write_page(id, &page)?;
            }
            self.cache.remove(&id);
            debug!(page = id, dirty, "evicted node");
        }
        Ok(())
    }

    /// Write dirty nodes and the meta page, then sync
    pub fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<PageId> = self
            .cache
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, _)| *id)
            .collect();
        dirty.sort_unstable();
        for id in &dirty {
            let page = match self.cache.get(id) {
                Some(cached) => cached
                    .node
                    .encode(self.file.key_type(), self.file.page_size())?,
                None => continue,
            };
            self.file.write_page(*id, &page)?;
            if let Some(cached) = self.cache.get_mut(id) {
                cached.dirty = false;
            }
        }
        let meta = self.file.meta_mut();
        meta.root = self.root;
        meta.height = self.height;
        meta.count = self.count;
        meta.unique = self.unique;
        self.file.sync()?;
        debug!(pages = dirty.len(), "flushed b+tree");
        self.evict()
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    fn descend_from<F>(&mut self, start: PageId, path: &mut Path, pick: F) -> Result<PageId>
    where
        F: Fn(&InternalNode) -> usize,
    {
        let mut id = start;
        loop {
            let (index, child) = match self.node(id)? {
                Node::Leaf(_) => return Ok(id),
                Node::Internal(node) => {
                    let index = pick(node).min(node.children.len().saturating_sub(1));
                    let child = node.children.get(index).copied().ok_or_else(|| {
                        StorageError::Corruption(format!("internal page {} has no children", id))
                    })?;
                    (index, child)
                }
            };
            path.push((id, index));
            if path.len() >= self.height as usize {
                return Err(StorageError::Corruption(format!(
                    "descent below page {} exceeds the tree height {}",
                    id, self.height
                )));
            }
            id = child;
        }
    }

    fn descend<F>(&mut self, pick: F) -> Result<(PageId, Path)>
    where
        F: Fn(&InternalNode) -> usize,
    {
        let mut path = Path::new();
        let leaf = self.descend_from(self.root, &mut path, pick)?;
        Ok((leaf, path))
    }

    /// Move `path` to the next leaf to the right
    fn advance(&mut self, path: &mut Path) -> Result<Option<PageId>> {
        while let Some((id, index)) = path.pop() {
            let next = match self.node(id)? {
                Node::Internal(node) => node.children.get(index + 1).copied(),
                Node::Leaf(_) => None,
            };
            if let Some(child) = next {
                path.push((id, index + 1));
                return self.descend_from(child, path, |_| 0).map(Some);
            }
        }
        Ok(None)
    }

    /// Move `path` to the next leaf to the left
    fn retreat(&mut self, path: &mut Path) -> Result<Option<PageId>> {
        while let Some((id, index)) = path.pop() {
            if index == 0 {
                continue;
            }
            let prev = match self.node(id)? {
                Node::Internal(node) => node.children.get(index - 1).copied(),
                Node::Leaf(_) => None,
            };
            if let Some(child) = prev {
                path.push((id, index - 1));
                return self.descend_from(child, path, |_| usize::MAX).map(Some);
            }
        }
        Ok(None)
    }

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
                let (mut leaf, mut path) = match lower {
                    Bound::Included(k) => self.descend(|n| n.keys.partition_point(|s| s < k))?,
                    Bound::Excluded(k) => self.descend(|n| n.keys.partition_point(|s| s <= k))?,
                    Bound::Unbounded => self.descend(|_| 0)?,
                };
                loop {
                    let block = self.leaf(leaf)?;
                    let start = match lower {
                        Bound::Included(k) => block.lower_index(k),
                        Bound::Excluded(k) => block.upper_index(k),
                        Bound::Unbounded => 0,
                    };
                    for entry in &block.entries()[start..] {
                        if !below_upper(&entry.key, upper) || !visit(entry) {
                            return Ok(());
                        }
                    }
                    match self.advance(&mut path)? {
                        Some(next) => leaf = next,
                        None => return Ok(()),
                    }
                }
            }
            ScanDirection::Descending => {
                let (mut leaf, mut path) = match upper {
                    Bound::Included(k) => self.descend(|n| n.keys.partition_point(|s| s <= k))?,
                    Bound::Excluded(k) => self.descend(|n| n.keys.partition_point(|s| s < k))?,
                    Bound::Unbounded => self.descend(|_| usize::MAX)?,
                };
                loop {
                    let block = self.leaf(leaf)?;
                    let end = match upper {
                        Bound::Included(k) => block.upper_index(k),
                        Bound::Excluded(k) => block.lower_index(k),
                        Bound::Unbounded => block.count(),
                    };
                    for entry in block.entries()[..end].iter().rev() {
                        if !above_lower(&entry.key, lower) || !visit(entry) {
                            return Ok(());
                        }
                    }
                    match self.retreat(&mut path)? {
                        Some(prev) => leaf = prev,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Leaf, path and position of the first entry matching key and item
    fn locate(&mut self, key: &IndexKey, item: &[u8]) -> Result<Option<(PageId, Path, usize)>> {
        let (mut leaf, mut path) = self.descend(|n| n.keys.partition_point(|s| s < key))?;
        loop {
            let block = self.leaf(leaf)?;
            let start = block.lower_index(key);
            for (offset, entry) in block.entries()[start..].iter().enumerate() {
                if entry.key != *key {
                    return Ok(None);
                }
                if entry.item == item {
                    return Ok(Some((leaf, path, start + offset)));
                }
            }
            match self.advance(&mut path)? {
                Some(next) => leaf = next,
                None => return Ok(None),
            }
        }
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

    // =========================================================================
    // Queries
    // =========================================================================

    /// True if some entry has `key`
    pub fn contains_index(&mut self, key: &IndexKey) -> Result<bool> {
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

    /// Distinct keys in order
    pub fn keys(&mut self) -> Result<Vec<IndexKey>> {
        let mut keys: Vec<IndexKey> = Vec::new();
        self.walk(
            Bound::Unbounded,
            Bound::Unbounded,
            ScanDirection::Ascending,
            |entry| {
                if keys.last() != Some(&entry.key) {
                    keys.push(entry.key.clone());
                }
                true
            },
        )?;
        self.evict()?;
        Ok(keys)
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

        self.atomically(|tree| tree.insert_entry(key, item, key_exists))?;
        self.evict()?;
        Ok(true)
    }

    fn insert_entry(&mut self, key: IndexKey, item: &[u8], key_exists: bool) -> Result<()> {
        let (leaf_id, path) = self.descend(|n| n.keys.partition_point(|s| s <= &key))?;
        let mut leaf = self.take_leaf(leaf_id)?;
        leaf.push_sorted(Entry::new(key, item));
        self.count += 1;
        if !key_exists {
            self.unique += 1;
        }

        if leaf.occupied_memory() > self.file.payload_size() {
            let right = leaf.split_half();
            let separator = right.min_key().cloned().ok_or_else(|| {
                StorageError::Corruption("leaf split produced an empty half".to_string())
            })?;
            let right_id = self.file.allocate()?;
            debug!(
                left = leaf_id,
                right = right_id,
                left_entries = leaf.count(),
                right_entries = right.count(),
                "split leaf"
            );
            self.put(leaf_id, Node::Leaf(leaf));
            self.put(right_id, Node::Leaf(right));
            self.insert_into_parent(path, separator, right_id)
        } else {
            self.put(leaf_id, Node::Leaf(leaf));
            Ok(())
        }
    }

    /// Add `separator` and its right child `right_id` above the last path node
    fn insert_into_parent(
        &mut self,
        mut path: Path,
        mut separator: IndexKey,
        mut right_id: PageId,
    ) -> Result<()> {
        while let Some((parent_id, index)) = path.pop() {
            let mut parent = self.take_internal(parent_id)?;
            parent.keys.insert(index, separator);
            parent.children.insert(index + 1, right_id);
            if parent.size() <= self.file.payload_size() {
                self.put(parent_id, Node::Internal(parent));
                return Ok(());
            }
            let (promoted, right) = parent.split();
            let new_id = self.file.allocate()?;
            debug!(left = parent_id, right = new_id, "split internal node");
            self.put(parent_id, Node::Internal(parent));
            self.put(new_id, Node::Internal(right));
            separator = promoted;
            right_id = new_id;
        }

        let old_root = self.root;
        let new_root = self.file.allocate()?;
        self.put(
            new_root,
            Node::Internal(InternalNode {
                keys: vec![separator],
                children: vec![old_root, right_id],
            }),
        );
        self.root = new_root;
        self.height += 1;
        debug!(root = new_root, height = self.height, "grew b+tree");
        Ok(())
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Remove the first entry matching key and item
    pub fn remove(&mut self, key: &IndexKey, item: &[u8]) -> Result<bool> {
        key.check_type(self.key_type())?;
        let removed = self.atomically(|tree| tree.remove_entry(key, item))?;
        self.evict()?;
        Ok(removed)
    }

    /// Remove every entry with `key`; returns how many were removed
    pub fn remove_index(&mut self, key: &IndexKey) -> Result<usize> {
        key.check_type(self.key_type())?;
        let removed = self.atomically(|tree| tree.remove_all(key))?;
        self.evict()?;
        Ok(removed)
    }

    fn remove_all(&mut self, key: &IndexKey) -> Result<usize> {
        let mut removed = 0;
        loop {
            let mut first = None;
            self.walk(
                Bound::Included(key),
                Bound::Included(key),
                ScanDirection::Ascending,
                |entry| {
                    first = Some(entry.item.clone());
                    false
                },
            )?;
            let item = match first {
                Some(item) => item,
                None => break,
            };
            if !self.remove_entry(key, &item)? {
                break;
            }
            removed += 1;
        }
        Ok(removed)
    }

    fn remove_entry(&mut self, key: &IndexKey, item: &[u8]) -> Result<bool> {
        let (leaf_id, path, pos) = match self.locate(key, item)? {
            Some(found) => found,
            None => return Ok(false),
        };
        let mut leaf = self.take_leaf(leaf_id)?;
        leaf.remove_at(pos);
        self.count -= 1;
        self.rebalance(leaf_id, Node::Leaf(leaf), path)?;

        let mut still_present = false;
        self.walk(
            Bound::Included(key),
            Bound::Included(key),
            ScanDirection::Ascending,
            |_| {
                still_present = true;
                false
            },
        )?;
        if !still_present {
            self.unique -= 1;
        }
        Ok(true)
    }

    /// Restore fill bounds from `node` (page `id`) up to the root
    fn rebalance(&mut self, mut id: PageId, mut node: Node, mut path: Path) -> Result<()> {
        let payload = self.file.payload_size();
        let min_fill = self.min_fill();
        loop {
            if node.size() > payload {
                let (separator, right) = split_node(&mut node)?;
                let right_id = self.file.allocate()?;
                debug!(left = id, right = right_id, "split node after separator change");
                self.put(id, node);
                self.put(right_id, right);
                return self.insert_into_parent(path, separator, right_id);
            }

            let (parent_id, index) = match path.pop() {
                Some(parent) => parent,
                None => return self.settle_root(id, node),
            };
            if node.size() >= min_fill {
                self.put(id, node);
                return Ok(());
            }

            let mut parent = self.take_internal(parent_id)?;
            if parent.children.len() < 2 {
                return Err(StorageError::Corruption(format!(
                    "internal page {} has a single child",
                    parent_id
                )));
            }
            let sep_index = if index > 0 { index - 1 } else { 0 };
            let left_id = parent.children[sep_index];
            let right_id = parent.children[sep_index + 1];
            let (left, right) = if index > 0 {
                (self.take(left_id)?, node)
            } else {
                (node, self.take(right_id)?)
            };

            match (left, right) {
                (Node::Leaf(mut left), Node::Leaf(right)) => {
                    let fits = left.occupied_memory() + right.occupied_memory() <= payload;
                    left.merge(right);
                    if fits {
                        debug!(left = left_id, right = right_id, "merged leaves");
                        self.put(left_id, Node::Leaf(left));
                        self.discard(right_id)?;
                        parent.keys.remove(sep_index);
                        parent.children.remove(sep_index + 1);
                    } else {
                        let right = left.split_half();
                        parent.keys[sep_index] = right.min_key().cloned().ok_or_else(|| {
                            StorageError::Corruption("redistribution emptied a leaf".to_string())
                        })?;
                        debug!(left = left_id, right = right_id, "redistributed leaves");
                        self.put(left_id, Node::Leaf(left));
                        self.put(right_id, Node::Leaf(right));
                    }
                }
                (Node::Internal(mut left), Node::Internal(right)) => {
                    let separator = parent.keys[sep_index].clone();
                    let fits = left.size() + right.size() + separator.encoded_len() <= payload;
                    left.keys.push(separator);
                    left.keys.extend(right.keys);
                    left.children.extend(right.children);
                    if fits {
                        debug!(left = left_id, right = right_id, "merged internal nodes");
                        self.put(left_id, Node::Internal(left));
                        self.discard(right_id)?;
                        parent.keys.remove(sep_index);
                        parent.children.remove(sep_index + 1);
                    } else {
                        let (promoted, right) = left.split();
                        parent.keys[sep_index] = promoted;
                        debug!(left = left_id, right = right_id, "redistributed internal nodes");
                        self.put(left_id, Node::Internal(left));
                        self.put(right_id, Node::Internal(right));
                    }
                }
                _ => {
                    return Err(StorageError::Corruption(format!(
                        "siblings {} and {} are on different levels",
                        left_id, right_id
                    )))
                }
            }

            id = parent_id;
            node = Node::Internal(parent);
        }
    }

    fn settle_root(&mut self, id: PageId, node: Node) -> Result<()> {
        match node {
            Node::Internal(root) if root.children.len() == 1 => {
                self.discard(id)?;
                self.root = root.children[0];
                self.height -= 1;
                debug!(root = self.root, height = self.height, "shrank b+tree");
            }
            node => self.put(id, node),
        }
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Walk the whole tree checking structural invariants
    ///
    /// Checks that every leaf is at the same depth, separators bound their
    /// children inclusively, non-root nodes are within fill bounds, and the
    /// entry and distinct-key counts match the stored totals.
    pub fn check_invariants(&mut self) -> Result<TreeStats> {
        let mut stats = TreeStats {
            height: self.height,
            ..TreeStats::default()
        };
        let mut last: Option<IndexKey> = None;
        self.check_node(self.root, 1, None, None, &mut stats, &mut last)?;
        if stats.entries != self.count {
            return Err(StorageError::Corruption(format!(
                "tree holds {} entries, count says {}",
                stats.entries, self.count
            )));
        }
        if stats.unique_keys != self.unique {
            return Err(StorageError::Corruption(format!(
                "tree holds {} distinct keys, counter says {}",
                stats.unique_keys, self.unique
            )));
        }
        self.evict()?;
        Ok(stats)
    }

    fn check_node(
        &mut self,
        id: PageId,
        depth: u32,
        lower: Option<&IndexKey>,
        upper: Option<&IndexKey>,
        stats: &mut TreeStats,
        last: &mut Option<IndexKey>,
    ) -> Result<()> {
        let corrupt = |msg: String| Err(StorageError::Corruption(format!("page {}: {}", id, msg)));
        let node = self.node(id)?.clone();
        let is_root = id == self.root;
        let size = node.size();
        if size > self.file.payload_size() {
            return corrupt(format!("{} bytes overflow the page", size));
        }
        if !is_root && size < self.min_fill() {
            return corrupt(format!("{} bytes is below the minimum fill", size));
        }
        let in_bounds = |key: &IndexKey| {
            lower.map_or(true, |lo| key >= lo) && upper.map_or(true, |hi| key <= hi)
        };

        match node {
            Node::Leaf(block) => {
                if depth != self.height {
                    return corrupt(format!("leaf at depth {} of {}", depth, self.height));
                }
                for entry in block.entries() {
                    if !in_bounds(&entry.key) {
                        return corrupt(format!("key {} outside its separators", entry.key));
                    }
                    match last.as_ref() {
                        Some(prev) if *prev > entry.key => {
                            return corrupt(format!("key {} after {}", entry.key, prev));
                        }
                        Some(prev) if *prev == entry.key => {}
                        _ => stats.unique_keys += 1,
                    }
                    *last = Some(entry.key.clone());
                }
                stats.leaves += 1;
                stats.entries += block.count() as u64;
            }
            Node::Internal(node) => {
                if depth >= self.height {
                    return corrupt(format!("internal node at depth {}", depth));
                }
                if node.children.len() != node.keys.len() + 1 || node.keys.is_empty() {
                    return corrupt(format!(
                        "{} keys with {} children",
                        node.keys.len(),
                        node.children.len()
                    ));
                }
                if node.keys.windows(2).any(|pair| pair[0] > pair[1]) {
                    return corrupt("separators out of order".to_string());
                }
                if let Some(key) = node.keys.iter().find(|key| !in_bounds(key)) {
                    return corrupt(format!("separator {} outside its bounds", key));
                }
                stats.internal_nodes += 1;
                for (i, child) in node.children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { node.keys.get(i - 1) };
                    let child_upper = if i == node.keys.len() {
                        upper
                    } else {
                        node.keys.get(i)
                    };
                    self.check_node(*child, depth + 1, child_lower, child_upper, stats, last)?;
                }
            }
        }
        Ok(())
    }
}

fn split_node(node: &mut Node) -> Result<(IndexKey, Node)> {
    match node {
        Node::Leaf(block) => {
            let right = block.split_half();
            let separator = right.min_key().cloned().ok_or_else(|| {
                StorageError::Corruption("split produced an empty leaf".to_string())
            })?;
            Ok((separator, Node::Leaf(right)))
        }
        Node::Internal(internal) => {
            let (promoted, right) = internal.split();
            Ok((promoted, Node::Internal(right)))
        }
    }
}

impl Drop for BTree {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to flush b+tree on drop");
        }
    }
}

impl IndexStorage for BTree {
    fn key_type(&self) -> KeyType {
        BTree::key_type(self)
    }

    fn insert(&mut self, key: IndexKey, item: &[u8]) -> Result<bool> {
        BTree::insert(self, key, item)
    }

    fn remove(&mut self, key: &IndexKey, item: &[u8]) -> Result<bool> {
        BTree::remove(self, key, item)
    }

    fn remove_index(&mut self, key: &IndexKey) -> Result<usize> {
        BTree::remove_index(self, key)
    }

    fn contains_index(&mut self, key: &IndexKey) -> Result<bool> {
        BTree::contains_index(self, key)
    }

    fn contains(&mut self, key: &IndexKey, item: &[u8]) -> Result<bool> {
        BTree::contains(self, key, item)
    }

    fn scan(
        &mut self,
        lower: Bound<&IndexKey>,
        upper: Bound<&IndexKey>,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        BTree::scan(self, lower, upper, direction, limit)
    }

    fn count(&self) -> u64 {
        BTree::count(self)
    }

    fn unique_indices_count(&self) -> u64 {
        BTree::unique_indices_count(self)
    }

    fn flush(&mut self) -> Result<()> {
        BTree::flush(self)
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

    fn small_tree(dir: &TempDir, capacity: usize) -> BTree {
        BTree::create(dir.path().join("tree"), KeyType::Int32, 512, capacity).unwrap()
    }

    fn all_keys(tree: &mut BTree) -> Vec<i32> {
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
        let mut tree = small_tree(&dir, 16);
        assert_eq!(tree.count(), 0);
        assert_eq!(tree.height(), 1);
        assert!(tree.find(&IndexKey::Int32(1)).unwrap().is_empty());
        assert!(!tree.contains_index(&IndexKey::Int32(1)).unwrap());
        let stats = tree.check_invariants().unwrap();
        assert_eq!(stats.leaves, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_insert_and_find() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 16);
        assert!(tree.insert(IndexKey::Int32(5), &id(1)).unwrap());
        assert!(tree.insert(IndexKey::Int32(3), &id(2)).unwrap());
        assert!(!tree.insert(IndexKey::Int32(5), &id(1)).unwrap());
        assert_eq!(tree.count(), 2);
        assert_eq!(tree.find(&IndexKey::Int32(5)).unwrap(), vec![id(1)]);
        assert!(tree.contains(&IndexKey::Int32(3), &id(2)).unwrap());
        assert!(!tree.contains(&IndexKey::Int32(3), &id(1)).unwrap());
    }

    #[test]
    fn test_growth_and_shrink() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 8);
        for v in 0..2000 {
            tree.insert(IndexKey::Int32((v * 7919) % 2000), &id(v as u32))
                .unwrap();
        }
        let stats = tree.check_invariants().unwrap();
        assert!(stats.height >= 3, "height {}", stats.height);
        assert_eq!(stats.entries, 2000);
        assert_eq!(all_keys(&mut tree), (0..2000).collect::<Vec<_>>());

        for v in 0..2000 {
            assert!(tree
                .remove(&IndexKey::Int32((v * 7919) % 2000), &id(v as u32))
                .unwrap());
            if v % 250 == 0 {
                tree.check_invariants().unwrap();
            }
        }
        assert_eq!(tree.count(), 0);
        assert_eq!(tree.unique_indices_count(), 0);
        assert_eq!(tree.height(), 1);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_failed_split_keeps_tree_intact() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 64);
        // A free list head pointing at a live leaf makes the next page
        // allocation fail.
        let root = tree.root;
        tree.file.meta_mut().free_head = root;

        let mut inserted = 0;
        let mut failed = None;
        for v in 0..100 {
            match tree.insert(IndexKey::Int32(v), &id(v as u32)) {
                Ok(true) => inserted += 1,
                Ok(false) => panic!("entry {} reported as duplicate", v),
                Err(e) => {
                    assert!(matches!(e, StorageError::Corruption(_)));
                    failed = Some(v);
                    break;
                }
            }
        }
        let failed = failed.expect("leaf never split");
        assert_eq!(tree.count(), inserted);
        assert_eq!(tree.unique_indices_count(), inserted);
        assert_eq!(tree.height(), 1);
        assert_eq!(all_keys(&mut tree), (0..failed).collect::<Vec<_>>());
        assert!(!tree.contains_index(&IndexKey::Int32(failed)).unwrap());
        assert_eq!(tree.file.meta().free_head, root);

        tree.file.meta_mut().free_head = 0;
        assert!(tree.insert(IndexKey::Int32(failed), &id(failed as u32)).unwrap());
        assert_eq!(tree.height(), 2);
        assert_eq!(tree.count(), inserted + 1);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_failed_merge_keeps_tree_intact() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 64);
        for v in 0..60 {
            tree.insert(IndexKey::Int32(v), &id(v as u32)).unwrap();
        }
        assert_eq!(tree.height(), 2);
        tree.flush().unwrap();

        let sibling = match tree.node(tree.root).unwrap() {
            Node::Internal(node) => node.children[1],
            Node::Leaf(_) => panic!("root should be internal"),
        };
        tree.cache.remove(&sibling);
        let blank = vec![0u8; tree.file.page_size()];
        tree.file.write_page(sibling, &blank).unwrap();

        let mut removed = 0;
        let mut failed = None;
        for v in 0..60 {
            match tree.remove(&IndexKey::Int32(v), &id(v as u32)) {
                Ok(true) => removed += 1,
                Ok(false) => panic!("entry {} missing", v),
                Err(_) => {
                    failed = Some(v);
                    break;
                }
            }
        }
        let failed = failed.expect("leaf never underflowed");
        assert_eq!(tree.count(), 60 - removed);
        assert_eq!(tree.unique_indices_count(), 60 - removed);
        assert!(tree
            .contains(&IndexKey::Int32(failed), &id(failed as u32))
            .unwrap());
        assert!(!tree.contains_index(&IndexKey::Int32(failed - 1)).unwrap());
    }

    #[test]
    fn test_freed_pages_are_reused() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 8);
        for v in 0..500 {
            tree.insert(IndexKey::Int32(v), &id(v as u32)).unwrap();
        }
        for v in 0..500 {
            tree.remove(&IndexKey::Int32(v), &id(v as u32)).unwrap();
        }
        tree.flush().unwrap();
        let pages = tree.file.meta().page_count;
        assert!(!tree.file.free_pages().unwrap().is_empty());
        for v in 0..500 {
            tree.insert(IndexKey::Int32(v), &id(v as u32)).unwrap();
        }
        tree.flush().unwrap();
        assert_eq!(tree.file.meta().page_count, pages);
    }

    #[test]
    fn test_duplicate_run_spans_leaves() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 4);
        for v in 0..50u32 {
            tree.insert(IndexKey::Int32(1), &id(v)).unwrap();
            tree.insert(IndexKey::Int32(2), &id(v)).unwrap();
            tree.insert(IndexKey::Int32(0), &id(v)).unwrap();
        }
        let stats = tree.check_invariants().unwrap();
        assert!(stats.leaves > 3);
        assert_eq!(stats.unique_keys, 3);
        let items = tree.find(&IndexKey::Int32(1)).unwrap();
        assert_eq!(items, (0..50).map(id).collect::<Vec<_>>());

        for v in (0..50u32).step_by(2) {
            assert!(tree.remove(&IndexKey::Int32(1), &id(v)).unwrap());
        }
        let items = tree.find(&IndexKey::Int32(1)).unwrap();
        assert_eq!(items, (1..50).step_by(2).map(id).collect::<Vec<_>>());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_index() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 4);
        for v in 0..40u32 {
            tree.insert(IndexKey::Int32(7), &id(v)).unwrap();
        }
        tree.insert(IndexKey::Int32(8), &id(0)).unwrap();
        assert_eq!(tree.remove_index(&IndexKey::Int32(7)).unwrap(), 40);
        assert_eq!(tree.remove_index(&IndexKey::Int32(7)).unwrap(), 0);
        assert_eq!(tree.count(), 1);
        assert_eq!(tree.unique_indices_count(), 1);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_scan_bounds_and_direction() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 8);
        for v in 0..300 {
            tree.insert(IndexKey::Int32(v), &id(v as u32)).unwrap();
        }
        let keys = |entries: Vec<Entry>| -> Vec<IndexKey> {
            entries.into_iter().map(|e| e.key).collect()
        };
        let lo = IndexKey::Int32(100);
        let hi = IndexKey::Int32(110);

        let asc = tree
            .scan(
                Bound::Excluded(&lo),
                Bound::Included(&hi),
                ScanDirection::Ascending,
                None,
            )
            .unwrap();
        assert_eq!(keys(asc), (101..=110).map(IndexKey::Int32).collect::<Vec<_>>());

        let desc = tree
            .scan(
                Bound::Included(&lo),
                Bound::Excluded(&hi),
                ScanDirection::Descending,
                None,
            )
            .unwrap();
        assert_eq!(
            keys(desc),
            (100..110).rev().map(IndexKey::Int32).collect::<Vec<_>>()
        );

        let limited = tree
            .scan(
                Bound::Unbounded,
                Bound::Unbounded,
                ScanDirection::Descending,
                Some(3),
            )
            .unwrap();
        assert_eq!(
            keys(limited),
            vec![IndexKey::Int32(299), IndexKey::Int32(298), IndexKey::Int32(297)]
        );
    }

    #[test]
    fn test_keys_lists_distinct() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 8);
        for v in 0..30u32 {
            tree.insert(IndexKey::Int32((v % 3) as i32), &id(v)).unwrap();
        }
        assert_eq!(
            tree.keys().unwrap(),
            vec![IndexKey::Int32(0), IndexKey::Int32(1), IndexKey::Int32(2)]
        );
    }

    #[test]
    fn test_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree");
        {
            let mut tree = BTree::create(&path, KeyType::String, 512, 4).unwrap();
            for v in 0..200u32 {
                tree.insert(IndexKey::String(format!("key{:04}", v)), &id(v))
                    .unwrap();
            }
            tree.flush().unwrap();
        }
        let mut tree = BTree::open(&path, 4).unwrap();
        assert_eq!(tree.count(), 200);
        assert_eq!(tree.unique_indices_count(), 200);
        assert_eq!(
            tree.find(&IndexKey::from("key0042")).unwrap(),
            vec![id(42)]
        );
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_rejects_bad_entries() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 8);
        assert!(matches!(
            tree.insert(IndexKey::Int64(1), &id(1)),
            Err(StorageError::KeyTypeMismatch { .. })
        ));
        let big = vec![0u8; 100];
        assert!(matches!(
            tree.insert(IndexKey::Int32(1), &big),
            Err(StorageError::EntryTooLarge { .. })
        ));
        assert_eq!(tree.count(), 0);
    }

    #[test]
    fn test_cache_stays_bounded() {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir, 2);
        for v in 0..1000 {
            tree.insert(IndexKey::Int32(v), &id(v as u32)).unwrap();
            assert!(tree.cached_nodes() <= 2);
        }
        assert_eq!(all_keys(&mut tree).len(), 1000);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_internal_node_page_roundtrip() {
        let node = InternalNode {
            keys: vec![IndexKey::from("b"), IndexKey::from("d")],
            children: vec![3, 4, 5],
        };
        let page = node.to_page(KeyType::String, 512).unwrap();
        match Node::decode(&page, KeyType::String).unwrap() {
            Node::Internal(decoded) => assert_eq!(decoded, node),
            Node::Leaf(_) => panic!("expected an internal node"),
        }
    }

    #[test]
    fn test_open_rejects_segment_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages");
        PageFile::create(&path, 512, KeyType::Int32, StorageKind::SegmentTree).unwrap();
        assert!(matches!(
            BTree::open(&path, 4),
            Err(StorageError::InvalidConfig(_))
        ));
    }
}
