//! In-memory block of sorted index entries
//!
//! A [`Block`] holds `(key, item)` entries sorted by key. Entries sharing a
//! key are contiguous and keep insertion order. Capacity is measured in
//! encoded bytes: a block of `size` bytes can hold entries whose encoded
//! sizes sum to `size - PAGE_HEADER_SIZE`, which is exactly what fits in one
//! page.
//!
//! Entry encoding: `[key][u32 item len][item]`.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, StorageError};
use crate::key::{IndexKey, KeyType};
use crate::page::{decode_page, encode_page, PageHeader, PageId, PageType, PAGE_HEADER_SIZE};

/// Default block and page size
pub const DEFAULT_BLOCK_SIZE: usize = 262_144;

/// One index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Index key
    pub key: IndexKey,
    /// Opaque payload, usually a document id
    pub item: Vec<u8>,
}

impl Entry {
    /// New entry
    pub fn new(key: IndexKey, item: impl Into<Vec<u8>>) -> Self {
        Entry {
            key,
            item: item.into(),
        }
    }

    /// Encoded size of an entry with this key and item
    pub fn size_of(key: &IndexKey, item: &[u8]) -> usize {
        key.encoded_len() + 4 + item.len()
    }

    /// Encoded size
    pub fn encoded_len(&self) -> usize {
        Self::size_of(&self.key, &self.item)
    }
}

/// Sorted, size-bounded run of entries
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    size: usize,
    occupied: usize,
    entries: Vec<Entry>,
}

impl Default for Block {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl Block {
    /// Empty block of `size` bytes
    pub fn new(size: usize) -> Self {
        Block {
            size,
            occupied: 0,
            entries: Vec::new(),
        }
    }

    /// Block size in bytes, header included
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes available for entries
    pub fn payload(&self) -> usize {
        self.size.saturating_sub(PAGE_HEADER_SIZE)
    }

    /// Bytes used by entries
    pub fn occupied_memory(&self) -> usize {
        self.occupied
    }

    /// Bytes still free
    pub fn available_memory(&self) -> usize {
        self.payload().saturating_sub(self.occupied)
    }

    /// Number of entries
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in order
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Smallest key
    pub fn min_key(&self) -> Option<&IndexKey> {
        self.entries.first().map(|e| &e.key)
    }

    /// Largest key
    pub fn max_key(&self) -> Option<&IndexKey> {
        self.entries.last().map(|e| &e.key)
    }

    /// Position of the first entry with key `>= key`
    pub fn lower_index(&self, key: &IndexKey) -> usize {
        self.entries.partition_point(|e| e.key < *key)
    }

    /// Position of the first entry with key `> key`
    pub fn upper_index(&self, key: &IndexKey) -> usize {
        self.entries.partition_point(|e| e.key <= *key)
    }

    fn run(&self, key: &IndexKey) -> &[Entry] {
        &self.entries[self.lower_index(key)..self.upper_index(key)]
    }

    /// Insert an entry after all entries with the same key
    ///
    /// Returns false if the block lacks room or already holds this exact
    /// key and item.
    pub fn append(&mut self, key: IndexKey, item: &[u8]) -> bool {
        if self.available_memory() < Entry::size_of(&key, item) || self.contains(&key, item) {
            return false;
        }
        self.push_sorted(Entry::new(key, item));
        true
    }

    /// Insert without a capacity or duplicate check
    pub(crate) fn push_sorted(&mut self, entry: Entry) {
        let pos = self.upper_index(&entry.key);
        self.occupied += entry.encoded_len();
        self.entries.insert(pos, entry);
    }

    /// Remove the first entry matching both key and item
    pub fn remove(&mut self, key: &IndexKey, item: &[u8]) -> bool {
        let start = self.lower_index(key);
        let found = self.run(key).iter().position(|e| e.item == item);
        match found {
            Some(offset) => {
                self.remove_at(start + offset);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_at(&mut self, pos: usize) -> Entry {
        let entry = self.entries.remove(pos);
        self.occupied -= entry.encoded_len();
        entry
    }

    /// Remove every entry with `key`; returns how many were removed
    pub fn remove_index(&mut self, key: &IndexKey) -> usize {
        let start = self.lower_index(key);
        let end = self.upper_index(key);
        let freed: usize = self.entries[start..end]
            .iter()
            .map(Entry::encoded_len)
            .sum();
        self.entries.drain(start..end);
        self.occupied -= freed;
        end - start
    }

    /// True if some entry has `key`
    pub fn contains_index(&self, key: &IndexKey) -> bool {
        self.entries
            .get(self.lower_index(key))
            .map_or(false, |e| e.key == *key)
    }

    /// True if an entry matches both key and item
    pub fn contains(&self, key: &IndexKey, item: &[u8]) -> bool {
        self.run(key).iter().any(|e| e.item == item)
    }

    /// Number of entries with `key`
    pub fn item_count(&self, key: &IndexKey) -> usize {
        self.upper_index(key) - self.lower_index(key)
    }

    /// Items stored under `key`, in insertion order
    pub fn get_items(&self, key: &IndexKey) -> Vec<&[u8]> {
        self.run(key).iter().map(|e| e.item.as_slice()).collect()
    }

    /// Number of distinct keys
    pub fn unique_indices_count(&self) -> usize {
        match self.entries.first() {
            None => 0,
            Some(_) => {
                1 + self
                    .entries
                    .windows(2)
                    .filter(|pair| pair[0].key != pair[1].key)
                    .count()
            }
        }
    }

    /// Move entries from `at` onward into a new block
    pub fn split(&mut self, at: usize) -> Block {
        let tail: Vec<Entry> = self.entries.split_off(at.min(self.entries.len()));
        let moved: usize = tail.iter().map(Entry::encoded_len).sum();
        self.occupied -= moved;
        Block {
            size: self.size,
            occupied: moved,
            entries: tail,
        }
    }

    /// Split near the byte midpoint
    ///
    /// A position between two different keys is preferred when both halves
    /// keep at least a quarter of the payload and fit in one block.
    pub fn split_half(&mut self) -> Block {
        let len = self.entries.len();
        if len < 2 {
            return self.split(len);
        }
        let total = self.occupied;
        let mut prefix = Vec::with_capacity(len + 1);
        prefix.push(0usize);
        for entry in &self.entries {
            let last = prefix[prefix.len() - 1];
            prefix.push(last + entry.encoded_len());
        }
        let mid = prefix
            .iter()
            .position(|&bytes| bytes * 2 >= total)
            .unwrap_or(len)
            .clamp(1, len - 1);

        let payload = self.payload();
        let fits = |at: usize| {
            let left = prefix[at];
            let right = total - left;
            left >= payload / 4 && right >= payload / 4 && left <= payload && right <= payload
        };
        let boundary = |at: usize| self.entries[at - 1].key != self.entries[at].key;

        let mut at = mid;
        for distance in 0..len {
            let below = mid.checked_sub(distance).filter(|&p| p >= 1);
            let above = Some(mid + distance).filter(|&p| p < len);
            if below.is_none() && above.is_none() {
                break;
            }
            if let Some(p) = below.filter(|&p| boundary(p) && fits(p)) {
                at = p;
                break;
            }
            if let Some(p) = above.filter(|&p| boundary(p) && fits(p)) {
                at = p;
                break;
            }
        }
        self.split(at)
    }

    /// Append every entry of `other`, whose keys must not sort before ours
    pub fn merge(&mut self, other: Block) {
        self.occupied += other.occupied;
        self.entries.extend(other.entries);
    }

    /// Encode as a leaf page
    pub fn to_page(&self, key_type: KeyType, next: PageId) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.occupied);
        for entry in &self.entries {
            entry.key.write_to(&mut body)?;
            body.write_u32::<LittleEndian>(entry.item.len() as u32)?;
            body.extend_from_slice(&entry.item);
        }
        let header = PageHeader {
            page_type: PageType::Leaf,
            key_type: key_type.to_u8(),
            count: self.entries.len() as u32,
            next,
        };
        encode_page(&header, &body, self.size)
    }

    /// Decode a leaf page, checking its checksum and key type
    ///
    /// Returns the block and the page's next pointer.
    pub fn from_page(page: &[u8], key_type: KeyType) -> Result<(Block, PageId)> {
        let (header, body) = decode_page(page)?;
        if header.page_type != PageType::Leaf {
            return Err(StorageError::Corruption(format!(
                "expected a leaf page, found {:?}",
                header.page_type
            )));
        }
        if header.key_type != key_type.to_u8() {
            return Err(StorageError::Corruption(format!(
                "page key type {} does not match index key type {}",
                header.key_type, key_type
            )));
        }
        let mut cursor = Cursor::new(body);
        let mut block = Block::new(page.len());
        for _ in 0..header.count {
            let key = IndexKey::read_from(&mut cursor, key_type)?;
            let len = cursor.read_u32::<LittleEndian>()? as usize;
            let start = cursor.position() as usize;
            let item = body
                .get(start..start + len)
                .ok_or_else(|| StorageError::Corruption("entry overruns page".to_string()))?
                .to_vec();
            cursor.set_position((start + len) as u64);
            let entry = Entry { key, item };
            if block.max_key().map_or(false, |max| *max > entry.key) {
                return Err(StorageError::Corruption("leaf entries out of order".to_string()));
            }
            block.occupied += entry.encoded_len();
            block.entries.push(entry);
        }
        Ok((block, header.next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: i32) -> IndexKey {
        IndexKey::Int32(v)
    }

    #[test]
    fn test_append_keeps_order() {
        let mut block = Block::default();
        for v in [5, 1, 3, 2, 4] {
            assert!(block.append(key(v), &[v as u8]));
        }
        let keys: Vec<_> = block.entries().iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, (1..=5).map(key).collect::<Vec<_>>());
        assert_eq!(block.min_key(), Some(&key(1)));
        assert_eq!(block.max_key(), Some(&key(5)));
    }

    #[test]
    fn test_duplicates_keep_insertion_order() {
        let mut block = Block::default();
        assert!(block.append(key(1), b"b"));
        assert!(block.append(key(2), b"z"));
        assert!(block.append(key(1), b"a"));
        assert!(block.append(key(1), b"c"));
        assert_eq!(block.get_items(&key(1)), vec![&b"b"[..], &b"a"[..], &b"c"[..]]);
        assert_eq!(block.item_count(&key(1)), 3);
        assert_eq!(block.unique_indices_count(), 2);
    }

    #[test]
    fn test_exact_duplicate_rejected() {
        let mut block = Block::default();
        assert!(block.append(key(1), b"a"));
        assert!(!block.append(key(1), b"a"));
        assert_eq!(block.count(), 1);
    }

    #[test]
    fn test_memory_accounting() {
        let mut block = Block::new(512);
        assert_eq!(block.available_memory(), 512 - PAGE_HEADER_SIZE);
        block.append(key(1), b"0123456789ab");
        assert_eq!(block.occupied_memory(), 4 + 4 + 12);
        assert_eq!(block.available_memory(), 512 - PAGE_HEADER_SIZE - 20);
        block.remove(&key(1), b"0123456789ab");
        assert_eq!(block.occupied_memory(), 0);
    }

    #[test]
    fn test_append_fails_when_full() {
        let mut block = Block::new(512);
        let mut n = 0;
        while block.append(key(n), &[0u8; 12]) {
            n += 1;
        }
        assert_eq!(n as usize, (512 - PAGE_HEADER_SIZE) / 20);
        assert!(block.available_memory() < 20);
    }

    #[test]
    fn test_remove_matches_item() {
        let mut block = Block::default();
        block.append(key(1), b"a");
        block.append(key(1), b"b");
        assert!(!block.remove(&key(1), b"c"));
        assert!(!block.remove(&key(2), b"a"));
        assert!(block.remove(&key(1), b"b"));
        assert_eq!(block.get_items(&key(1)), vec![&b"a"[..]]);
        assert!(block.contains_index(&key(1)));
        assert!(block.remove(&key(1), b"a"));
        assert!(!block.contains_index(&key(1)));
    }

    #[test]
    fn test_remove_index() {
        let mut block = Block::default();
        for item in [b"a", b"b", b"c"] {
            block.append(key(7), item);
        }
        block.append(key(8), b"x");
        assert_eq!(block.remove_index(&key(7)), 3);
        assert_eq!(block.count(), 1);
        assert_eq!(block.occupied_memory(), 4 + 4 + 1);
        assert_eq!(block.remove_index(&key(7)), 0);
    }

    #[test]
    fn test_contains() {
        let mut block = Block::default();
        block.append(key(3), b"a");
        assert!(block.contains(&key(3), b"a"));
        assert!(!block.contains(&key(3), b"b"));
        assert!(!block.contains_index(&key(4)));
    }

    #[test]
    fn test_split_and_merge() {
        let mut block = Block::default();
        for v in 0..10 {
            block.append(key(v), b"x");
        }
        let occupied = block.occupied_memory();
        let right = block.split(6);
        assert_eq!(block.count(), 6);
        assert_eq!(right.count(), 4);
        assert_eq!(right.min_key(), Some(&key(6)));
        assert_eq!(block.occupied_memory() + right.occupied_memory(), occupied);
        block.merge(right);
        assert_eq!(block.count(), 10);
        assert_eq!(block.occupied_memory(), occupied);
    }

    #[test]
    fn test_split_half_prefers_key_boundary() {
        let mut block = Block::new(512);
        for i in 0..10u8 {
            block.push_sorted(Entry::new(key(1), vec![i; 12]));
        }
        for i in 0..13u8 {
            block.push_sorted(Entry::new(key(2), vec![i; 12]));
        }
        let right = block.split_half();
        assert_eq!(block.count(), 10);
        assert_eq!(right.count(), 13);
        assert_eq!(right.min_key(), Some(&key(2)));
    }

    #[test]
    fn test_split_half_within_run() {
        let mut block = Block::new(512);
        for i in 0..30u8 {
            block.push_sorted(Entry::new(key(1), vec![i; 12]));
        }
        let right = block.split_half();
        assert_eq!(block.count(), 15);
        assert_eq!(right.count(), 15);
        assert_eq!(right.entries()[0].item, vec![15u8; 12]);
    }

    #[test]
    fn test_page_roundtrip() {
        let mut block = Block::new(512);
        block.append(IndexKey::from("b"), b"1");
        block.append(IndexKey::from("a"), b"22");
        block.append(IndexKey::from("b"), b"0");
        let page = block.to_page(KeyType::String, 4).unwrap();
        assert_eq!(page.len(), 512);
        let (decoded, next) = Block::from_page(&page, KeyType::String).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(next, 4);
    }

    #[test]
    fn test_from_page_rejects_wrong_key_type() {
        let mut block = Block::new(512);
        block.append(key(1), b"a");
        let page = block.to_page(KeyType::Int32, 0).unwrap();
        assert!(matches!(
            Block::from_page(&page, KeyType::Int64),
            Err(StorageError::Corruption(_))
        ));
    }
}
