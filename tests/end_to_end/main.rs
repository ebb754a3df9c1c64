//! End-to-end tests through the tapedb facade
//!
//! Documents are written to an in-memory primary store as tape bytes, then
//! indexed by field the way a write path would after the append is durable.

use std::collections::HashMap;

use tapedb::{
    CompareOp, Document, FlushMode, IndexConfig, IndexDisk, KeyType, ObjectId, OidGenerator,
    StorageKind,
};
use tempfile::TempDir;

// ============================================================================
// Helper Functions
// ============================================================================

struct Collection {
    docs: HashMap<ObjectId, Vec<u8>>,
    ids: OidGenerator,
}

impl Collection {
    fn new() -> Self {
        Collection {
            docs: HashMap::new(),
            ids: OidGenerator::with_seed(7).with_timestamp(1_700_000_000),
        }
    }

    fn append(&mut self, json: &str) -> (ObjectId, Vec<u8>) {
        let doc = Document::from_json(json).unwrap();
        let bytes = doc.to_bytes().unwrap();
        let id = self.ids.generate();
        self.docs.insert(id, bytes.clone());
        (id, bytes)
    }

    fn get(&self, id: &ObjectId) -> Document {
        Document::from_bytes(&self.docs[id]).unwrap()
    }
}

fn open(
    dir: &TempDir,
    name: &str,
    field: &str,
    key_type: KeyType,
    storage: StorageKind,
) -> IndexDisk {
    let config = IndexConfig::new(field, key_type)
        .with_storage(storage)
        .with_page_size(4096)
        .with_flush(FlushMode::Manual);
    IndexDisk::open(dir.path().join(name), config).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_write_path_indexes_stored_bytes() {
    let dir = TempDir::new().unwrap();
    let mut by_age = open(&dir, "by_age", "age", KeyType::Int32, StorageKind::BTree);
    let mut by_type = open(&dir, "by_type", "type", KeyType::String, StorageKind::SegmentTree);
    let mut store = Collection::new();

    for (n, kind) in ["dog", "cat", "dog", "bird"].iter().enumerate() {
        let (id, bytes) = store.append(&format!(r#"{{"type": "{}", "age": {}}}"#, kind, n * 3));
        let age = by_age.extractor().extract_from_bytes(&bytes).unwrap();
        by_age.insert(age, id).unwrap();
        let kind = by_type.extractor().extract_from_bytes(&bytes).unwrap();
        by_type.insert(kind, id).unwrap();
    }

    let dogs = by_type.find("dog").unwrap();
    assert_eq!(dogs.len(), 2);
    for id in &dogs {
        assert_eq!(store.get(id).get_str("type"), Some("dog"));
    }

    let older: Vec<i64> = by_age
        .collect(CompareOp::Gte, 6i32)
        .unwrap()
        .iter()
        .map(|id| store.get(id).get_i64("age").unwrap())
        .collect();
    assert_eq!(older, vec![6, 9]);
}

#[test]
fn test_update_moves_index_entry() {
    let dir = TempDir::new().unwrap();
    let mut index = open(&dir, "by_count", "count", KeyType::Int64, StorageKind::BTree);
    let mut store = Collection::new();

    let (id, _) = store.append(r#"{"name": "a", "count": 1}"#);
    let mut doc = store.get(&id);
    index.insert_document(&doc, id).unwrap();

    let update = Document::from_json(r#"{"$inc": {"count": 4}}"#).unwrap();
    index.remove_document(&doc, id).unwrap();
    assert!(doc.update(&update).unwrap());
    index.insert_document(&doc, id).unwrap();

    assert!(index.find(1i64).unwrap().is_empty());
    assert_eq!(index.find(5i64).unwrap(), vec![id]);
    assert_eq!(index.count(), 1);
}

#[test]
fn test_ids_sort_in_generation_order() {
    let dir = TempDir::new().unwrap();
    let mut index = open(&dir, "by_id", "_id", KeyType::String, StorageKind::BTree);
    let mut ids = OidGenerator::with_seed(1).with_timestamp(1_600_000_000);

    let generated: Vec<ObjectId> = (0..50).map(|_| ids.generate()).collect();
    for id in generated.iter().rev() {
        index.insert(id.to_hex(), *id).unwrap();
    }
    let all = index.upper_bound("").unwrap();
    assert_eq!(all, generated);
}
