//! Reference model for tracking expected index contents
//!
//! The reference index keeps an in-memory sorted multimap of the entries an
//! index should hold, so property tests can compare any index layout
//! against it.
//!
//! # Example
//!
//! ```ignore
//! use tapedb_storage::testing::ReferenceIndex;
//!
//! let mut model = ReferenceIndex::new();
//! model.insert(IndexKey::Int32(5), b"a".to_vec());
//! model.insert(IndexKey::Int32(5), b"b".to_vec());
//! model.remove(&IndexKey::Int32(5), b"a");
//!
//! let mismatches = model.compare_find(&IndexKey::Int32(5), &actual);
//! assert!(mismatches.is_empty());
//! ```

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::index::{above_lower, below_upper, ScanDirection};
use crate::key::IndexKey;

/// Reference index tracking expected entries
///
/// Entries sharing a key keep insertion order and an exact `(key, item)`
/// pair is held at most once, matching the on-disk layouts.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    /// key -> items in insertion order
    entries: BTreeMap<IndexKey, Vec<Vec<u8>>>,
    /// Applied operations in order
    committed_ops: Vec<Operation>,
}

/// Operation recorded in the reference index
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Insert of one entry
    Insert {
        /// Key
        key: IndexKey,
        /// Item bytes
        item: Vec<u8>,
    },
    /// Removal of one entry
    Remove {
        /// Key
        key: IndexKey,
        /// Item bytes
        item: Vec<u8>,
    },
    /// Removal of every entry under a key
    RemoveIndex {
        /// Key
        key: IndexKey,
    },
}

impl ReferenceIndex {
    /// Create a new empty reference index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an insert; returns false if the exact entry exists
    pub fn insert(&mut self, key: IndexKey, item: Vec<u8>) -> bool {
        let items = self.entries.entry(key.clone()).or_default();
        if items.contains(&item) {
            return false;
        }
        items.push(item.clone());
        self.committed_ops.push(Operation::Insert { key, item });
        true
    }

    /// Record a removal; returns false if the entry is absent
    pub fn remove(&mut self, key: &IndexKey, item: &[u8]) -> bool {
        let removed = match self.entries.get_mut(key) {
            Some(items) => match items.iter().position(|i| i.as_slice() == item) {
                Some(pos) => {
                    items.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        };
        if !removed {
            return false;
        }
        if self.entries.get(key).map_or(false, Vec::is_empty) {
            self.entries.remove(key);
        }
        self.committed_ops.push(Operation::Remove {
            key: key.clone(),
            item: item.to_vec(),
        });
        true
    }

    /// Record removal of a whole key; returns how many entries went
    pub fn remove_index(&mut self, key: &IndexKey) -> usize {
        let removed = self.entries.remove(key).map_or(0, |items| items.len());
        self.committed_ops
            .push(Operation::RemoveIndex { key: key.clone() });
        removed
    }

    /// True if some entry has `key`
    pub fn contains_index(&self, key: &IndexKey) -> bool {
        self.entries.contains_key(key)
    }

    /// True if the exact entry exists
    pub fn contains(&self, key: &IndexKey, item: &[u8]) -> bool {
        self.entries
            .get(key)
            .map_or(false, |items| items.iter().any(|i| i.as_slice() == item))
    }

    /// Expected items under `key`
    pub fn find(&self, key: &IndexKey) -> Vec<Vec<u8>> {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    /// Expected entries within bounds in `direction` order
    pub fn scan(
        &self,
        lower: Bound<&IndexKey>,
        upper: Bound<&IndexKey>,
        direction: ScanDirection,
    ) -> Vec<(IndexKey, Vec<u8>)> {
        let in_range = |key: &IndexKey| above_lower(key, lower) && below_upper(key, upper);
        let mut out: Vec<(IndexKey, Vec<u8>)> = self
            .entries
            .iter()
            .filter(|(key, _)| in_range(*key))
            .flat_map(|(key, items)| items.iter().map(move |i| (key.clone(), i.clone())))
            .collect();
        if direction == ScanDirection::Descending {
            out.reverse();
        }
        out
    }

    /// Expected items with keys strictly below `key`, ascending
    pub fn lower_bound(&self, key: &IndexKey) -> Vec<Vec<u8>> {
        self.scan(Bound::Unbounded, Bound::Excluded(key), ScanDirection::Ascending)
            .into_iter()
            .map(|(_, item)| item)
            .collect()
    }

    /// Expected items with keys strictly above `key`, ascending
    pub fn upper_bound(&self, key: &IndexKey) -> Vec<Vec<u8>> {
        self.scan(Bound::Excluded(key), Bound::Unbounded, ScanDirection::Ascending)
            .into_iter()
            .map(|(_, item)| item)
            .collect()
    }

    /// Distinct keys in order
    pub fn keys(&self) -> Vec<IndexKey> {
        self.entries.keys().cloned().collect()
    }

    /// Expected number of entries
    pub fn count(&self) -> u64 {
        self.entries.values().map(|items| items.len() as u64).sum()
    }

    /// Expected number of distinct keys
    pub fn unique_indices_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Get applied operations
    pub fn operations(&self) -> &[Operation] {
        &self.committed_ops
    }

    /// Compare expected items under `key` against actual
    ///
    /// Returns list of mismatches found.
    pub fn compare_find(&self, key: &IndexKey, actual: &[Vec<u8>]) -> Vec<StateMismatch> {
        let mut mismatches = Vec::new();
        let expected = self.entries.get(key).map(Vec::as_slice).unwrap_or(&[]);

        if expected.len() != actual.len() {
            mismatches.push(StateMismatch {
                entity: format!("find:{}:count", key),
                expected: expected.len().to_string(),
                actual: actual.len().to_string(),
            });
        }

        for (i, (exp, act)) in expected.iter().zip(actual.iter()).enumerate() {
            if exp != act {
                mismatches.push(StateMismatch {
                    entity: format!("find:{}:{}", key, i),
                    expected: format!("{:?}", exp),
                    actual: format!("{:?}", act),
                });
            }
        }

        mismatches
    }

    /// Compare expected keys against the keys of an ascending full scan
    pub fn compare_keys(&self, actual: &[IndexKey]) -> Vec<StateMismatch> {
        let mut mismatches = Vec::new();
        for key in self.entries.keys() {
            if actual.binary_search(key).is_err() {
                mismatches.push(StateMismatch {
                    entity: format!("key:{}", key),
                    expected: "present".to_string(),
                    actual: "not found".to_string(),
                });
            }
        }
        for key in actual {
            if !self.entries.contains_key(key) {
                mismatches.push(StateMismatch {
                    entity: format!("key:{}", key),
                    expected: "not present".to_string(),
                    actual: "found".to_string(),
                });
            }
        }
        mismatches
    }

    /// Reset model to empty state
    pub fn reset(&mut self) {
        self.entries.clear();
        self.committed_ops.clear();
    }
}

/// State mismatch found during comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMismatch {
    /// Entity identifier (e.g., "find:5:count")
    pub entity: String,
    /// Expected value
    pub expected: String,
    /// Actual value
    pub actual: String,
}

impl std::fmt::Display for StateMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: expected {}, got {}",
            self.entity, self.expected, self.actual
        )
    }
}
