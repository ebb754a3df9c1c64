//! Testing utilities for index correctness
//!
//! - **Reference Index**: in-memory sorted multimap tracking the expected
//!   contents of an index after any sequence of inserts and removes
//!
//! # Example
//!
//! ```ignore
//! use tapedb_storage::testing::ReferenceIndex;
//! use tapedb_storage::IndexKey;
//!
//! let mut model = ReferenceIndex::new();
//! model.insert(IndexKey::Int32(1), b"id-1".to_vec());
//!
//! // After running the same operations against an index
//! let mismatches = model.compare_find(&IndexKey::Int32(1), &actual_items);
//! assert!(mismatches.is_empty());
//! ```

mod reference_model;

pub use reference_model::{Operation, ReferenceIndex, StateMismatch};
