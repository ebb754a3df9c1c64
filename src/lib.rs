//! tapedb - embedded document storage core
//!
//! tapedb stores schema-less documents in a compact binary tape and indexes
//! them by field on disk.
//!
//! # Quick Start
//!
//! ```ignore
//! use tapedb::{Document, IndexConfig, IndexDisk, KeyType, OidGenerator};
//!
//! let mut ids = OidGenerator::new();
//! let mut index = IndexDisk::open("data/by_age", IndexConfig::new("age", KeyType::Int32))?;
//!
//! let doc = Document::from_json(r#"{"name": "rex", "age": 6}"#)?;
//! index.insert_document(&doc, ids.generate())?;
//!
//! let puppies = index.lower_bound(2)?;
//! ```
//!
//! # Architecture
//!
//! - [`tapedb_core`]: tape encoding, values and overlays, documents, codecs,
//!   shared keys and object ids
//! - [`tapedb_storage`]: key extraction, blocks, page files, the B+tree and
//!   segment tree layouts, and the [`IndexDisk`] facade

pub use tapedb_core;
pub use tapedb_storage;

pub use tapedb_core::{
    decode_with_shared_keys, encode_with_shared_keys, Document, DocumentState, Error, ObjectId,
    OidGenerator, SharedKeys, Tape, Value,
};
pub use tapedb_storage::{
    CompareOp, FlushMode, IndexConfig, IndexDisk, IndexKey, KeyRange, KeyType, ScanDirection,
    StorageError, StorageKind,
};
