//! Disk-backed secondary indexes for tapedb
//!
//! This crate indexes documents by one field:
//! - KeyExtractor: typed, ordered keys read from a document field
//! - Block: sorted in-memory node of `(key, item)` entries
//! - PageFile: fixed-size checksummed pages with a free list
//! - BTree: balanced B+tree of blocks with a node cache
//! - SegmentTree: flat linked sequence of blocks with a directory sidecar
//! - IndexDisk: the public index API over either layout, configured by
//!   `index.toml`
//!
//! # Ordering
//!
//! Entries sharing a key keep insertion order. An exact `(key, item)` pair
//! is stored once; removal matches both key and item.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod btree;
pub mod config;
pub mod error;
pub mod file;
pub mod index;
pub mod key;
pub mod page;
pub mod segment_tree;
pub mod testing;

pub use block::{Block, Entry, DEFAULT_BLOCK_SIZE};
pub use btree::{BTree, InternalNode, TreeStats};
pub use config::{FlushMode, IndexConfig, StorageKind, CONFIG_FILE_NAME};
pub use error::{Result, StorageError};
pub use file::{Meta, PageFile};
pub use index::{CompareOp, IndexDisk, IndexStorage, KeyRange, ScanDirection, PAGES_FILE_NAME};
pub use key::{IndexKey, KeyExtractor, KeyType};
pub use page::{PageHeader, PageId, PageType, PAGE_HEADER_SIZE};
pub use segment_tree::{SegmentStats, SegmentTree, MERGE_CHECK};
