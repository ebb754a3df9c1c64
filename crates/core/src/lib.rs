//! Document core for tapedb
//!
//! This crate defines the in-memory document model:
//! - Tape: flat 64-bit-cell binary encoding with a side string buffer
//! - TapeWriter/TapeBuilder: growable and fixed-capacity tape construction
//! - Value: typed, borrowed views over tape cells and overlay nodes
//! - Overlay: copy-on-write arena of edited dict/array nodes
//! - Document: immutable, mutable or hybrid documents with path access,
//!   mutation, the `$set`/`$inc`/`$mul`/`$unset` update language and merging
//! - Codecs: MessagePack and JSON through serde
//! - SharedKeys: dictionary encoding of repeated field names
//! - ObjectId: 12-byte time-ordered document ids
//! - Error: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod document;
pub mod error;
pub mod oid;
pub mod overlay;
pub mod shared_keys;
pub mod tape;
pub mod update;
pub mod value;

pub use codec::TapeSeed;
pub use document::{Document, DocumentState};
pub use error::{Error, Result};
pub use oid::{ObjectId, OidGenerator};
pub use overlay::{NodeId, NodeKind, Overlay, Scalar, Slot};
pub use shared_keys::{decode_with_shared_keys, encode_with_shared_keys, SharedKeys};
pub use tape::{
    FixedTapeWriter, Tape, TapeBuilder, TapeRef, TapeScalar, TapeType, TapeWriter, VecTapeWriter,
};
pub use update::{Number, UpdateOp};
pub use value::{ArrayIter, ArrayView, DictIter, DictView, Source, Value};
