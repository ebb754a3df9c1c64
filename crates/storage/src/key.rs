//! Index keys and key extraction
//!
//! An index is declared over one document field with a fixed [`KeyType`].
//! [`KeyExtractor`] reads that field from a document and converts it to an
//! [`IndexKey`]; documents where the field is missing or not convertible are
//! skipped with a warning rather than failing the index.
//!
//! Keys are encoded little-endian: strings as `[u32 len][bytes]`, 32-bit
//! numbers in 4 bytes and 64-bit numbers in 8.

use std::cmp::Ordering;
use std::fmt;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tapedb_core::{Document, Value};
use tracing::warn;

use crate::error::{Result, StorageError};

/// Declared type of an index's keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// UTF-8 string
    String,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// Unsigned 32-bit integer
    #[serde(rename = "uint32")]
    UInt32,
    /// Unsigned 64-bit integer
    #[serde(rename = "uint64")]
    UInt64,
    /// 64-bit float
    Float64,
}

impl KeyType {
    /// On-disk tag
    pub fn to_u8(self) -> u8 {
        match self {
            KeyType::String => 1,
            KeyType::Int32 => 2,
            KeyType::Int64 => 3,
            KeyType::UInt32 => 4,
            KeyType::UInt64 => 5,
            KeyType::Float64 => 6,
        }
    }

    /// Parse an on-disk tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => KeyType::String,
            2 => KeyType::Int32,
            3 => KeyType::Int64,
            4 => KeyType::UInt32,
            5 => KeyType::UInt64,
            6 => KeyType::Float64,
            _ => return None,
        })
    }

    /// Config name
    pub fn name(self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::Int32 => "int32",
            KeyType::Int64 => "int64",
            KeyType::UInt32 => "uint32",
            KeyType::UInt64 => "uint64",
            KeyType::Float64 => "float64",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed, totally ordered index key
#[derive(Debug, Clone)]
pub enum IndexKey {
    /// String key
    String(String),
    /// Int32 key
    Int32(i32),
    /// Int64 key
    Int64(i64),
    /// UInt32 key
    UInt32(u32),
    /// UInt64 key
    UInt64(u64),
    /// Float64 key, ordered by `f64::total_cmp`
    Float64(f64),
}

impl IndexKey {
    /// Type of this key
    pub fn key_type(&self) -> KeyType {
        match self {
            IndexKey::String(_) => KeyType::String,
            IndexKey::Int32(_) => KeyType::Int32,
            IndexKey::Int64(_) => KeyType::Int64,
            IndexKey::UInt32(_) => KeyType::UInt32,
            IndexKey::UInt64(_) => KeyType::UInt64,
            IndexKey::Float64(_) => KeyType::Float64,
        }
    }

    /// Convert a document value to a key of `key_type`
    ///
    /// Integer types accept integers in range. `Float64` accepts any number.
    /// Returns `None` for everything else.
    pub fn from_value(value: &Value<'_>, key_type: KeyType) -> Option<Self> {
        match (key_type, *value) {
            (KeyType::String, Value::String(s)) => Some(IndexKey::String(s.to_string())),
            (KeyType::Int32, Value::Int(i)) => i32::try_from(i).ok().map(IndexKey::Int32),
            (KeyType::Int32, Value::UInt(u)) => i32::try_from(u).ok().map(IndexKey::Int32),
            (KeyType::Int64, Value::Int(i)) => Some(IndexKey::Int64(i)),
            (KeyType::Int64, Value::UInt(u)) => i64::try_from(u).ok().map(IndexKey::Int64),
            (KeyType::UInt32, Value::Int(i)) => u32::try_from(i).ok().map(IndexKey::UInt32),
            (KeyType::UInt32, Value::UInt(u)) => u32::try_from(u).ok().map(IndexKey::UInt32),
            (KeyType::UInt64, Value::Int(i)) => u64::try_from(i).ok().map(IndexKey::UInt64),
            (KeyType::UInt64, Value::UInt(u)) => Some(IndexKey::UInt64(u)),
            (KeyType::Float64, v) if v.is_number() => v.as_f64().ok().map(IndexKey::Float64),
            _ => None,
        }
    }

    /// Error unless this key has type `expected`
    pub fn check_type(&self, expected: KeyType) -> Result<()> {
        let actual = self.key_type();
        if actual == expected {
            Ok(())
        } else {
            Err(StorageError::KeyTypeMismatch { expected, actual })
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            IndexKey::String(s) => 4 + s.len(),
            IndexKey::Int32(_) | IndexKey::UInt32(_) => 4,
            IndexKey::Int64(_) | IndexKey::UInt64(_) | IndexKey::Float64(_) => 8,
        }
    }

    /// Append the encoded key to `out`
    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        match self {
            IndexKey::String(s) => {
                out.write_u32::<LittleEndian>(s.len() as u32)?;
                out.write_all(s.as_bytes())
            }
            IndexKey::Int32(v) => out.write_i32::<LittleEndian>(*v),
            IndexKey::Int64(v) => out.write_i64::<LittleEndian>(*v),
            IndexKey::UInt32(v) => out.write_u32::<LittleEndian>(*v),
            IndexKey::UInt64(v) => out.write_u64::<LittleEndian>(*v),
            IndexKey::Float64(v) => out.write_f64::<LittleEndian>(*v),
        }
    }

    /// Read a key of `key_type`
    pub fn read_from<R: Read>(input: &mut R, key_type: KeyType) -> Result<Self> {
        Ok(match key_type {
            KeyType::String => {
                let len = input.read_u32::<LittleEndian>()? as usize;
                let mut bytes = vec![0u8; len];
                input.read_exact(&mut bytes)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| StorageError::Corruption("key is not UTF-8".to_string()))?;
                IndexKey::String(s)
            }
            KeyType::Int32 => IndexKey::Int32(input.read_i32::<LittleEndian>()?),
            KeyType::Int64 => IndexKey::Int64(input.read_i64::<LittleEndian>()?),
            KeyType::UInt32 => IndexKey::UInt32(input.read_u32::<LittleEndian>()?),
            KeyType::UInt64 => IndexKey::UInt64(input.read_u64::<LittleEndian>()?),
            KeyType::Float64 => IndexKey::Float64(input.read_f64::<LittleEndian>()?),
        })
    }

    fn rank(&self) -> u8 {
        self.key_type().to_u8()
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::String(a), IndexKey::String(b)) => a.cmp(b),
            (IndexKey::Int32(a), IndexKey::Int32(b)) => a.cmp(b),
            (IndexKey::Int64(a), IndexKey::Int64(b)) => a.cmp(b),
            (IndexKey::UInt32(a), IndexKey::UInt32(b)) => a.cmp(b),
            (IndexKey::UInt64(a), IndexKey::UInt64(b)) => a.cmp(b),
            (IndexKey::Float64(a), IndexKey::Float64(b)) => a.total_cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::String(s) => write!(f, "{:?}", s),
            IndexKey::Int32(v) => write!(f, "{}", v),
            IndexKey::Int64(v) => write!(f, "{}", v),
            IndexKey::UInt32(v) => write!(f, "{}", v),
            IndexKey::UInt64(v) => write!(f, "{}", v),
            IndexKey::Float64(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for IndexKey {
    fn from(s: &str) -> Self {
        IndexKey::String(s.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(s: String) -> Self {
        IndexKey::String(s)
    }
}

impl From<i32> for IndexKey {
    fn from(v: i32) -> Self {
        IndexKey::Int32(v)
    }
}

impl From<i64> for IndexKey {
    fn from(v: i64) -> Self {
        IndexKey::Int64(v)
    }
}

impl From<u32> for IndexKey {
    fn from(v: u32) -> Self {
        IndexKey::UInt32(v)
    }
}

impl From<u64> for IndexKey {
    fn from(v: u64) -> Self {
        IndexKey::UInt64(v)
    }
}

impl From<f64> for IndexKey {
    fn from(v: f64) -> Self {
        IndexKey::Float64(v)
    }
}

/// Reads the indexed field of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExtractor {
    path: String,
    key_type: KeyType,
}

impl KeyExtractor {
    /// Extractor for the dotted `path` with declared type `key_type`
    pub fn new(path: impl Into<String>, key_type: KeyType) -> Self {
        KeyExtractor {
            path: path.into(),
            key_type,
        }
    }

    /// Field path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Declared key type
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Key of `doc`, or `None` if the document is skipped
    pub fn extract(&self, doc: &Document) -> Option<IndexKey> {
        let value = match doc.get(&self.path) {
            Some(value) => value,
            None => {
                warn!(path = %self.path, "indexed field missing, document skipped");
                return None;
            }
        };
        let key = IndexKey::from_value(&value, self.key_type);
        if key.is_none() {
            warn!(
                path = %self.path,
                expected = %self.key_type,
                actual = value.type_name(),
                "indexed field has an incompatible type, document skipped"
            );
        }
        key
    }

    /// Key of a document in tape binary form
    ///
    /// Undecodable bytes skip the document like a missing field.
    pub fn extract_from_bytes(&self, bytes: &[u8]) -> Option<IndexKey> {
        match Document::from_bytes(bytes) {
            Ok(doc) => self.extract(&doc),
            Err(e) => {
                warn!(path = %self.path, error = %e, "undecodable document skipped");
                None
            }
        }
    }
}
