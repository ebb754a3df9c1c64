//! Shared-key dictionary encoding
//!
//! Documents in one collection tend to repeat the same field names. A
//! [`SharedKeys`] table assigns small integer ids to short identifier-like
//! keys so an encoded document can store the id in a `SHARED_KEY` cell instead
//! of a copy of the string.
//!
//! A key is eligible if it is at most [`MAX_KEY_LENGTH`] bytes of
//! `[A-Za-z0-9_-]`. The table holds at most [`MAX_COUNT`] keys; once full,
//! new keys are written as plain strings.

use rustc_hash::FxHashMap;

use crate::document::{write_value, Document};
use crate::error::{Error, Result};
use crate::tape::{
    Tape, TapeBuilder, TapeType, TapeWriter, VecTapeWriter, SHARED_TAPE_FORMAT,
};

/// Maximum number of keys in a table
pub const MAX_COUNT: usize = 2048;

/// Maximum byte length of an eligible key
pub const MAX_KEY_LENGTH: usize = 16;

/// Table mapping short field names to ids
#[derive(Debug, Clone, Default)]
pub struct SharedKeys {
    by_key: Vec<String>,
    table: FxHashMap<String, u16>,
}

impl SharedKeys {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `key` may be stored in the table
    pub fn is_eligible(key: &str) -> bool {
        key.len() <= MAX_KEY_LENGTH
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }

    /// Number of keys
    pub fn count(&self) -> usize {
        self.by_key.len()
    }

    /// Keys in id order
    pub fn by_key(&self) -> &[String] {
        &self.by_key
    }

    /// Id of a key already in the table
    pub fn encode(&self, key: &str) -> Option<u16> {
        self.table.get(key).copied()
    }

    /// Id of `key`, adding it if eligible and the table has room
    pub fn encode_and_add(&mut self, key: &str) -> Option<u16> {
        if let Some(id) = self.encode(key) {
            return Some(id);
        }
        if self.by_key.len() >= MAX_COUNT || !Self::is_eligible(key) {
            return None;
        }
        let id = self.by_key.len() as u16;
        self.by_key.push(key.to_string());
        self.table.insert(key.to_string(), id);
        Some(id)
    }

    /// Key for an id
    pub fn decode(&self, id: u16) -> Option<&str> {
        self.by_key.get(id as usize).map(String::as_str)
    }

    /// Drop every key added after the first `count`
    pub fn revert_to_count(&mut self, count: usize) {
        if count >= self.by_key.len() {
            return;
        }
        for key in self.by_key.drain(count..) {
            self.table.remove(&key);
        }
    }
}

/// Encode a document, replacing eligible dict keys with table ids
///
/// New keys are added to `keys`. On failure the table is reverted to its
/// previous size.
pub fn encode_with_shared_keys(doc: &Document, keys: &mut SharedKeys) -> Result<Vec<u8>> {
    let before = keys.count();
    let mut builder = TapeBuilder::new(VecTapeWriter::new());
    let result = write_value(&mut builder, doc.root(), Some(&mut *keys))
        .and_then(|_| builder.into_writer());
    match result {
        Ok(writer) => Ok(writer.into_tape().encode(SHARED_TAPE_FORMAT)),
        Err(e) => {
            keys.revert_to_count(before);
            Err(e)
        }
    }
}

/// Decode bytes produced by [`encode_with_shared_keys`]
pub fn decode_with_shared_keys(bytes: &[u8], keys: &SharedKeys) -> Result<Document> {
    let shared = Tape::decode(bytes, SHARED_TAPE_FORMAT)?;
    let mut builder = TapeBuilder::new(VecTapeWriter::new());
    expand(&shared, 0, &mut builder, keys)?;
    Ok(Document::from_valid_tape(builder.into_writer()?.into_tape()))
}

fn expand<W: TapeWriter>(
    tape: &Tape,
    index: usize,
    builder: &mut TapeBuilder<W>,
    keys: &SharedKeys,
) -> Result<usize> {
    let at = tape.at(index);
    match at.tape_type()? {
        TapeType::Null => builder.build_null()?,
        TapeType::True => builder.build_bool(true)?,
        TapeType::False => builder.build_bool(false)?,
        TapeType::Int8 => builder.build_i64(at.next_tape_value::<i8>()? as i64)?,
        TapeType::Int16 => builder.build_i64(at.next_tape_value::<i16>()? as i64)?,
        TapeType::Int32 => builder.build_i64(at.next_tape_value::<i32>()? as i64)?,
        TapeType::Int64 => builder.build_i64(at.next_tape_value::<i64>()?)?,
        TapeType::Int128 => builder.build_i128(at.next_tape_value::<i128>()?)?,
        TapeType::UInt8 => builder.build_u64(at.next_tape_value::<u8>()? as u64)?,
        TapeType::UInt16 => builder.build_u64(at.next_tape_value::<u16>()? as u64)?,
        TapeType::UInt32 => builder.build_u64(at.next_tape_value::<u32>()? as u64)?,
        TapeType::UInt64 => builder.build_u64(at.next_tape_value::<u64>()?)?,
        TapeType::Float => builder.build_f32(at.next_tape_value::<f32>()?)?,
        TapeType::Double => builder.build_f64(at.next_tape_value::<f64>()?)?,
        TapeType::String => builder.build_str(at.get_str()?)?,
        TapeType::ArrayStart => {
            let end = at.matching_end()?;
            builder.start_array()?;
            let mut i = index + 1;
            while i < end {
                i = expand(tape, i, builder, keys)?;
            }
            builder.end_array()?;
        }
        TapeType::DictStart => {
            let end = at.matching_end()?;
            builder.start_dict()?;
            let mut i = index + 1;
            while i < end {
                let key_at = tape.at(i);
                match key_at.tape_type()? {
                    TapeType::SharedKey => {
                        let id = key_at.tape_value()? as u16;
                        let key = keys.decode(id).ok_or_else(|| {
                            Error::Malformed(format!("unknown shared key id {}", id))
                        })?;
                        builder.build_str(key)?;
                    }
                    _ => builder.build_str(key_at.get_str()?)?,
                }
                i = expand(tape, i + 1, builder, keys)?;
            }
            builder.end_dict()?;
        }
        other => {
            return Err(Error::Malformed(format!(
                "unexpected {} cell at {}",
                other.name(),
                index
            )))
        }
    }
    at.after()
}
