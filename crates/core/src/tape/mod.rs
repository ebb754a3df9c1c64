//! Binary tape encoding
//!
//! A tape is a flat sequence of 64-bit cells plus a side buffer of strings.
//! The top byte of every cell is a [`TapeType`] tag; the low 56 bits hold an
//! inline value, an offset into the string buffer, or a link to the matching
//! end cell of a container.
//!
//! Layout rules:
//! - 8/16/32-bit integers and `f32` are inlined in the low bits of one cell
//! - `i64`/`u64`/`f64` use a header cell followed by one payload cell
//! - `i128` uses a header cell followed by two payload cells (low, then high)
//! - strings live in the string buffer as `[u32 len][bytes][0]`
//! - a container start cell stores the index of its end cell (low 32 bits)
//!   and its element count (bits 32..56); the end cell stores the index of
//!   its start cell
//!
//! Serialized form: `[u8 format][u32 cells][u32 string bytes][cells LE][strings]`.

pub mod builder;
pub mod reader;
pub mod writer;

pub use builder::TapeBuilder;
pub use reader::{TapeRef, TapeScalar};
pub use writer::{FixedTapeWriter, TapeWriter, VecTapeWriter};

use crate::error::{Error, Result};

/// Bit position of the type tag within a cell
pub const TYPE_SHIFT: u32 = 56;

/// Mask selecting the 56-bit payload of a cell
pub const VALUE_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

/// Maximum container nesting accepted when validating a tape
pub const MAX_NESTING_DEPTH: usize = 128;

/// Format tag of a plain tape
pub const TAPE_FORMAT: u8 = 0x01;

/// Format tag of a tape whose dict keys may be shared-key references
pub const SHARED_TAPE_FORMAT: u8 = 0x02;

/// Size of the serialized tape header
pub const TAPE_HEADER_SIZE: usize = 9;

/// Bytes of string-buffer overhead per string (length prefix + nul)
pub const STRING_OVERHEAD: usize = 5;

// =============================================================================
// Cell types
// =============================================================================

/// Physical type tag stored in the top byte of a tape cell
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapeType {
    /// `null`
    Null = b'n',
    /// `true`
    True = b't',
    /// `false`
    False = b'f',
    /// Inline `i8`
    Int8 = 0x01,
    /// Inline `i16`
    Int16 = 0x02,
    /// Inline `i32`
    Int32 = 0x03,
    /// `i64` in the following cell
    Int64 = b'l',
    /// `i128` in the following two cells
    Int128 = 0x04,
    /// Inline `u8`
    UInt8 = 0x05,
    /// Inline `u16`
    UInt16 = 0x06,
    /// Inline `u32`
    UInt32 = 0x07,
    /// `u64` in the following cell
    UInt64 = b'u',
    /// Inline `f32`
    Float = 0x08,
    /// `f64` in the following cell
    Double = b'd',
    /// String buffer offset
    String = b'"',
    /// Start of an array
    ArrayStart = b'[',
    /// End of an array
    ArrayEnd = b']',
    /// Start of a dict
    DictStart = b'{',
    /// End of a dict
    DictEnd = b'}',
    /// Shared-key table id in dict key position
    SharedKey = b'k',
}

impl TapeType {
    /// Decode a type tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        let ty = match tag {
            b'n' => TapeType::Null,
            b't' => TapeType::True,
            b'f' => TapeType::False,
            0x01 => TapeType::Int8,
            0x02 => TapeType::Int16,
            0x03 => TapeType::Int32,
            b'l' => TapeType::Int64,
            0x04 => TapeType::Int128,
            0x05 => TapeType::UInt8,
            0x06 => TapeType::UInt16,
            0x07 => TapeType::UInt32,
            b'u' => TapeType::UInt64,
            0x08 => TapeType::Float,
            b'd' => TapeType::Double,
            b'"' => TapeType::String,
            b'[' => TapeType::ArrayStart,
            b']' => TapeType::ArrayEnd,
            b'{' => TapeType::DictStart,
            b'}' => TapeType::DictEnd,
            b'k' => TapeType::SharedKey,
            _ => return None,
        };
        Some(ty)
    }

    /// Number of cells a value of this type occupies, counting the header
    pub fn width(self) -> usize {
        match self {
            TapeType::Int64 | TapeType::UInt64 | TapeType::Double => 2,
            TapeType::Int128 => 3,
            _ => 1,
        }
    }

    /// Header cell with an empty payload, used for pattern comparisons
    pub const fn pattern(self) -> u64 {
        (self as u64) << TYPE_SHIFT
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            TapeType::Null => "null",
            TapeType::True | TapeType::False => "bool",
            TapeType::Int8 => "int8",
            TapeType::Int16 => "int16",
            TapeType::Int32 => "int32",
            TapeType::Int64 => "int64",
            TapeType::Int128 => "int128",
            TapeType::UInt8 => "uint8",
            TapeType::UInt16 => "uint16",
            TapeType::UInt32 => "uint32",
            TapeType::UInt64 => "uint64",
            TapeType::Float => "float",
            TapeType::Double => "double",
            TapeType::String => "string",
            TapeType::ArrayStart | TapeType::ArrayEnd => "array",
            TapeType::DictStart | TapeType::DictEnd => "dict",
            TapeType::SharedKey => "shared key",
        }
    }
}

/// Compose a cell from a type tag and a payload
#[inline]
pub fn make_cell(ty: TapeType, payload: u64) -> u64 {
    ty.pattern() | (payload & VALUE_MASK)
}

/// Compose a container start cell
#[inline]
pub fn container_cell(ty: TapeType, end: usize, count: usize) -> u64 {
    let count = count.min(0x00FF_FFFF) as u64;
    make_cell(ty, (count << 32) | (end as u64 & 0xFFFF_FFFF))
}

// =============================================================================
// Tape
// =============================================================================

/// A finished, immutable tape: cells plus string buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tape {
    pub(crate) cells: Vec<u64>,
    pub(crate) strings: Vec<u8>,
}

impl Tape {
    /// Number of cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True if the tape has no cells
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Raw cells
    pub fn cells(&self) -> &[u64] {
        &self.cells
    }

    /// Raw string buffer
    pub fn string_buffer(&self) -> &[u8] {
        &self.strings
    }

    /// Bounds-checked cell access
    pub fn cell(&self, index: usize) -> Result<u64> {
        self.cells.get(index).copied().ok_or(Error::OutOfRange {
            index,
            len: self.cells.len(),
        })
    }

    /// Reference to the value at `index`
    pub fn at(&self, index: usize) -> TapeRef<'_> {
        TapeRef::new(self, index)
    }

    /// Reference to the root value
    pub fn root(&self) -> TapeRef<'_> {
        TapeRef::new(self, 0)
    }

    /// Read the string stored at `offset` in the string buffer
    pub fn string_at(&self, offset: usize) -> Result<&str> {
        let body = offset
            .checked_add(4)
            .filter(|end| *end <= self.strings.len())
            .ok_or_else(|| Error::Malformed(format!("string offset {} out of bounds", offset)))?;
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.strings[offset..body]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let end = body + len;
        if end >= self.strings.len() || self.strings[end] != 0 {
            return Err(Error::Malformed(format!(
                "string at offset {} is truncated",
                offset
            )));
        }
        std::str::from_utf8(&self.strings[body..end])
            .map_err(|_| Error::Malformed(format!("string at offset {} is not UTF-8", offset)))
    }

    /// Serialize to the binary tape form
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode(TAPE_FORMAT)
    }

    /// Parse and validate a plain binary tape
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes, TAPE_FORMAT)
    }

    pub(crate) fn encode(&self, format: u8) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(TAPE_HEADER_SIZE + self.cells.len() * 8 + self.strings.len());
        out.push(format);
        out.extend_from_slice(&(self.cells.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        for cell in &self.cells {
            out.extend_from_slice(&cell.to_le_bytes());
        }
        out.extend_from_slice(&self.strings);
        out
    }

    pub(crate) fn decode(bytes: &[u8], format: u8) -> Result<Self> {
        if bytes.len() < TAPE_HEADER_SIZE {
            return Err(Error::Malformed(format!(
                "tape too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != format {
            return Err(Error::Malformed(format!(
                "unexpected tape format tag {:#04x}",
                bytes[0]
            )));
        }
        let read_u32 = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf) as usize
        };
        let cell_count = read_u32(1);
        let string_len = read_u32(5);
        let expected = cell_count
            .checked_mul(8)
            .and_then(|n| n.checked_add(TAPE_HEADER_SIZE + string_len))
            .ok_or_else(|| Error::Malformed("tape length overflow".to_string()))?;
        if bytes.len() != expected {
            return Err(Error::Malformed(format!(
                "tape length mismatch: header says {}, got {}",
                expected,
                bytes.len()
            )));
        }

        let cells_end = TAPE_HEADER_SIZE + cell_count * 8;
        let cells = bytes[TAPE_HEADER_SIZE..cells_end]
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect();
        let tape = Tape {
            cells,
            strings: bytes[cells_end..].to_vec(),
        };
        tape.validate(format == SHARED_TAPE_FORMAT)?;
        Ok(tape)
    }

    /// Check that the tape holds exactly one well-formed root value
    pub(crate) fn validate(&self, allow_shared_keys: bool) -> Result<()> {
        if self.cells.is_empty() {
            return Err(Error::Malformed("empty tape".to_string()));
        }
        let end = self.validate_value(0, 0, allow_shared_keys)?;
        if end != self.cells.len() {
            return Err(Error::Malformed(format!(
                "trailing cells after root value at {}",
                end
            )));
        }
        Ok(())
    }

    fn cell_type(&self, index: usize) -> Result<(TapeType, u64)> {
        let cell = self.cell(index)?;
        let tag = (cell >> TYPE_SHIFT) as u8;
        let ty = TapeType::from_u8(tag).ok_or_else(|| {
            Error::Malformed(format!("unknown type tag {:#04x} at {}", tag, index))
        })?;
        Ok((ty, cell & VALUE_MASK))
    }

    fn validate_value(&self, index: usize, depth: usize, shared: bool) -> Result<usize> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::Malformed("nesting too deep".to_string()));
        }
        let (ty, payload) = self.cell_type(index)?;
        match ty {
            TapeType::String => {
                self.string_at(payload as usize)?;
                Ok(index + 1)
            }
            TapeType::ArrayStart | TapeType::DictStart => {
                let end = (payload & 0xFFFF_FFFF) as usize;
                if end <= index {
                    return Err(Error::Malformed(format!(
                        "container at {} links backwards",
                        index
                    )));
                }
                let mut i = index + 1;
                while i < end {
                    if ty == TapeType::DictStart {
                        i = self.validate_key(i, shared)?;
                        if i >= end {
                            return Err(Error::Malformed(format!(
                                "dict at {} has a key without a value",
                                index
                            )));
                        }
                    }
                    i = self.validate_value(i, depth + 1, shared)?;
                }
                if i != end {
                    return Err(Error::Malformed(format!(
                        "container at {} overruns its end cell",
                        index
                    )));
                }
                let expected_end = if ty == TapeType::ArrayStart {
                    TapeType::ArrayEnd
                } else {
                    TapeType::DictEnd
                };
                let (end_ty, back) = self.cell_type(end)?;
                if end_ty != expected_end || back as usize != index {
                    return Err(Error::Malformed(format!(
                        "container at {} has a mismatched end cell",
                        index
                    )));
                }
                Ok(end + 1)
            }
            TapeType::ArrayEnd | TapeType::DictEnd | TapeType::SharedKey => Err(Error::Malformed(
                format!("unexpected {} cell at {}", ty.name(), index),
            )),
            _ => {
                let width = ty.width();
                if width > 1 {
                    self.cell(index + width - 1)?;
                }
                Ok(index + width)
            }
        }
    }

    fn validate_key(&self, index: usize, shared: bool) -> Result<usize> {
        let (ty, payload) = self.cell_type(index)?;
        match ty {
            TapeType::String => {
                self.string_at(payload as usize)?;
                Ok(index + 1)
            }
            TapeType::SharedKey if shared => Ok(index + 1),
            other => Err(Error::Malformed(format!(
                "dict key at {} is a {} cell",
                index,
                other.name()
            ))),
        }
    }
}
