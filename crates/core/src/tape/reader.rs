//! Bounds-checked tape navigation

use super::{Tape, TapeType, TYPE_SHIFT, VALUE_MASK};
use crate::error::{Error, Result};

/// Scalar types that can be read from a tape position
///
/// Types narrower than 8 bytes are inlined in the header cell; wider types
/// are stored in the cell(s) following the header.
pub trait TapeScalar: Sized {
    /// Number of payload cells after the header (0 for inline types)
    const PAYLOAD_CELLS: usize;

    /// Decode from the header cell and the payload cells
    fn from_cells(header: u64, payload: &[u64]) -> Self;
}

macro_rules! inline_scalar {
    ($($ty:ty => $conv:expr),* $(,)?) => {
        $(
            impl TapeScalar for $ty {
                const PAYLOAD_CELLS: usize = 0;

                fn from_cells(header: u64, _payload: &[u64]) -> Self {
                    let conv: fn(u64) -> $ty = $conv;
                    conv(header & VALUE_MASK)
                }
            }
        )*
    };
}

inline_scalar! {
    i8 => |v| v as u8 as i8,
    i16 => |v| v as u16 as i16,
    i32 => |v| v as u32 as i32,
    u8 => |v| v as u8,
    u16 => |v| v as u16,
    u32 => |v| v as u32,
    f32 => |v| f32::from_bits(v as u32),
}

impl TapeScalar for i64 {
    const PAYLOAD_CELLS: usize = 1;

    fn from_cells(_header: u64, payload: &[u64]) -> Self {
        payload[0] as i64
    }
}

impl TapeScalar for u64 {
    const PAYLOAD_CELLS: usize = 1;

    fn from_cells(_header: u64, payload: &[u64]) -> Self {
        payload[0]
    }
}

impl TapeScalar for f64 {
    const PAYLOAD_CELLS: usize = 1;

    fn from_cells(_header: u64, payload: &[u64]) -> Self {
        f64::from_bits(payload[0])
    }
}

impl TapeScalar for i128 {
    const PAYLOAD_CELLS: usize = 2;

    fn from_cells(_header: u64, payload: &[u64]) -> Self {
        ((payload[1] as u128) << 64 | payload[0] as u128) as i128
    }
}

/// A position on a tape
#[derive(Debug, Clone, Copy)]
pub struct TapeRef<'a> {
    tape: &'a Tape,
    index: usize,
}

impl<'a> TapeRef<'a> {
    /// Wrap a tape position
    pub fn new(tape: &'a Tape, index: usize) -> Self {
        TapeRef { tape, index }
    }

    /// Cell index of this position
    pub fn index(&self) -> usize {
        self.index
    }

    /// The underlying tape
    pub fn tape(&self) -> &'a Tape {
        self.tape
    }

    /// Raw header cell
    pub fn cell(&self) -> Result<u64> {
        self.tape.cell(self.index)
    }

    /// Type tag of the header cell
    pub fn tape_type(&self) -> Result<TapeType> {
        let cell = self.cell()?;
        let tag = (cell >> TYPE_SHIFT) as u8;
        TapeType::from_u8(tag).ok_or_else(|| {
            Error::Malformed(format!("unknown type tag {:#04x} at {}", tag, self.index))
        })
    }

    /// 56-bit payload of the header cell
    pub fn tape_value(&self) -> Result<u64> {
        Ok(self.cell()? & VALUE_MASK)
    }

    fn top_byte_is(&self, ty: TapeType) -> bool {
        matches!(self.cell(), Ok(cell) if (cell >> TYPE_SHIFT) as u8 == ty as u8)
    }

    fn cell_is(&self, ty: TapeType) -> bool {
        matches!(self.cell(), Ok(cell) if cell == ty.pattern())
    }

    /// True if this is `null`
    pub fn is_null(&self) -> bool {
        self.top_byte_is(TapeType::Null)
    }

    /// True if this is a boolean
    pub fn is_bool(&self) -> bool {
        self.top_byte_is(TapeType::True) || self.top_byte_is(TapeType::False)
    }

    /// True if this is an inline `i8`
    pub fn is_int8(&self) -> bool {
        self.top_byte_is(TapeType::Int8)
    }

    /// True if this is an inline `i16`
    pub fn is_int16(&self) -> bool {
        self.top_byte_is(TapeType::Int16)
    }

    /// True if this is an inline `i32`
    pub fn is_int32(&self) -> bool {
        self.top_byte_is(TapeType::Int32)
    }

    /// True if this is an `i64` header
    pub fn is_int64(&self) -> bool {
        self.cell_is(TapeType::Int64)
    }

    /// True if this is an `i128` header
    pub fn is_int128(&self) -> bool {
        self.cell_is(TapeType::Int128)
    }

    /// True if this is an inline `u8`
    pub fn is_uint8(&self) -> bool {
        self.top_byte_is(TapeType::UInt8)
    }

    /// True if this is an inline `u16`
    pub fn is_uint16(&self) -> bool {
        self.top_byte_is(TapeType::UInt16)
    }

    /// True if this is an inline `u32`
    pub fn is_uint32(&self) -> bool {
        self.top_byte_is(TapeType::UInt32)
    }

    /// True if this is a `u64` header
    pub fn is_uint64(&self) -> bool {
        self.cell_is(TapeType::UInt64)
    }

    /// True if this is an inline `f32`
    pub fn is_float(&self) -> bool {
        self.top_byte_is(TapeType::Float)
    }

    /// True if this is an `f64` header
    pub fn is_double(&self) -> bool {
        self.cell_is(TapeType::Double)
    }

    /// True if this is a string
    pub fn is_string(&self) -> bool {
        self.top_byte_is(TapeType::String)
    }

    /// True if this is an array start
    pub fn is_array(&self) -> bool {
        self.top_byte_is(TapeType::ArrayStart)
    }

    /// True if this is a dict start
    pub fn is_dict(&self) -> bool {
        self.top_byte_is(TapeType::DictStart)
    }

    /// Read a scalar, taking payload cells into account
    pub fn next_tape_value<T: TapeScalar>(&self) -> Result<T> {
        let header = self.cell()?;
        let start = self.index + 1;
        let end = start + T::PAYLOAD_CELLS;
        if end > self.tape.len() {
            return Err(Error::OutOfRange {
                index: end - 1,
                len: self.tape.len(),
            });
        }
        Ok(T::from_cells(header, &self.tape.cells()[start..end]))
    }

    /// String stored at this position
    pub fn get_str(&self) -> Result<&'a str> {
        let ty = self.tape_type()?;
        match ty {
            TapeType::String => self.tape.string_at(self.tape_value()? as usize),
            other => Err(Error::TypeMismatch {
                expected: "string",
                actual: other.name(),
            }),
        }
    }

    /// Length in bytes of the string at this position
    pub fn get_string_length(&self) -> Result<usize> {
        Ok(self.get_str()?.len())
    }

    /// Index of the end cell of the container starting here
    pub fn matching_end(&self) -> Result<usize> {
        match self.tape_type()? {
            TapeType::ArrayStart | TapeType::DictStart => {
                Ok((self.tape_value()? & 0xFFFF_FFFF) as usize)
            }
            other => Err(Error::TypeMismatch {
                expected: "container",
                actual: other.name(),
            }),
        }
    }

    /// Number of elements of the container starting here
    pub fn element_count(&self) -> Result<usize> {
        self.matching_end()?;
        Ok((self.tape_value()? >> 32) as usize)
    }

    /// Index of the cell just past this value
    pub fn after(&self) -> Result<usize> {
        let ty = self.tape_type()?;
        match ty {
            TapeType::ArrayStart | TapeType::DictStart => Ok(self.matching_end()? + 1),
            _ => Ok(self.index + ty.width()),
        }
    }
}
