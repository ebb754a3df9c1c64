//! Value-level tape construction
//!
//! [`TapeBuilder`] turns values into cells, choosing the narrowest integer
//! encoding, and links container start/end cells once a container is closed.

use smallvec::SmallVec;

use super::writer::TapeWriter;
use super::{container_cell, make_cell, TapeType};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct OpenContainer {
    start: usize,
    kind: TapeType,
    items: usize,
}

/// Emits values into a [`TapeWriter`]
pub struct TapeBuilder<W> {
    writer: W,
    open: SmallVec<[OpenContainer; 16]>,
}

impl<W: TapeWriter> TapeBuilder<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        TapeBuilder {
            writer,
            open: SmallVec::new(),
        }
    }

    /// Current nesting depth
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Finish building; fails if a container is still open
    pub fn into_writer(self) -> Result<W> {
        if let Some(open) = self.open.last() {
            return Err(Error::Malformed(format!(
                "{} started at {} was never closed",
                open.kind.name(),
                open.start
            )));
        }
        Ok(self.writer)
    }

    fn bump(&mut self) {
        if let Some(open) = self.open.last_mut() {
            open.items += 1;
        }
    }

    fn scalar(&mut self, ty: TapeType, payload: u64) -> Result<()> {
        self.writer.append(make_cell(ty, payload))?;
        self.bump();
        Ok(())
    }

    fn wide(&mut self, ty: TapeType, words: &[u64]) -> Result<()> {
        self.writer.append(ty.pattern())?;
        for word in words {
            self.writer.copy(word.to_le_bytes())?;
        }
        self.bump();
        Ok(())
    }

    /// Emit `null`
    pub fn build_null(&mut self) -> Result<()> {
        self.scalar(TapeType::Null, 0)
    }

    /// Emit a boolean
    pub fn build_bool(&mut self, value: bool) -> Result<()> {
        let ty = if value { TapeType::True } else { TapeType::False };
        self.scalar(ty, 0)
    }

    /// Emit a signed integer in the narrowest encoding
    pub fn build_i64(&mut self, value: i64) -> Result<()> {
        if let Ok(v) = i8::try_from(value) {
            self.scalar(TapeType::Int8, v as u8 as u64)
        } else if let Ok(v) = i16::try_from(value) {
            self.scalar(TapeType::Int16, v as u16 as u64)
        } else if let Ok(v) = i32::try_from(value) {
            self.scalar(TapeType::Int32, v as u32 as u64)
        } else {
            self.wide(TapeType::Int64, &[value as u64])
        }
    }

    /// Emit an unsigned integer in the narrowest encoding
    pub fn build_u64(&mut self, value: u64) -> Result<()> {
        if value <= u8::MAX as u64 {
            self.scalar(TapeType::UInt8, value)
        } else if value <= u16::MAX as u64 {
            self.scalar(TapeType::UInt16, value)
        } else if value <= u32::MAX as u64 {
            self.scalar(TapeType::UInt32, value)
        } else {
            self.wide(TapeType::UInt64, &[value])
        }
    }

    /// Emit a 128-bit integer, narrowing when it fits in 64 bits
    pub fn build_i128(&mut self, value: i128) -> Result<()> {
        if let Ok(v) = i64::try_from(value) {
            return self.build_i64(v);
        }
        if let Ok(v) = u64::try_from(value) {
            return self.build_u64(v);
        }
        let bits = value as u128;
        self.wide(TapeType::Int128, &[bits as u64, (bits >> 64) as u64])
    }

    /// Emit an inline `f32`
    pub fn build_f32(&mut self, value: f32) -> Result<()> {
        self.scalar(TapeType::Float, value.to_bits() as u64)
    }

    /// Emit an `f64`
    pub fn build_f64(&mut self, value: f64) -> Result<()> {
        self.wide(TapeType::Double, &[value.to_bits()])
    }

    /// Emit a string (also used for dict keys)
    pub fn build_str(&mut self, value: &str) -> Result<()> {
        let offset = self.writer.append_string(value)?;
        self.scalar(TapeType::String, offset as u64)
    }

    /// Emit a shared-key reference in dict key position
    pub fn build_shared_key(&mut self, id: u16) -> Result<()> {
        self.scalar(TapeType::SharedKey, id as u64)
    }

    fn start(&mut self, kind: TapeType) -> Result<()> {
        let start = self.writer.append(kind.pattern())?;
        self.open.push(OpenContainer {
            start,
            kind,
            items: 0,
        });
        Ok(())
    }

    fn end(&mut self, start_kind: TapeType, end_kind: TapeType) -> Result<()> {
        let open = match self.open.pop() {
            Some(open) if open.kind == start_kind => open,
            Some(open) => {
                return Err(Error::Malformed(format!(
                    "cannot close {} with {}",
                    open.kind.name(),
                    end_kind.name()
                )))
            }
            None => {
                return Err(Error::Malformed(format!(
                    "no open {} to close",
                    start_kind.name()
                )))
            }
        };
        let count = if start_kind == TapeType::DictStart {
            if open.items % 2 != 0 {
                return Err(Error::Malformed("dict key without a value".to_string()));
            }
            open.items / 2
        } else {
            open.items
        };
        let end = self.writer.append(make_cell(end_kind, open.start as u64))?;
        self.writer
            .patch(open.start, container_cell(start_kind, end, count))?;
        self.bump();
        Ok(())
    }

    /// Open an array
    pub fn start_array(&mut self) -> Result<()> {
        self.start(TapeType::ArrayStart)
    }

    /// Close the innermost array
    pub fn end_array(&mut self) -> Result<()> {
        self.end(TapeType::ArrayStart, TapeType::ArrayEnd)
    }

    /// Open a dict; keys and values are then emitted alternately
    pub fn start_dict(&mut self) -> Result<()> {
        self.start(TapeType::DictStart)
    }

    /// Close the innermost dict
    pub fn end_dict(&mut self) -> Result<()> {
        self.end(TapeType::DictStart, TapeType::DictEnd)
    }
}
