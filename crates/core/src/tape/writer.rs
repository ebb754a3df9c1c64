//! Tape writers
//!
//! [`TapeWriter`] is the sink a [`TapeBuilder`](super::TapeBuilder) emits into.
//! Two implementations exist:
//! - [`VecTapeWriter`]: growable, used when the final size is unknown (parsing)
//! - [`FixedTapeWriter`]: pre-sized arena, used when the size has been measured
//!   up front (flattening a document)

use super::{Tape, STRING_OVERHEAD};
use crate::error::{Error, Result};

/// Destination for tape cells and strings
pub trait TapeWriter {
    /// Append one cell and return its index
    fn append(&mut self, cell: u64) -> Result<usize>;

    /// Append a raw 8-byte little-endian cell and return its index
    fn copy(&mut self, raw: [u8; 8]) -> Result<usize> {
        self.append(u64::from_le_bytes(raw))
    }

    /// Write a length-prefixed, nul-terminated string and return its offset
    fn append_string(&mut self, value: &str) -> Result<usize>;

    /// Overwrite a previously appended cell
    fn patch(&mut self, index: usize, cell: u64) -> Result<()>;

    /// Index the next appended cell will receive
    fn position(&self) -> usize;
}

fn push_string(strings: &mut Vec<u8>, value: &str) -> usize {
    let offset = strings.len();
    strings.extend_from_slice(&(value.len() as u32).to_le_bytes());
    strings.extend_from_slice(value.as_bytes());
    strings.push(0);
    offset
}

fn patch_cell(cells: &mut [u64], index: usize, cell: u64) -> Result<()> {
    let len = cells.len();
    let slot = cells.get_mut(index).ok_or(Error::OutOfRange { index, len })?;
    *slot = cell;
    Ok(())
}

// =============================================================================
// Growable writer
// =============================================================================

/// Writer backed by growable vectors
#[derive(Debug, Default)]
pub struct VecTapeWriter {
    tape: Tape,
}

impl VecTapeWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish writing and take the tape
    pub fn into_tape(self) -> Tape {
        self.tape
    }
}

impl TapeWriter for VecTapeWriter {
    fn append(&mut self, cell: u64) -> Result<usize> {
        self.tape.cells.push(cell);
        Ok(self.tape.cells.len() - 1)
    }

    fn append_string(&mut self, value: &str) -> Result<usize> {
        Ok(push_string(&mut self.tape.strings, value))
    }

    fn patch(&mut self, index: usize, cell: u64) -> Result<()> {
        patch_cell(&mut self.tape.cells, index, cell)
    }

    fn position(&self) -> usize {
        self.tape.cells.len()
    }
}

// =============================================================================
// Fixed-capacity writer
// =============================================================================

/// Writer over a pre-sized arena that refuses to grow
#[derive(Debug)]
pub struct FixedTapeWriter {
    tape: Tape,
    cell_capacity: usize,
    string_capacity: usize,
}

impl FixedTapeWriter {
    /// Allocate room for exactly `cells` cells and `string_bytes` bytes of strings
    pub fn with_capacity(cells: usize, string_bytes: usize) -> Self {
        FixedTapeWriter {
            tape: Tape {
                cells: Vec::with_capacity(cells),
                strings: Vec::with_capacity(string_bytes),
            },
            cell_capacity: cells,
            string_capacity: string_bytes,
        }
    }

    /// Cells still available
    pub fn remaining_cells(&self) -> usize {
        self.cell_capacity - self.tape.cells.len()
    }

    /// String bytes still available
    pub fn remaining_string_bytes(&self) -> usize {
        self.string_capacity - self.tape.strings.len()
    }

    /// Finish writing and take the tape
    pub fn into_tape(self) -> Tape {
        self.tape
    }
}

impl TapeWriter for FixedTapeWriter {
    fn append(&mut self, cell: u64) -> Result<usize> {
        if self.remaining_cells() == 0 {
            return Err(Error::CapacityExceeded {
                requested: 1,
                available: 0,
            });
        }
        self.tape.cells.push(cell);
        Ok(self.tape.cells.len() - 1)
    }

    fn append_string(&mut self, value: &str) -> Result<usize> {
        let needed = value.len() + STRING_OVERHEAD;
        let available = self.remaining_string_bytes();
        if needed > available {
            return Err(Error::CapacityExceeded {
                requested: needed,
                available,
            });
        }
        Ok(push_string(&mut self.tape.strings, value))
    }

    fn patch(&mut self, index: usize, cell: u64) -> Result<()> {
        patch_cell(&mut self.tape.cells, index, cell)
    }

    fn position(&self) -> usize {
        self.tape.cells.len()
    }
}
