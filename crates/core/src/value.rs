//! Typed value views
//!
//! [`Value`] is a borrowed view over either tape cells or overlay nodes. It
//! never owns storage: strings are slices into the tape string buffer or into
//! overlay scalars, and containers are [`ArrayView`]/[`DictView`] handles that
//! resolve children lazily.
//!
//! Numeric comparisons normalize integers and doubles to a common domain;
//! comparing a string with a number yields no ordering.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::overlay::{NodeBody, NodeId, Overlay, Scalar, Slot};
use crate::tape::{Tape, TapeType};

/// Storage a view resolves against
#[derive(Debug, Clone, Copy)]
pub struct Source<'a> {
    pub(crate) tape: Option<&'a Tape>,
    pub(crate) overlay: &'a Overlay,
}

impl<'a> Source<'a> {
    /// Combine a base tape and an overlay
    pub fn new(tape: Option<&'a Tape>, overlay: &'a Overlay) -> Self {
        Source { tape, overlay }
    }

    fn tape(&self) -> Result<&'a Tape> {
        self.tape
            .ok_or_else(|| Error::Malformed("tape slot without a tape".to_string()))
    }

    /// Resolve a slot into a value
    pub fn slot_value(&self, slot: &'a Slot) -> Result<Value<'a>> {
        match slot {
            Slot::Tape(index) => self.tape_value(*index),
            Slot::Scalar(scalar) => Ok(Value::from_scalar(scalar)),
            Slot::Node(id) => {
                let node = self.overlay.node(*id)?;
                let repr = Repr::Heap(*id);
                Ok(match node.body() {
                    NodeBody::Dict(_) => Value::Dict(DictView { src: *self, repr }),
                    NodeBody::Array(_) => Value::Array(ArrayView { src: *self, repr }),
                })
            }
        }
    }

    /// Resolve a tape position into a value
    pub fn tape_value(&self, index: usize) -> Result<Value<'a>> {
        let tape = self.tape()?;
        let at = tape.at(index);
        let value = match at.tape_type()? {
            TapeType::Null => Value::Null,
            TapeType::True => Value::Bool(true),
            TapeType::False => Value::Bool(false),
            TapeType::Int8 => Value::Int(at.next_tape_value::<i8>()? as i64),
            TapeType::Int16 => Value::Int(at.next_tape_value::<i16>()? as i64),
            TapeType::Int32 => Value::Int(at.next_tape_value::<i32>()? as i64),
            TapeType::Int64 => Value::Int(at.next_tape_value::<i64>()?),
            TapeType::Int128 => {
                let wide = at.next_tape_value::<i128>()?;
                if let Ok(v) = i64::try_from(wide) {
                    Value::Int(v)
                } else if let Ok(v) = u64::try_from(wide) {
                    Value::UInt(v)
                } else {
                    // Lossy: outside both 64-bit ranges.
                    Value::Double(wide as f64)
                }
            }
            TapeType::UInt8 => Value::UInt(at.next_tape_value::<u8>()? as u64),
            TapeType::UInt16 => Value::UInt(at.next_tape_value::<u16>()? as u64),
            TapeType::UInt32 => Value::UInt(at.next_tape_value::<u32>()? as u64),
            TapeType::UInt64 => Value::UInt(at.next_tape_value::<u64>()?),
            TapeType::Float => Value::Double(at.next_tape_value::<f32>()? as f64),
            TapeType::Double => Value::Double(at.next_tape_value::<f64>()?),
            TapeType::String => Value::String(at.get_str()?),
            TapeType::ArrayStart => Value::Array(ArrayView {
                src: *self,
                repr: Repr::Tape(index),
            }),
            TapeType::DictStart => Value::Dict(DictView {
                src: *self,
                repr: Repr::Tape(index),
            }),
            other => {
                return Err(Error::Malformed(format!(
                    "{} cell at {} is not a value",
                    other.name(),
                    index
                )))
            }
        };
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Repr {
    Tape(usize),
    Heap(NodeId),
}

// =============================================================================
// Value
// =============================================================================

/// A borrowed, typed view of one document value
///
/// Integers are widened to `i64` or `u64`. A 128-bit tape integer that fits
/// neither reads as the nearest `Double`; copying such a value through
/// `Value` into another document keeps only that approximation, while
/// [`crate::tape::TapeRef::next_tape_value`] still reads it exactly.
#[derive(Debug, Clone, Copy)]
pub enum Value<'a> {
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point
    Double(f64),
    /// String slice
    String(&'a str),
    /// Array view
    Array(ArrayView<'a>),
    /// Dict view
    Dict(DictView<'a>),
}

impl<'a> Value<'a> {
    /// View of an owned scalar
    pub fn from_scalar(scalar: &'a Scalar) -> Self {
        match scalar {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::Int(*i),
            Scalar::UInt(u) => Value::UInt(*u),
            Scalar::Double(d) => Value::Double(*d),
            Scalar::String(s) => Value::String(s),
        }
    }

    /// Copy a scalar view into an owned scalar; `None` for containers
    pub fn to_scalar(&self) -> Option<Scalar> {
        Some(match *self {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Bool(b),
            Value::Int(i) => Scalar::Int(i),
            Value::UInt(u) => Scalar::UInt(u),
            Value::Double(d) => Scalar::Double(d),
            Value::String(s) => Scalar::String(s.to_string()),
            Value::Array(_) | Value::Dict(_) => return None,
        })
    }

    /// Name of the value's kind
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
        }
    }

    /// True for `null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for int, uint and double
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::UInt(_) | Value::Double(_))
    }

    /// True for arrays
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// True for dicts
    pub fn is_dict(&self) -> bool {
        matches!(self, Value::Dict(_))
    }

    fn mismatch<T>(&self, expected: &'static str) -> Result<T> {
        Err(Error::TypeMismatch {
            expected,
            actual: self.type_name(),
        })
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => self.mismatch("bool"),
        }
    }

    /// Signed integer payload; unsigned values that fit are accepted
    pub fn as_i64(&self) -> Result<i64> {
        match *self {
            Value::Int(i) => Ok(i),
            Value::UInt(u) if u <= i64::MAX as u64 => Ok(u as i64),
            _ => self.mismatch("int"),
        }
    }

    /// Unsigned integer payload; non-negative signed values are accepted
    pub fn as_u64(&self) -> Result<u64> {
        match *self {
            Value::UInt(u) => Ok(u),
            Value::Int(i) if i >= 0 => Ok(i as u64),
            _ => self.mismatch("uint"),
        }
    }

    /// Any numeric payload as a double
    pub fn as_f64(&self) -> Result<f64> {
        match *self {
            Value::Int(i) => Ok(i as f64),
            Value::UInt(u) => Ok(u as f64),
            Value::Double(d) => Ok(d),
            _ => self.mismatch("double"),
        }
    }

    /// String payload
    pub fn as_str(&self) -> Result<&'a str> {
        match *self {
            Value::String(s) => Ok(s),
            _ => self.mismatch("string"),
        }
    }

    /// Array view
    pub fn as_array(&self) -> Result<ArrayView<'a>> {
        match *self {
            Value::Array(a) => Ok(a),
            _ => self.mismatch("array"),
        }
    }

    /// Dict view
    pub fn as_dict(&self) -> Result<DictView<'a>> {
        match *self {
            Value::Dict(d) => Ok(d),
            _ => self.mismatch("dict"),
        }
    }

    /// Order two values
    ///
    /// Numbers compare numerically across int/uint/double. Strings compare
    /// bytewise, bools and nulls among themselves. Other pairings, including
    /// containers, have no order.
    pub fn compare(&self, other: &Value<'_>) -> Option<Ordering> {
        match (*self, *other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(&b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (a, b) if a.is_number() && b.is_number() => compare_numbers(a, b),
            _ => None,
        }
    }

    /// Structural equality; dict key order is ignored
    pub fn equals(&self, other: &Value<'_>) -> bool {
        match (*self, *other) {
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(&y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map_or(false, |w| v.equals(&w)))
            }
            (a, b) => a.compare(&b) == Some(Ordering::Equal),
        }
    }
}

fn compare_numbers(a: Value<'_>, b: Value<'_>) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(&y)),
        (Value::UInt(x), Value::UInt(y)) => Some(x.cmp(&y)),
        (Value::Int(x), Value::UInt(y)) => Some((x as i128).cmp(&(y as i128))),
        (Value::UInt(x), Value::Int(y)) => Some((x as i128).cmp(&(y as i128))),
        (x, y) => {
            let x = x.as_f64().ok()?;
            let y = y.as_f64().ok()?;
            x.partial_cmp(&y)
        }
    }
}

impl PartialEq for Value<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

// =============================================================================
// Containers
// =============================================================================

/// View of an array on the tape or in the overlay
#[derive(Debug, Clone, Copy)]
pub struct ArrayView<'a> {
    pub(crate) src: Source<'a>,
    pub(crate) repr: Repr,
}

impl<'a> ArrayView<'a> {
    /// Number of items
    pub fn len(&self) -> usize {
        match self.repr {
            Repr::Tape(index) => self
                .src
                .tape
                .and_then(|t| t.at(index).element_count().ok())
                .unwrap_or(0),
            Repr::Heap(id) => match self.src.overlay.node(id).map(|n| n.body()) {
                Ok(NodeBody::Array(a)) => a.len(),
                _ => 0,
            },
        }
    }

    /// True if there are no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Item at `index`
    pub fn get(&self, index: usize) -> Option<Value<'a>> {
        match self.repr {
            Repr::Tape(_) => self.iter().nth(index),
            Repr::Heap(id) => match self.src.overlay.node(id).ok()?.body() {
                NodeBody::Array(a) => self.src.slot_value(a.items.get(index)?).ok(),
                NodeBody::Dict(_) => None,
            },
        }
    }

    /// Iterate over items in order
    pub fn iter(&self) -> ArrayIter<'a> {
        let pos = match self.repr {
            Repr::Tape(index) => IterPos::Tape {
                next: index + 1,
                end: self
                    .src
                    .tape
                    .and_then(|t| t.at(index).matching_end().ok())
                    .unwrap_or(0),
            },
            Repr::Heap(id) => IterPos::Heap { id, next: 0 },
        };
        ArrayIter { src: self.src, pos }
    }

    /// Overlay node backing this view, if any
    pub fn node_id(&self) -> Option<NodeId> {
        match self.repr {
            Repr::Heap(id) => Some(id),
            Repr::Tape(_) => None,
        }
    }

    /// Tape index this view can be copied from verbatim
    pub(crate) fn tape_source(&self) -> Option<usize> {
        tape_source(self.src, self.repr)
    }
}

/// View of a dict on the tape or in the overlay
#[derive(Debug, Clone, Copy)]
pub struct DictView<'a> {
    pub(crate) src: Source<'a>,
    pub(crate) repr: Repr,
}

impl<'a> DictView<'a> {
    /// Number of entries
    pub fn len(&self) -> usize {
        match self.repr {
            Repr::Tape(index) => self
                .src
                .tape
                .and_then(|t| t.at(index).element_count().ok())
                .unwrap_or(0),
            Repr::Heap(id) => match self.src.overlay.node(id).map(|n| n.body()) {
                Ok(NodeBody::Dict(d)) => d.len(),
                _ => 0,
            },
        }
    }

    /// True if there are no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value stored under `key`
    pub fn get(&self, key: &str) -> Option<Value<'a>> {
        match self.repr {
            Repr::Tape(_) => self.iter().find(|(k, _)| *k == key).map(|(_, v)| v),
            Repr::Heap(id) => match self.src.overlay.node(id).ok()?.body() {
                NodeBody::Dict(d) => self.src.slot_value(d.get(key)?).ok(),
                NodeBody::Array(_) => None,
            },
        }
    }

    /// True if `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterate over entries in insertion order
    pub fn iter(&self) -> DictIter<'a> {
        let pos = match self.repr {
            Repr::Tape(index) => IterPos::Tape {
                next: index + 1,
                end: self
                    .src
                    .tape
                    .and_then(|t| t.at(index).matching_end().ok())
                    .unwrap_or(0),
            },
            Repr::Heap(id) => IterPos::Heap { id, next: 0 },
        };
        DictIter { src: self.src, pos }
    }

    /// Iterate over keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &'a str> {
        self.iter().map(|(k, _)| k)
    }

    /// Overlay node backing this view, if any
    pub fn node_id(&self) -> Option<NodeId> {
        match self.repr {
            Repr::Heap(id) => Some(id),
            Repr::Tape(_) => None,
        }
    }

    pub(crate) fn tape_source(&self) -> Option<usize> {
        tape_source(self.src, self.repr)
    }
}

fn tape_source(src: Source<'_>, repr: Repr) -> Option<usize> {
    match repr {
        Repr::Tape(index) => Some(index),
        Repr::Heap(id) => src.overlay.node(id).ok()?.unchanged_source(),
    }
}

#[derive(Debug, Clone, Copy)]
enum IterPos {
    Tape { next: usize, end: usize },
    Heap { id: NodeId, next: usize },
}

/// Iterator over array items
#[derive(Debug, Clone)]
pub struct ArrayIter<'a> {
    src: Source<'a>,
    pos: IterPos,
}

impl<'a> Iterator for ArrayIter<'a> {
    type Item = Value<'a>;

    fn next(&mut self) -> Option<Value<'a>> {
        match &mut self.pos {
            IterPos::Tape { next, end } => {
                if *next >= *end {
                    return None;
                }
                let tape = self.src.tape?;
                let value = self.src.tape_value(*next).ok()?;
                *next = tape.at(*next).after().ok()?;
                Some(value)
            }
            IterPos::Heap { id, next } => {
                let slot = match self.src.overlay.node(*id).ok()?.body() {
                    NodeBody::Array(a) => a.items.get(*next)?,
                    NodeBody::Dict(_) => return None,
                };
                *next += 1;
                self.src.slot_value(slot).ok()
            }
        }
    }
}

/// Iterator over dict entries
#[derive(Debug, Clone)]
pub struct DictIter<'a> {
    src: Source<'a>,
    pos: IterPos,
}

impl<'a> Iterator for DictIter<'a> {
    type Item = (&'a str, Value<'a>);

    fn next(&mut self) -> Option<(&'a str, Value<'a>)> {
        match &mut self.pos {
            IterPos::Tape { next, end } => {
                if *next >= *end {
                    return None;
                }
                let tape = self.src.tape?;
                let key = tape.at(*next).get_str().ok()?;
                let value = self.src.tape_value(*next + 1).ok()?;
                *next = tape.at(*next + 1).after().ok()?;
                Some((key, value))
            }
            IterPos::Heap { id, next } => {
                let (key, slot) = match self.src.overlay.node(*id).ok()?.body() {
                    NodeBody::Dict(d) => d.entries.get(*next)?,
                    NodeBody::Array(_) => return None,
                };
                *next += 1;
                Some((key.as_str(), self.src.slot_value(slot).ok()?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::HeapNode;
    use crate::tape::{TapeBuilder, VecTapeWriter};

    fn tape() -> Tape {
        let mut b = TapeBuilder::new(VecTapeWriter::new());
        b.start_dict().unwrap();
        b.build_str("n").unwrap();
        b.build_i64(-3).unwrap();
        b.build_str("big").unwrap();
        b.build_u64(u64::MAX).unwrap();
        b.build_str("s").unwrap();
        b.build_str("text").unwrap();
        b.build_str("arr").unwrap();
        b.start_array().unwrap();
        b.build_bool(true).unwrap();
        b.build_f64(1.5).unwrap();
        b.build_null().unwrap();
        b.end_array().unwrap();
        b.end_dict().unwrap();
        b.into_writer().unwrap().into_tape()
    }

    #[test]
    fn test_wide_integers() {
        let mut b = TapeBuilder::new(VecTapeWriter::new());
        b.start_array().unwrap();
        b.build_i128(-5).unwrap();
        b.build_i128(u64::MAX as i128).unwrap();
        b.build_i128(1i128 << 100).unwrap();
        b.end_array().unwrap();
        let tape = b.into_writer().unwrap().into_tape();
        let overlay = Overlay::new();
        let src = Source::new(Some(&tape), &overlay);
        let arr = src.tape_value(0).unwrap().as_array().unwrap();

        assert_eq!(arr.get(0).unwrap().as_i64().unwrap(), -5);
        assert_eq!(arr.get(1).unwrap().as_u64().unwrap(), u64::MAX);
        let huge = arr.get(2).unwrap();
        assert_eq!(huge.type_name(), "double");
        assert_eq!(huge.as_f64().unwrap(), (1i128 << 100) as f64);

        let index = (0..tape.len())
            .filter(|&i| tape.at(i).is_int128())
            .last()
            .unwrap();
        assert_eq!(tape.at(index).next_tape_value::<i128>().unwrap(), 1i128 << 100);
    }

    #[test]
    fn test_tape_views() {
        let tape = tape();
        let overlay = Overlay::new();
        let src = Source::new(Some(&tape), &overlay);
        let root = src.tape_value(0).unwrap().as_dict().unwrap();
        assert_eq!(root.len(), 4);
        assert_eq!(root.get("n").unwrap().as_i64().unwrap(), -3);
        assert_eq!(root.get("big").unwrap().as_u64().unwrap(), u64::MAX);
        assert_eq!(root.get("s").unwrap().as_str().unwrap(), "text");
        assert!(root.get("missing").is_none());

        let arr = root.get("arr").unwrap().as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert!(arr.get(0).unwrap().as_bool().unwrap());
        assert_eq!(arr.get(1).unwrap().as_f64().unwrap(), 1.5);
        assert!(arr.get(2).unwrap().is_null());
        assert!(arr.get(3).is_none());

        let keys: Vec<_> = root.keys().collect();
        assert_eq!(keys, vec!["n", "big", "s", "arr"]);
    }

    #[test]
    fn test_heap_views() {
        let mut overlay = Overlay::new();
        let inner = overlay.alloc(HeapNode::array(vec![Slot::Scalar(Scalar::Int(7))]));
        let root = overlay.alloc(HeapNode::dict(vec![
            ("x".to_string(), Slot::Scalar(Scalar::from("y"))),
            ("list".to_string(), Slot::Node(inner)),
        ]));
        let slot = Slot::Node(root);
        let src = Source::new(None, &overlay);
        let dict = src.slot_value(&slot).unwrap().as_dict().unwrap();
        assert_eq!(dict.get("x").unwrap().as_str().unwrap(), "y");
        let list = dict.get("list").unwrap().as_array().unwrap();
        assert_eq!(list.iter().count(), 1);
        assert_eq!(list.get(0).unwrap().as_i64().unwrap(), 7);
    }

    #[test]
    fn test_type_mismatch() {
        let err = Value::String("a").as_i64().unwrap_err();
        assert_eq!(
            err,
            Error::TypeMismatch {
                expected: "int",
                actual: "string"
            }
        );
        assert!(Value::Int(-1).as_u64().is_err());
    }

    #[test]
    fn test_numeric_comparison_normalizes() {
        assert_eq!(Value::Int(-1).compare(&Value::UInt(1)), Some(Ordering::Less));
        assert_eq!(
            Value::UInt(u64::MAX).compare(&Value::Int(i64::MAX)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Int(2).compare(&Value::Double(2.0)), Some(Ordering::Equal));
        assert_eq!(Value::Double(0.5).compare(&Value::UInt(1)), Some(Ordering::Less));
    }

    #[test]
    fn test_string_number_incomparable() {
        assert_eq!(Value::String("1").compare(&Value::Int(1)), None);
        assert!(Value::String("1") != Value::Int(1));
    }

    #[test]
    fn test_dict_equality_ignores_order() {
        let mut overlay = Overlay::new();
        let a = overlay.alloc(HeapNode::dict(vec![
            ("a".to_string(), Slot::Scalar(Scalar::Int(1))),
            ("b".to_string(), Slot::Scalar(Scalar::Int(2))),
        ]));
        let b = overlay.alloc(HeapNode::dict(vec![
            ("b".to_string(), Slot::Scalar(Scalar::UInt(2))),
            ("a".to_string(), Slot::Scalar(Scalar::Int(1))),
        ]));
        let (sa, sb) = (Slot::Node(a), Slot::Node(b));
        let src = Source::new(None, &overlay);
        let va = src.slot_value(&sa).unwrap();
        let vb = src.slot_value(&sb).unwrap();
        assert!(va.equals(&vb));
    }

    #[test]
    fn test_wide_int128_maps_to_double() {
        let mut b = TapeBuilder::new(VecTapeWriter::new());
        b.build_i128(-(1i128 << 80)).unwrap();
        let tape = b.into_writer().unwrap().into_tape();
        let overlay = Overlay::new();
        let value = Source::new(Some(&tape), &overlay).tape_value(0).unwrap();
        assert!(matches!(value, Value::Double(_)));
    }
}
