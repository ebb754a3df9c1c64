//! Update language
//!
//! An update is itself a document whose top-level keys are operators:
//!
//! ```json
//! {"$set": {"a.b": 1}, "$inc": {"count": 2}, "$mul": {"price": 1.5}, "$unset": {"old": ""}}
//! ```
//!
//! Each field is applied independently. A field that fails (for example
//! `$inc` on a string) is skipped, the remaining fields still apply, and the
//! first error is returned once the whole update has run.

use tracing::debug;

use crate::document::{import_value, Document};
use crate::error::{Error, Result};
use crate::overlay::{Scalar, Slot};
use crate::value::Value;

/// Update operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    /// Overwrite the field
    Set,
    /// Remove the field
    Unset,
    /// Add a number to the field
    Inc,
    /// Multiply the field by a number
    Mul,
}

impl UpdateOp {
    /// Parse an operator name such as `$set`
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "$set" => Some(UpdateOp::Set),
            "$unset" => Some(UpdateOp::Unset),
            "$inc" => Some(UpdateOp::Inc),
            "$mul" => Some(UpdateOp::Mul),
            _ => None,
        }
    }
}

/// A numeric operand
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Double
    Double(f64),
}

impl Number {
    /// Numeric view of a value
    pub fn from_value(value: &Value<'_>) -> Option<Self> {
        match *value {
            Value::Int(i) => Some(Number::Int(i)),
            Value::UInt(u) => Some(Number::UInt(u)),
            Value::Double(d) => Some(Number::Double(d)),
            _ => None,
        }
    }

    fn as_i128(self) -> Option<i128> {
        match self {
            Number::Int(i) => Some(i as i128),
            Number::UInt(u) => Some(u as i128),
            Number::Double(_) => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::UInt(u) => u as f64,
            Number::Double(d) => d,
        }
    }

    fn from_i128(v: i128) -> Self {
        if let Ok(i) = i64::try_from(v) {
            Number::Int(i)
        } else if let Ok(u) = u64::try_from(v) {
            Number::UInt(u)
        } else {
            Number::Double(v as f64)
        }
    }

    /// Integer arithmetic when both sides are integers, double otherwise
    pub fn add(self, other: Number) -> Number {
        match (self.as_i128(), other.as_i128()) {
            (Some(a), Some(b)) => Number::from_i128(a + b),
            _ => Number::Double(self.as_f64() + other.as_f64()),
        }
    }

    /// Integer arithmetic when both sides are integers and the product fits
    pub fn mul(self, other: Number) -> Number {
        match (self.as_i128(), other.as_i128()) {
            (Some(a), Some(b)) => match a.checked_mul(b) {
                Some(v) => Number::from_i128(v),
                None => Number::Double(self.as_f64() * other.as_f64()),
            },
            _ => Number::Double(self.as_f64() * other.as_f64()),
        }
    }
}

impl From<Number> for Scalar {
    fn from(n: Number) -> Self {
        match n {
            Number::Int(i) => Scalar::Int(i),
            Number::UInt(u) => Scalar::UInt(u),
            Number::Double(d) => Scalar::Double(d),
        }
    }
}

impl Document {
    /// Apply an update document; returns true if anything changed
    pub fn update(&mut self, update: &Document) -> Result<bool> {
        let ops = update
            .root()
            .as_dict()
            .map_err(|_| Error::InvalidUpdate("update must be a dict".to_string()))?;
        let mut changed = false;
        let mut first_error = None;

        for (name, fields) in ops.iter() {
            let result = match (UpdateOp::parse(name), fields) {
                (Some(op), Value::Dict(fields)) => {
                    for (path, arg) in fields.iter() {
                        match self.apply_field(op, path, arg) {
                            Ok(c) => changed |= c,
                            Err(e) => {
                                debug!(op = name, field = path, error = %e, "update field skipped");
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                    Ok(())
                }
                (Some(_), other) => Err(Error::InvalidUpdate(format!(
                    "{} expects a dict of fields, got {}",
                    name,
                    other.type_name()
                ))),
                (None, _) => Err(Error::InvalidUpdate(format!("unknown operator {}", name))),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }

    fn apply_field(&mut self, op: UpdateOp, path: &str, arg: Value<'_>) -> Result<bool> {
        match op {
            UpdateOp::Set => {
                let slot = import_value(self.overlay_mut(), arg);
                self.set_slot(path, slot)?;
                Ok(true)
            }
            UpdateOp::Unset => self.remove(path),
            UpdateOp::Inc | UpdateOp::Mul => {
                let operand = Number::from_value(&arg).ok_or(Error::TypeMismatch {
                    expected: "number",
                    actual: arg.type_name(),
                })?;
                let current = match self.get(path) {
                    None => None,
                    Some(value) => Some(Number::from_value(&value).ok_or(Error::TypeMismatch {
                        expected: "number",
                        actual: value.type_name(),
                    })?),
                };
                let result = match (op, current) {
                    (UpdateOp::Inc, Some(c)) => c.add(operand),
                    (UpdateOp::Inc, None) => operand,
                    (_, Some(c)) => c.mul(operand),
                    (_, None) => Number::Int(0),
                };
                self.set_slot(path, Slot::Scalar(result.into()))?;
                Ok(true)
            }
        }
    }
}
