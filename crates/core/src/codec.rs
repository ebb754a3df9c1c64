//! MessagePack and JSON codecs
//!
//! Encoding goes through `serde::Serialize` on [`Value`] and [`Document`], so
//! any serde format works. Decoding streams serde events straight into a
//! [`TapeBuilder`] through [`TapeSeed`], without an intermediate value tree.
//!
//! Dict keys are always strings on the tape: integer, bool and float keys
//! (legal in MessagePack) are converted to their decimal text.

use std::fmt;

use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::document::Document;
use crate::error::Result;
use crate::tape::{TapeBuilder, TapeWriter, VecTapeWriter};
use crate::value::Value;

// =============================================================================
// Serialization
// =============================================================================

impl Serialize for Value<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match *self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(b),
            Value::Int(i) => serializer.serialize_i64(i),
            Value::UInt(u) => serializer.serialize_u64(u),
            Value::Double(d) => serializer.serialize_f64(d),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(array) => {
                let mut seq = serializer.serialize_seq(Some(array.len()))?;
                for item in array.iter() {
                    seq.serialize_element(&item)?;
                }
                seq.end()
            }
            Value::Dict(dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (key, item) in dict.iter() {
                    map.serialize_entry(key, &item)?;
                }
                map.end()
            }
        }
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.root().serialize(serializer)
    }
}

// =============================================================================
// Deserialization
// =============================================================================

/// Deserializes one value directly onto a tape
pub struct TapeSeed<'b, W> {
    builder: &'b mut TapeBuilder<W>,
}

impl<'b, W: TapeWriter> TapeSeed<'b, W> {
    /// Seed writing into `builder`
    pub fn new(builder: &'b mut TapeBuilder<W>) -> Self {
        TapeSeed { builder }
    }
}

impl<'de, 'b, W: TapeWriter> DeserializeSeed<'de> for TapeSeed<'b, W> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_any(TapeVisitor {
            builder: self.builder,
        })
    }
}

struct TapeVisitor<'b, W> {
    builder: &'b mut TapeBuilder<W>,
}

fn emit<E: de::Error>(result: Result<()>) -> std::result::Result<(), E> {
    result.map_err(E::custom)
}

impl<'de, 'b, W: TapeWriter> Visitor<'de> for TapeVisitor<'b, W> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a document value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<(), E> {
        emit(self.builder.build_bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<(), E> {
        emit(self.builder.build_i64(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<(), E> {
        emit(self.builder.build_u64(v))
    }

    fn visit_i128<E: de::Error>(self, v: i128) -> std::result::Result<(), E> {
        emit(self.builder.build_i128(v))
    }

    fn visit_f32<E: de::Error>(self, v: f32) -> std::result::Result<(), E> {
        emit(self.builder.build_f32(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<(), E> {
        emit(self.builder.build_f64(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<(), E> {
        emit(self.builder.build_str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<(), E> {
        match std::str::from_utf8(v) {
            Ok(s) => emit(self.builder.build_str(s)),
            Err(_) => Err(E::custom("binary values must be UTF-8")),
        }
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<(), E> {
        emit(self.builder.build_null())
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<(), E> {
        emit(self.builder.build_null())
    }

    fn visit_some<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        TapeSeed::new(self.builder).deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        emit::<A::Error>(self.builder.start_array())?;
        while seq
            .next_element_seed(TapeSeed::new(&mut *self.builder))?
            .is_some()
        {}
        emit(self.builder.end_array())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        emit::<A::Error>(self.builder.start_dict())?;
        while map
            .next_key_seed(KeySeed {
                builder: &mut *self.builder,
            })?
            .is_some()
        {
            map.next_value_seed(TapeSeed::new(&mut *self.builder))?;
        }
        emit(self.builder.end_dict())
    }
}

/// Deserializes a dict key, coercing scalars to strings
struct KeySeed<'b, W> {
    builder: &'b mut TapeBuilder<W>,
}

impl<'de, 'b, W: TapeWriter> DeserializeSeed<'de> for KeySeed<'b, W> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de, 'b, W: TapeWriter> Visitor<'de> for KeySeed<'b, W> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a dict key")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<(), E> {
        emit(self.builder.build_str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<(), E> {
        match std::str::from_utf8(v) {
            Ok(s) => emit(self.builder.build_str(s)),
            Err(_) => Err(E::custom("dict keys must be UTF-8")),
        }
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<(), E> {
        emit(self.builder.build_str(&v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<(), E> {
        emit(self.builder.build_str(&v.to_string()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<(), E> {
        emit(self.builder.build_str(&v.to_string()))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<(), E> {
        emit(self.builder.build_str(if v { "true" } else { "false" }))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<(), E> {
        emit(self.builder.build_str("null"))
    }
}

fn finish(builder: TapeBuilder<VecTapeWriter>) -> Result<Document> {
    let tape = builder.into_writer()?.into_tape();
    tape.validate(false)?;
    Ok(Document::from_valid_tape(tape))
}

impl Document {
    /// Parse JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let mut builder = TapeBuilder::new(VecTapeWriter::new());
        let mut deserializer = serde_json::Deserializer::from_str(json);
        TapeSeed::new(&mut builder).deserialize(&mut deserializer)?;
        deserializer.end()?;
        finish(builder)
    }

    /// Render as JSON text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let mut builder = TapeBuilder::new(VecTapeWriter::new());
        let mut deserializer = rmp_serde::Deserializer::new(bytes);
        TapeSeed::new(&mut builder).deserialize(&mut deserializer)?;
        finish(builder)
    }

    /// Encode as MessagePack
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }
}
