//! Documents
//!
//! A [`Document`] owns an optional immutable tape (shared through `Arc`) and an
//! overlay arena of edited containers. Its state follows from which of the two
//! the root points into:
//!
//! - **Immutable**: root is the tape root, no edits
//! - **Mutable**: no tape at all, everything lives in the overlay
//! - **Hybrid**: tape base plus overlay nodes along edited paths
//!
//! Reads resolve through the overlay first and fall back to the tape. Edits
//! materialize the containers along the path with
//! [`Overlay::mutable_copy`], so tape bytes are never modified.
//! [`Document::flatten`] folds the overlay back into a fresh tape.
//!
//! Paths are `.`-separated. Numeric segments index arrays, other segments
//! index dict keys.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::overlay::{HeapNode, NodeBody, NodeId, NodeKind, Overlay, Scalar, Slot};
use crate::shared_keys::SharedKeys;
use crate::tape::{FixedTapeWriter, Tape, TapeBuilder, TapeWriter, STRING_OVERHEAD};
use crate::value::{Source, Value};

/// Which storage backs a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    /// Finished tape, no overlay
    Immutable,
    /// Overlay only
    Mutable,
    /// Tape base with overlay edits
    Hybrid,
}

/// A schema-less document
#[derive(Debug, Clone)]
pub struct Document {
    base: Option<Arc<Tape>>,
    overlay: Overlay,
    root: Slot,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Empty mutable document with a dict root
    pub fn new() -> Self {
        let mut overlay = Overlay::new();
        let root = overlay.alloc(HeapNode::empty(NodeKind::Dict));
        Document {
            base: None,
            overlay,
            root: Slot::Node(root),
        }
    }

    /// Wrap a tape after validating it
    pub fn from_tape(tape: Tape) -> Result<Self> {
        tape.validate(false)?;
        Ok(Self::from_valid_tape(tape))
    }

    /// Share an already validated tape with other documents
    pub fn from_shared(tape: Arc<Tape>) -> Result<Self> {
        tape.validate(false)?;
        Ok(Document {
            base: Some(tape),
            overlay: Overlay::new(),
            root: Slot::Tape(0),
        })
    }

    pub(crate) fn from_valid_tape(tape: Tape) -> Self {
        Document {
            base: Some(Arc::new(tape)),
            overlay: Overlay::new(),
            root: Slot::Tape(0),
        }
    }

    /// Deep-copy a value from any document into a new mutable document
    pub fn from_value(value: Value<'_>) -> Self {
        let mut overlay = Overlay::new();
        let root = import_value(&mut overlay, value);
        Document {
            base: None,
            overlay,
            root,
        }
    }

    /// Parse the binary tape form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_valid_tape(Tape::from_bytes(bytes)?))
    }

    /// Current backing state
    pub fn state(&self) -> DocumentState {
        match (&self.base, &self.root) {
            (Some(_), Slot::Tape(_)) => DocumentState::Immutable,
            (None, _) => DocumentState::Mutable,
            (Some(_), _) => DocumentState::Hybrid,
        }
    }

    /// Shared base tape, if any
    pub fn base(&self) -> Option<&Arc<Tape>> {
        self.base.as_ref()
    }

    /// Storage views resolve against
    pub fn source(&self) -> Source<'_> {
        Source::new(self.base.as_deref(), &self.overlay)
    }

    pub(crate) fn overlay_mut(&mut self) -> &mut Overlay {
        &mut self.overlay
    }

    /// Root value
    pub fn root(&self) -> Value<'_> {
        self.source().slot_value(&self.root).unwrap_or(Value::Null)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value at `path`, or `None` if any segment is absent
    pub fn get(&self, path: &str) -> Option<Value<'_>> {
        let mut current = self.root();
        if path.is_empty() {
            return Some(current);
        }
        for segment in path.split('.') {
            current = match current {
                Value::Dict(dict) => dict.get(segment)?,
                Value::Array(array) => array.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// True if `path` resolves
    pub fn is_exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// True if `path` holds `null`
    pub fn is_null(&self, path: &str) -> bool {
        matches!(self.get(path), Some(Value::Null))
    }

    /// True if `path` holds a dict
    pub fn is_dict(&self, path: &str) -> bool {
        matches!(self.get(path), Some(Value::Dict(_)))
    }

    /// True if `path` holds an array
    pub fn is_array(&self, path: &str) -> bool {
        matches!(self.get(path), Some(Value::Array(_)))
    }

    /// Element count of the container at `path`; 0 otherwise
    pub fn count(&self, path: &str) -> usize {
        match self.get(path) {
            Some(Value::Dict(d)) => d.len(),
            Some(Value::Array(a)) => a.len(),
            _ => 0,
        }
    }

    /// Boolean at `path`
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path)?.as_bool().ok()
    }

    /// Signed integer at `path`
    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path)?.as_i64().ok()
    }

    /// Unsigned integer at `path`
    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path)?.as_u64().ok()
    }

    /// Number at `path` as a double
    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path)?.as_f64().ok()
    }

    /// String at `path`
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)?.as_str().ok()
    }

    /// Order two documents by the value at `path`; missing values sort last
    pub fn compare(&self, other: &Document, path: &str) -> Ordering {
        match (self.get(path), other.get(path)) {
            (Some(a), Some(b)) => a.compare(&b).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    /// Structural equality; dict key order is ignored
    pub fn is_equal(&self, other: &Document) -> bool {
        self.root().equals(&other.root())
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Store a scalar at `path`, creating intermediate dicts
    pub fn set(&mut self, path: &str, value: impl Into<Scalar>) -> Result<()> {
        self.set_slot(path, Slot::Scalar(value.into()))
    }

    /// Store `null` at `path`
    pub fn set_null(&mut self, path: &str) -> Result<()> {
        self.set(path, Scalar::Null)
    }

    /// Store an empty dict at `path`
    pub fn set_dict(&mut self, path: &str) -> Result<()> {
        let id = self.overlay.alloc(HeapNode::empty(NodeKind::Dict));
        self.set_slot(path, Slot::Node(id))
    }

    /// Store an empty array at `path`
    pub fn set_array(&mut self, path: &str) -> Result<()> {
        let id = self.overlay.alloc(HeapNode::empty(NodeKind::Array));
        self.set_slot(path, Slot::Node(id))
    }

    /// Store a deep copy of a value taken from another document
    pub fn set_value(&mut self, path: &str, value: Value<'_>) -> Result<()> {
        let slot = import_value(&mut self.overlay, value);
        self.set_slot(path, slot)
    }

    /// Remove the value at `path`; returns false if nothing was there
    pub fn remove(&mut self, path: &str) -> Result<bool> {
        if path.is_empty() {
            return Err(Error::InvalidPath("cannot remove the root".to_string()));
        }
        if !self.is_exists(path) {
            return Ok(false);
        }
        let (node, last) = match self.walk_to_parent(path, false)? {
            Some(found) => found,
            None => return Ok(false),
        };
        let removed = match self.overlay.node_mut(node)?.body_mut() {
            NodeBody::Dict(dict) => dict.remove(last).is_some(),
            NodeBody::Array(array) => {
                let index = parse_index(last)?;
                if index < array.items.len() {
                    array.items.remove(index);
                    true
                } else {
                    false
                }
            }
        };
        self.overlay.set_changed(node)?;
        self.reclaim()?;
        Ok(removed)
    }

    /// Move the value at `from` to `to`; returns false if `from` is absent
    pub fn move_value(&mut self, from: &str, to: &str) -> Result<bool> {
        let fragment = match self.get(from) {
            Some(value) => Document::from_value(value),
            None => return Ok(false),
        };
        self.remove(from)?;
        self.set_value(to, fragment.root())?;
        Ok(true)
    }

    /// Copy the value at `from` to `to`; returns false if `from` is absent
    pub fn copy_value(&mut self, from: &str, to: &str) -> Result<bool> {
        let fragment = match self.get(from) {
            Some(value) => Document::from_value(value),
            None => return Ok(false),
        };
        self.set_value(to, fragment.root())?;
        Ok(true)
    }

    /// Union of the top-level fields of two dict documents; `right` wins ties
    pub fn merge(left: &Document, right: &Document) -> Result<Document> {
        let l = left.root().as_dict()?;
        let r = right.root().as_dict()?;
        let mut overlay = Overlay::new();
        let mut entries = Vec::with_capacity(l.len() + r.len());
        for (key, value) in l.iter() {
            let value = r.get(key).unwrap_or(value);
            entries.push((key.to_string(), import_value(&mut overlay, value)));
        }
        for (key, value) in r.iter() {
            if !l.contains_key(key) {
                entries.push((key.to_string(), import_value(&mut overlay, value)));
            }
        }
        let root = overlay.alloc(HeapNode::dict(entries));
        Ok(Document {
            base: None,
            overlay,
            root: Slot::Node(root),
        })
    }

    pub(crate) fn set_slot(&mut self, path: &str, slot: Slot) -> Result<()> {
        if path.is_empty() {
            return Err(Error::InvalidPath("empty path".to_string()));
        }
        match self.walk_to_parent(path, true)? {
            Some((node, last)) => self.store(node, last, slot)?,
            None => return Err(Error::InvalidPath(path.to_string())),
        }
        self.reclaim()
    }

    /// Drop overlay nodes that edits have made unreachable
    fn reclaim(&mut self) -> Result<()> {
        if !self.overlay.needs_compaction() {
            return Ok(());
        }
        let before = self.overlay.len();
        self.root = self.overlay.compact(&self.root)?;
        debug!(before, after = self.overlay.len(), "compacted overlay");
        Ok(())
    }

    fn materialize_root(&mut self, tape: Option<&Tape>) -> Result<NodeId> {
        let kind = self
            .overlay
            .slot_kind(tape, &self.root)?
            .ok_or_else(|| Error::InvalidPath("document root is not a container".to_string()))?;
        let id = self.overlay.mutable_copy(tape, &self.root, kind)?;
        self.root = Slot::Node(id);
        Ok(id)
    }

    /// Materialize every container above the last segment of `path`
    fn walk_to_parent<'p>(
        &mut self,
        path: &'p str,
        create: bool,
    ) -> Result<Option<(NodeId, &'p str)>> {
        let (parents, last) = match path.rsplit_once('.') {
            Some((parents, last)) => (Some(parents), last),
            None => (None, path),
        };
        let base = self.base.clone();
        let tape = base.as_deref();
        let mut node = self.materialize_root(tape)?;
        if let Some(parents) = parents {
            for segment in parents.split('.') {
                match self.child_container(tape, node, segment, create)? {
                    Some(child) => node = child,
                    None => return Ok(None),
                }
            }
        }
        Ok(Some((node, last)))
    }

    fn child_container(
        &mut self,
        tape: Option<&Tape>,
        node: NodeId,
        segment: &str,
        create: bool,
    ) -> Result<Option<NodeId>> {
        let existing = match self.overlay.node(node)?.body() {
            NodeBody::Dict(dict) => dict.get(segment).cloned(),
            NodeBody::Array(array) => array.items.get(parse_index(segment)?).cloned(),
        };
        let child = match existing {
            Some(slot) => {
                let kind = self.overlay.slot_kind(tape, &slot)?.ok_or_else(|| {
                    Error::InvalidPath(format!("segment '{}' is not a container", segment))
                })?;
                let id = self.overlay.mutable_copy(tape, &slot, kind)?;
                if slot != Slot::Node(id) {
                    self.store(node, segment, Slot::Node(id))?;
                }
                id
            }
            None if create => {
                let id = self.overlay.alloc(HeapNode::empty(NodeKind::Dict));
                self.store(node, segment, Slot::Node(id))?;
                id
            }
            None => return Ok(None),
        };
        self.overlay.set_changed(node)?;
        Ok(Some(child))
    }

    fn store(&mut self, node: NodeId, segment: &str, slot: Slot) -> Result<()> {
        match self.overlay.node_mut(node)?.body_mut() {
            NodeBody::Dict(dict) => dict.insert(segment, slot),
            NodeBody::Array(array) => {
                let index = parse_index(segment)?;
                let len = array.items.len();
                if index < len {
                    array.items[index] = slot;
                } else if index == len {
                    array.items.push(slot);
                } else {
                    return Err(Error::InvalidPath(format!(
                        "index {} past the end of an array of {}",
                        index, len
                    )));
                }
            }
        }
        self.overlay.set_changed(node)
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Build a tape holding the current content
    pub fn to_tape(&self) -> Result<Tape> {
        if let (Some(base), Slot::Tape(_)) = (&self.base, &self.root) {
            return Ok(Tape::clone(base));
        }
        let root = self.root();
        let (cells, string_bytes) = measure(root);
        let mut builder = TapeBuilder::new(FixedTapeWriter::with_capacity(cells, string_bytes));
        write_value(&mut builder, root, None)?;
        Ok(builder.into_writer()?.into_tape())
    }

    /// Binary tape form; byte-identical across calls for the same content
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match (&self.base, &self.root) {
            (Some(base), Slot::Tape(_)) => Ok(base.to_bytes()),
            _ => Ok(self.to_tape()?.to_bytes()),
        }
    }

    /// Fold overlay edits into a fresh immutable tape
    pub fn flatten(&mut self) -> Result<()> {
        if self.state() == DocumentState::Immutable {
            return Ok(());
        }
        let tape = self.to_tape()?;
        debug!(
            overlay_nodes = self.overlay.len(),
            cells = tape.len(),
            "flattened document"
        );
        *self = Self::from_valid_tape(tape);
        Ok(())
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

fn parse_index(segment: &str) -> Result<usize> {
    segment
        .parse::<usize>()
        .map_err(|_| Error::InvalidPath(format!("'{}' is not an array index", segment)))
}

/// Deep-copy a value into `overlay`
pub(crate) fn import_value(overlay: &mut Overlay, value: Value<'_>) -> Slot {
    match value {
        Value::Array(array) => {
            let items = array.iter().map(|v| import_value(overlay, v)).collect();
            Slot::Node(overlay.alloc(HeapNode::array(items)))
        }
        Value::Dict(dict) => {
            let entries = dict
                .iter()
                .map(|(k, v)| (k.to_string(), import_value(overlay, v)))
                .collect();
            Slot::Node(overlay.alloc(HeapNode::dict(entries)))
        }
        scalar => Slot::Scalar(scalar.to_scalar().unwrap_or(Scalar::Null)),
    }
}

/// Exact cell and string-buffer sizes `write_value` will produce
pub(crate) fn measure(value: Value<'_>) -> (usize, usize) {
    match value {
        Value::Null | Value::Bool(_) => (1, 0),
        Value::Int(i) => (if i32::try_from(i).is_ok() { 1 } else { 2 }, 0),
        Value::UInt(u) => (if u <= u32::MAX as u64 { 1 } else { 2 }, 0),
        Value::Double(_) => (2, 0),
        Value::String(s) => (1, s.len() + STRING_OVERHEAD),
        Value::Array(array) => array.iter().fold((2, 0), |(c, b), item| {
            let (ic, ib) = measure(item);
            (c + ic, b + ib)
        }),
        Value::Dict(dict) => dict.iter().fold((2, 0), |(c, b), (key, item)| {
            let (ic, ib) = measure(item);
            (c + 1 + ic, b + key.len() + STRING_OVERHEAD + ib)
        }),
    }
}

/// Emit a value, optionally replacing eligible dict keys with shared-key ids
pub(crate) fn write_value<W: TapeWriter>(
    builder: &mut TapeBuilder<W>,
    value: Value<'_>,
    mut keys: Option<&mut SharedKeys>,
) -> Result<()> {
    match value {
        Value::Null => builder.build_null(),
        Value::Bool(b) => builder.build_bool(b),
        Value::Int(i) => builder.build_i64(i),
        Value::UInt(u) => builder.build_u64(u),
        Value::Double(d) => builder.build_f64(d),
        Value::String(s) => builder.build_str(s),
        Value::Array(array) => {
            if let (Some(_), Some(index)) = (array.node_id(), array.tape_source()) {
                return write_value(builder, array.src.tape_value(index)?, keys);
            }
            builder.start_array()?;
            for item in array.iter() {
                write_value(builder, item, keys.as_deref_mut())?;
            }
            builder.end_array()
        }
        Value::Dict(dict) => {
            if let (Some(_), Some(index)) = (dict.node_id(), dict.tape_source()) {
                return write_value(builder, dict.src.tape_value(index)?, keys);
            }
            builder.start_dict()?;
            for (key, item) in dict.iter() {
                match keys.as_deref_mut().and_then(|k| k.encode_and_add(key)) {
                    Some(id) => builder.build_shared_key(id)?,
                    None => builder.build_str(key)?,
                }
                write_value(builder, item, keys.as_deref_mut())?;
            }
            builder.end_dict()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        Document::from_json(
            r#"{"name":"rex","age":6,"owner":{"city":"Oslo"},"tags":["a","b"],"score":1.5}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_repeated_sets_reuse_overlay_memory() {
        let mut doc = sample();
        for i in 0..1000i64 {
            doc.set_dict("owner").unwrap();
            doc.set("owner.visits", i).unwrap();
            doc.set_array("tags").unwrap();
        }
        assert!(doc.overlay.len() < 100, "overlay holds {} nodes", doc.overlay.len());
        assert_eq!(doc.get_i64("owner.visits"), Some(999));
        assert!(!doc.is_exists("owner.city"));
        assert_eq!(doc.count("tags"), 0);
        assert_eq!(doc.get_str("name"), Some("rex"));
        assert_eq!(doc.state(), DocumentState::Hybrid);
    }

    #[test]
    fn test_new_document_is_mutable() {
        let doc = Document::new();
        assert_eq!(doc.state(), DocumentState::Mutable);
        assert!(doc.root().is_dict());
        assert_eq!(doc.count(""), 0);
    }

    #[test]
    fn test_parsed_document_is_immutable() {
        let doc = sample();
        assert_eq!(doc.state(), DocumentState::Immutable);
        assert_eq!(doc.get_str("name"), Some("rex"));
        assert_eq!(doc.get_i64("age"), Some(6));
        assert_eq!(doc.get_str("owner.city"), Some("Oslo"));
        assert_eq!(doc.get_str("tags.1"), Some("b"));
        assert_eq!(doc.get_f64("score"), Some(1.5));
    }

    #[test]
    fn test_get_missing_paths() {
        let doc = sample();
        assert!(doc.get("nope").is_none());
        assert!(doc.get("name.inner").is_none());
        assert!(doc.get("tags.9").is_none());
        assert!(doc.get("tags.x").is_none());
        assert!(!doc.is_exists("owner.zip"));
    }

    #[test]
    fn test_set_makes_hybrid_and_keeps_base() {
        let mut doc = sample();
        let base = doc.base().cloned().unwrap();
        doc.set("owner.zip", 150).unwrap();
        assert_eq!(doc.state(), DocumentState::Hybrid);
        assert_eq!(doc.get_i64("owner.zip"), Some(150));
        assert_eq!(doc.get_str("owner.city"), Some("Oslo"));
        assert_eq!(doc.get_str("name"), Some("rex"));
        // base tape untouched
        let original = Document::from_shared(base).unwrap();
        assert!(original.get("owner.zip").is_none());
    }

    #[test]
    fn test_set_creates_intermediate_dicts() {
        let mut doc = Document::new();
        doc.set("a.b.c", true).unwrap();
        assert!(doc.is_dict("a"));
        assert!(doc.is_dict("a.b"));
        assert_eq!(doc.get_bool("a.b.c"), Some(true));
    }

    #[test]
    fn test_set_through_scalar_is_invalid_path() {
        let mut doc = sample();
        let err = doc.set("name.first", "x").unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[test]
    fn test_set_array_indices() {
        let mut doc = sample();
        doc.set("tags.0", "z").unwrap();
        doc.set("tags.2", "c").unwrap();
        assert_eq!(doc.count("tags"), 3);
        assert_eq!(doc.get_str("tags.0"), Some("z"));
        assert_eq!(doc.get_str("tags.2"), Some("c"));
        assert!(matches!(doc.set("tags.9", "x"), Err(Error::InvalidPath(_))));
        assert!(matches!(doc.set("tags.x", "x"), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn test_set_dict_and_array() {
        let mut doc = Document::new();
        doc.set_array("list").unwrap();
        doc.set("list.0", 1).unwrap();
        doc.set_dict("meta").unwrap();
        doc.set_null("meta.none").unwrap();
        assert!(doc.is_array("list"));
        assert_eq!(doc.count("list"), 1);
        assert!(doc.is_null("meta.none"));
    }

    #[test]
    fn test_remove() {
        let mut doc = sample();
        assert!(doc.remove("owner.city").unwrap());
        assert!(!doc.remove("owner.city").unwrap());
        assert_eq!(doc.count("owner"), 0);
        assert!(doc.remove("tags.0").unwrap());
        assert_eq!(doc.get_str("tags.0"), Some("b"));
    }

    #[test]
    fn test_move_and_copy() {
        let mut doc = sample();
        assert!(doc.copy_value("owner", "previous_owner").unwrap());
        assert!(doc.move_value("tags", "labels").unwrap());
        assert!(!doc.is_exists("tags"));
        assert_eq!(doc.get_str("labels.1"), Some("b"));
        assert_eq!(doc.get_str("previous_owner.city"), Some("Oslo"));
        assert_eq!(doc.get_str("owner.city"), Some("Oslo"));
        assert!(!doc.move_value("missing", "x").unwrap());
    }

    #[test]
    fn test_flatten_preserves_content_and_order() {
        let mut doc = sample();
        doc.set("owner.zip", 150).unwrap();
        doc.set("extra", "e").unwrap();
        let before = doc.clone();
        doc.flatten().unwrap();
        assert_eq!(doc.state(), DocumentState::Immutable);
        assert!(doc.is_equal(&before));
        let keys: Vec<_> = doc.root().as_dict().unwrap().keys().collect();
        assert_eq!(keys, vec!["name", "age", "owner", "tags", "score", "extra"]);
    }

    #[test]
    fn test_serialize_is_idempotent() {
        let mut doc = Document::new();
        doc.set("x", 1).unwrap();
        doc.set("y.z", "w").unwrap();
        let first = doc.to_bytes().unwrap();
        doc.flatten().unwrap();
        let second = doc.to_bytes().unwrap();
        let third = doc.to_bytes().unwrap();
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[test]
    fn test_rewrite_with_same_values_is_byte_identical() {
        let doc = sample();
        let mut edited = doc.clone();
        edited.set("tags.1", "b").unwrap();
        assert_eq!(edited.state(), DocumentState::Hybrid);
        assert_eq!(edited.to_bytes().unwrap(), doc.to_bytes().unwrap());
    }

    #[test]
    fn test_failed_set_leaves_content_unchanged() {
        let doc = sample();
        let mut edited = doc.clone();
        assert!(edited.set("owner.city.zip", 1).is_err());
        assert_eq!(edited.to_bytes().unwrap(), doc.to_bytes().unwrap());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut doc = sample();
        doc.set("big", u64::MAX).unwrap();
        let bytes = doc.to_bytes().unwrap();
        let decoded = Document::from_bytes(&bytes).unwrap();
        assert!(decoded.is_equal(&doc));
        assert_eq!(decoded.get_u64("big"), Some(u64::MAX));
    }

    #[test]
    fn test_merge_right_wins() {
        let left = Document::from_json(r#"{"a":1,"b":2}"#).unwrap();
        let right = Document::from_json(r#"{"b":3,"c":4}"#).unwrap();
        let merged = Document::merge(&left, &right).unwrap();
        assert_eq!(merged.get_i64("a"), Some(1));
        assert_eq!(merged.get_i64("b"), Some(3));
        assert_eq!(merged.get_i64("c"), Some(4));
        assert_eq!(merged.count(""), 3);
    }

    #[test]
    fn test_merge_requires_dicts() {
        let left = Document::from_json("[1]").unwrap();
        let right = Document::new();
        assert!(matches!(
            Document::merge(&left, &right),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_compare_missing_sorts_last() {
        let a = Document::from_json(r#"{"n":1}"#).unwrap();
        let b = Document::from_json(r#"{"n":2.5}"#).unwrap();
        let c = Document::new();
        assert_eq!(a.compare(&b, "n"), Ordering::Less);
        assert_eq!(a.compare(&c, "n"), Ordering::Less);
        assert_eq!(c.compare(&a, "n"), Ordering::Greater);
        assert_eq!(c.compare(&c, "n"), Ordering::Equal);
    }

    #[test]
    fn test_measure_matches_written_size() {
        let doc = sample();
        let (cells, bytes) = measure(doc.root());
        let tape = doc.to_tape().unwrap();
        assert_eq!(cells, tape.len());
        assert_eq!(bytes, tape.string_buffer().len());
    }
}
