//! Copy-on-write overlay for document edits
//!
//! Edits never touch tape bytes. Instead the containers along an edited path
//! are materialized into heap nodes held in an arena owned by the document.
//! Nodes are addressed by [`NodeId`] handles; a handle is only meaningful for
//! the overlay that issued it.
//!
//! A heap node's children are [`Slot`]s: an untouched tape value (by index),
//! an owned scalar, or another heap node.
//!
//! Nodes replaced or removed by later edits stay in the arena until
//! [`Overlay::compact`] copies the reachable ones into a fresh arena.

use crate::error::{Error, Result};
use crate::tape::{Tape, TapeType};

/// Arena size below which compaction is never worth it
const COMPACT_MIN_NODES: usize = 64;

/// Handle to a node in an [`Overlay`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Arena index of this node
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An owned scalar value stored in the overlay
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Double
    Double(f64),
    /// String
    String(String),
}

impl From<()> for Scalar {
    fn from(_: ()) -> Self {
        Scalar::Null
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self {
        Scalar::UInt(v as u64)
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Scalar::UInt(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Double(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::String(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::String(v)
    }
}

/// Where a child value lives
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// Untouched value on the document's base tape
    Tape(usize),
    /// Owned scalar
    Scalar(Scalar),
    /// Materialized container
    Node(NodeId),
}

/// Container kind of a heap node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Ordered key/value pairs
    Dict,
    /// Ordered values
    Array,
}

impl NodeKind {
    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Dict => "dict",
            NodeKind::Array => "array",
        }
    }
}

/// Mutable dict node; keeps insertion order
#[derive(Debug, Clone, Default)]
pub struct HeapDict {
    pub(crate) entries: Vec<(String, Slot)>,
}

impl HeapDict {
    /// Position of `key`
    pub fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Slot stored under `key`
    pub fn get(&self, key: &str) -> Option<&Slot> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    /// Insert or overwrite; new keys go to the end
    pub fn insert(&mut self, key: &str, slot: Slot) {
        match self.position(key) {
            Some(i) => self.entries[i].1 = slot,
            None => self.entries.push((key.to_string(), slot)),
        }
    }

    /// Remove `key`, preserving the order of the rest
    pub fn remove(&mut self, key: &str) -> Option<Slot> {
        self.position(key).map(|i| self.entries.remove(i).1)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mutable array node
#[derive(Debug, Clone, Default)]
pub struct HeapArray {
    pub(crate) items: Vec<Slot>,
}

impl HeapArray {
    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Contents of a heap node
#[derive(Debug, Clone)]
pub enum NodeBody {
    /// Dict contents
    Dict(HeapDict),
    /// Array contents
    Array(HeapArray),
}

/// A heap node with its dirty flag
#[derive(Debug, Clone)]
pub struct HeapNode {
    pub(crate) body: NodeBody,
    /// Tape index this node was seeded from, if any
    pub(crate) source: Option<usize>,
    pub(crate) changed: bool,
}

impl HeapNode {
    /// Empty node of the given kind
    pub fn empty(kind: NodeKind) -> Self {
        let body = match kind {
            NodeKind::Dict => NodeBody::Dict(HeapDict::default()),
            NodeKind::Array => NodeBody::Array(HeapArray::default()),
        };
        HeapNode {
            body,
            source: None,
            changed: true,
        }
    }

    /// Dict node with the given entries
    pub fn dict(entries: Vec<(String, Slot)>) -> Self {
        HeapNode {
            body: NodeBody::Dict(HeapDict { entries }),
            source: None,
            changed: true,
        }
    }

    /// Array node with the given items
    pub fn array(items: Vec<Slot>) -> Self {
        HeapNode {
            body: NodeBody::Array(HeapArray { items }),
            source: None,
            changed: true,
        }
    }

    /// Kind of this node
    pub fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::Dict(_) => NodeKind::Dict,
            NodeBody::Array(_) => NodeKind::Array,
        }
    }

    /// Contents
    pub fn body(&self) -> &NodeBody {
        &self.body
    }

    /// Mutable contents
    pub fn body_mut(&mut self) -> &mut NodeBody {
        &mut self.body
    }

    /// True if edited since it was seeded from the tape
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Tape index of an unedited copy; `None` once the node has changed
    pub fn unchanged_source(&self) -> Option<usize> {
        if self.changed {
            None
        } else {
            self.source
        }
    }
}

/// Arena of heap nodes owned by one document
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    nodes: Vec<HeapNode>,
    /// Reachable nodes at the last compaction
    live: usize,
}

impl Overlay {
    /// Empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated nodes, including unreachable ones
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if no node was ever allocated
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True once the arena has grown to twice its last live size
    pub fn needs_compaction(&self) -> bool {
        self.nodes.len() >= COMPACT_MIN_NODES.max(self.live * 2)
    }

    /// Keep only the nodes reachable from `root`
    ///
    /// Returns `root` rewritten for the new arena. Every [`NodeId`] issued
    /// before the call is invalid afterwards.
    pub fn compact(&mut self, root: &Slot) -> Result<Slot> {
        let mut fresh = Overlay::new();
        let root = self.copy_into(&mut fresh, root)?;
        fresh.live = fresh.nodes.len();
        *self = fresh;
        Ok(root)
    }

    fn copy_into(&self, fresh: &mut Overlay, slot: &Slot) -> Result<Slot> {
        let id = match slot {
            Slot::Node(id) => *id,
            other => return Ok(other.clone()),
        };
        let node = self.node(id)?;
        let body = match &node.body {
            NodeBody::Dict(dict) => {
                let mut entries = Vec::with_capacity(dict.entries.len());
                for (key, child) in &dict.entries {
                    entries.push((key.clone(), self.copy_into(fresh, child)?));
                }
                NodeBody::Dict(HeapDict { entries })
            }
            NodeBody::Array(array) => {
                let mut items = Vec::with_capacity(array.items.len());
                for child in &array.items {
                    items.push(self.copy_into(fresh, child)?);
                }
                NodeBody::Array(HeapArray { items })
            }
        };
        Ok(Slot::Node(fresh.alloc(HeapNode {
            body,
            source: node.source,
            changed: node.changed,
        })))
    }

    /// Add a node to the arena
    pub fn alloc(&mut self, node: HeapNode) -> NodeId {
        self.nodes.push(node);
        NodeId((self.nodes.len() - 1) as u32)
    }

    /// Node by handle
    pub fn node(&self, id: NodeId) -> Result<&HeapNode> {
        let len = self.nodes.len();
        self.nodes.get(id.index()).ok_or(Error::OutOfRange {
            index: id.index(),
            len,
        })
    }

    /// Mutable node by handle
    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut HeapNode> {
        let len = self.nodes.len();
        self.nodes.get_mut(id.index()).ok_or(Error::OutOfRange {
            index: id.index(),
            len,
        })
    }

    /// Flag a node as edited so serialization re-encodes it
    pub fn set_changed(&mut self, id: NodeId) -> Result<()> {
        self.node_mut(id)?.changed = true;
        Ok(())
    }

    /// Container kind of a slot, or `None` for scalars
    pub fn slot_kind(&self, tape: Option<&Tape>, slot: &Slot) -> Result<Option<NodeKind>> {
        match slot {
            Slot::Scalar(_) => Ok(None),
            Slot::Node(id) => Ok(Some(self.node(*id)?.kind())),
            Slot::Tape(index) => {
                let tape = tape.ok_or_else(|| Error::Malformed("tape slot without a tape".into()))?;
                Ok(match tape.at(*index).tape_type()? {
                    TapeType::DictStart => Some(NodeKind::Dict),
                    TapeType::ArrayStart => Some(NodeKind::Array),
                    _ => None,
                })
            }
        }
    }

    /// Return a mutable node for `slot`
    ///
    /// An existing heap node of the right kind is returned as is. A tape
    /// container of the right kind is copied shallowly: its children become
    /// tape slots. Anything else yields a fresh empty node.
    pub fn mutable_copy(
        &mut self,
        tape: Option<&Tape>,
        slot: &Slot,
        kind: NodeKind,
    ) -> Result<NodeId> {
        match slot {
            Slot::Node(id) if self.node(*id)?.kind() == kind => Ok(*id),
            Slot::Tape(index) => match (tape, self.slot_kind(tape, slot)?) {
                (Some(tape), Some(found)) if found == kind => {
                    let node = seed_from_tape(tape, *index, kind)?;
                    Ok(self.alloc(node))
                }
                _ => Ok(self.alloc(HeapNode::empty(kind))),
            },
            _ => Ok(self.alloc(HeapNode::empty(kind))),
        }
    }
}

fn seed_from_tape(tape: &Tape, index: usize, kind: NodeKind) -> Result<HeapNode> {
    let start = tape.at(index);
    let end = start.matching_end()?;
    let mut i = index + 1;
    let body = match kind {
        NodeKind::Dict => {
            let mut entries = Vec::with_capacity(start.element_count()?);
            while i < end {
                let key = tape.at(i).get_str()?.to_string();
                let value = i + 1;
                entries.push((key, Slot::Tape(value)));
                i = tape.at(value).after()?;
            }
            NodeBody::Dict(HeapDict { entries })
        }
        NodeKind::Array => {
            let mut items = Vec::with_capacity(start.element_count()?);
            while i < end {
                items.push(Slot::Tape(i));
                i = tape.at(i).after()?;
            }
            NodeBody::Array(HeapArray { items })
        }
    };
    Ok(HeapNode {
        body,
        source: Some(index),
        changed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::{TapeBuilder, VecTapeWriter};

    fn tape() -> Tape {
        let mut b = TapeBuilder::new(VecTapeWriter::new());
        b.start_dict().unwrap();
        b.build_str("a").unwrap();
        b.build_i64(1).unwrap();
        b.build_str("list").unwrap();
        b.start_array().unwrap();
        b.build_str("x").unwrap();
        b.build_f64(0.5).unwrap();
        b.end_array().unwrap();
        b.end_dict().unwrap();
        b.into_writer().unwrap().into_tape()
    }

    #[test]
    fn test_compact_drops_unreachable_nodes() {
        let mut overlay = Overlay::new();
        let leaf = overlay.alloc(HeapNode::array(vec![Slot::Scalar(Scalar::Null)]));
        for _ in 0..10 {
            overlay.alloc(HeapNode::empty(NodeKind::Dict));
        }
        let root = overlay.alloc(HeapNode::dict(vec![
            ("list".to_string(), Slot::Node(leaf)),
            ("t".to_string(), Slot::Tape(3)),
        ]));
        assert_eq!(overlay.len(), 12);

        let root = overlay.compact(&Slot::Node(root)).unwrap();
        assert_eq!(overlay.len(), 2);
        let id = match root {
            Slot::Node(id) => id,
            other => panic!("root became {:?}", other),
        };
        let entries = match overlay.node(id).unwrap().body() {
            NodeBody::Dict(dict) => dict.entries.clone(),
            NodeBody::Array(_) => panic!("root should stay a dict"),
        };
        assert_eq!(entries[1], ("t".to_string(), Slot::Tape(3)));
        match &entries[0].1 {
            Slot::Node(list) => assert_eq!(overlay.node(*list).unwrap().kind(), NodeKind::Array),
            other => panic!("list became {:?}", other),
        }
        assert!(!overlay.needs_compaction());
    }

    #[test]
    fn test_mutable_copy_seeds_from_tape() {
        let tape = tape();
        let mut overlay = Overlay::new();
        let id = overlay
            .mutable_copy(Some(&tape), &Slot::Tape(0), NodeKind::Dict)
            .unwrap();
        let node = overlay.node(id).unwrap();
        assert!(!node.is_changed());
        assert_eq!(node.unchanged_source(), Some(0));
        match node.body() {
            NodeBody::Dict(d) => {
                assert_eq!(d.len(), 2);
                assert_eq!(d.get("a"), Some(&Slot::Tape(2)));
                assert_eq!(d.get("list"), Some(&Slot::Tape(4)));
            }
            NodeBody::Array(_) => panic!("expected dict"),
        }
    }

    #[test]
    fn test_mutable_copy_reuses_node() {
        let mut overlay = Overlay::new();
        let id = overlay.alloc(HeapNode::empty(NodeKind::Array));
        let again = overlay
            .mutable_copy(None, &Slot::Node(id), NodeKind::Array)
            .unwrap();
        assert_eq!(id, again);
        assert_eq!(overlay.len(), 1);
    }

    #[test]
    fn test_mutable_copy_of_scalar_is_fresh() {
        let tape = tape();
        let mut overlay = Overlay::new();
        let id = overlay
            .mutable_copy(Some(&tape), &Slot::Tape(2), NodeKind::Dict)
            .unwrap();
        assert!(overlay.node(id).unwrap().is_changed());
        assert_eq!(overlay.node(id).unwrap().unchanged_source(), None);
    }

    #[test]
    fn test_set_changed() {
        let tape = tape();
        let mut overlay = Overlay::new();
        let id = overlay
            .mutable_copy(Some(&tape), &Slot::Tape(4), NodeKind::Array)
            .unwrap();
        assert!(!overlay.node(id).unwrap().is_changed());
        overlay.set_changed(id).unwrap();
        assert!(overlay.node(id).unwrap().is_changed());
    }

    #[test]
    fn test_heap_dict_keeps_order() {
        let mut dict = HeapDict::default();
        dict.insert("b", Slot::Scalar(Scalar::Int(1)));
        dict.insert("a", Slot::Scalar(Scalar::Int(2)));
        dict.insert("b", Slot::Scalar(Scalar::Int(3)));
        let keys: Vec<_> = dict.entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(dict.remove("b"), Some(Slot::Scalar(Scalar::Int(3))));
        assert_eq!(dict.len(), 1);
    }
}
