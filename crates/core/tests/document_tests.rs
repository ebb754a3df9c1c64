//! Integration tests for documents and their encodings
//!
//! These tests exercise the public API end to end:
//! - Round trips through the tape, MessagePack and JSON forms
//! - Serialization idempotence after edits
//! - The shared-key encoding against a fixed reference dump

use proptest::prelude::*;
use tapedb_core::{
    decode_with_shared_keys, encode_with_shared_keys, Document, DocumentState, SharedKeys,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn arb_json() -> impl Strategy<Value = serde_json::Value> {
    let leaf = prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        any::<u64>().prop_map(serde_json::Value::from),
        (-1.0e9f64..1.0e9).prop_map(serde_json::Value::from),
        "[a-z ]{0,12}".prop_map(serde_json::Value::from),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(serde_json::Value::Array),
            prop::collection::btree_map("[a-z_]{1,20}", inner, 0..6)
                .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_document() -> impl Strategy<Value = Document> {
    prop::collection::btree_map("[a-z_]{1,20}", arb_json(), 0..8).prop_map(|m| {
        let json = serde_json::Value::Object(m.into_iter().collect()).to_string();
        Document::from_json(&json).unwrap()
    })
}

// ============================================================================
// Shared-key reference dump
// ============================================================================

#[test]
fn test_shared_key_golden_dump() {
    let doc = Document::from_json(
        r#"{"type":"dog","age":6,"achievements":{"id":0,"name":"Rex"}}"#,
    )
    .unwrap();
    let mut keys = SharedKeys::new();
    let bytes = encode_with_shared_keys(&doc, &mut keys).unwrap();

    let expected = concat!(
        "02",               // format
        "0d000000",         // 13 cells
        "10000000",         // 16 string bytes
        "0c0000000300007b", // { end=12 count=3
        "000000000000006b", // key#0 type
        "0000000000000022", // "dog"
        "010000000000006b", // key#1 age
        "0600000000000005", // 6
        "020000000000006b", // key#2 achievements
        "0b0000000200007b", // { end=11 count=2
        "030000000000006b", // key#3 id
        "0000000000000005", // 0
        "040000000000006b", // key#4 name
        "0800000000000022", // "Rex"
        "060000000000007d", // } start=6
        "000000000000007d", // } start=0
        "03000000646f6700", // len 3 "dog"
        "0300000052657800", // len 3 "Rex"
    );
    assert_eq!(to_hex(&bytes), expected);
    assert_eq!(keys.by_key(), &["type", "age", "achievements", "id", "name"]);

    let decoded = decode_with_shared_keys(&bytes, &keys).unwrap();
    assert!(decoded.is_equal(&doc));
    assert_eq!(decoded.get_str("achievements.name"), Some("Rex"));
}

#[test]
fn test_shared_key_table_reused_across_documents() {
    let mut keys = SharedKeys::new();
    let first = Document::from_json(r#"{"type":"dog","age":6}"#).unwrap();
    let second = Document::from_json(r#"{"age":7,"type":"cat","owner":"ann"}"#).unwrap();
    let a = encode_with_shared_keys(&first, &mut keys).unwrap();
    let b = encode_with_shared_keys(&second, &mut keys).unwrap();
    assert_eq!(keys.count(), 3);
    assert!(decode_with_shared_keys(&a, &keys).unwrap().is_equal(&first));
    assert!(decode_with_shared_keys(&b, &keys).unwrap().is_equal(&second));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_document_lifecycle() {
    let mut doc = Document::from_json(r#"{"_id":"a1","count":1,"tags":["x"]}"#).unwrap();
    assert_eq!(doc.state(), DocumentState::Immutable);

    let update = Document::from_json(r#"{"$inc":{"count":2},"$set":{"tags.1":"y"}}"#).unwrap();
    assert!(doc.update(&update).unwrap());
    assert_eq!(doc.state(), DocumentState::Hybrid);

    doc.flatten().unwrap();
    assert_eq!(doc.state(), DocumentState::Immutable);
    assert_eq!(
        doc.to_json().unwrap(),
        r#"{"_id":"a1","count":3,"tags":["x","y"]}"#
    );
}

#[test]
fn test_shared_base_between_clones() {
    let doc = Document::from_json(r#"{"a":{"b":1}}"#).unwrap();
    let mut copy = doc.clone();
    copy.set("a.b", 2).unwrap();
    assert_eq!(doc.get_i64("a.b"), Some(1));
    assert_eq!(copy.get_i64("a.b"), Some(2));
    assert!(std::sync::Arc::ptr_eq(
        doc.base().unwrap(),
        copy.base().unwrap()
    ));
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tape_roundtrip(doc in arb_document()) {
        let bytes = doc.to_bytes().unwrap();
        let decoded = Document::from_bytes(&bytes).unwrap();
        prop_assert!(decoded.is_equal(&doc));
    }

    #[test]
    fn prop_msgpack_roundtrip(doc in arb_document()) {
        let bytes = doc.to_msgpack().unwrap();
        let decoded = Document::from_msgpack(&bytes).unwrap();
        prop_assert!(decoded.is_equal(&doc));
    }

    #[test]
    fn prop_shared_key_roundtrip(doc in arb_document()) {
        let mut keys = SharedKeys::new();
        let bytes = encode_with_shared_keys(&doc, &mut keys).unwrap();
        let decoded = decode_with_shared_keys(&bytes, &keys).unwrap();
        prop_assert!(decoded.is_equal(&doc));
    }

    #[test]
    fn prop_flatten_is_idempotent(doc in arb_document(), n in any::<i64>()) {
        let mut edited = doc.clone();
        edited.set("edited.value", n).unwrap();
        let first = edited.to_bytes().unwrap();
        edited.flatten().unwrap();
        prop_assert_eq!(edited.state(), DocumentState::Immutable);
        let second = edited.to_bytes().unwrap();
        let third = edited.to_bytes().unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&second, &third);
        prop_assert_eq!(edited.get_i64("edited.value"), Some(n));
    }
}
