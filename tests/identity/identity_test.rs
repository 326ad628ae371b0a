//! Sovereign identifier determinism.

use serde_json::{json, Map, Value};
use sentinel::identity::{sovereign_id, SovereignId, UnitDefinition, IDENTIFIER_LEN};

#[test]
fn identical_definitions_collide() {
    let a = UnitDefinition::new("explorer", json!({"speed_ms": 5, "memory_mb": 1}));
    let b = UnitDefinition::new("explorer", json!({"speed_ms": 5, "memory_mb": 1}));
    assert_eq!(
        sovereign_id(&a).expect("hashes"),
        sovereign_id(&b).expect("hashes")
    );
}

#[test]
fn key_insertion_order_does_not_matter() {
    let mut forward = Map::new();
    forward.insert("alpha".to_owned(), json!(1));
    forward.insert("beta".to_owned(), json!({"x": [1, 2], "y": null}));

    let mut backward = Map::new();
    backward.insert("beta".to_owned(), json!({"y": null, "x": [1, 2]}));
    backward.insert("alpha".to_owned(), json!(1));

    let a = UnitDefinition::new("explorer", Value::Object(forward));
    let b = UnitDefinition::new("explorer", Value::Object(backward));
    assert_eq!(
        sovereign_id(&a).expect("hashes"),
        sovereign_id(&b).expect("hashes")
    );
}

#[test]
fn single_field_change_changes_identity() {
    let base = UnitDefinition::new("explorer", json!({"command": "./a", "version": 1}));
    let bumped = UnitDefinition::new("explorer", json!({"command": "./a", "version": 2}));
    let renamed = UnitDefinition::new("other", json!({"command": "./a", "version": 1}));

    let base_id = sovereign_id(&base).expect("hashes");
    assert_ne!(base_id, sovereign_id(&bumped).expect("hashes"));
    assert_ne!(base_id, sovereign_id(&renamed).expect("hashes"));
}

#[test]
fn identifier_is_fixed_length_lowercase_hex() {
    let id = sovereign_id(&UnitDefinition::new("explorer", json!({}))).expect("hashes");
    assert_eq!(id.as_str().len(), IDENTIFIER_LEN);
    assert!(SovereignId::parse(id.as_str()).is_ok());
}

#[test]
fn identifier_serializes_as_plain_string() {
    let id = SovereignId::parse("00112233445566aa").expect("well formed");
    assert_eq!(
        serde_json::to_string(&id).expect("serializes"),
        "\"00112233445566aa\""
    );
}

#[test]
fn identifiers_match_published_vectors() {
    let function = UnitDefinition::new(
        "explorer",
        json!({"type": "function", "code": "def f(x): return x+1", "version": 1}),
    );
    assert_eq!(sovereign_id(&function).expect("hashes").as_str(), "e5b597d4341c6041");

    let command = UnitDefinition::new(
        "explorer",
        json!({"command": "cat input.txt", "definition": {"name": "café", "weights": [1, 2.5]}}),
    );
    assert_eq!(sovereign_id(&command).expect("hashes").as_str(), "ff90c33407452519");
}
