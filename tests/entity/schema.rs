//! Integration tests for schema registration and composition
//!
//! Tests duplicate detection, lineage composition with diamonds, nested
//! blobs, validators and unknown field handling.

use reliquary_entity::{
    AttributeDef, BlobDef, EntityManager, EntityType, ManagerConfig, Spawn, UnknownFields,
};
use reliquary_foundation::{Error, ErrorKind, Record, Result, Type, Value};

fn weapons() -> EntityManager {
    let mut entities = EntityManager::new();
    entities.register_type(EntityType::new("Item")).unwrap();
    entities
        .register_type(EntityType::new("Weapon").with_base("Item"))
        .unwrap();
    entities
        .register_type(EntityType::new("Tool").with_base("Item"))
        .unwrap();
    entities
        .register_type(EntityType::new("Axe").with_base("Weapon").with_base("Tool"))
        .unwrap();
    entities
}

// =============================================================================
// Registration
// =============================================================================

#[test]
fn duplicate_attribute_on_one_type_fails() {
    let mut entities = weapons();
    entities
        .register_attribute("Item", "name", AttributeDef::new("thing"))
        .unwrap();
    let err = entities
        .register_attribute("Item", "name", AttributeDef::new("other"))
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::AlreadyExists { .. }));
}

#[test]
fn same_name_on_unrelated_types_succeeds() {
    let mut entities = weapons();
    entities.register_type(EntityType::new("Room")).unwrap();
    entities
        .register_attribute("Room", "name", AttributeDef::new("lobby"))
        .unwrap();
    entities
        .register_attribute("Item", "name", AttributeDef::new("thing"))
        .unwrap();
}

#[test]
fn ancestor_field_cannot_be_redeclared() {
    let mut entities = weapons();
    entities
        .register_attribute("Item", "name", AttributeDef::new("thing"))
        .unwrap();
    let err = entities
        .register_attribute("Axe", "name", AttributeDef::new("axe"))
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::AlreadyExists { .. }));
}

#[test]
fn descendant_field_blocks_base_declaration() {
    let mut entities = weapons();
    entities
        .register_attribute("Axe", "edge", AttributeDef::new("sharp"))
        .unwrap();
    for base in ["Item", "Weapon", "Tool"] {
        let err = entities
            .register_attribute(base, "edge", AttributeDef::new("dull"))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::AlreadyExists { .. }));
    }
}

#[test]
fn reserved_names_are_rejected() {
    let mut entities = weapons();
    for name in ["uid", "type", "key", "flags", "tags", "active", "dirty", "savable"] {
        let err = entities
            .register_attribute("Item", name, AttributeDef::new(0))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::AlreadyExists { .. }), "{name}");
    }
}

#[test]
fn bad_default_is_type_mismatch() {
    let mut entities = weapons();
    let err = entities
        .register_attribute("Item", "weight", AttributeDef::new("heavy").with_type(Type::Int))
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::TypeMismatch { .. }));
}

// =============================================================================
// Composition
// =============================================================================

#[test]
fn diamond_counts_each_field_once() {
    let mut entities = weapons();
    entities
        .register_attribute("Item", "name", AttributeDef::new("thing"))
        .unwrap();
    entities
        .register_attribute("Weapon", "damage", AttributeDef::new(1))
        .unwrap();
    entities
        .register_attribute("Tool", "uses", AttributeDef::new(10))
        .unwrap();
    entities
        .register_attribute("Axe", "edge", AttributeDef::new("sharp"))
        .unwrap();

    // version (Entity), name (Item), damage, uses, edge
    let schema = entities.schema("Axe").unwrap();
    assert_eq!(schema.len(), 5);
    assert_eq!(
        schema.names().collect::<Vec<_>>(),
        vec!["version", "name", "damage", "uses", "edge"]
    );
    assert_eq!(entities.schema("Weapon").unwrap().len(), 3);
}

#[test]
fn late_base_fields_reach_descendants() {
    let mut entities = weapons();
    assert_eq!(entities.schema("Axe").unwrap().len(), 1);
    entities
        .register_attribute("Item", "name", AttributeDef::new("thing"))
        .unwrap();
    assert!(entities.schema("Axe").unwrap().contains("name"));
}

#[test]
fn nested_blobs_read_and_write_by_path() {
    let mut entities = weapons();
    let stats = BlobDef::new()
        .with_attribute("hp", AttributeDef::new(10).with_type(Type::Int).with_range(0.0, 100.0))
        .unwrap();
    entities.register_blob("Item", "stats", stats).unwrap();

    let item = entities.create("Item", None, Spawn::new()).unwrap();
    let mut inner = item.borrow_mut();
    assert_eq!(inner.get("stats.hp").unwrap(), Value::Int(10));
    inner.set("stats.hp", 50).unwrap();
    assert_eq!(inner.get("stats.hp").unwrap(), Value::Int(50));

    let err = inner.set("stats.hp", 500).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Validation { .. }));
    assert_eq!(inner.get("stats.hp").unwrap(), Value::Int(50));

    let stats = inner.get("stats").unwrap();
    assert_eq!(stats.as_map().unwrap().get("hp"), Some(&Value::Int(50)));
}

fn trimmed(value: &Value) -> Result<Value> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Ok(Value::from(s.trim())),
        _ => Err(Error::validation("name", "must not be blank")),
    }
}

#[test]
fn validators_sanitize_values() {
    let mut entities = weapons();
    entities
        .register_attribute("Item", "name", AttributeDef::new("thing").with_validator(trimmed))
        .unwrap();
    let item = entities.create("Item", None, Spawn::new()).unwrap();

    item.borrow_mut().set("name", "  sword ").unwrap();
    assert_eq!(item.borrow().get("name").unwrap(), Value::from("sword"));
    assert!(item.borrow_mut().set("name", "   ").is_err());
}

#[test]
fn read_only_attributes_ignore_writes() {
    let mut entities = weapons();
    entities
        .register_attribute("Item", "serial", AttributeDef::new(7).read_only())
        .unwrap();
    let item = entities.create("Item", None, Spawn::new()).unwrap();

    item.borrow_mut().set("serial", 8).unwrap();
    assert_eq!(item.borrow().get("serial").unwrap(), Value::Int(7));
    assert!(!item.borrow().is_dirty());

    // Deserialization bypasses the guard
    let mut record = Record::new();
    record.insert("serial".to_string(), Value::Int(9));
    item.borrow_mut().deserialize(record).unwrap();
    assert_eq!(item.borrow().get("serial").unwrap(), Value::Int(9));
}

// =============================================================================
// Unknown Fields
// =============================================================================

fn unknown_field_record() -> Option<Record> {
    let mut record = Record::new();
    record.insert("color".to_string(), Value::from("red"));
    Some(record)
}

#[test]
fn unknown_fields_warn_by_default() {
    let mut entities = weapons();
    let item = entities
        .create("Item", unknown_field_record(), Spawn::new())
        .unwrap();
    assert!(item.borrow().get("color").unwrap_err().is_not_found());
}

#[test]
fn unknown_fields_can_be_rejected() {
    let mut entities =
        EntityManager::with_config(ManagerConfig::new().with_unknown_fields(UnknownFields::Reject));
    entities.register_type(EntityType::new("Item")).unwrap();
    let err = entities
        .create("Item", unknown_field_record(), Spawn::new())
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Validation { .. }));
    assert!(entities.instances("Item").unwrap().is_empty());
}

#[test]
fn types_override_unknown_field_policy() {
    let mut entities = EntityManager::new();
    entities
        .register_type(EntityType::new("Strict").with_unknown_fields(UnknownFields::Reject))
        .unwrap();
    entities
        .register_type(EntityType::new("Stricter").with_base("Strict"))
        .unwrap();
    assert!(
        entities
            .create("Stricter", unknown_field_record(), Spawn::new())
            .is_err()
    );
}
