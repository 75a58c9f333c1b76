//! Integration tests for the entity lifecycle
//!
//! Tests construction, dirty tracking, save/revert, clone, delete, key
//! migration, weak links and the save sweep.

use std::rc::Rc;

use reliquary_entity::{EntityManager, EntityType, Link, NewKey, OLD_KEY_TAG, Spawn};
use reliquary_foundation::{ErrorKind, Value};
use reliquary_storage::{MemoryBackend, MemoryStore, Store, shared};

use crate::{item, items};

// =============================================================================
// Construction
// =============================================================================

#[test]
fn defaults_and_identity() {
    let (mut entities, _store) = items(16);
    let x = entities.create("Item", None, Spawn::new()).unwrap();
    let y = entities.create("Item", None, Spawn::new()).unwrap();

    assert_eq!(x.borrow().get("name").unwrap(), Value::from("thing"));
    assert_eq!(x.borrow().get("version").unwrap(), Value::Int(1));
    assert_ne!(x.borrow().uid(), y.borrow().uid());
    assert_eq!(x.borrow().uid().type_code(), "I");
    assert!(x.borrow().uid().time_value() < y.borrow().uid().time_value());
    assert!(!x.borrow().is_dirty());
    assert!(!x.borrow().is_active());
}

#[test]
fn spawn_options() {
    let (mut entities, _store) = items(16);
    let shown = entities
        .create("Item", item("a", "apple", 1), Spawn::new().active())
        .unwrap();
    let ghost = entities
        .create("Item", item("b", "ghost", 0), Spawn::new().transient())
        .unwrap();

    assert!(shown.borrow().is_active());
    assert!(shown.borrow().is_savable());
    assert!(!ghost.borrow().is_savable());
    let all = entities.all("Item").unwrap();
    assert_eq!(all.len(), 1);
    assert!(Rc::ptr_eq(&all[0], &shown));
}

// =============================================================================
// Dirty Tracking
// =============================================================================

#[test]
fn every_mutation_marks_dirty() {
    let (mut entities, _store) = items(16);
    let x = entities.create("Item", item("x", "x", 1), Spawn::new()).unwrap();
    let mut inner = x.borrow_mut();

    inner.set("weight", 2).unwrap();
    assert!(inner.is_dirty());
    inner.save().unwrap();
    assert!(!inner.is_dirty());

    inner.add_flags(&["cursed"]);
    assert!(inner.is_dirty());
    inner.save().unwrap();

    inner.set_tag("owner", "ann");
    assert!(inner.is_dirty());
    inner.save().unwrap();

    // Nothing changes, nothing to save
    inner.add_flags(&["cursed"]);
    assert!(!inner.is_dirty());
}

#[test]
fn built_in_fields_are_read_only() {
    let (mut entities, _store) = items(16);
    let x = entities.create("Item", None, Spawn::new()).unwrap();
    let err = x.borrow_mut().set("type", "Room").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Usage(_)));
    assert_eq!(x.borrow().get("type").unwrap(), Value::from("Item"));
}

// =============================================================================
// Serialization
// =============================================================================

#[test]
fn serialize_deserialize_round_trip() {
    let (mut entities, _store) = items(16);
    let x = entities
        .create("Item", item("x", "sword", 4), Spawn::new())
        .unwrap();
    x.borrow_mut().add_flags(&["sharp", "heavy"]);
    x.borrow_mut().set_tag("forged_by", "ann");
    let record = x.borrow().serialize();

    let (mut elsewhere, _other) = items(16);
    let copy = elsewhere.create("Item", Some(record.clone()), Spawn::new()).unwrap();
    let copy = copy.borrow();
    assert_eq!(copy.uid(), x.borrow().uid());
    assert_eq!(copy.serialize(), record);
    assert!(copy.flags().has(&["sharp", "heavy"]));
    assert_eq!(copy.tag("forged_by"), Some(&Value::from("ann")));
}

#[test]
fn record_shape() {
    let (mut entities, _store) = items(16);
    let x = entities
        .create("Item", item("x", "sword", 4), Spawn::new())
        .unwrap();
    let record = x.borrow().serialize();
    let mut keys: Vec<_> = record.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec!["flags", "ident", "name", "tags", "type", "uid", "version", "weight"]
    );
}

// =============================================================================
// Save, Load, Revert
// =============================================================================

#[test]
fn saved_entity_loads_from_store() {
    let (mut entities, store) = items(16);
    let uid = {
        let x = entities.create("Item", None, Spawn::new()).unwrap();
        let mut inner = x.borrow_mut();
        inner.set("ident", "x1").unwrap();
        inner.set("name", "sword").unwrap();
        inner.save().unwrap();
        inner.uid().clone()
    };
    assert!(store.borrow().has("x1"));

    let loaded = entities.load("Item", "x1").unwrap();
    assert_eq!(loaded.borrow().get("name").unwrap(), Value::from("sword"));
    assert_eq!(loaded.borrow().uid(), &uid);
    assert!(!loaded.borrow().is_dirty());
}

#[test]
fn revert_discards_unsaved_changes() {
    let (mut entities, _store) = items(16);
    let x = entities.create("Item", item("x", "sword", 4), Spawn::new()).unwrap();
    x.borrow_mut().save().unwrap();
    x.borrow_mut().set("weight", 40).unwrap();
    x.borrow_mut().add_flags(&["broken"]);

    x.borrow_mut().revert().unwrap();
    let inner = x.borrow();
    assert_eq!(inner.get("weight").unwrap(), Value::Int(4));
    assert!(!inner.is_dirty());
}

#[test]
fn revert_checks_uid() {
    let (mut entities, store) = items(16);
    let x = entities.create("Item", item("x", "sword", 4), Spawn::new()).unwrap();
    let mut forged = x.borrow().serialize();
    forged.insert("uid".to_string(), Value::from("I-someoneelse"));
    store.borrow_mut().put("x", forged).unwrap();

    let err = x.borrow_mut().revert().unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Consistency(_)));
}

#[test]
fn storeless_types_cannot_revert_or_clone() {
    let mut entities = EntityManager::new();
    entities.register_type(EntityType::new("Ephemera")).unwrap();
    let e = entities.create("Ephemera", None, Spawn::new()).unwrap();

    let err = e.borrow_mut().revert().unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Usage(_)));
    let err = entities.clone_entity(&e, "copy").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Usage(_)));

    // Saving is a soft no-op
    e.borrow_mut().save().unwrap();
}

// =============================================================================
// Clone
// =============================================================================

#[test]
fn clone_gets_new_uid_and_key() {
    let (mut entities, store) = items(16);
    let x = entities.create("Item", item("x1", "sword", 4), Spawn::new()).unwrap();
    x.borrow_mut().save().unwrap();

    let copy = entities.clone_entity(&x, "sword2").unwrap();
    assert_ne!(copy.borrow().uid(), x.borrow().uid());
    assert_eq!(copy.borrow().key(), "sword2");
    assert_eq!(copy.borrow().get("name").unwrap(), Value::from("sword"));
    assert!(copy.borrow().tag(OLD_KEY_TAG).is_none());

    copy.borrow_mut().save().unwrap();
    assert!(store.borrow().has("sword2"));
    assert!(store.borrow().has("x1"));
    let loaded = entities.load("Item", "sword2").unwrap();
    assert!(Rc::ptr_eq(&loaded, &copy));
}

#[test]
fn clone_onto_stored_key_fails() {
    let (mut entities, _store) = items(16);
    let x = entities.create("Item", item("x1", "sword", 4), Spawn::new()).unwrap();
    x.borrow_mut().save().unwrap();

    let err = entities.clone_entity(&x, "x1").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::DuplicateKey(_)));
    assert_eq!(entities.instances("Item").unwrap().len(), 1);
}

#[test]
fn clone_with_generated_key() {
    let (mut entities, _store) = items(16);
    let x = entities.create("Item", item("x1", "sword", 4), Spawn::new()).unwrap();
    let copy = entities
        .clone_entity(&x, NewKey::generate(|| "generated".to_string()))
        .unwrap();
    assert_eq!(copy.borrow().key(), "generated");
}

// =============================================================================
// Delete
// =============================================================================

#[test]
fn deleted_entity_no_longer_exists() {
    let (mut entities, store) = items(16);
    let x = entities.create("Item", item("x1", "sword", 4), Spawn::new()).unwrap();
    x.borrow_mut().save().unwrap();
    store.borrow_mut().commit().unwrap();
    assert!(entities.exists("Item", "x1").unwrap());

    entities.delete(&x).unwrap();
    assert!(!entities.exists("Item", "x1").unwrap());
    assert!(entities.load("Item", "x1").unwrap_err().is_not_found());
    assert!(entities.cached("Item", "ident", "x1").unwrap().is_none());
    // Still registered as a live instance
    assert_eq!(entities.instances("Item").unwrap().len(), 1);

    store.borrow_mut().commit().unwrap();
    assert!(store.borrow().keys().unwrap().is_empty());
}

#[test]
fn saving_restores_a_deleted_entity() {
    let (mut entities, _store) = items(16);
    let x = entities.create("Item", item("x1", "sword", 4), Spawn::new()).unwrap();
    x.borrow_mut().save().unwrap();
    entities.delete(&x).unwrap();

    x.borrow_mut().save().unwrap();
    assert!(entities.exists("Item", "x1").unwrap());
    assert!(Rc::ptr_eq(&entities.load("Item", "x1").unwrap(), &x));
}

// =============================================================================
// Key Migration
// =============================================================================

#[test]
fn renaming_moves_the_stored_record() {
    let (mut entities, store) = items(16);
    let x = entities.create("Item", item("x1", "sword", 4), Spawn::new()).unwrap();
    x.borrow_mut().save().unwrap();

    entities.set_key(&x, "x2").unwrap();
    assert_eq!(x.borrow().tag(OLD_KEY_TAG), Some(&Value::from("x1")));
    x.borrow_mut().save().unwrap();

    assert!(!store.borrow().has("x1"));
    assert!(store.borrow().has("x2"));
    assert!(x.borrow().tag(OLD_KEY_TAG).is_none());
    assert!(Rc::ptr_eq(&entities.load("Item", "x2").unwrap(), &x));
    assert!(entities.try_load("Item", "x1", Default::default()).unwrap().is_none());
}

#[test]
fn deleting_a_renamed_entity_removes_both_records() {
    let (mut entities, store) = items(16);
    let x = entities.create("Item", item("x1", "sword", 4), Spawn::new()).unwrap();
    x.borrow_mut().save().unwrap();
    store.borrow_mut().commit().unwrap();
    x.borrow_mut().set("ident", "x2").unwrap();
    x.borrow_mut().save().unwrap();
    x.borrow_mut().set("ident", "x3").unwrap();

    entities.delete(&x).unwrap();
    assert!(!store.borrow().has("x1"));
    assert!(!store.borrow().has("x2"));
}

// =============================================================================
// Links
// =============================================================================

#[derive(Debug)]
struct Session {
    address: String,
}

#[test]
fn links_do_not_keep_targets_alive() {
    let (mut entities, _store) = items(16);
    let player = entities.create("Item", item("p", "player", 1), Spawn::new()).unwrap();
    let session = Rc::new(Session {
        address: "127.0.0.1".to_string(),
    });
    player
        .borrow_mut()
        .set_link("session", Link::to_object(&session));
    assert_eq!(
        player.borrow().linked_object::<Session>("session").unwrap().address,
        "127.0.0.1"
    );

    drop(session);
    let err = player
        .borrow()
        .linked_object::<Session>("session")
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::LinkGone(_)));
}

#[test]
fn entity_links_report_gone() {
    let (mut entities, _store) = items(16);
    let holder = entities.create("Item", item("h", "holder", 1), Spawn::new()).unwrap();
    {
        let held = entities.create("Item", item("s", "sword", 1), Spawn::new()).unwrap();
        holder.borrow_mut().set_link("holding", Link::to_entity(&held));
        let resolved = holder.borrow().linked("holding").unwrap();
        assert!(Rc::ptr_eq(&resolved, &held));
        // Drop the cache's reference too
        entities.delete(&held).unwrap();
    }

    let err = holder.borrow().linked("holding").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::LinkGone(_)));
}

// =============================================================================
// Save Sweep
// =============================================================================

#[test]
fn save_all_saves_dirty_savable_instances() {
    let (mut entities, store) = items(16);
    let dirty = entities.create("Item", item("a", "a", 1), Spawn::new()).unwrap();
    let clean = entities.create("Item", item("b", "b", 1), Spawn::new()).unwrap();
    let transient = entities
        .create("Item", item("c", "c", 1), Spawn::new().transient())
        .unwrap();
    let deleted = entities.create("Item", item("d", "d", 1), Spawn::new()).unwrap();

    dirty.borrow_mut().set("weight", 2).unwrap();
    transient.borrow_mut().set("weight", 2).unwrap();
    deleted.borrow_mut().set("weight", 2).unwrap();
    entities.delete(&deleted).unwrap();

    assert_eq!(entities.save_all(), 1);
    assert!(!dirty.borrow().is_dirty());
    assert!(store.borrow().has("a"));
    assert!(!store.borrow().has("b"));
    assert!(!store.borrow().has("c"));
    assert!(!clean.borrow().is_dirty());
    assert_eq!(entities.save_all(), 0);
}

#[test]
fn save_all_skips_busy_entities() {
    let (mut entities, _store) = items(16);
    let x = entities.create("Item", item("a", "a", 1), Spawn::new()).unwrap();
    x.borrow_mut().dirty();
    let _guard = x.borrow_mut();
    assert_eq!(entities.save_all(), 0);
}

#[test]
fn commit_stores_flushes_transactions() {
    let (mut entities, store) = items(16);
    let other = shared(MemoryStore::new(MemoryBackend::new()));
    entities
        .register_type(EntityType::new("Room").with_store(Rc::clone(&other)))
        .unwrap();
    let x = entities.create("Item", item("a", "a", 1), Spawn::new()).unwrap();
    let room = entities.create("Room", None, Spawn::new()).unwrap();
    x.borrow_mut().save().unwrap();
    room.borrow_mut().save().unwrap();

    assert_eq!(entities.commit_stores().unwrap(), 2);
    assert!(!store.borrow().is_pending());
    assert!(!other.borrow().is_pending());
}
