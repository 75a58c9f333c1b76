//! Integration tests for entities persisted to a file-backed store
//!
//! Each test writes through one manager and reads back through a fresh
//! manager with its own store over the same directory.

use std::path::Path;
use std::rc::Rc;

use reliquary_entity::{AttributeDef, BlobDef, EntityManager, EntityType, KeySpec, ManagerConfig, Spawn};
use reliquary_foundation::{Type, Value};
use reliquary_storage::{FileBackend, FileStore, shared};

use crate::item;

fn world(dir: &Path, capacity: usize) -> EntityManager {
    let store = shared(FileStore::new(FileBackend::create(dir).unwrap()));
    let mut entities =
        EntityManager::with_config(ManagerConfig::new().with_cache_capacity(capacity));
    entities
        .register_type(
            EntityType::new("Item")
                .with_code("I")
                .with_key(KeySpec::Attribute("ident".to_string()))
                .with_store(Rc::clone(&store)),
        )
        .unwrap();
    entities
        .register_attribute("Item", "ident", AttributeDef::new("").with_type(Type::String))
        .unwrap();
    entities
        .register_attribute("Item", "name", AttributeDef::new("thing").with_type(Type::String))
        .unwrap();
    entities
        .register_attribute("Item", "weight", AttributeDef::new(1).with_type(Type::Int))
        .unwrap();
    let stats = BlobDef::new()
        .with_attribute("hp", AttributeDef::new(10).with_type(Type::Int))
        .unwrap();
    entities.register_blob("Item", "stats", stats).unwrap();
    entities
}

#[test]
fn committed_entities_load_in_a_new_manager() {
    let dir = tempfile::tempdir().unwrap();
    let uid = {
        let mut entities = world(dir.path(), 16);
        let sword = entities
            .create("Item", item("sword", "Sword of Ages", 4), Spawn::new())
            .unwrap();
        {
            let mut inner = sword.borrow_mut();
            inner.set("stats.hp", 25).unwrap();
            inner.add_flags(&["sharp"]);
            inner.set_tag("forged_by", "ann");
            inner.save().unwrap();
        }
        assert_eq!(entities.commit_stores().unwrap(), 1);
        let uid = sword.borrow().uid().clone();
        uid
    };

    let mut entities = world(dir.path(), 16);
    let sword = entities.load("Item", "sword").unwrap();
    let inner = sword.borrow();
    assert_eq!(inner.uid(), &uid);
    assert_eq!(inner.get("name").unwrap(), Value::from("Sword of Ages"));
    assert_eq!(inner.get("weight").unwrap(), Value::Int(4));
    assert_eq!(inner.get("stats.hp").unwrap(), Value::Int(25));
    assert!(inner.flags().has(&["sharp"]));
    assert_eq!(inner.tag("forged_by"), Some(&Value::from("ann")));
    assert!(!inner.is_dirty());
}

#[test]
fn uncommitted_saves_stay_private() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = world(dir.path(), 16);
    let sword = writer
        .create("Item", item("sword", "sword", 4), Spawn::new())
        .unwrap();
    sword.borrow_mut().save().unwrap();
    assert!(writer.exists("Item", "sword").unwrap());

    let mut reader = world(dir.path(), 16);
    assert!(!reader.exists("Item", "sword").unwrap());

    writer.commit_stores().unwrap();
    assert!(reader.exists("Item", "sword").unwrap());
}

#[test]
fn renames_and_deletes_reach_the_files() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut entities = world(dir.path(), 16);
        let sword = entities
            .create("Item", item("sword", "sword", 4), Spawn::new())
            .unwrap();
        let axe = entities.create("Item", item("axe", "axe", 6), Spawn::new()).unwrap();
        sword.borrow_mut().save().unwrap();
        axe.borrow_mut().save().unwrap();
        entities.commit_stores().unwrap();

        entities.set_key(&sword, "blade").unwrap();
        sword.borrow_mut().save().unwrap();
        entities.delete(&axe).unwrap();
        entities.commit_stores().unwrap();
    }

    let mut entities = world(dir.path(), 16);
    assert!(entities.exists("Item", "blade").unwrap());
    assert!(!entities.exists("Item", "sword").unwrap());
    assert!(!entities.exists("Item", "axe").unwrap());
}

#[test]
fn evicted_entities_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut entities = world(dir.path(), 2);
        for ident in ["a", "b", "c"] {
            entities
                .create("Item", item(ident, ident, 1), Spawn::new())
                .unwrap();
        }
        entities.commit_stores().unwrap();
    }

    let mut entities = world(dir.path(), 2);
    assert!(entities.exists("Item", "a").unwrap());
    assert!(!entities.exists("Item", "c").unwrap());
}

#[test]
fn save_all_then_commit() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut entities = world(dir.path(), 16);
        let kept: Vec<_> = ["a", "b"]
            .iter()
            .map(|ident| {
                entities
                    .create("Item", item(ident, ident, 1), Spawn::new())
                    .unwrap()
            })
            .collect();
        for entity in &kept {
            entity.borrow_mut().set("weight", 3).unwrap();
        }
        assert_eq!(entities.save_all(), 2);
        entities.commit_stores().unwrap();
    }

    let mut entities = world(dir.path(), 16);
    let b = entities.load("Item", "b").unwrap();
    assert_eq!(b.borrow().get("weight").unwrap(), Value::Int(3));
}
