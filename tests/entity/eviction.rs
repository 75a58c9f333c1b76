//! Integration tests for write-back eviction from the primary cache

use std::rc::Rc;

use reliquary_entity::{EntityManager, EntityRef, Spawn};
use reliquary_foundation::Value;
use reliquary_storage::Store;

use crate::{item, items};

fn fill(entities: &mut EntityManager, count: usize, spawn: Spawn) -> Vec<EntityRef> {
    (0..count)
        .map(|i| {
            let ident = format!("i{i}");
            entities.create("Item", item(&ident, "thing", 1), spawn).unwrap()
        })
        .collect()
}

#[test]
fn overflow_saves_exactly_one_entity() {
    let (mut entities, store) = items(3);
    let _kept = fill(&mut entities, 4, Spawn::new());

    let keys = store.borrow().keys().unwrap();
    assert_eq!(keys, vec!["i0".to_string()]);
}

#[test]
fn within_capacity_nothing_is_saved() {
    let (mut entities, store) = items(3);
    let _kept = fill(&mut entities, 3, Spawn::new());
    assert!(store.borrow().keys().unwrap().is_empty());
}

#[test]
fn recent_loads_protect_entries() {
    let (mut entities, store) = items(3);
    let _kept = fill(&mut entities, 3, Spawn::new());
    entities.load("Item", "i0").unwrap();
    let _extra = entities
        .create("Item", item("i3", "thing", 1), Spawn::new())
        .unwrap();

    assert!(!store.borrow().has("i0"));
    assert!(store.borrow().has("i1"));
}

#[test]
fn evicted_dirty_entity_is_written_back() {
    let (mut entities, store) = items(2);
    let kept = fill(&mut entities, 2, Spawn::new());
    kept[0].borrow_mut().set("weight", 7).unwrap();
    let _extra = entities
        .create("Item", item("i2", "thing", 1), Spawn::new())
        .unwrap();

    assert!(!kept[0].borrow().is_dirty());
    let record = store.borrow().get("i0").unwrap();
    assert_eq!(record.get("weight"), Some(&Value::Int(7)));
}

#[test]
fn evicted_entities_remain_resolvable() {
    let (mut entities, _store) = items(2);
    let kept = fill(&mut entities, 3, Spawn::new());
    let loaded = entities.load("Item", "i0").unwrap();
    assert!(Rc::ptr_eq(&loaded, &kept[0]));
}

#[test]
fn dropped_entities_reload_from_the_store() {
    let (mut entities, _store) = items(2);
    let uid = {
        let first = entities
            .create("Item", item("i0", "relic", 5), Spawn::new())
            .unwrap();
        first.borrow().uid().clone()
    };
    let _rest: Vec<EntityRef> = ["i1", "i2"]
        .iter()
        .map(|ident| {
            entities
                .create("Item", item(ident, "thing", 1), Spawn::new())
                .unwrap()
        })
        .collect();
    assert!(entities.instances("Item").unwrap().iter().all(|e| e.borrow().uid() != &uid));

    let loaded = entities.load("Item", "i0").unwrap();
    assert_eq!(loaded.borrow().uid(), &uid);
    assert_eq!(loaded.borrow().get("name").unwrap(), Value::from("relic"));
}

#[test]
fn transient_evictions_are_not_saved() {
    let (mut entities, store) = items(2);
    let _kept = fill(&mut entities, 3, Spawn::new().transient());
    assert!(store.borrow().keys().unwrap().is_empty());
}

#[test]
fn busy_evictions_are_skipped() {
    let (mut entities, store) = items(2);
    let kept = fill(&mut entities, 2, Spawn::new());
    {
        let _guard = kept[0].borrow_mut();
        let _extra = entities
            .create("Item", item("i2", "thing", 1), Spawn::new())
            .unwrap();
    }
    assert!(store.borrow().keys().unwrap().is_empty());
}
