#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use mirra_core::{Obj, ObjKey};
use mirra_store::Store;

fn obj(name: &str, rv: &str) -> Obj {
    Obj {
        namespace: Some("ns".into()),
        name: name.into(),
        resource_version: rv.into(),
        raw: serde_json::json!({ "metadata": { "name": name, "resourceVersion": rv } }),
    }
}

#[test]
fn delete_absent_key_is_noop() {
    let store = Store::new();
    assert!(store.delete(&ObjKey::new(Some("ns"), "ghost")).is_none());
    store.insert(obj("a", "1"));
    assert_eq!(store.len(), 1);
    assert!(store.delete(&ObjKey::new(Some("ns"), "a")).is_some());
    assert!(store.delete(&ObjKey::new(Some("ns"), "a")).is_none());
    assert!(store.is_empty());
}

#[test]
fn insert_replaces_by_key() {
    let store = Store::new();
    store.insert(obj("a", "1"));
    let prev = store.insert(obj("a", "2"));
    assert_eq!(prev.unwrap().resource_version, "1");
    assert_eq!(store.len(), 1);
    let got = store.get(&ObjKey::new(Some("ns"), "a")).unwrap();
    assert_eq!(got.resource_version, "2");
}

#[test]
fn list_is_a_stable_snapshot_under_concurrent_writes() {
    let store = Arc::new(Store::new());
    for i in 0..100 {
        store.insert(obj(&format!("o{}", i), "1"));
    }

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for round in 0..50 {
                for i in 0..100 {
                    store.insert(obj(&format!("o{}", i), &format!("{}", round + 2)));
                }
            }
        })
    };

    // Every snapshot must pair each key with a fully-formed object; a
    // half-applied write would show up as a missing or empty entry.
    for _ in 0..200 {
        let snap = store.list();
        assert_eq!(snap.len(), 100);
        for o in &snap {
            assert!(!o.name.is_empty());
            assert!(!o.resource_version.is_empty());
        }
    }
    writer.join().unwrap();
}
