//! End-to-end store scenarios: routing, ordering, merge and reopen behavior.

use skein_core::{DataType, Event, Value};
use skein_store::{EnvOptions, Store, StoreError};
use std::collections::BTreeMap;
use tempfile::TempDir;

// 2000-01-01T00:00:00Z in microseconds.
const Y2K: i64 = 946_684_800_000_000;

fn secs(offset: i64) -> i64 {
    Y2K + offset * 1_000_000
}

fn with_store(shard_count: usize, f: impl FnOnce(&Store)) {
    let dir = TempDir::new().unwrap();
    let mut store = Store::new(EnvOptions::default());
    store.open(dir.path(), shard_count).unwrap();
    store.create_table("foo").unwrap();
    f(&store);
    store.close().unwrap();
}

#[test]
fn insert_and_fetch() {
    with_store(0, |store| {
        store
            .insert_event("foo", "bar", Event::new(secs(0)).with_field(1, "john"))
            .unwrap();
        let event = store.get_event("foo", "bar", secs(0)).unwrap().unwrap();
        assert_eq!(event.timestamp, secs(0));
        assert_eq!(event.get(1), Some(&Value::Str("john".into())));
    });
}

#[test]
fn out_of_order_inserts_preserve_order() {
    with_store(0, |store| {
        store
            .insert_event(
                "foo",
                "bar",
                Event::new(secs(2)).with_field(1, "john").with_field(-1, 100i64),
            )
            .unwrap();
        store
            .insert_event(
                "foo",
                "bar",
                Event::new(secs(1)).with_field(1, "jane").with_field(2, "test"),
            )
            .unwrap();
        store
            .insert_event("foo", "bar", Event::new(secs(3)).with_field(1, "jose"))
            .unwrap();

        let events = store.get_events("foo", "bar").unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].timestamp, secs(1));
        assert_eq!(events[0].get(-1), None);
        assert_eq!(events[0].get(1), Some(&Value::Str("jane".into())));
        assert_eq!(events[0].get(2), Some(&Value::Str("test".into())));
        assert_eq!(events[1].timestamp, secs(2));
        assert_eq!(events[1].get(-1), Some(&Value::Int(100)));
        assert_eq!(events[1].get(2), None);
        assert_eq!(events[2].timestamp, secs(3));
        assert_eq!(events[2].get(1), Some(&Value::Str("jose".into())));
    });
}

#[test]
fn insert_objects_batches_across_shards() {
    with_store(0, |store| {
        let mut objects = BTreeMap::new();
        objects.insert(
            "bar".to_string(),
            vec![
                Event::new(secs(2)).with_field(2, 100i64),
                Event::new(secs(0)).with_field(1, "john"),
            ],
        );
        objects.insert(
            "bat".to_string(),
            vec![Event::new(secs(0)).with_field(1, "jose")],
        );

        let n = store.insert_objects("foo", objects).unwrap();
        assert_eq!(n, 3);

        let events = store.get_events("foo", "bar").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].get(1), Some(&Value::Str("john".into())));
        assert_eq!(events[1].get(2), Some(&Value::Int(100)));

        let events = store.get_events("foo", "bat").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get(1), Some(&Value::Str("jose".into())));
    });
}

#[test]
fn delete_event_leaves_others() {
    with_store(0, |store| {
        store
            .insert_event("foo", "bar", Event::new(secs(0)).with_field(1, "john"))
            .unwrap();
        store.delete_event("foo", "bar", secs(0)).unwrap();
        assert!(store.get_event("foo", "bar", secs(0)).unwrap().is_none());

        store
            .insert_event("foo", "bar", Event::new(secs(0)).with_field(1, "john"))
            .unwrap();
        store.delete_event("foo", "bar", secs(1)).unwrap();
        assert!(store.get_event("foo", "bar", secs(0)).unwrap().is_some());
    });
}

#[test]
fn delete_object_removes_all_events() {
    with_store(0, |store| {
        store
            .insert_event("foo", "bar", Event::new(secs(0)).with_field(1, "john"))
            .unwrap();
        store
            .insert_event("foo", "bar", Event::new(secs(1)).with_field(1, "jane"))
            .unwrap();
        store.delete_object("foo", "bar").unwrap();
        assert!(store.get_events("foo", "bar").unwrap().is_empty());
    });
}

#[test]
fn merge_with_overlap_keeps_destination() {
    with_store(0, |store| {
        store
            .insert_event("foo", "bar", Event::new(secs(3)).with_field(1, "john"))
            .unwrap();
        store
            .insert_event("foo", "bar", Event::new(secs(2)).with_field(1, "jane"))
            .unwrap();
        store
            .insert_event("foo", "bat", Event::new(secs(2)).with_field(1, "joe"))
            .unwrap();
        store
            .insert_event("foo", "bat", Event::new(secs(1)).with_field(1, "jose"))
            .unwrap();

        store.merge("foo", "bar", "bat").unwrap();

        let events = store.get_events("foo", "bar").unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].timestamp, secs(1));
        assert_eq!(events[0].get(1), Some(&Value::Str("jose".into())));
        // destination retains its own event on the timestamp tie
        assert_eq!(events[1].timestamp, secs(2));
        assert_eq!(events[1].get(1), Some(&Value::Str("jane".into())));
        assert_eq!(events[2].timestamp, secs(3));
        assert_eq!(events[2].get(1), Some(&Value::Str("john".into())));

        assert!(store.get_events("foo", "bat").unwrap().is_empty());
    });
}

#[test]
fn reopen_restores_state() {
    let dir = TempDir::new().unwrap();
    let mut store = Store::new(EnvOptions::default());
    store.open(dir.path(), 2).unwrap();
    store.create_table("foo").unwrap();
    store
        .insert_event("foo", "bar", Event::new(secs(0)).with_field(1, "john"))
        .unwrap();
    store.close().unwrap();
    assert!(store.path().is_none());

    store.open(dir.path(), 0).unwrap();
    assert_eq!(store.shard_count(), 2);
    let event = store.get_event("foo", "bar", secs(0)).unwrap().unwrap();
    assert_eq!(event.timestamp, secs(0));
    assert_eq!(event.get(1), Some(&Value::Str("john".into())));
    store.close().unwrap();
}

#[test]
fn factor_ids_stable_across_restart() {
    let dir = TempDir::new().unwrap();
    let mut store = Store::new(EnvOptions::default());
    store.open(dir.path(), 2).unwrap();
    store.create_table("foo").unwrap();
    store
        .add_property("foo", "name", false, DataType::Factor)
        .unwrap();

    store
        .insert_event("foo", "bar", Event::new(secs(0)).with_field(1, "john"))
        .unwrap();
    store
        .insert_event("foo", "bar", Event::new(secs(1)).with_field(1, "jane"))
        .unwrap();
    let john = store.factorize("foo", "name", "john", false).unwrap();
    let jane = store.factorize("foo", "name", "jane", false).unwrap();
    store.close().unwrap();

    store.open(dir.path(), 0).unwrap();
    assert_eq!(store.factorize("foo", "name", "john", false).unwrap(), john);
    assert_eq!(store.factorize("foo", "name", "jane", false).unwrap(), jane);

    let events = store.get_events("foo", "bar").unwrap();
    assert_eq!(events[0].get(1), Some(&Value::Str("john".into())));
    assert_eq!(events[1].get(1), Some(&Value::Str("jane".into())));
    store.close().unwrap();
}

#[test]
fn object_ids_across_shards() {
    with_store(3, |store| {
        store
            .insert_event("foo", "bar", Event::new(secs(0)).with_field(1, "john"))
            .unwrap();
        store
            .insert_event("foo", "baz", Event::new(secs(0)).with_field(1, "john"))
            .unwrap();
        assert_eq!(
            store.object_ids("foo").unwrap(),
            vec!["bar".to_string(), "baz".to_string()]
        );
    });
}

#[test]
fn stats_reports_every_shard() {
    with_store(3, |store| {
        let stats = store.stats().unwrap();
        assert_eq!(stats.len(), 3);
    });
}

#[test]
fn drop_table_removes_data() {
    with_store(0, |store| {
        store
            .insert_event("foo", "bar", Event::new(secs(0)).with_field(1, "john"))
            .unwrap();
        store.drop_table("foo").unwrap();
        assert!(matches!(
            store.get_events("foo", "bar"),
            Err(StoreError::TableNotFound(_))
        ));

        // recreating the table shows the data is gone
        store.create_table("foo").unwrap();
        assert!(store.get_events("foo", "bar").unwrap().is_empty());
    });
}

#[test]
fn unknown_table_is_not_found() {
    with_store(0, |store| {
        assert!(matches!(
            store.insert_event("ghost", "bar", Event::new(0)),
            Err(StoreError::TableNotFound(_))
        ));
        assert!(matches!(
            store.get_events("ghost", "bar"),
            Err(StoreError::TableNotFound(_))
        ));
    });
}
