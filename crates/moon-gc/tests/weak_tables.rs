//! Tests for weak tables and ephemerons.

#![allow(clippy::unwrap_used)]

use moon_gc::{GcConfig, GcMode, GcRef, Heap, Value};

/// A pinned table whose metatable declares `__mode = mode`.
fn weak_table(heap: &mut Heap, mode: &str) -> GcRef {
    let t = heap.new_table().unwrap();
    heap.pin(t.into()).unwrap();
    let mt = heap.new_table().unwrap();
    let key = heap.new_string("__mode").unwrap();
    let mode = heap.new_string(mode).unwrap();
    heap.table_set(mt, key.into(), mode.into()).unwrap();
    heap.set_metatable(t, Some(mt)).unwrap();
    t
}

#[test]
fn test_weak_values_are_cleared() {
    let mut heap = Heap::new().unwrap();
    let weak = weak_table(&mut heap, "v");
    let dropped = heap.new_table().unwrap();
    let kept = heap.new_table().unwrap();
    heap.pin(kept.into()).unwrap();
    let name = heap.new_string("name").unwrap();

    heap.table_set(weak, Value::Integer(1), dropped.into()).unwrap();
    heap.table_set(weak, Value::Integer(2), kept.into()).unwrap();
    heap.table_set(weak, name.into(), dropped.into()).unwrap();
    heap.table_set(weak, Value::Integer(10), Value::Integer(10)).unwrap();

    heap.full_collect();

    assert!(!heap.is_live(dropped));
    assert_eq!(heap.table_get(weak, Value::Integer(1)).unwrap(), Value::Nil);
    assert_eq!(heap.table_get(weak, name.into()).unwrap(), Value::Nil);
    assert_eq!(heap.table_get(weak, Value::Integer(2)).unwrap(), kept.into());
    assert_eq!(heap.table_get(weak, Value::Integer(10)).unwrap(), Value::Integer(10));
    heap.verify().unwrap();
}

#[test]
fn test_weak_value_keys_stay_strong() {
    let mut heap = Heap::new().unwrap();
    let weak = weak_table(&mut heap, "v");
    let key = heap.new_table().unwrap();
    heap.table_set(weak, key.into(), Value::Boolean(true)).unwrap();

    heap.full_collect();
    assert!(heap.is_live(key));
    assert_eq!(heap.table_get(weak, key.into()).unwrap(), Value::Boolean(true));
}

#[test]
fn test_strings_are_never_cleared() {
    let mut heap = Heap::new().unwrap();
    let weak = weak_table(&mut heap, "kv");
    let s = heap.new_string("value").unwrap();
    let k = heap.new_string("key").unwrap();
    heap.table_set(weak, k.into(), s.into()).unwrap();

    heap.full_collect();
    assert!(heap.is_live(s));
    assert_eq!(heap.table_get(weak, k.into()).unwrap(), s.into());
}

#[test]
fn test_ephemeron_entry_dies_with_its_key() {
    let mut heap = Heap::new().unwrap();
    let eph = weak_table(&mut heap, "k");
    let key = heap.new_table().unwrap();
    let value = heap.new_table().unwrap();
    heap.table_set(eph, key.into(), value.into()).unwrap();

    heap.full_collect();

    assert!(!heap.is_live(key));
    assert!(!heap.is_live(value));
    assert!(heap.table_pairs(eph).unwrap().is_empty());
}

#[test]
fn test_ephemeron_value_lives_while_key_is_reachable() {
    let mut heap = Heap::new().unwrap();
    let eph = weak_table(&mut heap, "k");
    let key = heap.new_table().unwrap();
    heap.pin(key.into()).unwrap();
    let value = heap.new_table().unwrap();
    heap.table_set(eph, key.into(), value.into()).unwrap();

    heap.full_collect();
    assert!(heap.is_live(value));
    assert_eq!(heap.table_get(eph, key.into()).unwrap(), value.into());
}

#[test]
fn test_ephemeron_value_does_not_keep_its_key_alive() {
    let mut heap = Heap::new().unwrap();
    let eph = weak_table(&mut heap, "k");
    let key = heap.new_table().unwrap();
    let value = heap.new_table().unwrap();
    // The value references its own key.
    heap.table_set(value, Value::Integer(1), key.into()).unwrap();
    heap.table_set(eph, key.into(), value.into()).unwrap();

    heap.full_collect();
    assert!(!heap.is_live(key));
    assert!(!heap.is_live(value));
}

#[test]
fn test_cross_ephemeron_convergence() {
    let mut heap = Heap::new().unwrap();
    let e1 = weak_table(&mut heap, "k");
    let e2 = weak_table(&mut heap, "k");
    let k1 = heap.new_table().unwrap();
    let k2 = heap.new_table().unwrap();
    heap.pin(k1.into()).unwrap();
    heap.table_set(e1, k1.into(), k2.into()).unwrap();
    heap.table_set(e2, k2.into(), k1.into()).unwrap();

    heap.full_collect();

    assert!(heap.is_live(k1));
    assert!(heap.is_live(k2));
    assert_eq!(heap.table_get(e1, k1.into()).unwrap(), k2.into());
    assert_eq!(heap.table_get(e2, k2.into()).unwrap(), k1.into());
    heap.verify().unwrap();
}

#[test]
fn test_ephemeron_chain_converges_in_any_order() {
    let mut heap = Heap::new().unwrap();
    let eph = weak_table(&mut heap, "k");
    let keys: Vec<_> = (0..40).map(|_| heap.new_table().unwrap()).collect();
    heap.pin(keys[0].into()).unwrap();
    // Insert the chain backwards so each pass over the table can only make
    // progress one link at a time in one direction.
    for pair in keys.windows(2).rev() {
        heap.table_set(eph, pair[0].into(), pair[1].into()).unwrap();
    }
    let orphan = heap.new_table().unwrap();
    let orphan_value = heap.new_table().unwrap();
    heap.table_set(eph, orphan.into(), orphan_value.into()).unwrap();

    heap.full_collect();

    assert!(keys.iter().all(|&k| heap.is_live(k)));
    for pair in keys.windows(2) {
        assert_eq!(heap.table_get(eph, pair[0].into()).unwrap(), pair[1].into());
    }
    assert!(!heap.is_live(orphan));
    assert!(!heap.is_live(orphan_value));
}

#[test]
fn test_all_weak_table_clears_keys_and_values() {
    let mut heap = Heap::new().unwrap();
    let weak = weak_table(&mut heap, "kv");
    let live = heap.new_table().unwrap();
    heap.pin(live.into()).unwrap();
    let dead_key = heap.new_table().unwrap();
    let dead_value = heap.new_table().unwrap();

    heap.table_set(weak, dead_key.into(), live.into()).unwrap();
    heap.table_set(weak, live.into(), dead_value.into()).unwrap();
    heap.table_set(weak, Value::Integer(1), live.into()).unwrap();

    heap.full_collect();

    assert!(!heap.is_live(dead_key));
    assert!(!heap.is_live(dead_value));
    let pairs = heap.table_pairs(weak).unwrap();
    assert_eq!(pairs, vec![(Value::Integer(1), live.into())]);
}

#[test]
fn test_weak_tables_during_incremental_cycle() {
    let mut heap = Heap::with_config(GcConfig {
        step_size_log2: 0,
        ..GcConfig::default()
    })
    .unwrap();
    let weak = weak_table(&mut heap, "v");
    let mut values = Vec::new();
    for i in 0..100 {
        let t = heap.new_table().unwrap();
        heap.table_set(weak, Value::Integer(i + 1), t.into()).unwrap();
        if i % 10 == 0 {
            heap.pin(t.into()).unwrap();
        }
        values.push(t);
        heap.step_kb(0);
        heap.verify().unwrap();
    }
    heap.full_collect();
    for (i, &t) in values.iter().enumerate() {
        assert_eq!(heap.is_live(t), i % 10 == 0, "value {i}");
    }
}

#[test]
fn test_weak_tables_in_generational_mode() {
    let mut heap = Heap::with_config(GcConfig::generational()).unwrap();
    assert_eq!(heap.mode(), GcMode::Generational);
    let eph = weak_table(&mut heap, "k");
    let key = heap.new_table().unwrap();
    let value = heap.new_table().unwrap();
    heap.table_set(eph, key.into(), value.into()).unwrap();

    // Minor collections.
    for _ in 0..3 {
        heap.step_kb(0);
    }
    assert!(!heap.is_live(key));
    assert!(!heap.is_live(value));
    assert!(heap.table_pairs(eph).unwrap().is_empty());
    heap.verify().unwrap();
}
