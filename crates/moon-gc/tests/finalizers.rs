//! Tests for `__gc` finalizers: ordering, resurrection, faults and closing.

#![allow(clippy::unwrap_used, clippy::unnecessary_wraps)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use moon_gc::{CallError, GcConfig, GcRef, GcState, Heap, Value};

thread_local! {
    static FINALIZED: RefCell<Vec<GcRef>> = const { RefCell::new(Vec::new()) };
    static RESURRECT: Cell<bool> = const { Cell::new(false) };
}

fn finalized() -> Vec<GcRef> {
    FINALIZED.with(|f| f.borrow().clone())
}

fn record(heap: &mut Heap, _: GcRef, args: &[Value]) -> Result<(), CallError> {
    let Some(Value::Object(object)) = args.first().copied() else {
        return Err(CallError::new("finalizer called without its object"));
    };
    FINALIZED.with(|f| f.borrow_mut().push(object));
    if RESURRECT.with(|r| r.replace(false)) {
        let key = heap.new_string("resurrected").map_err(|e| CallError::new(e.to_string()))?;
        let globals = heap.globals();
        heap.table_set(globals, key.into(), object.into())
            .map_err(|e| CallError::new(e.to_string()))?;
    }
    Ok(())
}

fn failing(_: &mut Heap, _: GcRef, _: &[Value]) -> Result<(), CallError> {
    Err(CallError::new("cleanup failed"))
}

fn panicking(_: &mut Heap, _: GcRef, _: &[Value]) -> Result<(), CallError> {
    panic!("finalizer blew up");
}

/// Runs collection requests from inside a finalizer; all of them must be
/// ignored.
fn collecting(heap: &mut Heap, closure: GcRef, args: &[Value]) -> Result<(), CallError> {
    let state = heap.state();
    heap.full_collect();
    heap.step_kb(64);
    for _ in 0..100 {
        heap.new_table().unwrap();
        heap.step();
    }
    assert_eq!(heap.state(), state);
    record(heap, closure, args)
}

/// A metatable whose `__gc` is `function`.
fn finalizer_metatable(heap: &mut Heap, function: moon_gc::NativeFn) -> GcRef {
    let mt = heap.new_table().unwrap();
    heap.pin(mt.into()).unwrap();
    let gc = heap.new_string("__gc").unwrap();
    let f = heap.new_native_closure(function, Vec::new()).unwrap();
    heap.table_set(mt, gc.into(), f.into()).unwrap();
    mt
}

fn finalizable(heap: &mut Heap, mt: GcRef) -> GcRef {
    let t = heap.new_table().unwrap();
    heap.set_metatable(t, Some(mt)).unwrap();
    t
}

#[test]
fn test_finalizer_runs_once_for_unreachable_object() {
    let mut heap = Heap::new().unwrap();
    let mt = finalizer_metatable(&mut heap, record);
    let t = finalizable(&mut heap, mt);

    heap.full_collect();
    assert_eq!(finalized(), vec![t]);
    assert_eq!(heap.stats().finalizers_run, 1);
    // Finalized but kept until the next cycle proves it dead again.
    assert!(heap.is_live(t));

    heap.full_collect();
    assert!(!heap.is_live(t));
    assert_eq!(finalized(), vec![t]);
}

#[test]
fn test_reachable_objects_are_not_finalized() {
    let mut heap = Heap::new().unwrap();
    let mt = finalizer_metatable(&mut heap, record);
    let t = finalizable(&mut heap, mt);
    heap.pin(t.into()).unwrap();

    heap.full_collect();
    heap.full_collect();
    assert!(finalized().is_empty());
    assert!(heap.is_live(t));
}

#[test]
fn test_gc_field_must_exist_when_metatable_is_set() {
    let mut heap = Heap::new().unwrap();
    let mt = heap.new_table().unwrap();
    heap.pin(mt.into()).unwrap();
    let t = heap.new_table().unwrap();
    heap.set_metatable(t, Some(mt)).unwrap();

    // Added too late: `t` was never registered.
    let gc = heap.new_string("__gc").unwrap();
    let f = heap.new_native_closure(record, Vec::new()).unwrap();
    heap.table_set(mt, gc.into(), f.into()).unwrap();

    heap.full_collect();
    assert!(finalized().is_empty());
    assert!(!heap.is_live(t));
}

#[test]
fn test_finalizers_run_in_reverse_registration_order() {
    let mut heap = Heap::new().unwrap();
    let mt = finalizer_metatable(&mut heap, record);
    let a = finalizable(&mut heap, mt);
    let b = finalizable(&mut heap, mt);
    let c = finalizable(&mut heap, mt);

    heap.full_collect();
    assert_eq!(finalized(), vec![c, b, a]);
}

#[test]
fn test_finalized_object_keeps_its_references_alive() {
    let mut heap = Heap::new().unwrap();
    let mt = finalizer_metatable(&mut heap, record);
    let t = finalizable(&mut heap, mt);
    let child = heap.new_table().unwrap();
    heap.table_set(t, Value::Integer(1), child.into()).unwrap();

    heap.full_collect();
    assert!(heap.is_live(child));
    assert_eq!(heap.table_get(t, Value::Integer(1)).unwrap(), child.into());

    heap.full_collect();
    assert!(!heap.is_live(child));
}

#[test]
fn test_resurrected_object_is_finalized_again() {
    let mut heap = Heap::new().unwrap();
    let mt = finalizer_metatable(&mut heap, record);
    let t = finalizable(&mut heap, mt);

    RESURRECT.with(|r| r.set(true));
    heap.full_collect();
    assert_eq!(finalized(), vec![t]);
    let key = heap.new_string("resurrected").unwrap();
    assert_eq!(heap.table_get(heap.globals(), key.into()).unwrap(), t.into());

    // Still reachable: the next cycle re-arms its finalizer.
    heap.full_collect();
    assert!(heap.is_live(t));
    assert_eq!(heap.stats().resurrections, 1);
    assert_eq!(finalized().len(), 1);

    let globals = heap.globals();
    heap.table_set(globals, key.into(), Value::Nil).unwrap();
    heap.full_collect();
    assert_eq!(finalized(), vec![t, t]);

    heap.full_collect();
    assert!(!heap.is_live(t));
    assert_eq!(finalized().len(), 2);
}

#[test]
fn test_weak_values_to_finalized_objects_are_cleared_first() {
    let mut heap = Heap::new().unwrap();
    let mt = finalizer_metatable(&mut heap, record);

    let mode_key = heap.new_string("__mode").unwrap();
    let weak_values = heap.new_table().unwrap();
    let weak_keys = heap.new_table().unwrap();
    for (table, mode) in [(weak_values, "v"), (weak_keys, "k")] {
        heap.pin(table.into()).unwrap();
        let weak_mt = heap.new_table().unwrap();
        let mode = heap.new_string(mode).unwrap();
        heap.table_set(weak_mt, mode_key.into(), mode.into()).unwrap();
        heap.set_metatable(table, Some(weak_mt)).unwrap();
    }

    let t = finalizable(&mut heap, mt);
    heap.table_set(weak_values, Value::Integer(1), t.into()).unwrap();
    heap.table_set(weak_keys, t.into(), Value::Boolean(true)).unwrap();

    heap.full_collect();
    assert_eq!(finalized(), vec![t]);
    assert_eq!(heap.table_get(weak_values, Value::Integer(1)).unwrap(), Value::Nil);
    assert_eq!(heap.table_get(weak_keys, t.into()).unwrap(), Value::Boolean(true));

    heap.full_collect();
    assert!(!heap.is_live(t));
    assert!(heap.table_pairs(weak_keys).unwrap().is_empty());
}

#[test]
fn test_finalizer_errors_are_recorded() {
    let mut heap = Heap::new().unwrap();
    let bad = finalizer_metatable(&mut heap, failing);
    let good = finalizer_metatable(&mut heap, record);
    let first = finalizable(&mut heap, good);
    let broken = finalizable(&mut heap, bad);

    heap.full_collect();

    // The failure does not stop the remaining finalizers.
    assert_eq!(finalized(), vec![first]);
    let faults = heap.take_finalizer_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].object, broken);
    assert_eq!(faults[0].message, "cleanup failed");
    assert_eq!(heap.stats().finalizer_faults, 1);
    assert!(heap.take_finalizer_faults().is_empty());
}

#[test]
fn test_finalizer_panics_are_caught() {
    let mut heap = Heap::new().unwrap();
    let mt = finalizer_metatable(&mut heap, panicking);
    let t = finalizable(&mut heap, mt);

    heap.full_collect();
    let faults = heap.take_finalizer_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].object, t);
    assert_eq!(faults[0].message, "finalizer blew up");
    assert!(heap.is_running());
    heap.verify().unwrap();
}

#[test]
fn test_non_callable_finalizer_is_a_fault() {
    let mut heap = Heap::new().unwrap();
    let mt = heap.new_table().unwrap();
    heap.pin(mt.into()).unwrap();
    let gc = heap.new_string("__gc").unwrap();
    heap.table_set(mt, gc.into(), Value::Integer(1)).unwrap();
    let t = finalizable(&mut heap, mt);

    heap.full_collect();
    let faults = heap.take_finalizer_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].object, t);
    assert!(faults[0].message.contains("number"), "{}", faults[0].message);
}

#[test]
fn test_finalizer_hook_handles_non_native_finalizers() {
    let mut heap = Heap::new().unwrap();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let hook_calls = Rc::clone(&calls);
    heap.set_finalizer_hook(move |_, finalizer, object| {
        hook_calls.borrow_mut().push((finalizer, object));
        Ok(())
    });

    let mt = heap.new_table().unwrap();
    heap.pin(mt.into()).unwrap();
    let gc = heap.new_string("__gc").unwrap();
    let callable = heap.new_table().unwrap();
    heap.table_set(mt, gc.into(), callable.into()).unwrap();
    let t = finalizable(&mut heap, mt);

    heap.full_collect();
    assert_eq!(*calls.borrow(), vec![(Value::Object(callable), Value::Object(t))]);
    assert!(heap.take_finalizer_faults().is_empty());
}

#[test]
fn test_collection_requests_inside_finalizers_are_ignored() {
    let mut heap = Heap::new().unwrap();
    let mt = finalizer_metatable(&mut heap, collecting);
    let t = finalizable(&mut heap, mt);

    heap.full_collect();
    assert_eq!(finalized(), vec![t]);
    assert!(heap.take_finalizer_faults().is_empty());
    heap.full_collect();
    heap.verify().unwrap();
}

#[test]
fn test_incremental_cycle_runs_one_finalizer_per_step() {
    let mut heap = Heap::with_config(GcConfig {
        step_size_log2: 0,
        ..GcConfig::default()
    })
    .unwrap();
    let mt = finalizer_metatable(&mut heap, record);
    for _ in 0..3 {
        finalizable(&mut heap, mt);
    }

    while heap.state() != GcState::CallFinalizers {
        heap.step_kb(0);
    }
    assert_eq!(heap.pending_finalizers(), 3);
    heap.step_kb(0);
    assert_eq!(finalized().len(), 1);
    assert_eq!(heap.pending_finalizers(), 2);
    while !heap.step_kb(0) {}
    assert_eq!(finalized().len(), 3);
}

#[test]
fn test_dropping_the_heap_runs_every_finalizer() {
    let mut heap = Heap::new().unwrap();
    let mt = finalizer_metatable(&mut heap, record);
    let reachable = finalizable(&mut heap, mt);
    heap.pin(reachable.into()).unwrap();
    let unreachable = finalizable(&mut heap, mt);

    drop(heap);
    let mut ran = finalized();
    ran.sort();
    let mut expected = vec![reachable, unreachable];
    expected.sort();
    assert_eq!(ran, expected);
}
