//! Finalizers.
//!
//! An object whose metatable carries `__gc` when the metatable is assigned
//! moves from the all-objects list to the finalizable list. The atomic phase
//! separates unreachable finalizable objects into the to-be-finalized list
//! and marks them, so they and everything they reference survive until their
//! finalizer has run. Finalizers run one at a time with collection stopped.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::{CallError, FinalizerFault};
use crate::heap::Heap;
use crate::object::{Age, Object};
use crate::value::{GcRef, Value};

use super::state::{get_link, set_link, Link, ObjList};

impl Heap {
    /// Registers `r` for finalization if `metatable` has a `__gc` field.
    /// Objects that are not on the all-objects list are left alone.
    pub(crate) fn check_finalizer(&mut self, r: GcRef, metatable: Option<GcRef>) {
        let idx = r.index();
        if self.arena.headers[idx as usize].finalizable
            || self.gc.closing
            || self.gc_metamethod(metatable).is_nil()
        {
            return;
        }
        let mut link = Link::Head(ObjList::AllGc);
        loop {
            match get_link(&self.arena.headers, &self.gc, link) {
                Some(curr) if curr == idx => break,
                Some(curr) => link = Link::Next(curr),
                None => return,
            }
        }
        // Sweeping past `idx` below leaves the link into it intact.
        if self.gc.state.is_sweep_phase() {
            // "Sweep" the object now, and never leave the cursor on it.
            self.make_white(idx);
            if self.gc.sweep_cursor == Some(Link::Next(idx)) {
                self.gc.sweep_cursor = self.sweep_to_live(Link::Next(idx));
            }
        } else {
            self.correct_pointers(idx);
        }
        let next = self.arena.headers[idx as usize].next;
        set_link(&mut self.arena.headers, &mut self.gc, link, next);
        let header = &mut self.arena.headers[idx as usize];
        header.next = self.gc.finobj;
        header.finalizable = true;
        self.gc.finobj = Some(idx);
    }

    /// Moves generational segment starts off an object leaving `allgc`.
    fn correct_pointers(&mut self, idx: u32) {
        let next = self.arena.headers[idx as usize].next;
        for segment in [
            &mut self.gc.survival,
            &mut self.gc.old1,
            &mut self.gc.reallyold,
            &mut self.gc.firstold1,
        ] {
            if *segment == Some(idx) {
                *segment = next;
            }
        }
    }

    /// Moves unreachable finalizable objects (all of them if `all`) to the end
    /// of the to-be-finalized list, preserving their order.
    pub(crate) fn separate_to_be_finalized(&mut self, all: bool) {
        let mut tail = Link::Head(ObjList::ToBeFnz);
        while let Some(curr) = get_link(&self.arena.headers, &self.gc, tail) {
            tail = Link::Next(curr);
        }
        let mut link = Link::Head(ObjList::FinObj);
        loop {
            let curr = get_link(&self.arena.headers, &self.gc, link);
            if curr == self.gc.finobjold1 {
                break;
            }
            let Some(curr) = curr else {
                break;
            };
            debug_assert!(self.arena.headers[curr as usize].finalizable);
            if !(all || self.arena.headers[curr as usize].color.is_white()) {
                link = Link::Next(curr);
                continue;
            }
            let next = self.arena.headers[curr as usize].next;
            if self.gc.finobjsur == Some(curr) {
                self.gc.finobjsur = next;
            }
            set_link(&mut self.arena.headers, &mut self.gc, link, next);
            self.arena.headers[curr as usize].next = None;
            set_link(&mut self.arena.headers, &mut self.gc, tail, Some(curr));
            tail = Link::Next(curr);
        }
    }

    /// Marks every object waiting for its finalizer.
    pub(crate) fn mark_being_finalized(&mut self) -> usize {
        let mut count = 0;
        let mut cursor = self.gc.tobefnz;
        let mut marker = self.marker();
        while let Some(idx) = cursor {
            count += 1;
            cursor = marker.headers[idx as usize].next;
            if marker.is_white(idx) {
                marker.really_mark(idx);
            }
        }
        count
    }

    /// Re-registers finalized objects that were found reachable again, so
    /// their finalizer runs once more when they next die. Only valid after a
    /// full trace.
    pub(crate) fn rearm_resurrected(&mut self) {
        for r in std::mem::take(&mut self.gc.rearm) {
            if !self.arena.is_live(r) {
                continue;
            }
            let header = &self.arena.headers[r.slot()];
            if header.color.is_white() || header.finalizable {
                continue;
            }
            let metatable = self.metatable_of(r);
            if !self.gc_metamethod(metatable).is_nil() {
                self.check_finalizer(r, metatable);
                self.stats.resurrections += 1;
            }
        }
    }

    /// Pops the first object to be finalized and returns it to `allgc`.
    fn take_next_to_finalize(&mut self) -> Option<u32> {
        let idx = self.gc.tobefnz?;
        let header = &mut self.arena.headers[idx as usize];
        debug_assert!(header.finalizable);
        self.gc.tobefnz = header.next;
        header.next = self.gc.allgc;
        header.finalizable = false;
        self.gc.allgc = Some(idx);
        if self.gc.state.is_sweep_phase() {
            self.make_white(idx);
        } else if self.arena.headers[idx as usize].age == Age::Old1 {
            self.gc.firstold1 = Some(idx);
        }
        Some(idx)
    }

    /// Runs the finalizer of the next object in the to-be-finalized list.
    pub(crate) fn call_one_finalizer(&mut self) {
        debug_assert!(!self.gc.emergency);
        let Some(idx) = self.take_next_to_finalize() else {
            return;
        };
        let object = self.arena.gc_ref(idx);
        let finalizer = self.gc_metamethod(self.metatable_of(object));
        if finalizer.is_nil() {
            return;
        }
        // Anchor the finalizer and its argument for the duration of the call,
        // so an emergency collection cannot free them.
        let base = self.anchors.len();
        self.anchors.extend([finalizer, Value::Object(object)]);

        let was_stopped = std::mem::replace(&mut self.gc.stopped_internally, true);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.invoke_finalizer(finalizer, object)));
        self.gc.stopped_internally = was_stopped;
        self.anchors.truncate(base);
        self.stats.finalizers_run += 1;
        if !self.gc.closing {
            self.gc.rearm.push(object);
        }
        let message = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.message,
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "finalizer panicked".to_owned()),
        };
        let fault = FinalizerFault { object, message };
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_finalizer_fault(&fault);
        self.stats.finalizer_faults += 1;
        self.faults.push(fault);
    }

    fn invoke_finalizer(&mut self, finalizer: Value, object: GcRef) -> Result<(), CallError> {
        let args = [Value::Object(object)];
        if let Some(callee) = finalizer.as_object() {
            if let Ok(Object::NativeClosure(c)) = self.arena.get(callee) {
                let function = c.function;
                return function(self, callee, &args);
            }
        }
        if let Some(mut hook) = self.finalizer_hook.take() {
            let result = hook(self, finalizer, Value::Object(object));
            if self.finalizer_hook.is_none() {
                self.finalizer_hook = Some(hook);
            }
            return result;
        }
        let type_name = match finalizer.as_object() {
            Some(r) => self.arena.get(r).map_or("object", |o| o.kind().name()),
            None => finalizer.type_name(),
        };
        Err(CallError::new(format!("attempt to call a {type_name} value")))
    }

    /// Runs up to `n` pending finalizers. Returns how many ran.
    pub(crate) fn run_a_few_finalizers(&mut self, n: usize) -> usize {
        let mut ran = 0;
        while ran < n && self.gc.tobefnz.is_some() {
            self.call_one_finalizer();
            ran += 1;
        }
        ran
    }

    pub(crate) fn call_all_pending_finalizers(&mut self) {
        while self.gc.tobefnz.is_some() {
            self.call_one_finalizer();
        }
    }

    /// Number of objects waiting for their finalizer.
    #[must_use]
    pub fn pending_finalizers(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.gc.tobefnz;
        while let Some(idx) = cursor {
            count += 1;
            cursor = self.arena.headers[idx as usize].next;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcState;

    fn noop(_: &mut Heap, _: GcRef, _: &[Value]) -> Result<(), CallError> {
        Ok(())
    }

    #[test]
    fn test_registering_the_object_under_the_sweep_cursor() {
        let mut heap = Heap::new().unwrap();
        let mt = heap.new_table().unwrap();
        heap.pin(mt.into()).unwrap();
        let gc = heap.new_string("__gc").unwrap();
        let f = heap.new_native_closure(noop, Vec::new()).unwrap();
        heap.table_set(mt, gc.into(), f.into()).unwrap();

        let holder = heap.new_table().unwrap();
        heap.pin(holder.into()).unwrap();
        let mut children = Vec::new();
        for i in 1..=300 {
            let t = heap.new_table().unwrap();
            heap.table_set(holder, Value::Integer(i), t.into()).unwrap();
            children.push(t);
        }

        heap.run_until(GcState::SweepAllGc);
        let mut registered = Vec::new();
        while heap.gc.state == GcState::SweepAllGc {
            if let Some(Link::Next(idx)) = heap.gc.sweep_cursor {
                let r = heap.arena.gc_ref(idx);
                if children.contains(&r) && !registered.contains(&r) {
                    heap.set_metatable(r, Some(mt)).unwrap();
                    assert_ne!(heap.gc.sweep_cursor, Some(Link::Next(idx)));
                    assert!(heap.arena.headers[idx as usize].finalizable);
                    heap.verify().unwrap();
                    registered.push(r);
                }
            }
            heap.single_step();
        }
        assert!(registered.len() >= 2);
        heap.verify().unwrap();

        // Still reachable, so nothing is finalized.
        heap.full_collect();
        assert_eq!(heap.stats().finalizers_run, 0);
        assert!(registered.iter().all(|&r| heap.is_live(r)));
        heap.verify().unwrap();

        for &r in &registered {
            let slot = children.iter().position(|&c| c == r).unwrap();
            let key = Value::Integer(i64::try_from(slot + 1).unwrap());
            heap.table_set(holder, key, Value::Nil).unwrap();
        }
        heap.full_collect();
        assert_eq!(heap.stats().finalizers_run, registered.len() as u64);
        heap.verify().unwrap();
    }

    #[test]
    fn test_finalizer_anchors_are_released() {
        let mut heap = Heap::new().unwrap();
        let mt = heap.new_table().unwrap();
        heap.pin(mt.into()).unwrap();
        let gc = heap.new_string("__gc").unwrap();
        let f = heap.new_native_closure(noop, Vec::new()).unwrap();
        heap.table_set(mt, gc.into(), f.into()).unwrap();
        let t = heap.new_table().unwrap();
        heap.set_metatable(t, Some(mt)).unwrap();

        heap.full_collect();
        assert_eq!(heap.stats().finalizers_run, 1);
        assert!(heap.anchors.is_empty());
        assert_eq!(heap.thread_len(heap.main_thread()).unwrap(), 0);
        heap.full_collect();
        assert!(!heap.is_live(t));
    }
}
