//! Generational mode.
//!
//! `allgc` is split into segments by age, newest first:
//!
//! ```text
//! allgc -> [new] survival -> [survival] old1 -> [old1] reallyold -> [old] -> end
//! ```
//!
//! A minor collection marks from the roots, the gray-again list (touched old
//! objects and threads) and objects that just became old, then sweeps only
//! the young segments. Old objects stay black between cycles and are never
//! traversed unless a barrier touches them.

use std::cell::Cell;

use crate::config::GcMode;
use crate::heap::Heap;
use crate::metrics::CollectionType;
use crate::object::{Age, Color, Object, ObjectKind, Upvalue};

use super::state::{
    get_gray_link, get_link, set_gray_link, set_link, GcState, GrayLink, GrayList, Link, ObjList,
};

impl Heap {
    /// Frees dead objects of `list` and makes every survivor old. Threads go
    /// to the gray-again list; open upvalues stay gray.
    fn sweep_to_old(&mut self, list: ObjList) {
        let mut link = Link::Head(list);
        while let Some(idx) = get_link(&self.arena.headers, &self.gc, link) {
            let header = &mut self.arena.headers[idx as usize];
            if header.color.is_white() {
                debug_assert!(self.gc.is_dead_color(header.color));
                let next = header.next;
                set_link(&mut self.arena.headers, &mut self.gc, link, next);
                self.free_object(idx);
                continue;
            }
            let open_upvalue = matches!(
                self.arena.objects[idx as usize],
                Some(Object::Upvalue(Upvalue::Open { .. }))
            );
            let header = &mut self.arena.headers[idx as usize];
            header.age = Age::Old;
            if header.kind == ObjectKind::Thread {
                self.marker().link_gray(idx, GrayList::GrayAgain);
            } else {
                header.color = if open_upvalue { Color::Gray } else { Color::Black };
            }
            link = Link::Next(idx);
        }
    }

    /// Sweeps from `link` up to `limit`: frees dead objects, whitens new
    /// ones and ages the rest. Returns the link to the first unswept object.
    ///
    /// With `firstold1`, records the first object that became `Old1`.
    fn sweep_gen(
        &mut self,
        mut link: Link,
        limit: Option<u32>,
        firstold1: Option<&Cell<Option<u32>>>,
    ) -> Link {
        let white = self.gc.current_white;
        loop {
            let curr = get_link(&self.arena.headers, &self.gc, link);
            if curr == limit {
                return link;
            }
            let Some(idx) = curr else {
                return link;
            };
            let header = &mut self.arena.headers[idx as usize];
            if header.color.is_white() {
                debug_assert!(!header.age.is_old() && self.gc.is_dead_color(header.color));
                let next = header.next;
                set_link(&mut self.arena.headers, &mut self.gc, link, next);
                self.free_object(idx);
                continue;
            }
            if header.age == Age::New {
                header.color = white;
                header.age = Age::Survival;
            } else {
                header.age = header.age.next_after_sweep();
                if let Some(first) = firstold1 {
                    if header.age == Age::Old1 && first.get().is_none() {
                        first.set(Some(idx));
                    }
                }
            }
            link = Link::Next(idx);
        }
    }

    /// Paints every object of `list` with the current white and resets its
    /// age.
    fn white_list(&mut self, list: ObjList) {
        let white = self.gc.current_white;
        let mut cursor = self.gc.head(list);
        while let Some(idx) = cursor {
            let header = &mut self.arena.headers[idx as usize];
            header.color = white;
            header.age = Age::New;
            cursor = header.next;
        }
    }

    /// Prepares a gray list for the next minor collection: young objects
    /// leave it, touched objects advance, threads stay. Returns the link at
    /// the end of the list.
    fn correct_gray_list(&mut self, mut link: GrayLink) -> GrayLink {
        while let Some(idx) = get_gray_link(&self.arena.headers, &mut self.gc, link) {
            let header = &mut self.arena.headers[idx as usize];
            let next = header.gclist;
            let remain = if header.color.is_white() {
                false
            } else if header.age == Age::Touched1 {
                debug_assert!(header.color.is_gray());
                header.color = Color::Black;
                header.age = Age::Touched2;
                true
            } else if header.kind == ObjectKind::Thread {
                debug_assert!(header.color.is_gray());
                true
            } else {
                debug_assert!(header.age.is_old());
                if header.age == Age::Touched2 {
                    header.age = Age::Old;
                }
                header.color = Color::Black;
                false
            };
            if remain {
                link = GrayLink::Next(idx);
            } else {
                self.arena.headers[idx as usize].gclist = None;
                set_gray_link(&mut self.arena.headers, &mut self.gc, link, next);
            }
        }
        link
    }

    /// Folds the weak lists into the gray-again list, corrected.
    fn correct_gray_lists(&mut self) {
        let mut tail = self.correct_gray_list(GrayLink::Head(GrayList::GrayAgain));
        for list in [GrayList::Weak, GrayList::AllWeak, GrayList::Ephemeron] {
            let head = self.gc.gray_head_mut(list).take();
            set_gray_link(&mut self.arena.headers, &mut self.gc, tail, head);
            tail = self.correct_gray_list(tail);
        }
    }

    /// Marks the objects of `from..to` that just became old, so their
    /// references are seen once more before they stop being traversed.
    fn mark_old(&mut self, from: Option<u32>, to: Option<u32>) {
        let mut cursor = from;
        while cursor != to {
            let Some(idx) = cursor else {
                break;
            };
            cursor = self.arena.headers[idx as usize].next;
            let header = &mut self.arena.headers[idx as usize];
            if header.age == Age::Old1 {
                debug_assert!(!header.color.is_white());
                header.age = Age::Old;
                if header.color.is_black() {
                    self.marker().really_mark(idx);
                }
            }
        }
    }

    fn finish_gen_cycle(&mut self) {
        self.correct_gray_lists();
        self.set_state(GcState::Propagate);
        if !self.gc.emergency {
            self.strings.check_size();
            self.call_all_pending_finalizers();
        }
    }

    /// A minor collection.
    fn young_collection(&mut self) {
        debug_assert_eq!(self.gc.state, GcState::Propagate);
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_gc_collection(CollectionType::Minor, self.gc.gc_id);
        if let Some(first) = self.gc.firstold1.take() {
            self.mark_old(Some(first), self.gc.reallyold);
        }
        self.mark_old(self.gc.finobj, self.gc.finobjrold);
        self.mark_old(self.gc.tobefnz, None);

        self.gc.minor = true;
        self.atomic();
        self.gc.minor = false;

        self.set_state(GcState::SweepAllGc);
        let firstold1 = Cell::new(None);
        let survival = self.sweep_gen(Link::Head(ObjList::AllGc), self.gc.survival, Some(&firstold1));
        self.sweep_gen(survival, self.gc.old1, Some(&firstold1));
        self.gc.firstold1 = firstold1.get();
        self.gc.reallyold = self.gc.old1;
        self.gc.old1 = get_link(&self.arena.headers, &self.gc, survival);
        self.gc.survival = self.gc.allgc;

        let survival = self.sweep_gen(Link::Head(ObjList::FinObj), self.gc.finobjsur, None);
        self.sweep_gen(survival, self.gc.finobjold1, None);
        self.gc.finobjrold = self.gc.finobjold1;
        self.gc.finobjold1 = get_link(&self.arena.headers, &self.gc, survival);
        self.gc.finobjsur = self.gc.finobj;

        self.sweep_gen(Link::Head(ObjList::ToBeFnz), None, None);
        self.finish_gen_cycle();

        self.stats.minor_collections += 1;
        self.stats.last_collection = CollectionType::Minor;
    }

    /// After a full atomic phase, makes every survivor old and switches to
    /// generational mode.
    fn atomic_to_gen(&mut self) {
        self.gc.clear_gray_lists();
        self.set_state(GcState::SweepAllGc);
        self.sweep_to_old(ObjList::AllGc);
        self.gc.reallyold = self.gc.allgc;
        self.gc.old1 = self.gc.allgc;
        self.gc.survival = self.gc.allgc;
        self.gc.firstold1 = None;

        self.sweep_to_old(ObjList::FinObj);
        self.gc.finobjrold = self.gc.finobj;
        self.gc.finobjold1 = self.gc.finobj;
        self.gc.finobjsur = self.gc.finobj;

        self.sweep_to_old(ObjList::ToBeFnz);

        self.gc.kind = GcMode::Generational;
        self.gc.last_atomic = 0;
        self.gc.estimate = self.gc.heap_bytes();
        self.finish_gen_cycle();
    }

    /// Runs a full cycle and enters generational mode. Returns the number of
    /// slots the atomic phase traversed.
    pub(crate) fn enter_gen(&mut self) -> usize {
        self.run_until(GcState::Pause);
        self.run_until(GcState::Propagate);
        let work = self.atomic();
        self.atomic_to_gen();
        self.set_minor_debt();
        work
    }

    /// Whitens everything and resumes incremental collection from the pause
    /// state.
    pub(crate) fn enter_inc(&mut self) {
        self.white_list(ObjList::AllGc);
        self.gc.reallyold = None;
        self.gc.old1 = None;
        self.gc.survival = None;
        self.gc.firstold1 = None;
        self.white_list(ObjList::FinObj);
        self.white_list(ObjList::ToBeFnz);
        self.gc.finobjrold = None;
        self.gc.finobjold1 = None;
        self.gc.finobjsur = None;
        self.gc.clear_gray_lists();
        self.set_state(GcState::Pause);
        self.gc.kind = GcMode::Incremental;
        self.gc.last_atomic = 0;
    }

    /// Major collection in generational mode.
    pub(crate) fn full_gen(&mut self) -> usize {
        self.enter_inc();
        self.enter_gen()
    }

    /// Full cycle after a bad major collection. Returns to generational mode
    /// once a collection traverses clearly fewer objects than the last one.
    fn step_gen_full(&mut self) {
        let last_atomic = self.gc.last_atomic;
        if self.gc.kind == GcMode::Generational {
            self.enter_inc();
        }
        self.run_until(GcState::Propagate);
        let new_atomic = self.atomic();
        if new_atomic < last_atomic + (last_atomic >> 3) {
            self.atomic_to_gen();
            self.set_minor_debt();
        } else {
            self.gc.estimate = self.gc.heap_bytes();
            self.enter_sweep();
            self.run_until(GcState::Pause);
            self.set_pause();
            self.gc.last_atomic = new_atomic;
        }
        self.stats.major_collections += 1;
        self.stats.last_collection = CollectionType::Major;
    }

    /// A pacer-driven generational step: a minor collection, or a major one
    /// once the heap has grown `major_multiplier` percent past its size after
    /// the last major collection.
    pub(crate) fn generational_step(&mut self) {
        if self.gc.last_atomic != 0 {
            self.step_gen_full();
            return;
        }
        let major_base = self.gc.estimate;
        let major_inc = (major_base / 100).saturating_mul(self.gc.config.major_multiplier);
        if self.gc.debt > 0 && self.gc.heap_bytes() > major_base.saturating_add(major_inc) {
            #[cfg(feature = "tracing")]
            let _span = crate::tracing::internal::trace_gc_collection(CollectionType::Major, self.gc.gc_id);
            let traversed = self.full_gen();
            if self.gc.heap_bytes() >= major_base + major_inc / 2 {
                // Less than half of the growth was garbage: stay with full
                // cycles for a while.
                self.gc.last_atomic = traversed;
                self.set_pause();
            }
            self.stats.major_collections += 1;
            self.stats.last_collection = CollectionType::Major;
        } else {
            self.young_collection();
            self.set_minor_debt();
            self.gc.estimate = major_base;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{GcConfig, GcMode};
    use crate::heap::Heap;
    use crate::object::Age;

    #[test]
    fn test_emergency_major_leaves_string_table_size_alone() {
        let mut heap = Heap::with_config(GcConfig::generational()).unwrap();
        for i in 0..2000 {
            heap.new_string(format!("short-lived {i}")).unwrap();
        }
        let capacity = heap.strings.capacity();
        assert!(capacity >= 2000);

        heap.full_gc(true);
        assert!(heap.string_count() < 10);
        assert_eq!(heap.strings.capacity(), capacity);

        heap.full_gc(false);
        assert!(heap.strings.capacity() < capacity);
        heap.verify().unwrap();
    }

    #[test]
    fn test_entering_generational_makes_survivors_old() {
        let mut heap = Heap::new().unwrap();
        let t = heap.new_table().unwrap();
        heap.pin(t.into()).unwrap();
        heap.change_mode(GcMode::Generational);
        assert_eq!(heap.mode(), GcMode::Generational);
        assert_eq!(heap.age_of(t).unwrap(), Age::Old);
        assert!(heap.color_of(t).unwrap().is_black());
    }

    #[test]
    fn test_new_objects_age_through_minor_collections() {
        let mut heap = Heap::with_config(GcConfig::generational()).unwrap();
        let t = heap.new_table().unwrap();
        heap.pin(t.into()).unwrap();
        assert_eq!(heap.age_of(t).unwrap(), Age::New);
        heap.young_collection();
        assert_eq!(heap.age_of(t).unwrap(), Age::Survival);
        heap.young_collection();
        assert_eq!(heap.age_of(t).unwrap(), Age::Old1);
        heap.young_collection();
        assert_eq!(heap.age_of(t).unwrap(), Age::Old);
    }

    #[test]
    fn test_leaving_generational_whitens_everything() {
        let mut heap = Heap::with_config(GcConfig::generational()).unwrap();
        let t = heap.new_table().unwrap();
        heap.pin(t.into()).unwrap();
        heap.change_mode(GcMode::Incremental);
        assert!(heap.color_of(t).unwrap().is_white());
        assert_eq!(heap.age_of(t).unwrap(), Age::New);
        assert_eq!(heap.state(), crate::gc::GcState::Pause);
    }
}
