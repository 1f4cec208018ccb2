//! Write barriers.
//!
//! The fast paths are inline color checks; the slow paths restore the
//! black-never-points-to-white invariant (forward) or re-gray the writer so it
//! is traversed again (backward).

use crate::heap::Heap;
use crate::object::{Age, Color};
use crate::value::{GcRef, Value};

use super::state::GrayList;
use crate::config::GcMode;

impl Heap {
    #[inline]
    fn is_black(&self, idx: u32) -> bool {
        self.arena.headers[idx as usize].color.is_black()
    }

    #[inline]
    fn is_white(&self, idx: u32) -> bool {
        self.arena.headers[idx as usize].color.is_white()
    }

    /// Forward barrier: `writer` now references `value`.
    ///
    /// Call after every store of a collectable value into a closure,
    /// upvalue, prototype or metatable slot. Does nothing unless `writer` is
    /// black and `value` is a white object.
    #[inline]
    pub fn write_barrier_forward(&mut self, writer: GcRef, value: Value) {
        let Value::Object(target) = value else {
            return;
        };
        if !(self.arena.is_live(writer) && self.arena.is_live(target)) {
            return;
        }
        if self.is_black(writer.index()) && self.is_white(target.index()) {
            self.barrier_forward_slow(writer.index(), target.index());
        }
    }

    fn barrier_forward_slow(&mut self, writer: u32, target: u32) {
        debug_assert!(!self.gc.is_dead_color(self.arena.headers[writer as usize].color));
        debug_assert!(!self.gc.is_dead_color(self.arena.headers[target as usize].color));
        self.stats.forward_barriers += 1;
        if self.gc.state.keeps_invariant() {
            self.marker().really_mark(target);
            if self.arena.headers[writer as usize].age.is_old() {
                debug_assert!(!self.arena.headers[target as usize].age.is_old());
                self.arena.headers[target as usize].age = Age::Old0;
            }
        } else {
            debug_assert!(self.gc.state.is_sweep_phase());
            // Sweeping does not rely on black: whiten the writer so it stops
            // triggering the barrier.
            if self.gc.kind == GcMode::Incremental {
                self.make_white(writer);
            }
        }
    }

    /// Backward barrier: `writer`, a table or userdata, was mutated.
    ///
    /// Does nothing unless `writer` is black. The writer is re-grayed and
    /// revisited by the next atomic phase instead of marking what was stored.
    #[inline]
    pub fn write_barrier_backward(&mut self, writer: GcRef) {
        if self.arena.is_live(writer) && self.is_black(writer.index()) {
            self.barrier_backward_slow(writer.index());
        }
    }

    /// Backward barrier that only fires when the stored value is white.
    #[inline]
    pub(crate) fn barrier_back_value(&mut self, writer: GcRef, value: Value) {
        if let Value::Object(target) = value {
            if self.is_black(writer.index()) && self.is_white(target.index()) {
                self.barrier_backward_slow(writer.index());
            }
        }
    }

    fn barrier_backward_slow(&mut self, writer: u32) {
        debug_assert!(!self.gc.is_dead_color(self.arena.headers[writer as usize].color));
        self.stats.backward_barriers += 1;
        if self.arena.headers[writer as usize].age == Age::Touched2 {
            // Still on the gray-again list from the last cycle.
            self.arena.headers[writer as usize].color = Color::Gray;
        } else {
            self.marker().link_gray(writer, GrayList::GrayAgain);
        }
        let header = &mut self.arena.headers[writer as usize];
        if header.age.is_old() {
            header.age = Age::Touched1;
        }
    }

    /// Paints an object with the current white.
    #[inline]
    pub(crate) fn make_white(&mut self, idx: u32) {
        self.arena.headers[idx as usize].color = self.gc.current_white;
    }
}
