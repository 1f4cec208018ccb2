//! Incremental sweeping.
//!
//! The sweeper walks an object list through a [`Link`] handle to the link
//! field preceding the current object, so a dead object is unlinked in place
//! without revisiting the list from its head.

use crate::heap::Heap;
use crate::object::{Age, Object, Upvalue};

use super::state::{get_link, set_link, GcState, Link, ObjList};

/// Objects visited per sweep step.
pub(crate) const SWEEP_MAX: usize = 100;

impl Heap {
    /// Sweeps up to `count` objects starting at `link`.
    ///
    /// Objects with the dead white are freed; survivors are painted with the
    /// current white and their age reset. Returns the link to resume from
    /// (`None` once the list is exhausted) and the number of objects visited.
    pub(crate) fn sweep_list(&mut self, mut link: Link, count: usize) -> (Option<Link>, usize) {
        let white = self.gc.current_white;
        let mut visited = 0;
        while visited < count {
            let Some(idx) = get_link(&self.arena.headers, &self.gc, link) else {
                break;
            };
            visited += 1;
            let header = &mut self.arena.headers[idx as usize];
            if self.gc.is_dead_color(header.color) {
                let next = header.next;
                set_link(&mut self.arena.headers, &mut self.gc, link, next);
                self.free_object(idx);
            } else {
                header.color = white;
                header.age = Age::New;
                link = Link::Next(idx);
            }
        }
        let more = get_link(&self.arena.headers, &self.gc, link).is_some();
        (more.then_some(link), visited)
    }

    /// Sweeps until the link points past at least one live object, so the
    /// returned cursor never refers to an object that can be freed.
    pub(crate) fn sweep_to_live(&mut self, link: Link) -> Option<Link> {
        loop {
            match self.sweep_list(link, 1).0 {
                // The object after `link` was freed; `link` now points at its
                // successor.
                Some(next) if next == link => {}
                other => return other,
            }
        }
    }

    /// Starts sweeping the all-objects list.
    pub(crate) fn enter_sweep(&mut self) {
        self.set_state(GcState::SweepAllGc);
        debug_assert!(self.gc.sweep_cursor.is_none());
        self.gc.sweep_cursor = self.sweep_to_live(Link::Head(ObjList::AllGc));
    }

    /// One bounded sweep increment of the current list, or a move to the
    /// next list once it is exhausted.
    pub(crate) fn sweep_step(&mut self, next_state: GcState, next_list: Option<ObjList>) -> usize {
        if let Some(cursor) = self.gc.sweep_cursor {
            let old_debt = self.gc.debt;
            let (cursor, visited) = self.sweep_list(cursor, SWEEP_MAX);
            self.gc.sweep_cursor = cursor;
            self.gc.estimate = self.gc.estimate.saturating_add_signed(self.gc.debt - old_debt);
            visited
        } else {
            self.set_state(next_state);
            self.gc.sweep_cursor = next_list.map(Link::Head);
            0
        }
    }

    /// Releases an object's slot and memory. The caller has already unlinked
    /// it from its object list.
    pub(crate) fn free_object(&mut self, idx: u32) {
        let size = self.arena.headers[idx as usize].size;
        let r = self.arena.gc_ref(idx);
        let Some(object) = self.arena.remove(idx) else {
            return;
        };
        self.shrink_reservation(size.saturating_sub(object.block_bytes()), 0);
        self.gc.credit(size);
        self.stats.objects_freed += 1;
        self.stats.bytes_freed += size as u64;
        match object {
            Object::String(s) => {
                self.strings.remove(s.hash, idx);
                self.allocator.free(s.bytes);
            }
            Object::UserData(u) => self.allocator.free(u.block),
            Object::Upvalue(Upvalue::Open { thread, .. }) => {
                if let Ok(Object::Thread(th)) = self.arena.get_mut(thread) {
                    th.open_upvalues.retain(|&(_, uv)| uv != r);
                }
            }
            Object::Thread(th) => {
                // Upvalues still open on this stack outlive it as closed ones.
                for (slot, uv) in th.open_upvalues {
                    let value = th.stack.get(slot).copied().unwrap_or_default();
                    if let Ok(Object::Upvalue(state)) = self.arena.get_mut(uv) {
                        *state = Upvalue::Closed(value);
                    }
                }
                if th.in_twups.get() {
                    self.gc.twups.retain(|&t| t != idx);
                }
            }
            Object::Upvalue(Upvalue::Closed(_))
            | Object::Table(_)
            | Object::LuaClosure(_)
            | Object::NativeClosure(_)
            | Object::Proto(_) => {}
        }
    }
}
