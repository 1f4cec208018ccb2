//! Marking engine.
//!
//! [`Marker`] borrows the header vector mutably and the object bodies
//! immutably, so traversals can read an object while recoloring its
//! children. Objects with outgoing references are grayed by linking them
//! into a gray list; leaves (strings, closed upvalues, userdata without user
//! values) go straight to black.

use crate::heap::Heap;
use crate::object::{
    Color, Header, LuaClosure, NativeClosure, Object, ObjectKind, Proto, Thread, UserData,
};
use crate::table::{Table, WeakMode};
use crate::value::{GcRef, TableKey, Value};

use super::state::{CollectorState, GcState, GrayList};

pub(crate) struct Marker<'a> {
    pub headers: &'a mut [Header],
    pub objects: &'a [Option<Object>],
    pub gc: &'a mut CollectorState,
    pub tm_mode: GcRef,
}

impl Marker<'_> {
    #[inline]
    pub(crate) fn is_white(&self, idx: u32) -> bool {
        self.headers[idx as usize].color.is_white()
    }

    #[inline]
    fn set_color(&mut self, idx: u32, color: Color) {
        self.headers[idx as usize].color = color;
    }

    #[inline]
    pub(crate) fn mark_value(&mut self, value: Value) {
        if let Value::Object(r) = value {
            self.mark_ref(r);
        }
    }

    #[inline]
    pub(crate) fn mark_ref(&mut self, r: GcRef) {
        debug_assert!(
            self.objects[r.slot()].is_some(),
            "marking freed object {r:?}"
        );
        if self.is_white(r.index()) {
            self.really_mark(r.index());
        }
    }

    #[inline]
    fn mark_opt(&mut self, r: Option<GcRef>) {
        if let Some(r) = r {
            self.mark_ref(r);
        }
    }

    #[inline]
    fn mark_key(&mut self, key: TableKey) {
        if let Some(r) = key.as_object() {
            self.mark_ref(r);
        }
    }

    /// Marks a white object: leaves become black, everything else is linked
    /// into the gray list.
    pub(crate) fn really_mark(&mut self, idx: u32) {
        let objects = self.objects;
        match &objects[idx as usize] {
            Some(Object::String(_)) => self.set_color(idx, Color::Black),
            Some(Object::Upvalue(uv)) => match *uv {
                crate::object::Upvalue::Open { thread, slot } => {
                    // Open upvalues stay gray; their value is remarked from
                    // the owning thread.
                    self.set_color(idx, Color::Gray);
                    let value = objects[thread.slot()]
                        .as_ref()
                        .and_then(Object::as_thread)
                        .and_then(|t| t.stack.get(slot).copied())
                        .unwrap_or(Value::Nil);
                    self.mark_value(value);
                }
                crate::object::Upvalue::Closed(value) => {
                    self.set_color(idx, Color::Black);
                    self.mark_value(value);
                }
            },
            Some(Object::UserData(u)) if u.user_values.is_empty() => {
                self.mark_opt(u.metatable);
                self.set_color(idx, Color::Black);
            }
            Some(_) => self.link_gray(idx, GrayList::Gray),
            None => debug_assert!(false, "marking vacant slot {idx}"),
        }
    }

    /// Pushes `idx` onto a gray list and paints it gray.
    #[inline]
    pub(crate) fn link_gray(&mut self, idx: u32, list: GrayList) {
        let head = self.gc.gray_head_mut(list);
        let old = head.replace(idx);
        let header = &mut self.headers[idx as usize];
        header.gclist = old;
        header.color = Color::Gray;
    }

    /// Keeps touched old objects on the gray-again list for the next minor
    /// collection.
    pub(crate) fn gen_link(&mut self, idx: u32) {
        use crate::object::Age;
        match self.headers[idx as usize].age {
            Age::Touched1 => self.link_gray(idx, GrayList::GrayAgain),
            Age::Touched2 => self.headers[idx as usize].age = Age::Old,
            _ => {}
        }
    }

    #[inline]
    pub(crate) fn is_cleared(&mut self, r: Option<GcRef>) -> bool {
        is_cleared(self.headers, r)
    }

    #[inline]
    fn value_is_white(&self, value: Value) -> bool {
        value.as_object().is_some_and(|r| self.is_white(r.index()))
    }

    /// Weak mode declared by `table`'s metatable.
    pub(crate) fn weak_mode(&self, table: &Table) -> WeakMode {
        table
            .metatable
            .and_then(|mt| self.objects[mt.slot()].as_ref())
            .and_then(Object::as_table)
            .and_then(|mt| mt.get_str(self.tm_mode).as_object())
            .and_then(|s| match &self.objects[s.slot()] {
                Some(Object::String(s)) => Some(WeakMode::from_mode_bytes(s.bytes.as_slice())),
                _ => None,
            })
            .unwrap_or(WeakMode::Strong)
    }

    /// Blackens the head of the gray list and traverses it. Returns the work
    /// done, roughly the number of slots visited.
    pub(crate) fn propagate_mark(&mut self) -> usize {
        let Some(idx) = self.gc.gray else {
            return 0;
        };
        let header = &mut self.headers[idx as usize];
        self.gc.gray = header.gclist.take();
        header.color = Color::Black;
        header.traversals += 1;
        let objects = self.objects;
        match &objects[idx as usize] {
            Some(Object::Table(t)) => self.traverse_table(idx, t),
            Some(Object::UserData(u)) => self.traverse_userdata(idx, u),
            Some(Object::LuaClosure(c)) => self.traverse_lua_closure(c),
            Some(Object::NativeClosure(c)) => self.traverse_native_closure(c),
            Some(Object::Proto(p)) => self.traverse_proto(p),
            Some(Object::Thread(th)) => self.traverse_thread(idx, th),
            Some(Object::String(_) | Object::Upvalue(_)) | None => {
                debug_assert!(false, "object {idx} cannot be on a gray list");
                0
            }
        }
    }

    /// Drains the gray list.
    pub(crate) fn propagate_all(&mut self) -> usize {
        let mut work = 0;
        while self.gc.gray.is_some() {
            work += self.propagate_mark();
        }
        work
    }

    fn traverse_table(&mut self, idx: u32, table: &Table) -> usize {
        let mode = self.weak_mode(table);
        self.mark_opt(table.metatable);
        match mode {
            WeakMode::Strong => self.traverse_strong_table(idx, table),
            WeakMode::WeakValues => self.traverse_weak_value(idx, table),
            WeakMode::WeakKeys => {
                self.traverse_ephemeron(idx, table, false);
            }
            WeakMode::AllWeak => self.link_gray(idx, GrayList::AllWeak),
        }
        1 + table.array.len() + 2 * table.hash.len()
    }

    fn traverse_strong_table(&mut self, idx: u32, table: &Table) {
        for &v in &table.array {
            self.mark_value(v);
        }
        for (&k, &v) in &table.hash {
            self.mark_key(k);
            self.mark_value(v);
        }
        self.gen_link(idx);
    }

    fn traverse_weak_value(&mut self, idx: u32, table: &Table) {
        // Array values are weak too: any array part may need clearing.
        let mut has_clears = !table.array.is_empty();
        for (&k, &v) in &table.hash {
            self.mark_key(k);
            if !has_clears && self.is_cleared(v.as_object()) {
                has_clears = true;
            }
        }
        if self.gc.state == GcState::Atomic && has_clears {
            self.link_gray(idx, GrayList::Weak);
        } else {
            self.link_gray(idx, GrayList::GrayAgain);
        }
    }

    /// Marks values whose keys are already marked. Returns whether anything
    /// was marked. `reverse` walks the hash part backwards.
    pub(crate) fn traverse_ephemeron(&mut self, idx: u32, table: &Table, reverse: bool) -> bool {
        let mut marked = false;
        let mut has_clears = false;
        let mut has_white_white = false;
        for &v in &table.array {
            if let Some(r) = v.as_object().filter(|r| self.is_white(r.index())) {
                marked = true;
                self.really_mark(r.index());
            }
        }
        let mut visit = |this: &mut Self, key: TableKey, value: Value| {
            if this.is_cleared(key.as_object()) {
                has_clears = true;
                if this.value_is_white(value) {
                    has_white_white = true;
                }
            } else if let Some(r) = value.as_object().filter(|r| this.is_white(r.index())) {
                marked = true;
                this.really_mark(r.index());
            }
        };
        if reverse {
            for (&k, &v) in table.hash.iter().rev() {
                visit(self, k, v);
            }
        } else {
            for (&k, &v) in &table.hash {
                visit(self, k, v);
            }
        }
        if self.gc.state == GcState::Propagate {
            self.link_gray(idx, GrayList::GrayAgain);
        } else if has_white_white {
            self.link_gray(idx, GrayList::Ephemeron);
        } else if has_clears {
            self.link_gray(idx, GrayList::AllWeak);
        } else {
            self.gen_link(idx);
        }
        marked
    }

    fn traverse_userdata(&mut self, idx: u32, u: &UserData) -> usize {
        self.mark_opt(u.metatable);
        for &v in &u.user_values {
            self.mark_value(v);
        }
        self.gen_link(idx);
        1 + u.user_values.len()
    }

    fn traverse_lua_closure(&mut self, c: &LuaClosure) -> usize {
        self.mark_ref(c.proto);
        for &uv in &c.upvalues {
            self.mark_opt(uv);
        }
        1 + c.upvalues.len()
    }

    fn traverse_native_closure(&mut self, c: &NativeClosure) -> usize {
        for &v in &c.upvalues {
            self.mark_value(v);
        }
        1 + c.upvalues.len()
    }

    fn traverse_proto(&mut self, p: &Proto) -> usize {
        self.mark_opt(p.source);
        for &k in &p.constants {
            self.mark_value(k);
        }
        for &name in &p.upvalue_names {
            self.mark_opt(name);
        }
        for &child in &p.protos {
            self.mark_ref(child);
        }
        for &name in &p.local_names {
            self.mark_opt(name);
        }
        1 + p.constants.len() + p.upvalue_names.len() + p.protos.len() + p.local_names.len()
    }

    /// Threads are never left black while marking: the stack is written
    /// without barriers, so the thread is revisited in the atomic phase.
    fn traverse_thread(&mut self, idx: u32, th: &Thread) -> usize {
        if self.headers[idx as usize].age.is_old() || self.gc.state == GcState::Propagate {
            self.link_gray(idx, GrayList::GrayAgain);
        }
        for &v in &th.stack {
            self.mark_value(v);
        }
        for &(_, uv) in &th.open_upvalues {
            self.mark_ref(uv);
        }
        if self.gc.state == GcState::Atomic && !th.in_twups.get() && !th.open_upvalues.is_empty() {
            th.in_twups.set(true);
            self.gc.twups.push(idx);
        }
        1 + th.stack.len()
    }

    /// Marks the values of open upvalues whose thread is unmarked or has no
    /// upvalues left, and drops such threads from the list.
    pub(crate) fn remark_upvalues(&mut self) -> usize {
        let mut work = 0;
        let threads = std::mem::take(&mut self.gc.twups);
        let mut kept = Vec::with_capacity(threads.len());
        let objects = self.objects;
        for idx in threads {
            work += 1;
            let Some(thread) = objects[idx as usize].as_ref().and_then(Object::as_thread) else {
                continue;
            };
            if !self.is_white(idx) && !thread.open_upvalues.is_empty() {
                kept.push(idx);
                continue;
            }
            thread.in_twups.set(false);
            for &(slot, uv) in &thread.open_upvalues {
                work += 1;
                if !self.is_white(uv.index()) {
                    self.mark_value(thread.stack.get(slot).copied().unwrap_or(Value::Nil));
                }
            }
        }
        kept.append(&mut self.gc.twups);
        self.gc.twups = kept;
        work
    }
}

/// Whether a weak reference to `r` may be dropped. Strings are values and
/// are never weak: they get marked instead.
pub(crate) fn is_cleared(headers: &mut [Header], r: Option<GcRef>) -> bool {
    let Some(r) = r else {
        return false;
    };
    let header = &mut headers[r.slot()];
    if header.kind == ObjectKind::String {
        if header.color.is_white() {
            header.color = Color::Black;
        }
        return false;
    }
    header.color.is_white()
}

/// Root marking handle passed to the embedder's root hook.
pub struct Roots<'a, 'm> {
    marker: &'a mut Marker<'m>,
}

impl Roots<'_, '_> {
    /// Marks `value` and everything reachable from it as live for the
    /// current cycle. Stale handles are ignored.
    pub fn mark_root(&mut self, value: Value) {
        if let Value::Object(r) = value {
            let live = self
                .marker
                .objects
                .get(r.slot())
                .is_some_and(Option::is_some)
                && self.marker.headers[r.slot()].generation == r.generation();
            if live {
                self.marker.mark_ref(r);
            }
        }
    }
}

impl Heap {
    /// Marks the root set: main thread, registry, per-kind metatables,
    /// values anchored by an operation in progress and whatever the
    /// embedder's root hook reports.
    pub(crate) fn mark_roots(&mut self) {
        let (main, registry, metatables) = (self.main_thread, self.registry, self.type_metatables);
        let anchors = std::mem::take(&mut self.anchors);
        let mut hook = self.root_hook.take();
        {
            let mut marker = self.marker();
            marker.mark_ref(main);
            marker.mark_ref(registry);
            for mt in metatables.into_iter().flatten() {
                marker.mark_ref(mt);
            }
            for &value in &anchors {
                marker.mark_value(value);
            }
            if let Some(hook) = hook.as_mut() {
                hook(&mut Roots {
                    marker: &mut marker,
                });
            }
        }
        if self.root_hook.is_none() {
            self.root_hook = hook;
        }
        self.anchors = anchors;
    }

    /// Starts a cycle: empties the gray lists and marks the roots.
    pub(crate) fn restart_collection(&mut self) {
        self.gc.clear_gray_lists();
        self.mark_roots();
        self.mark_being_finalized();
    }

    pub(crate) fn propagate_mark(&mut self) -> usize {
        self.marker().propagate_mark()
    }

    pub(crate) fn propagate_all(&mut self) -> usize {
        self.marker().propagate_all()
    }
}
