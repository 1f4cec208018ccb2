//! Mutator-facing object operations.
//!
//! Every store of a collectable value into a heap object goes through the
//! matching write barrier here. Constructors and growing stores only run the
//! collector for an emergency collection when the backing store refuses a
//! request; values an operation is handed survive it, other unrooted locals
//! do not. Regular collector work happens at [`Heap::step`].

#![allow(clippy::missing_errors_doc)]

use crate::error::GcError;
use crate::heap::{wrong_kind, Heap};
use crate::object::{
    Color, LuaClosure, NativeClosure, NativeFn, Object, Proto, Thread, Upvalue, UserData,
};
use crate::table::Table;
use crate::value::{GcRef, TableKey, Value};

impl Heap {
    fn check_value(&self, value: Value) -> Result<(), GcError> {
        if let Value::Object(r) = value {
            self.arena.get(r)?;
        }
        Ok(())
    }

    fn check_values<'v>(&self, values: impl IntoIterator<Item = &'v Value>) -> Result<(), GcError> {
        values.into_iter().try_for_each(|&v| self.check_value(v))
    }

    fn check_refs<'r>(&self, refs: impl IntoIterator<Item = &'r GcRef>) -> Result<(), GcError> {
        refs.into_iter().try_for_each(|&r| self.arena.get(r).map(|_| ()))
    }

    pub fn new_table(&mut self) -> Result<GcRef, GcError> {
        self.allocate_object(Object::Table(Table::default()))
    }

    /// Allocates a userdata with a zeroed block of `size` bytes and
    /// `user_values` nil user values.
    pub fn new_userdata(&mut self, size: usize, user_values: usize) -> Result<GcRef, GcError> {
        let block = self.allocate_block(size)?;
        self.allocate_object(Object::UserData(UserData {
            block,
            metatable: None,
            user_values: vec![Value::Nil; user_values],
        }))
    }

    pub fn new_native_closure(&mut self, function: NativeFn, upvalues: Vec<Value>) -> Result<GcRef, GcError> {
        self.check_values(&upvalues)?;
        self.allocate_object(Object::NativeClosure(NativeClosure { function, upvalues }))
    }

    /// Allocates a closure over `proto` with `upvalues` unset upvalue slots.
    pub fn new_lua_closure(&mut self, proto: GcRef, upvalues: usize) -> Result<GcRef, GcError> {
        match self.arena.get(proto)? {
            Object::Proto(_) => {}
            other => return Err(wrong_kind("proto", other)),
        }
        self.allocate_object(Object::LuaClosure(LuaClosure {
            proto,
            upvalues: vec![None; upvalues],
        }))
    }

    pub fn new_proto(&mut self, proto: Proto) -> Result<GcRef, GcError> {
        self.check_values(&proto.constants)?;
        self.check_refs(&proto.protos)?;
        self.check_refs(proto.source.iter())?;
        self.check_refs(proto.upvalue_names.iter().chain(&proto.local_names).flatten())?;
        self.allocate_object(Object::Proto(proto))
    }

    pub fn new_thread(&mut self) -> Result<GcRef, GcError> {
        self.allocate_object(Object::Thread(Thread::default()))
    }

    // Tables

    /// Raw get. A nil or NaN key reads as nil.
    pub fn table_get(&self, table: GcRef, key: Value) -> Result<Value, GcError> {
        let table = self.expect_table(table)?;
        Ok(TableKey::from_value(key).map_or(Value::Nil, |k| table.get(&k)))
    }

    /// Raw set. Storing nil removes the entry.
    ///
    /// If the table has to grow and the backing store refuses even after an
    /// emergency collection, the table is left as it was.
    pub fn table_set(&mut self, table: GcRef, key: Value, value: Value) -> Result<(), GcError> {
        let key = TableKey::from_value(key)?;
        self.check_value(key.to_value())?;
        self.check_value(value)?;
        let t = self.expect_table_mut(table)?;
        let previous = t.get(&key);
        t.set(key, value);
        self.barrier_back_value(table, key.to_value());
        self.barrier_back_value(table, value);
        if let Err(err) = self.recharge(table, &[key.to_value(), value]) {
            self.expect_table_mut(table)?.set(key, previous);
            return Err(err);
        }
        Ok(())
    }

    /// A border of the table's sequence.
    pub fn table_len(&self, table: GcRef) -> Result<usize, GcError> {
        Ok(self.expect_table(table)?.len())
    }

    /// Snapshot of the table's entries, array part first.
    pub fn table_pairs(&self, table: GcRef) -> Result<Vec<(Value, Value)>, GcError> {
        Ok(self
            .expect_table(table)?
            .iter()
            .map(|(k, v)| (k.to_value(), v))
            .collect())
    }

    // Metatables

    /// The metatable of `r`: its own for tables and userdata, the per-kind
    /// metatable otherwise.
    pub fn get_metatable(&self, r: GcRef) -> Result<Option<GcRef>, GcError> {
        self.arena.get(r)?;
        Ok(self.metatable_of(r))
    }

    /// Sets the metatable of a table or userdata.
    ///
    /// The object becomes finalizable if `metatable` has a `__gc` field at
    /// this point; adding `__gc` to the metatable later has no effect.
    pub fn set_metatable(&mut self, r: GcRef, metatable: Option<GcRef>) -> Result<(), GcError> {
        if let Some(mt) = metatable {
            self.expect_table(mt)?;
        }
        match self.arena.get_mut(r)? {
            Object::Table(t) => t.metatable = metatable,
            Object::UserData(u) => u.metatable = metatable,
            other => return Err(wrong_kind("table or userdata", other)),
        }
        if let Some(mt) = metatable {
            self.write_barrier_forward(r, Value::Object(mt));
            self.check_finalizer(r, metatable);
        }
        Ok(())
    }

    // Userdata

    fn expect_userdata(&self, r: GcRef) -> Result<&UserData, GcError> {
        match self.arena.get(r)? {
            Object::UserData(u) => Ok(u),
            other => Err(wrong_kind("userdata", other)),
        }
    }

    fn expect_userdata_mut(&mut self, r: GcRef) -> Result<&mut UserData, GcError> {
        match self.arena.get_mut(r)? {
            Object::UserData(u) => Ok(u),
            other => Err(wrong_kind("userdata", other)),
        }
    }

    pub fn user_value(&self, userdata: GcRef, n: usize) -> Result<Value, GcError> {
        let values = &self.expect_userdata(userdata)?.user_values;
        values.get(n).copied().ok_or(GcError::IndexOutOfRange {
            index: n,
            len: values.len(),
        })
    }

    pub fn set_user_value(&mut self, userdata: GcRef, n: usize, value: Value) -> Result<(), GcError> {
        self.check_value(value)?;
        let values = &mut self.expect_userdata_mut(userdata)?.user_values;
        let len = values.len();
        *values
            .get_mut(n)
            .ok_or(GcError::IndexOutOfRange { index: n, len })? = value;
        self.barrier_back_value(userdata, value);
        Ok(())
    }

    pub fn userdata_bytes(&self, userdata: GcRef) -> Result<&[u8], GcError> {
        Ok(self.expect_userdata(userdata)?.block.as_slice())
    }

    pub fn userdata_bytes_mut(&mut self, userdata: GcRef) -> Result<&mut [u8], GcError> {
        Ok(self.expect_userdata_mut(userdata)?.block.as_mut_slice())
    }

    // Closures

    pub fn native_upvalue(&self, closure: GcRef, n: usize) -> Result<Value, GcError> {
        match self.arena.get(closure)? {
            Object::NativeClosure(c) => c.upvalues.get(n).copied().ok_or(GcError::IndexOutOfRange {
                index: n,
                len: c.upvalues.len(),
            }),
            other => Err(wrong_kind("native closure", other)),
        }
    }

    pub fn set_native_upvalue(&mut self, closure: GcRef, n: usize, value: Value) -> Result<(), GcError> {
        self.check_value(value)?;
        match self.arena.get_mut(closure)? {
            Object::NativeClosure(c) => {
                let len = c.upvalues.len();
                *c.upvalues
                    .get_mut(n)
                    .ok_or(GcError::IndexOutOfRange { index: n, len })? = value;
            }
            other => return Err(wrong_kind("native closure", other)),
        }
        self.write_barrier_forward(closure, value);
        Ok(())
    }

    pub fn closure_upvalue(&self, closure: GcRef, n: usize) -> Result<Option<GcRef>, GcError> {
        match self.arena.get(closure)? {
            Object::LuaClosure(c) => c.upvalues.get(n).copied().ok_or(GcError::IndexOutOfRange {
                index: n,
                len: c.upvalues.len(),
            }),
            other => Err(wrong_kind("closure", other)),
        }
    }

    /// Points upvalue slot `n` of a closure at `upvalue`.
    pub fn set_closure_upvalue(&mut self, closure: GcRef, n: usize, upvalue: GcRef) -> Result<(), GcError> {
        match self.arena.get(upvalue)? {
            Object::Upvalue(_) => {}
            other => return Err(wrong_kind("upvalue", other)),
        }
        match self.arena.get_mut(closure)? {
            Object::LuaClosure(c) => {
                let len = c.upvalues.len();
                *c.upvalues
                    .get_mut(n)
                    .ok_or(GcError::IndexOutOfRange { index: n, len })? = Some(upvalue);
            }
            other => return Err(wrong_kind("closure", other)),
        }
        self.write_barrier_forward(closure, Value::Object(upvalue));
        Ok(())
    }

    // Upvalues

    fn expect_thread(&self, r: GcRef) -> Result<&Thread, GcError> {
        match self.arena.get(r)? {
            Object::Thread(t) => Ok(t),
            other => Err(wrong_kind("thread", other)),
        }
    }

    fn expect_thread_mut(&mut self, r: GcRef) -> Result<&mut Thread, GcError> {
        match self.arena.get_mut(r)? {
            Object::Thread(t) => Ok(t),
            other => Err(wrong_kind("thread", other)),
        }
    }

    /// The open upvalue for stack `slot` of `thread`, created if missing.
    pub fn find_upvalue(&mut self, thread: GcRef, slot: usize) -> Result<GcRef, GcError> {
        let th = self.expect_thread(thread)?;
        if slot >= th.stack.len() {
            return Err(GcError::IndexOutOfRange {
                index: slot,
                len: th.stack.len(),
            });
        }
        let pos = match th.open_upvalues.binary_search_by_key(&slot, |&(s, _)| s) {
            Ok(found) => return Ok(th.open_upvalues[found].1),
            Err(pos) => pos,
        };
        let uv = self.allocate_object(Object::Upvalue(Upvalue::Open { thread, slot }))?;
        let th = self.expect_thread_mut(thread)?;
        th.open_upvalues.insert(pos, (slot, uv));
        if !th.in_twups.replace(true) {
            self.gc.twups.push(thread.index());
        }
        if let Err(err) = self.recharge(thread, &[Value::Object(uv)]) {
            // The upvalue stays behind as garbage; it no longer names a slot.
            self.expect_thread_mut(thread)?.open_upvalues.retain(|&(_, u)| u != uv);
            if let Ok(Object::Upvalue(state)) = self.arena.get_mut(uv) {
                *state = Upvalue::Closed(Value::Nil);
            }
            return Err(err);
        }
        Ok(uv)
    }

    fn expect_upvalue(&self, r: GcRef) -> Result<Upvalue, GcError> {
        match self.arena.get(r)? {
            Object::Upvalue(uv) => Ok(*uv),
            other => Err(wrong_kind("upvalue", other)),
        }
    }

    pub fn upvalue_get(&self, upvalue: GcRef) -> Result<Value, GcError> {
        match self.expect_upvalue(upvalue)? {
            Upvalue::Open { thread, slot } => self.thread_get(thread, slot),
            Upvalue::Closed(value) => Ok(value),
        }
    }

    /// Writes through an upvalue. An open upvalue writes its stack slot.
    pub fn upvalue_set(&mut self, upvalue: GcRef, value: Value) -> Result<(), GcError> {
        self.check_value(value)?;
        match self.expect_upvalue(upvalue)? {
            Upvalue::Open { thread, slot } => self.thread_set(thread, slot, value),
            Upvalue::Closed(_) => {
                if let Ok(Object::Upvalue(uv)) = self.arena.get_mut(upvalue) {
                    *uv = Upvalue::Closed(value);
                }
                self.write_barrier_forward(upvalue, value);
                Ok(())
            }
        }
    }

    /// Closes every upvalue of `thread` at stack slot `level` or above.
    pub fn close_upvalues(&mut self, thread: GcRef, level: usize) -> Result<(), GcError> {
        let th = self.expect_thread_mut(thread)?;
        let keep = th.open_upvalues.partition_point(|&(slot, _)| slot < level);
        let closing: Vec<(usize, GcRef)> = th.open_upvalues.drain(keep..).collect();
        let values: Vec<Value> = closing
            .iter()
            .map(|&(slot, _)| th.stack.get(slot).copied().unwrap_or_default())
            .collect();
        for (&(_, uv), value) in closing.iter().zip(values) {
            if let Ok(Object::Upvalue(state)) = self.arena.get_mut(uv) {
                *state = Upvalue::Closed(value);
            }
            let header = &mut self.arena.headers[uv.slot()];
            if !header.color.is_white() {
                // Closed upvalues are never gray.
                header.color = Color::Black;
                self.write_barrier_forward(uv, value);
            }
        }
        self.recharge(thread, &[])
    }

    // Threads

    pub fn thread_push(&mut self, thread: GcRef, value: Value) -> Result<(), GcError> {
        self.check_value(value)?;
        self.expect_thread_mut(thread)?.stack.push(value);
        if let Err(err) = self.recharge(thread, &[]) {
            self.expect_thread_mut(thread)?.stack.pop();
            return Err(err);
        }
        Ok(())
    }

    pub fn thread_pop(&mut self, thread: GcRef) -> Result<Value, GcError> {
        let len = self.thread_len(thread)?;
        if len == 0 {
            return Err(GcError::IndexOutOfRange { index: 0, len: 0 });
        }
        let value = self.thread_get(thread, len - 1)?;
        self.thread_set_top(thread, len - 1)?;
        Ok(value)
    }

    pub fn thread_get(&self, thread: GcRef, slot: usize) -> Result<Value, GcError> {
        let stack = &self.expect_thread(thread)?.stack;
        stack.get(slot).copied().ok_or(GcError::IndexOutOfRange {
            index: slot,
            len: stack.len(),
        })
    }

    /// Stack writes need no barrier: threads are re-traversed by the atomic
    /// phase.
    pub fn thread_set(&mut self, thread: GcRef, slot: usize, value: Value) -> Result<(), GcError> {
        self.check_value(value)?;
        let stack = &mut self.expect_thread_mut(thread)?.stack;
        let len = stack.len();
        *stack
            .get_mut(slot)
            .ok_or(GcError::IndexOutOfRange { index: slot, len })? = value;
        Ok(())
    }

    /// Resizes the stack to `top` slots, closing upvalues of dropped slots
    /// and filling new ones with nil.
    pub fn thread_set_top(&mut self, thread: GcRef, top: usize) -> Result<(), GcError> {
        self.close_upvalues(thread, top)?;
        let stack = &mut self.expect_thread_mut(thread)?.stack;
        let len = stack.len();
        stack.resize(top, Value::Nil);
        if let Err(err) = self.recharge(thread, &[]) {
            self.expect_thread_mut(thread)?.stack.truncate(len);
            return Err(err);
        }
        Ok(())
    }

    pub fn thread_len(&self, thread: GcRef) -> Result<usize, GcError> {
        Ok(self.expect_thread(thread)?.stack.len())
    }
}
