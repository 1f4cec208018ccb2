//! Heap invariant checks.

use crate::error::InvariantViolation;
use crate::heap::Heap;
use crate::object::{Color, Object, Upvalue};
use crate::value::{GcRef, TableKey, Value};

use super::state::{GcState, Link, ObjList};

/// Calls `f` with every reference `object` traces.
fn for_each_child(object: &Object, mut f: impl FnMut(GcRef)) {
    let mut value = |v: &Value| {
        if let Value::Object(r) = *v {
            f(r);
        }
    };
    match object {
        Object::String(_) | Object::Upvalue(Upvalue::Open { .. }) => {}
        Object::Upvalue(Upvalue::Closed(v)) => value(v),
        Object::Table(t) => {
            t.metatable.map(Value::Object).iter().for_each(&mut value);
            t.array.iter().for_each(&mut value);
            for (k, v) in &t.hash {
                if let TableKey::Object(r) = *k {
                    value(&Value::Object(r));
                }
                value(v);
            }
        }
        Object::UserData(u) => {
            u.metatable.map(Value::Object).iter().for_each(&mut value);
            u.user_values.iter().for_each(&mut value);
        }
        Object::LuaClosure(c) => {
            value(&Value::Object(c.proto));
            c.upvalues.iter().flatten().map(|&r| Value::Object(r)).for_each(|v| value(&v));
        }
        Object::NativeClosure(c) => c.upvalues.iter().for_each(&mut value),
        Object::Thread(th) => {
            th.stack.iter().for_each(&mut value);
            th.open_upvalues.iter().for_each(|&(_, uv)| value(&Value::Object(uv)));
        }
        Object::Proto(p) => {
            let names = p.upvalue_names.iter().chain(&p.local_names).flatten();
            p.source
                .iter()
                .chain(&p.protos)
                .chain(names)
                .for_each(|&r| value(&Value::Object(r)));
            p.constants.iter().for_each(&mut value);
        }
    }
}

impl Heap {
    /// Checks the collector's structural invariants.
    ///
    /// - every live object is on exactly one object list, and fixed objects
    ///   are gray;
    /// - no object that is not awaiting sweep references a freed slot or an
    ///   object awaiting sweep;
    /// - in incremental mode, while marking, no black object references a
    ///   white one;
    /// - the sweep cursor points into the list being swept.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        let lists = self.verify_lists()?;
        self.verify_references()?;
        self.verify_sweep_cursor(&lists)
    }

    fn verify_lists(&self) -> Result<Vec<Option<ObjList>>, InvariantViolation> {
        let mut membership: Vec<Option<ObjList>> = vec![None; self.arena.objects.len()];
        let mut counts = vec![0usize; self.arena.objects.len()];
        for list in [ObjList::AllGc, ObjList::FinObj, ObjList::ToBeFnz, ObjList::FixedGc] {
            let mut cursor = self.gc.head(list);
            while let Some(idx) = cursor {
                let slot = idx as usize;
                if self.arena.objects[slot].is_none() {
                    return Err(InvariantViolation::Dangling {
                        object: self.arena.gc_ref(idx),
                        index: idx,
                    });
                }
                counts[slot] += 1;
                if counts[slot] > 1 {
                    // Also catches cycles in a list.
                    return Err(InvariantViolation::ListMembership {
                        object: self.arena.gc_ref(idx),
                        lists: counts[slot],
                    });
                }
                membership[slot] = Some(list);
                let color = self.arena.headers[slot].color;
                if list == ObjList::FixedGc && color != Color::Gray {
                    return Err(InvariantViolation::UnexpectedColor {
                        object: self.arena.gc_ref(idx),
                        color,
                    });
                }
                cursor = self.arena.headers[slot].next;
            }
        }
        for (slot, object) in self.arena.objects.iter().enumerate() {
            if object.is_some() && counts[slot] == 0 {
                let idx = u32::try_from(slot).unwrap_or(u32::MAX);
                return Err(InvariantViolation::ListMembership {
                    object: self.arena.gc_ref(idx),
                    lists: 0,
                });
            }
        }
        Ok(membership)
    }

    fn verify_references(&self) -> Result<(), InvariantViolation> {
        let check_black = self.gc.state.keeps_invariant() && !self.gc.is_generational();
        for (slot, object) in self.arena.objects.iter().enumerate() {
            let Some(object) = object else {
                continue;
            };
            let color = self.arena.headers[slot].color;
            if self.gc.is_dead_color(color) {
                continue;
            }
            let parent = self.arena.gc_ref(u32::try_from(slot).unwrap_or(u32::MAX));
            let mut violation = None;
            for_each_child(object, |child| {
                if violation.is_some() {
                    return;
                }
                if !self.arena.is_live(child) {
                    violation = Some(InvariantViolation::Dangling {
                        object: parent,
                        index: child.index(),
                    });
                    return;
                }
                let child_color = self.arena.headers[child.slot()].color;
                if self.gc.is_dead_color(child_color) {
                    violation = Some(InvariantViolation::DeadReference { parent, child });
                } else if check_black && color.is_black() && child_color.is_white() {
                    violation = Some(InvariantViolation::BlackToWhite { parent, child });
                }
            });
            if let Some(violation) = violation {
                return Err(violation);
            }
        }
        Ok(())
    }

    fn verify_sweep_cursor(&self, membership: &[Option<ObjList>]) -> Result<(), InvariantViolation> {
        let swept = match self.gc.state {
            GcState::SweepAllGc => Some(ObjList::AllGc),
            GcState::SweepFinObj => Some(ObjList::FinObj),
            GcState::SweepToBeFnz => Some(ObjList::ToBeFnz),
            _ => None,
        };
        let ok = match (self.gc.sweep_cursor, swept) {
            (None, _) => true,
            (Some(Link::Head(list)), Some(swept)) => list == swept,
            (Some(Link::Next(idx)), Some(swept)) => {
                membership.get(idx as usize).copied().flatten() == Some(swept)
            }
            (Some(_), None) => false,
        };
        if ok {
            Ok(())
        } else {
            Err(InvariantViolation::SweepCursor)
        }
    }
}
