//! Object headers and the closed set of traced object kinds.

use std::cell::Cell;
use std::fmt;

use moon_alloc::RawBlock;

use crate::error::CallError;
use crate::heap::Heap;
use crate::table::Table;
use crate::value::{GcRef, Value};

/// Tri-color marking state.
///
/// Two white shades alternate between cycles: the current one marks objects
/// that are not yet known to be reachable, the other one marks objects found
/// dead by the last atomic phase and not swept yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    White0,
    White1,
    Gray,
    Black,
}

impl Color {
    #[inline]
    #[must_use]
    pub const fn is_white(self) -> bool {
        matches!(self, Self::White0 | Self::White1)
    }

    #[inline]
    #[must_use]
    pub const fn is_black(self) -> bool {
        matches!(self, Self::Black)
    }

    #[inline]
    #[must_use]
    pub const fn is_gray(self) -> bool {
        matches!(self, Self::Gray)
    }
}

/// Generational age. Only meaningful in generational mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Age {
    /// Created in the current cycle.
    New,
    /// Survived one minor collection.
    Survival,
    /// Made reachable from an old object by a forward barrier.
    Old0,
    /// Survived two minor collections; not traversed again after the next one.
    Old1,
    Old,
    /// Old object written through a backward barrier in this cycle.
    Touched1,
    /// Old object written through a backward barrier in the previous cycle.
    Touched2,
}

impl Age {
    #[inline]
    #[must_use]
    pub const fn is_old(self) -> bool {
        !matches!(self, Self::New | Self::Survival)
    }

    /// Age after surviving a generational sweep.
    #[must_use]
    pub(crate) const fn next_after_sweep(self) -> Self {
        match self {
            Self::New => Self::Survival,
            Self::Survival | Self::Old0 => Self::Old1,
            Self::Old1 | Self::Old => Self::Old,
            Self::Touched1 => Self::Touched1,
            Self::Touched2 => Self::Touched2,
        }
    }
}

/// Discriminates which traversal applies to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    String,
    Table,
    LuaClosure,
    NativeClosure,
    UserData,
    Thread,
    Upvalue,
    Proto,
}

impl ObjectKind {
    pub const COUNT: usize = 8;

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Table => "table",
            Self::LuaClosure | Self::NativeClosure => "function",
            Self::UserData => "userdata",
            Self::Thread => "thread",
            Self::Upvalue => "upvalue",
            Self::Proto => "proto",
        }
    }

    #[inline]
    pub(crate) const fn ordinal(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-slot collector metadata.
///
/// `next` threads the object through exactly one of the object lists
/// (all, finalizable, to-be-finalized, fixed). `gclist` threads it through at
/// most one gray list.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub color: Color,
    pub age: Age,
    /// Linked into the finalizable or to-be-finalized list.
    pub finalizable: bool,
    pub kind: ObjectKind,
    pub next: Option<u32>,
    pub gclist: Option<u32>,
    pub generation: u32,
    /// Estimated bytes charged to the pacer for this object.
    pub size: usize,
    /// Times this object was taken off a gray list and traversed.
    pub traversals: u64,
}

impl Header {
    pub(crate) const fn vacant() -> Self {
        Self {
            color: Color::White0,
            age: Age::New,
            finalizable: false,
            kind: ObjectKind::String,
            next: None,
            gclist: None,
            generation: 0,
            size: 0,
            traversals: 0,
        }
    }
}

/// A native function.
///
/// Receives the heap, the closure being called and its arguments. Finalizers
/// get the dying object as their single argument.
pub type NativeFn = fn(&mut Heap, GcRef, &[Value]) -> Result<(), CallError>;

/// An interned byte string.
#[derive(Debug)]
pub(crate) struct LuaString {
    pub bytes: RawBlock,
    pub hash: u64,
}

#[derive(Debug)]
pub(crate) struct LuaClosure {
    pub proto: GcRef,
    pub upvalues: Vec<Option<GcRef>>,
}

pub(crate) struct NativeClosure {
    pub function: NativeFn,
    pub upvalues: Vec<Value>,
}

impl fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeClosure")
            .field("upvalues", &self.upvalues)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct UserData {
    pub block: RawBlock,
    pub metatable: Option<GcRef>,
    pub user_values: Vec<Value>,
}

/// A coroutine: a value stack plus the upvalues still open on it.
#[derive(Debug, Default)]
pub(crate) struct Thread {
    pub stack: Vec<Value>,
    /// Open upvalues, sorted by stack slot.
    pub open_upvalues: Vec<(usize, GcRef)>,
    /// Linked into the collector's threads-with-upvalues list.
    pub in_twups: Cell<bool>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Upvalue {
    /// Aliases a live stack slot.
    Open { thread: GcRef, slot: usize },
    Closed(Value),
}

/// A function prototype produced by the compiler front end.
#[derive(Debug, Default, Clone)]
pub struct Proto {
    pub constants: Vec<Value>,
    pub protos: Vec<GcRef>,
    pub source: Option<GcRef>,
    pub upvalue_names: Vec<Option<GcRef>>,
    pub local_names: Vec<Option<GcRef>>,
    pub code: Vec<u32>,
}

#[derive(Debug)]
pub(crate) enum Object {
    String(LuaString),
    Table(Table),
    LuaClosure(LuaClosure),
    NativeClosure(NativeClosure),
    UserData(UserData),
    Thread(Thread),
    Upvalue(Upvalue),
    Proto(Proto),
}

impl Object {
    pub(crate) const fn kind(&self) -> ObjectKind {
        match self {
            Self::String(_) => ObjectKind::String,
            Self::Table(_) => ObjectKind::Table,
            Self::LuaClosure(_) => ObjectKind::LuaClosure,
            Self::NativeClosure(_) => ObjectKind::NativeClosure,
            Self::UserData(_) => ObjectKind::UserData,
            Self::Thread(_) => ObjectKind::Thread,
            Self::Upvalue(_) => ObjectKind::Upvalue,
            Self::Proto(_) => ObjectKind::Proto,
        }
    }

    /// Bytes charged to the pacer for this object.
    pub(crate) fn estimated_size(&self) -> usize {
        const VALUE: usize = std::mem::size_of::<Value>();
        const REF: usize = std::mem::size_of::<Option<GcRef>>();
        match self {
            Self::String(s) => 24 + s.bytes.len() + 1,
            Self::Table(t) => t.estimated_size(),
            Self::LuaClosure(c) => 32 + REF * c.upvalues.len(),
            Self::NativeClosure(c) => 32 + VALUE * c.upvalues.len(),
            Self::UserData(u) => 40 + VALUE * u.user_values.len() + u.block.len(),
            Self::Thread(t) => 200 + VALUE * t.stack.len() + 16 * t.open_upvalues.len(),
            Self::Upvalue(_) => 40,
            Self::Proto(p) => {
                120 + VALUE * p.constants.len()
                    + REF * (p.protos.len() + p.upvalue_names.len() + p.local_names.len())
                    + 4 * p.code.len()
            }
        }
    }

    /// Part of [`Object::estimated_size`] held in backing-store blocks. The
    /// rest is reserved with the allocator as the object's body.
    pub(crate) const fn block_bytes(&self) -> usize {
        match self {
            Self::String(s) => s.bytes.len(),
            Self::UserData(u) => u.block.len(),
            _ => 0,
        }
    }

    pub(crate) const fn metatable(&self) -> Option<GcRef> {
        match self {
            Self::Table(t) => t.metatable,
            Self::UserData(u) => u.metatable,
            _ => None,
        }
    }

    pub(crate) const fn as_table(&self) -> Option<&Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) const fn as_thread(&self) -> Option<&Thread> {
        match self {
            Self::Thread(t) => Some(t),
            _ => None,
        }
    }
}
