//! Error types.
//!
//! Mutator operations fail with [`GcError`]. Finalizer bodies fail with
//! [`CallError`], which the collector downgrades to a [`FinalizerFault`].
//! [`InvariantViolation`] is only produced by [`Heap::verify`](crate::Heap::verify).

use crate::object::{Color, ObjectKind};
use crate::value::GcRef;

/// Failures visible to the mutator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GcError {
    /// The backing store refused a request even after an emergency collection.
    #[error("not enough memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("stale object handle {0:?}")]
    StaleHandle(GcRef),

    #[error("expected {expected}, found {found}")]
    WrongKind {
        expected: &'static str,
        found: ObjectKind,
    },

    #[error("table index is nil")]
    NilKey,

    #[error("table index is NaN")]
    NaNKey,

    #[error("index {index} out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Only the most recently allocated string can be fixed.
    #[error("object {0:?} cannot be fixed")]
    NotFixable(GcRef),
}

/// An error raised by a finalizer or native function.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CallError {
    pub message: String,
}

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A finalizer failed. The collector logs it and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("error in __gc finalizer of {object:?}: {message}")]
pub struct FinalizerFault {
    pub object: GcRef,
    pub message: String,
}

/// A broken collector invariant. Indicates a collector bug, never a user error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("black object {parent:?} references white object {child:?}")]
    BlackToWhite { parent: GcRef, child: GcRef },

    #[error("live object {parent:?} references dead object {child:?}")]
    DeadReference { parent: GcRef, child: GcRef },

    #[error("object {object:?} references a freed slot {index}")]
    Dangling { object: GcRef, index: u32 },

    #[error("object {object:?} is linked into {lists} object lists")]
    ListMembership { object: GcRef, lists: usize },

    #[error("object {object:?} has color {color:?} outside of a collection")]
    UnexpectedColor { object: GcRef, color: Color },

    #[error("sweep cursor does not point into the list being swept")]
    SweepCursor,
}
