//! A tri-color incremental and generational tracing garbage collector for an
//! embedded register VM.
//!
//! Every object of one VM instance lives in a [`Heap`]. The mutator reaches
//! objects through [`GcRef`] handles and stores them in [`Value`]s; the heap
//! traces tables, closures, upvalues, userdata, threads and prototypes, and
//! interns strings.
//!
//! # Features
//!
//! - Incremental mark and sweep in bounded steps, paced by allocation debt
//! - Generational mode with minor collections and automatic major fallback
//! - Forward and backward write barriers
//! - Weak tables and ephemerons, cleared during the atomic phase
//! - `__gc` finalizers, with resurrection and re-arming
//! - Emergency collection when the backing store refuses a request
//! - Structured logging with the `tracing` feature
//!
//! # Quick Start
//!
//! ```ignore
//! use moon_gc::{Heap, Value};
//!
//! let mut heap = Heap::new()?;
//! let t = heap.new_table()?;
//! let key = heap.new_string("answer")?;
//! heap.table_set(heap.globals(), key.into(), t.into())?;
//! heap.table_set(t, Value::Integer(1), Value::Integer(42))?;
//!
//! // Safepoint: does collector work once enough has been allocated.
//! heap.step();
//! assert!(heap.is_live(t));
//! ```
//!
//! # Rooting
//!
//! The root set is the main thread, the registry, the per-kind metatables and
//! whatever the root hook reports. Anything else must be reachable from
//! those, or be stored with [`Heap::pin`], before the next call to
//! [`Heap::step`] or any collection request. Allocation itself never runs the
//! collector, except for an emergency collection when the backing store
//! refuses an object, a payload or the growth of a table or stack. The values
//! handed to that operation survive it.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
mod gc;
mod heap;
pub mod metrics;
mod mutator;
mod object;
mod string;
mod table;
pub mod tracing;
mod value;

// Re-export public API
pub use config::{
    GcConfig, GcMode, DEFAULT_MAJOR_MULTIPLIER, DEFAULT_MINOR_MULTIPLIER, DEFAULT_PAUSE,
    DEFAULT_STEP_MULTIPLIER, DEFAULT_STEP_SIZE_LOG2,
};
pub use error::{CallError, FinalizerFault, GcError, InvariantViolation};
pub use gc::{GcState, Roots};
pub use heap::{FinalizerHook, Heap, RootHook, REGISTRY_GLOBALS, REGISTRY_MAIN_THREAD};
pub use metrics::{CollectionType, GcStats};
pub use object::{Age, Color, NativeFn, ObjectKind, Proto};
pub use table::WeakMode;
pub use value::{GcRef, TableKey, Value};

pub use moon_alloc::{AllocError, Allocator, Budget, LimitedAllocator, SystemAllocator};
