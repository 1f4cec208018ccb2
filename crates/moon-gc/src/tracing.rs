//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collector phases, atomic pauses, emergency
//! collections and finalizer faults. Without the feature every helper
//! compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tracing::{span, Level};

    use crate::gc::GcState;
    use crate::metrics::CollectionType;

    /// Stable identifier for a collection cycle.
    ///
    /// Correlates all events emitted between leaving the pause state and
    /// returning to it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a full or minor collection.
    pub fn trace_gc_collection(collection_type: CollectionType, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = ?collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    pub fn log_transition(gc_id: GcId, from: GcState, to: GcState) {
        tracing::trace!(gc_id = gc_id.0, ?from, ?to, "state_transition");
    }

    pub fn log_atomic(gc_id: GcId, work: usize, total_bytes: usize, pause: Duration) {
        tracing::debug!(
            gc_id = gc_id.0,
            work,
            total_bytes,
            pause_us = u64::try_from(pause.as_micros()).unwrap_or(u64::MAX),
            "atomic_end"
        );
    }

    pub fn log_cycle_end(gc_id: GcId, total_bytes: usize, threshold: usize) {
        tracing::debug!(gc_id = gc_id.0, total_bytes, threshold, "cycle_end");
    }

    pub fn log_emergency(requested: usize) {
        tracing::warn!(requested, "allocation failed; running emergency collection");
    }

    pub fn log_finalizer_fault(fault: &crate::error::FinalizerFault) {
        tracing::warn!(object = ?fault.object, message = %fault.message, "finalizer_fault");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
