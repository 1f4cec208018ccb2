//! GC metrics and statistics.

use std::time::Duration;

/// Type of the most recent collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None,
    /// Generational minor collection.
    Minor,
    /// Stop-the-world full collection.
    Major,
    /// Incremental cycle driven by allocation debt.
    Incremental,
}

/// Running counters for one heap.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Incremental cycles that reached the pause state.
    pub cycles: u64,
    pub minor_collections: u64,
    pub major_collections: u64,
    /// Full collections forced by an allocation failure.
    pub emergency_collections: u64,
    /// Pacer-driven step batches.
    pub steps: u64,
    pub objects_allocated: u64,
    pub objects_freed: u64,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    pub finalizers_run: u64,
    pub finalizer_faults: u64,
    /// Finalized objects found reachable again and re-armed.
    pub resurrections: u64,
    pub forward_barriers: u64,
    pub backward_barriers: u64,
    /// Duration of the last atomic phase.
    pub last_atomic_pause: Duration,
    pub max_atomic_pause: Duration,
    pub last_collection: CollectionType,
}

impl GcStats {
    pub(crate) fn record_atomic(&mut self, pause: Duration) {
        self.last_atomic_pause = pause;
        self.max_atomic_pause = self.max_atomic_pause.max(pause);
    }
}
