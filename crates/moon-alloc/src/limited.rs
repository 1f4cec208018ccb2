//! A byte-budgeted allocator wrapper.

use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::{AllocError, Allocator, SystemAllocator};

/// Shared accounting for a [`LimitedAllocator`].
///
/// The budget outlives the allocator it is attached to, so a test can keep a
/// handle after moving the allocator into a heap.
#[derive(Debug, Default)]
pub struct Budget {
    limit: Cell<usize>,
    in_use: Cell<usize>,
    peak: Cell<usize>,
    refusals: Cell<usize>,
}

impl Budget {
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.get()
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.set(limit);
    }

    /// Bytes currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.get()
    }

    /// High-water mark of `in_use`.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    /// Number of requests turned down for exceeding the limit.
    #[must_use]
    pub fn refusals(&self) -> usize {
        self.refusals.get()
    }

    pub fn reset_peak(&self) {
        self.peak.set(self.in_use.get());
    }

    /// Bytes in use once `old_size` is replaced by `new_size`, or `None`
    /// (counted as a refusal) if that growth passes the limit.
    fn admit(&self, old_size: usize, new_size: usize) -> Option<usize> {
        let after = self.in_use.get().saturating_sub(old_size) + new_size;
        if new_size > old_size && after > self.limit.get() {
            self.refusals.set(self.refusals.get() + 1);
            return None;
        }
        Some(after)
    }

    fn settle(&self, after: usize) {
        self.in_use.set(after);
        self.peak.set(self.peak.get().max(after));
    }
}

/// Wraps another allocator and refuses requests that would push the bytes in
/// use past a limit.
#[derive(Debug)]
pub struct LimitedAllocator<A = SystemAllocator> {
    inner: A,
    budget: Rc<Budget>,
}

impl LimitedAllocator<SystemAllocator> {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self::with_inner(SystemAllocator, limit)
    }
}

impl<A: Allocator> LimitedAllocator<A> {
    #[must_use]
    pub fn with_inner(inner: A, limit: usize) -> Self {
        let budget = Budget::default();
        budget.limit.set(limit);
        Self {
            inner,
            budget: Rc::new(budget),
        }
    }

    /// A handle to the shared accounting.
    #[must_use]
    pub fn budget(&self) -> Rc<Budget> {
        Rc::clone(&self.budget)
    }
}

// SAFETY: delegates every block to `inner` and only adds bookkeeping.
unsafe impl<A: Allocator> Allocator for LimitedAllocator<A> {
    unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let old_size = if ptr.is_some() { old_size } else { 0 };
        let after = self.budget.admit(old_size, new_size)?;
        // SAFETY: forwarded verbatim from our caller.
        let result = unsafe { self.inner.reallocate(ptr, old_size, new_size) };
        if result.is_some() || new_size == 0 {
            self.budget.settle(after);
        }
        result
    }

    fn reserve(&mut self, old_size: usize, new_size: usize) -> Result<(), AllocError> {
        let after = self
            .budget
            .admit(old_size, new_size)
            .ok_or(AllocError { requested: new_size })?;
        self.budget.settle(after);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_past_limit() {
        let mut alloc = LimitedAllocator::new(100);
        let budget = alloc.budget();

        let a = alloc.allocate(60).unwrap();
        assert_eq!(budget.in_use(), 60);

        let err = alloc.allocate(60).unwrap_err();
        assert_eq!(err.requested, 60);
        assert_eq!(budget.refusals(), 1);

        alloc.free(a);
        assert_eq!(budget.in_use(), 0);
        assert_eq!(budget.peak(), 60);

        let b = alloc.allocate(100).unwrap();
        alloc.free(b);
    }

    #[test]
    fn test_shrinking_is_never_refused() {
        let mut alloc = LimitedAllocator::new(64);
        let budget = alloc.budget();
        let mut block = alloc.allocate(64).unwrap();
        budget.set_limit(0);
        alloc.resize(&mut block, 16).unwrap();
        assert_eq!(budget.in_use(), 16);
        alloc.free(block);
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn test_reservations_share_the_budget_with_blocks() {
        let mut alloc = LimitedAllocator::new(100);
        let budget = alloc.budget();
        alloc.reserve(0, 70).unwrap();
        assert_eq!(budget.in_use(), 70);

        let err = alloc.allocate(40).unwrap_err();
        assert_eq!(err.requested, 40);
        let block = alloc.allocate(30).unwrap();
        assert_eq!(alloc.reserve(70, 80), Err(AllocError { requested: 80 }));
        assert_eq!(budget.refusals(), 2);

        alloc.reserve(70, 0).unwrap();
        alloc.free(block);
        assert_eq!(budget.in_use(), 0);
        assert_eq!(budget.peak(), 100);
    }
}
