//! Debt-based pacing.
//!
//! Allocation raises the debt; a step is due once it is positive. Work is
//! measured in value slots and converted to bytes with [`WORK2MEM`].

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use crate::heap::Heap;

use super::state::GcState;

/// Bytes of allocation one unit of collector work pays for.
pub(crate) const WORK2MEM: isize = std::mem::size_of::<crate::value::Value>() as isize;

/// Divisor applied to the live estimate before the pause multiplier.
const PAUSEADJ: usize = 100;

impl Heap {
    /// Sets the debt so the next cycle starts once the heap reaches `pause`
    /// percent of the live estimate.
    pub(crate) fn set_pause(&mut self) {
        let estimate = (self.gc.estimate / PAUSEADJ).max(1);
        let threshold = estimate.saturating_mul(self.gc.config.pause);
        let threshold = isize::try_from(threshold).unwrap_or(isize::MAX);
        let heap = self.gc.heap_bytes() as isize;
        let debt = heap.saturating_sub(threshold).min(0);
        self.gc.set_debt(debt);
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_cycle_end(self.gc.gc_id, self.gc.heap_bytes(), threshold as usize);
    }

    /// Performs enough work to pay the current debt, at `step_multiplier`
    /// percent work per byte and at least one step size of credit.
    pub(crate) fn incremental_step(&mut self) {
        let stepmul = (self.gc.config.step_multiplier | 1) as isize;
        let mut debt = (self.gc.debt / WORK2MEM).saturating_mul(stepmul);
        let stepsize = (self.gc.config.step_size() as isize / WORK2MEM).saturating_mul(stepmul);
        loop {
            let work = self.single_step();
            debt = debt.saturating_sub(work as isize);
            if debt <= -stepsize || self.gc.state == GcState::Pause {
                break;
            }
        }
        if self.gc.state == GcState::Pause {
            self.set_pause();
        } else {
            self.gc.set_debt((debt / stepmul).saturating_mul(WORK2MEM));
        }
    }

    /// Allows `minor_multiplier` percent of the heap to be allocated before
    /// the next minor collection.
    pub(crate) fn set_minor_debt(&mut self) {
        let allowance = (self.gc.heap_bytes() / 100).saturating_mul(self.gc.config.minor_multiplier);
        self.gc.set_debt(-isize::try_from(allowance).unwrap_or(isize::MAX));
    }
}
