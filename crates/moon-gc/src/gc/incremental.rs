//! The incremental phase scheduler.
//!
//! A cycle walks `Pause -> Propagate -> EnterAtomic -> Atomic -> sweeps ->
//! CallFinalizers -> Pause`. Each call to [`Heap::single_step`] performs one
//! bounded unit of the current phase, except the atomic phase, which runs to
//! completion and never allocates.

use std::time::Instant;

use crate::config::GcMode;
use crate::heap::Heap;
use crate::metrics::CollectionType;

use super::state::{GcState, GrayList, ObjList};

/// Work charged for running one finalizer.
const FINALIZE_COST: usize = 50;

impl Heap {
    pub(crate) fn set_state(&mut self, to: GcState) {
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_transition(self.gc.gc_id, self.gc.state, to);
        self.gc.state = to;
    }

    /// Advances the current phase by one unit and returns the work done.
    pub(crate) fn single_step(&mut self) -> usize {
        debug_assert!(!self.gc.stop_emergency, "collector is not reentrant");
        self.gc.stop_emergency = true;
        let work = match self.gc.state {
            GcState::Pause => {
                self.gc.gc_id = crate::tracing::internal::next_gc_id();
                self.restart_collection();
                self.set_state(GcState::Propagate);
                1
            }
            GcState::Propagate => {
                if self.gc.gray.is_none() {
                    self.set_state(GcState::EnterAtomic);
                    0
                } else {
                    self.propagate_mark()
                }
            }
            GcState::EnterAtomic => {
                let work = self.atomic();
                self.enter_sweep();
                self.gc.estimate = self.gc.heap_bytes();
                work
            }
            GcState::SweepAllGc => self.sweep_step(GcState::SweepFinObj, Some(ObjList::FinObj)),
            GcState::SweepFinObj => self.sweep_step(GcState::SweepToBeFnz, Some(ObjList::ToBeFnz)),
            GcState::SweepToBeFnz => self.sweep_step(GcState::SweepEnd, None),
            GcState::SweepEnd => {
                if !self.gc.emergency {
                    self.strings.check_size();
                }
                self.set_state(GcState::CallFinalizers);
                0
            }
            GcState::CallFinalizers => {
                if self.gc.tobefnz.is_some() && !self.gc.emergency {
                    self.gc.stop_emergency = false;
                    self.run_a_few_finalizers(1) * FINALIZE_COST
                } else {
                    self.set_state(GcState::Pause);
                    self.stats.cycles += 1;
                    0
                }
            }
            // Only reachable through the atomic phase itself.
            GcState::Atomic => 0,
        };
        self.gc.stop_emergency = false;
        work
    }

    /// The atomic phase: finishes marking, resolves weak tables, separates
    /// objects to be finalized and flips the current white.
    ///
    /// Returns the work done, in traversed slots.
    pub(crate) fn atomic(&mut self) -> usize {
        let started = Instant::now();
        let mut work = 0;
        let grayagain = self.gc.grayagain.take();
        debug_assert!(self.gc.ephemeron.is_none() && self.gc.weak.is_none());
        self.set_state(GcState::Atomic);

        // The root set may have changed since the cycle started.
        self.mark_roots();
        work += self.propagate_all();
        work += self.marker().remark_upvalues();
        work += self.propagate_all();
        self.gc.gray = grayagain;
        work += self.propagate_all();
        self.converge_ephemerons();

        // Everything strongly reachable is marked. Clear weak values before
        // resurrecting objects to be finalized.
        self.clear_by_values(GrayList::Weak, None);
        self.clear_by_values(GrayList::AllWeak, None);
        let origweak = self.gc.weak;
        let origall = self.gc.allweak;
        if !self.gc.minor {
            self.rearm_resurrected();
        }
        self.separate_to_be_finalized(false);
        work += self.mark_being_finalized();
        work += self.propagate_all();
        self.converge_ephemerons();

        // Resurrected objects are marked; drop what is still dead.
        self.clear_by_keys(GrayList::Ephemeron);
        self.clear_by_keys(GrayList::AllWeak);
        self.clear_by_values(GrayList::Weak, origweak);
        self.clear_by_values(GrayList::AllWeak, origall);

        if cfg!(debug_assertions) && !self.gc.is_generational() {
            if let Err(violation) = self.verify() {
                panic!("heap invariant violated after atomic phase: {violation}");
            }
        }

        self.gc.current_white = self.gc.other_white();
        debug_assert!(self.gc.gray.is_none());

        let pause = started.elapsed();
        self.stats.record_atomic(pause);
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_atomic(self.gc.gc_id, work, self.gc.heap_bytes(), pause);
        work
    }

    /// Steps until the collector reaches `target`.
    pub(crate) fn run_until(&mut self, target: GcState) {
        while self.gc.state != target {
            self.single_step();
        }
    }

    /// Full collection in incremental mode.
    fn full_inc(&mut self) {
        if self.gc.state.keeps_invariant() {
            // Sweep everything back to white before starting over.
            self.enter_sweep();
        }
        self.run_until(GcState::Pause);
        self.run_until(GcState::CallFinalizers);
        debug_assert_eq!(self.gc.estimate, self.gc.heap_bytes());
        self.run_until(GcState::Pause);
        self.set_pause();
    }

    /// Runs a complete cycle. An emergency collection runs no finalizers
    /// and does not resize the string table.
    pub(crate) fn full_gc(&mut self, emergency: bool) {
        debug_assert!(!self.gc.emergency);
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_gc_collection(CollectionType::Major, self.gc.gc_id);
        self.gc.emergency = emergency;
        if emergency {
            self.stats.emergency_collections += 1;
        }
        if self.gc.kind == GcMode::Incremental {
            self.full_inc();
        } else {
            self.full_gen();
        }
        self.gc.emergency = false;
        self.stats.major_collections += 1;
        self.stats.last_collection = CollectionType::Major;
    }

    /// Safepoint: performs collector work if allocation debt is due.
    ///
    /// The mutator calls this between instructions, after allocating. Values
    /// held only in Rust locals must be rooted (on a thread stack, in the
    /// registry or through the root hook) before calling it.
    pub fn step(&mut self) {
        if self.gc.debt > 0 {
            self.collector_step();
        }
    }

    /// One pacer-driven step regardless of the debt.
    pub(crate) fn collector_step(&mut self) {
        if !self.gc.is_running() {
            // Avoid being called again too soon.
            self.gc.set_debt(-2000);
            return;
        }
        self.stats.steps += 1;
        if self.gc.is_generational() {
            self.generational_step();
        } else {
            #[cfg(feature = "tracing")]
            let _span =
                crate::tracing::internal::trace_gc_collection(CollectionType::Incremental, self.gc.gc_id);
            self.incremental_step();
            self.stats.last_collection = CollectionType::Incremental;
        }
    }

    /// Explicit step request.
    ///
    /// With `kb == 0` performs one basic step, otherwise adds `kb` KiB of
    /// debt and steps if it is due. Returns `true` if a cycle finished. Does
    /// nothing while a finalizer runs.
    pub fn step_kb(&mut self, kb: usize) -> bool {
        if self.gc.stopped_internally || self.gc.closing {
            return false;
        }
        let was_stopped = std::mem::replace(&mut self.gc.stopped_by_user, false);
        let mut debt = 1;
        if kb == 0 {
            self.gc.set_debt(0);
            self.collector_step();
        } else {
            let kb = isize::try_from(kb).unwrap_or(isize::MAX);
            debt = kb.saturating_mul(1024).saturating_add(self.gc.debt);
            self.gc.set_debt(debt);
            self.step();
        }
        self.gc.stopped_by_user = was_stopped;
        debt > 0 && self.gc.state == GcState::Pause
    }

    /// Runs a complete collection cycle, finalizers included.
    ///
    /// Works while the collector is stopped by the user; does nothing while
    /// a finalizer runs.
    pub fn full_collect(&mut self) {
        if self.gc.stopped_internally || self.gc.closing {
            return;
        }
        self.full_gc(false);
    }

    /// Suspends automatic collection. Explicit requests still run.
    pub fn stop(&mut self) {
        self.gc.stopped_by_user = true;
    }

    /// Resumes automatic collection.
    pub fn restart(&mut self) {
        if self.gc.stopped_internally {
            return;
        }
        self.gc.set_debt(0);
        self.gc.stopped_by_user = false;
    }

    /// Whether automatic collection is enabled.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.gc.is_running()
    }

    pub fn set_incremental(&mut self) {
        self.change_mode(GcMode::Incremental);
    }

    pub fn set_generational(&mut self) {
        self.change_mode(GcMode::Generational);
    }

    /// Switches collection mode. Entering generational mode runs a full
    /// cycle that makes every live object old; leaving it whitens everything
    /// and restarts incremental collection from the pause state.
    pub fn change_mode(&mut self, mode: GcMode) {
        self.gc.config.mode = mode;
        if mode != self.gc.kind {
            match mode {
                GcMode::Generational => {
                    self.enter_gen();
                }
                GcMode::Incremental => self.enter_inc(),
            }
        }
        self.gc.last_atomic = 0;
    }
}
