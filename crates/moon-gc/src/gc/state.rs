//! Collector state: phase, white shade, intrusive list heads and debt.

use crate::config::{GcConfig, GcMode};
use crate::object::{Color, Header};
use crate::tracing::GcId;
use crate::value::GcRef;

/// Incremental collector states, in cycle order.
///
/// The ordering is meaningful: every state up to [`GcState::Atomic`] keeps the
/// tri-color invariant, the sweep states form a contiguous range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcState {
    Propagate,
    EnterAtomic,
    Atomic,
    SweepAllGc,
    SweepFinObj,
    SweepToBeFnz,
    SweepEnd,
    CallFinalizers,
    Pause,
}

impl GcState {
    /// Black objects may not point to white ones in these states.
    #[inline]
    #[must_use]
    pub fn keeps_invariant(self) -> bool {
        self <= Self::Atomic
    }

    #[inline]
    #[must_use]
    pub fn is_sweep_phase(self) -> bool {
        (Self::SweepAllGc..=Self::SweepEnd).contains(&self)
    }
}

/// Object lists threaded through `Header::next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjList {
    AllGc,
    FinObj,
    ToBeFnz,
    FixedGc,
}

/// Gray lists threaded through `Header::gclist`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GrayList {
    Gray,
    GrayAgain,
    Weak,
    AllWeak,
    Ephemeron,
}

/// A handle to a link field: either a list head or the `next` field of the
/// object at an index. Unlinking the successor of a `Link` is O(1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    Head(ObjList),
    Next(u32),
}

/// Same as [`Link`], for `gclist` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GrayLink {
    Head(GrayList),
    Next(u32),
}

#[derive(Debug)]
pub(crate) struct CollectorState {
    pub config: GcConfig,
    pub current_white: Color,
    pub state: GcState,
    /// Mode currently in effect. May be incremental while the pacer is still
    /// driving generational steps after a bad major collection.
    pub kind: GcMode,

    pub allgc: Option<u32>,
    pub finobj: Option<u32>,
    pub tobefnz: Option<u32>,
    pub fixedgc: Option<u32>,
    /// The newest object, the only one [`Heap::fix`](crate::Heap::fix) accepts.
    pub last_allocated: Option<u32>,

    pub gray: Option<u32>,
    pub grayagain: Option<u32>,
    pub weak: Option<u32>,
    pub allweak: Option<u32>,
    pub ephemeron: Option<u32>,

    /// Resume position of the incremental sweeper. `None` means the current
    /// list is exhausted.
    pub sweep_cursor: Option<Link>,

    // Generational segments of `allgc` and `finobj`. Each points at the first
    // object of the segment; `None` is the end of the list.
    pub survival: Option<u32>,
    pub old1: Option<u32>,
    pub reallyold: Option<u32>,
    pub firstold1: Option<u32>,
    pub finobjsur: Option<u32>,
    pub finobjold1: Option<u32>,
    pub finobjrold: Option<u32>,

    /// Threads with open upvalues.
    pub twups: Vec<u32>,
    /// Finalized objects to re-register if they turn out to be resurrected.
    pub rearm: Vec<GcRef>,

    /// Bytes accounted as of the last `set_debt`; the heap size is
    /// `total_bytes + debt`.
    pub total_bytes: isize,
    pub debt: isize,
    /// Estimate of the live heap, used to compute the pause threshold.
    pub estimate: usize,
    /// Objects traversed by the last bad major collection, or 0.
    pub last_atomic: usize,

    pub emergency: bool,
    /// Set while a collector step runs: an allocation failure then cannot
    /// trigger an emergency collection.
    pub stop_emergency: bool,
    pub stopped_by_user: bool,
    /// Set while a finalizer runs and while the heap is being built.
    pub stopped_internally: bool,
    pub closing: bool,
    /// Set during the atomic phase of a minor collection.
    pub minor: bool,

    pub gc_id: GcId,
}

impl CollectorState {
    pub(crate) fn new(config: GcConfig) -> Self {
        Self {
            config,
            current_white: Color::White0,
            state: GcState::Pause,
            kind: GcMode::Incremental,
            allgc: None,
            finobj: None,
            tobefnz: None,
            fixedgc: None,
            last_allocated: None,
            gray: None,
            grayagain: None,
            weak: None,
            allweak: None,
            ephemeron: None,
            sweep_cursor: None,
            survival: None,
            old1: None,
            reallyold: None,
            firstold1: None,
            finobjsur: None,
            finobjold1: None,
            finobjrold: None,
            twups: Vec::new(),
            rearm: Vec::new(),
            total_bytes: 0,
            debt: 0,
            estimate: 0,
            last_atomic: 0,
            emergency: false,
            stop_emergency: false,
            stopped_by_user: false,
            stopped_internally: true,
            closing: false,
            minor: false,
            gc_id: crate::tracing::internal::next_gc_id(),
        }
    }

    #[inline]
    pub(crate) const fn other_white(&self) -> Color {
        match self.current_white {
            Color::White0 => Color::White1,
            _ => Color::White0,
        }
    }

    /// An object of color `color` was found unreachable by the last atomic
    /// phase and has not been swept yet.
    #[inline]
    pub(crate) fn is_dead_color(&self, color: Color) -> bool {
        color == self.other_white()
    }

    #[inline]
    pub(crate) const fn is_running(&self) -> bool {
        !(self.stopped_by_user || self.stopped_internally || self.closing)
    }

    /// Generational steps are in effect, including the incremental fallback
    /// after a bad major collection.
    #[inline]
    pub(crate) fn is_generational(&self) -> bool {
        self.kind == GcMode::Generational || self.last_atomic != 0
    }

    #[inline]
    #[allow(clippy::cast_sign_loss)]
    pub(crate) const fn heap_bytes(&self) -> usize {
        let total = self.total_bytes + self.debt;
        if total < 0 {
            0
        } else {
            total as usize
        }
    }

    /// Sets the debt while keeping the heap size unchanged.
    pub(crate) fn set_debt(&mut self, debt: isize) {
        let total = self.total_bytes + self.debt;
        let debt = debt.max(total - isize::MAX);
        self.total_bytes = total - debt;
        self.debt = debt;
    }

    #[inline]
    #[allow(clippy::cast_possible_wrap)]
    pub(crate) const fn charge(&mut self, bytes: usize) {
        self.debt += bytes as isize;
    }

    #[inline]
    #[allow(clippy::cast_possible_wrap)]
    pub(crate) const fn credit(&mut self, bytes: usize) {
        self.debt -= bytes as isize;
    }

    pub(crate) const fn head(&self, list: ObjList) -> Option<u32> {
        match list {
            ObjList::AllGc => self.allgc,
            ObjList::FinObj => self.finobj,
            ObjList::ToBeFnz => self.tobefnz,
            ObjList::FixedGc => self.fixedgc,
        }
    }

    pub(crate) const fn head_mut(&mut self, list: ObjList) -> &mut Option<u32> {
        match list {
            ObjList::AllGc => &mut self.allgc,
            ObjList::FinObj => &mut self.finobj,
            ObjList::ToBeFnz => &mut self.tobefnz,
            ObjList::FixedGc => &mut self.fixedgc,
        }
    }

    pub(crate) const fn gray_head_mut(&mut self, list: GrayList) -> &mut Option<u32> {
        match list {
            GrayList::Gray => &mut self.gray,
            GrayList::GrayAgain => &mut self.grayagain,
            GrayList::Weak => &mut self.weak,
            GrayList::AllWeak => &mut self.allweak,
            GrayList::Ephemeron => &mut self.ephemeron,
        }
    }

    pub(crate) const fn clear_gray_lists(&mut self) {
        self.gray = None;
        self.grayagain = None;
        self.weak = None;
        self.allweak = None;
        self.ephemeron = None;
    }
}

/// Reads the object a link points at.
#[inline]
pub(crate) fn get_link(headers: &[Header], gc: &CollectorState, link: Link) -> Option<u32> {
    match link {
        Link::Head(list) => gc.head(list),
        Link::Next(i) => headers[i as usize].next,
    }
}

#[inline]
pub(crate) fn set_link(headers: &mut [Header], gc: &mut CollectorState, link: Link, to: Option<u32>) {
    match link {
        Link::Head(list) => *gc.head_mut(list) = to,
        Link::Next(i) => headers[i as usize].next = to,
    }
}

#[inline]
pub(crate) fn get_gray_link(headers: &[Header], gc: &mut CollectorState, link: GrayLink) -> Option<u32> {
    match link {
        GrayLink::Head(list) => *gc.gray_head_mut(list),
        GrayLink::Next(i) => headers[i as usize].gclist,
    }
}

#[inline]
pub(crate) fn set_gray_link(
    headers: &mut [Header],
    gc: &mut CollectorState,
    link: GrayLink,
    to: Option<u32>,
) {
    match link {
        GrayLink::Head(list) => *gc.gray_head_mut(list) = to,
        GrayLink::Next(i) => headers[i as usize].gclist = to,
    }
}
