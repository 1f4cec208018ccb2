//! The collector.
//!
//! - `state`: phases, list heads and the debt counter.
//! - `mark`: gray-list driven traversal and root marking.
//! - `barrier`: forward and backward write barriers.
//! - `weak`: ephemeron convergence and weak-entry clearing.
//! - `finalize`: finalizer registration, separation and execution.
//! - `sweep`: incremental sweeping through link handles.
//! - `incremental`: the phase scheduler and explicit collection requests.
//! - `pacer`: debt-based step sizing.
//! - `generational`: minor collections and mode switches.
//! - `verify`: invariant checks.

mod barrier;
mod finalize;
mod generational;
mod incremental;
mod mark;
mod pacer;
mod state;
mod sweep;
mod verify;
mod weak;

pub(crate) use mark::Marker;
pub use mark::Roots;
pub(crate) use state::CollectorState;
pub use state::GcState;
