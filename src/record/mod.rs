//! Internal records for tasks and scopes.
//!
//! Records are pure state machines: they validate transitions and hold
//! membership, but all cross-record orchestration (cancellation recursion,
//! failure propagation, completion gating) lives in the runtime state.

mod scope;
mod task;

pub(crate) use scope::ScopeRecord;
pub(crate) use task::{CancelSignal, Completion, TaskRecord};
pub use task::TaskState;
