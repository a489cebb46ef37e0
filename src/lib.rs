//! Weft: a cooperative task-suspension runtime.
//!
//! Sequential-looking code pauses at defined points without occupying a
//! worker, resumes later (possibly elsewhere), and lives inside a
//! supervised lifecycle tree that bounds every task's lifetime.
//!
//! # Core guarantees
//!
//! - **Structured concurrency**: every launched task is a tracked child of
//!   a scope or another task; a parent cannot complete before its children
//!   are terminal, and nothing outlives its scope.
//! - **Cancellation is cooperative and loud**: requests strengthen
//!   monotonically, are observed at suspension points and checkpoints, and
//!   never propagate upward as failures.
//! - **Failures propagate**: an unhandled error cancels siblings and fails
//!   the parent, unless a supervisor isolates it.
//! - **Resume-at-most-once**: a continuation resumed twice is a protocol
//!   violation and panics; results are delivered exactly once.
//! - **Bounded communication**: channels buffer explicitly, suspend
//!   producers on overflow and consumers on emptiness, and never leak an
//!   undeliverable value silently.
//!
//! # Module structure
//!
//! - [`types`]: identifiers, time, cancellation reasons, outcomes, context
//! - [`cont`]: the resume-once continuation handle
//! - [`runtime`]: scheduler, timers, worker pools, and the driver
//! - [`cx`]: the explicit capability context tasks operate through
//! - [`scope`]: scopes and task handles
//! - [`channel`]: bounded channels with capacity policies
//! - [`sync`]: the single-owner exclusive cell
//! - [`time`]: sleep and timeout
//! - [`error`]: error types
//! - [`test_utils`]: logging and runtime helpers for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

pub mod channel;
pub mod cont;
pub mod cx;
pub mod error;
pub mod runtime;
pub mod scope;
pub mod sync;
pub mod test_utils;
pub mod time;
pub mod types;

mod record;
mod util;

pub use cont::Continuation;
pub use cx::{Cx, MaskGuard, Offload};
pub use error::{Error, ErrorKind};
pub use record::TaskState;
pub use runtime::{
    ConfigError, Dispatch, OffloadKind, Runtime, RuntimeBuilder, RuntimeConfig, RuntimeMetrics,
    TimeMode,
};
pub use scope::{Scope, ScopeConfig, SpawnOptions, TaskHandle};
pub use sync::{Exclusive, ExclusiveGuard};
pub use types::{
    CancelKind, CancelReason, ContextMap, ExecContext, Outcome, PanicPayload, ScopeId, TaskId,
    Time,
};
