//! The runtime: shared state, scheduler, timers, worker pools, and the
//! driver loop.

mod config;
mod driver;
mod scheduler;
mod state;
mod stored;
mod timer;
mod waker;
mod workers;

pub use config::{ConfigError, RuntimeConfig, TimeMode};
pub use driver::{Runtime, RuntimeBuilder, RuntimeMetrics};
pub use workers::{Dispatch, OffloadKind};

pub(crate) use scheduler::Scheduler;
pub(crate) use state::{Effects, RuntimeState};
pub(crate) use stored::StoredTask;
pub(crate) use timer::TimerRegistry;
pub(crate) use waker::Injector;
pub(crate) use workers::WorkerSet;

use crate::types::Time;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

/// State shared between the driver, contexts, futures, and worker threads.
pub(crate) struct Shared {
    pub(crate) state: Mutex<RuntimeState>,
    pub(crate) scheduler: Mutex<Scheduler>,
    pub(crate) timers: Mutex<TimerRegistry>,
    pub(crate) injector: Arc<Injector>,
    pub(crate) clock: Clock,
    pub(crate) workers: WorkerSet,
    pub(crate) steps: AtomicU64,
}

/// The runtime clock: wall time measured from runtime start, or virtual time
/// that only moves when the driver advances it past an idle point.
pub(crate) struct Clock {
    mode: TimeMode,
    origin: Instant,
    virtual_now: Mutex<Time>,
}

impl Clock {
    pub(crate) fn new(mode: TimeMode) -> Self {
        Self {
            mode,
            origin: Instant::now(),
            virtual_now: Mutex::new(Time::ZERO),
        }
    }

    pub(crate) fn mode(&self) -> TimeMode {
        self.mode
    }

    pub(crate) fn now(&self) -> Time {
        match self.mode {
            TimeMode::Virtual => *self.virtual_now.lock(),
            TimeMode::Wall => Time::from_nanos(self.origin.elapsed().as_nanos() as u64),
        }
    }

    /// Moves virtual time forward to `target`. Never moves backward.
    pub(crate) fn advance_to(&self, target: Time) {
        assert_eq!(
            self.mode,
            TimeMode::Virtual,
            "advance_to is only meaningful under the virtual clock"
        );
        let mut now = self.virtual_now.lock();
        if target > *now {
            *now = target;
        }
    }
}
