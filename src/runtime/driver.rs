//! The driver: the loop that turns ready continuations back into running
//! frames.
//!
//! One step drains cross-thread wakes into the scheduler, fires due timers,
//! and re-polls a single task. Resumption is therefore always iterative —
//! a chain of nested suspending calls unwinds through `Poll::Pending` and
//! re-enters one frame per step, so resumption depth never tracks logical
//! call-stack depth.
//!
//! When there is nothing runnable the driver either advances the virtual
//! clock to the next timer deadline or parks until one fires or an external
//! wake arrives. A wait with no timers, no offloaded work, and no queued
//! wakes can never be satisfied; the driver fails fast instead of hanging.

use crate::error::Error;
use crate::scope::{Scope, ScopeConfig};
use crate::types::{Outcome, Time};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use super::{
    Clock, Injector, RuntimeConfig, RuntimeState, Scheduler, Shared, TimeMode, TimerRegistry,
    WorkerSet,
};

/// Counters describing a runtime's current load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeMetrics {
    /// Task polls executed so far.
    pub steps: u64,
    /// Live (non-terminal) tasks, scope roots included.
    pub tasks_live: usize,
    /// Armed timers.
    pub timers_pending: usize,
    /// Offloaded closures still running.
    pub offloads_outstanding: usize,
}

/// Builder for a [`Runtime`].
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Starts from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the clock mode.
    #[must_use]
    pub fn time(mut self, mode: TimeMode) -> Self {
        self.config.time = mode;
        self
    }

    /// Sets the shared offload thread budget.
    #[must_use]
    pub fn thread_budget(mut self, budget: usize) -> Self {
        self.config.thread_budget = budget;
        self
    }

    /// Sets the compute pool cap.
    #[must_use]
    pub fn compute_threads(mut self, threads: usize) -> Self {
        self.config.compute_threads = threads;
        self
    }

    /// Sets the blocking pool cap.
    #[must_use]
    pub fn blocking_threads(mut self, threads: usize) -> Self {
        self.config.blocking_threads = threads;
        self
    }

    /// Builds the runtime.
    #[must_use]
    pub fn build(self) -> Runtime {
        Runtime::with_config(self.config)
    }
}

/// A cooperative task-suspension runtime.
///
/// Tasks are multiplexed over the driver; suspension detaches a continuation
/// and returns the worker, it never blocks one.
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// A runtime with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// A runtime with the given configuration.
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        let injector = Arc::new(Injector::new());
        let shared = Arc::new(Shared {
            state: parking_lot::Mutex::new(RuntimeState::new()),
            scheduler: parking_lot::Mutex::new(Scheduler::new(config.context_pressure)),
            timers: parking_lot::Mutex::new(TimerRegistry::new()),
            injector: Arc::clone(&injector),
            clock: Clock::new(config.time),
            workers: WorkerSet::new(
                config.compute_threads,
                config.blocking_threads,
                config.thread_budget,
                injector,
            ),
            steps: std::sync::atomic::AtomicU64::new(0),
        });
        Self { shared }
    }

    /// A builder for custom configurations.
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The current runtime instant.
    #[must_use]
    pub fn now(&self) -> Time {
        self.shared.clock.now()
    }

    /// Opens a new scope on this runtime.
    #[must_use]
    pub fn scope(&self, config: ScopeConfig) -> Scope {
        Scope::open(&self.shared, config)
    }

    /// Runs `body` as the root task of a fresh scope, driving the runtime
    /// until it terminates, and returns its outcome.
    pub fn block_on<T, F, Fut>(&self, body: F) -> Outcome<T, Error>
    where
        F: FnOnce(crate::cx::Cx) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        let scope = self.scope(ScopeConfig::default());
        let handle = scope.launch(body);
        self.drive_while(|| !handle.is_finished());
        let outcome = handle
            .outcome_now()
            .expect("terminal task must publish an outcome");
        scope.close();
        self.drive_while(|| !scope.is_closed());
        outcome
    }

    /// Steps until no runnable work, armed timer, or outstanding offload
    /// remains. Returns the number of polls executed.
    pub fn run_until_quiescent(&self) -> u64 {
        let before = self.shared.steps.load(Ordering::Relaxed);
        loop {
            if self.step() {
                continue;
            }
            if self.idle_once(false) {
                continue;
            }
            break;
        }
        self.shared.steps.load(Ordering::Relaxed) - before
    }

    /// Current load counters.
    #[must_use]
    pub fn metrics(&self) -> RuntimeMetrics {
        RuntimeMetrics {
            steps: self.shared.steps.load(Ordering::Relaxed),
            tasks_live: self.shared.state.lock().tasks_live(),
            timers_pending: self.shared.timers.lock().pending(),
            offloads_outstanding: self.shared.workers.outstanding(),
        }
    }

    /// Drives the runtime while `cond` holds.
    ///
    /// # Panics
    ///
    /// Panics if `cond` still holds when the runtime has nothing left that
    /// could ever produce progress — that wait would hang forever.
    pub(crate) fn drive_while(&self, cond: impl Fn() -> bool) {
        while cond() {
            if self.step() {
                continue;
            }
            if !self.idle_once(true) && cond() {
                panic!(
                    "runtime stalled: waiting with no runnable tasks, armed timers, \
                     or outstanding offloads"
                );
            }
        }
    }

    /// Handles one idle period. Returns `true` if progress may now be
    /// possible, `false` if the runtime is quiescent. `park` controls
    /// whether external work is waited for (drive) or drained (quiescence).
    fn idle_once(&self, park: bool) -> bool {
        let shared = &self.shared;
        if let Some(deadline) = shared.timers.lock().next_deadline() {
            match shared.clock.mode() {
                TimeMode::Virtual => shared.clock.advance_to(deadline),
                TimeMode::Wall => {
                    let wait = deadline.duration_since(shared.clock.now());
                    shared
                        .injector
                        .park(Some(Duration::from_nanos(wait.max(1))));
                }
            }
            return true;
        }
        if shared.workers.outstanding() > 0 || !shared.injector.is_empty() {
            if park {
                shared.injector.park(Some(Duration::from_millis(10)));
            } else {
                // Quiescence wants the offloads drained, not abandoned.
                shared.injector.park(Some(Duration::from_millis(1)));
            }
            return true;
        }
        false
    }

    /// Executes one unit of driver work. Returns `false` when there was
    /// nothing immediately runnable.
    fn step(&self) -> bool {
        let shared = &self.shared;
        let mut progressed = false;

        // 1. Cross-thread wakes become schedule entries.
        if !shared.injector.is_empty() {
            let state = shared.state.lock();
            let mut scheduler = shared.scheduler.lock();
            while let Some(task) = shared.injector.pop() {
                let Some(record) = state.tasks.get(task.arena_index()) else {
                    continue;
                };
                if record.state.is_terminal() {
                    continue;
                }
                if record.state.is_cancelling() {
                    scheduler.schedule_cancel(task);
                } else {
                    scheduler.schedule(task, record.exec);
                }
                progressed = true;
            }
        }

        // 2. Fire due timers; their wakes land in the injector for the next
        //    pass.
        let due = shared.timers.lock().take_due(shared.clock.now());
        if !due.is_empty() {
            progressed = true;
            for cont in due {
                cont.resume(Ok(()));
            }
        }

        // 3. Poll one task.
        let Some(task) = shared.scheduler.lock().pop() else {
            return progressed;
        };
        let Some(mut body) = ({
            let mut state = shared.state.lock();
            match state.tasks.get_mut(task.arena_index()) {
                Some(record) if !record.state.is_terminal() => {
                    record.start();
                    record.body.take()
                }
                _ => None,
            }
        }) else {
            // Stale wake for a container, finished, or not-yet-installed
            // body.
            return true;
        };

        shared.steps.fetch_add(1, Ordering::Relaxed);
        let waker = shared.injector.waker_for(task);
        let mut poll_cx = Context::from_waker(&waker);
        match body.poll(&mut poll_cx) {
            Poll::Ready(outcome) => {
                let mut effects = super::Effects::default();
                shared
                    .state
                    .lock()
                    .body_finished(task, outcome, &mut effects);
                effects.apply(shared);
            }
            Poll::Pending => {
                let mut state = shared.state.lock();
                if let Some(record) = state.tasks.get_mut(task.arena_index()) {
                    record.body = Some(body);
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("metrics", &self.metrics())
            .finish()
    }
}
