//! Worker pools for synchronous offload.
//!
//! Tasks never occupy a worker while suspended; only explicitly offloaded
//! synchronous closures do. Two lazily-scaled pools exist — one sized for
//! CPU-bound work, one for long blocking calls — and both draw threads from
//! a single shared [`ThreadBudget`], so their independent caps can never add
//! up past the configured bound. Each pool is always allowed one thread, so
//! a saturated budget degrades throughput without deadlocking either pool.
//!
//! The [`Dispatch`] trait is the external collaborator boundary: the core
//! only ever asks "run this ready callback on context X".

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::waker::Injector;

/// Submission boundary for pluggable worker contexts.
pub trait Dispatch: Send + Sync + 'static {
    /// Runs `work` on this context, at some point, exactly once.
    fn submit(&self, work: Box<dyn FnOnce() + Send + 'static>);
}

/// Which offload pool a closure is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadKind {
    /// CPU-shaped work; pool sized near hardware parallelism.
    Compute,
    /// Long synchronous calls; larger, more forgiving pool.
    Blocking,
}

/// Shared cap on the total number of offload threads.
#[derive(Debug)]
pub(crate) struct ThreadBudget {
    limit: usize,
    used: AtomicUsize,
}

impl ThreadBudget {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    fn try_acquire(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }

    fn force_acquire(&self) {
        self.used.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.used.fetch_sub(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

const IDLE_RETIRE: Duration = Duration::from_millis(500);

struct PoolInner {
    name: &'static str,
    cap: usize,
    budget: Arc<ThreadBudget>,
    queue: SegQueue<Box<dyn FnOnce() + Send>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    shutdown: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

/// A lazily-scaled pool of OS threads running submitted closures FIFO.
///
/// Threads spawn on demand up to `cap` (budget permitting) and retire after
/// sitting idle.
pub(crate) struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub(crate) fn new(name: &'static str, cap: usize, budget: Arc<ThreadBudget>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                cap: cap.max(1),
                budget,
                queue: SegQueue::new(),
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                lock: Mutex::new(()),
                cvar: Condvar::new(),
            }),
        }
    }

    pub(crate) fn submit(&self, work: Box<dyn FnOnce() + Send + 'static>) {
        let inner = &self.inner;
        assert!(
            !inner.shutdown.load(Ordering::Acquire),
            "submit to a shut-down worker pool"
        );
        inner.queue.push(work);
        if inner.idle.load(Ordering::Acquire) == 0 {
            try_spawn(inner);
        }
        let _guard = inner.lock.lock();
        inner.cvar.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn active_threads(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.cvar.notify_all();
    }
}

impl Dispatch for WorkerPool {
    fn submit(&self, work: Box<dyn FnOnce() + Send + 'static>) {
        WorkerPool::submit(self, work);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("cap", &self.inner.cap)
            .field("active", &self.inner.active.load(Ordering::Relaxed))
            .finish()
    }
}

fn try_spawn(inner: &Arc<PoolInner>) {
    loop {
        let active = inner.active.load(Ordering::Acquire);
        if active >= inner.cap {
            return;
        }
        // The pool's first thread bypasses the budget so the pool can always
        // make progress; it is still counted against the budget.
        let forced = active == 0;
        if !forced && !inner.budget.try_acquire() {
            return;
        }
        if inner
            .active
            .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if forced {
                inner.budget.force_acquire();
            }
            let pool = Arc::clone(inner);
            std::thread::Builder::new()
                .name(format!("weft-{}-{}", inner.name, active))
                .spawn(move || worker_loop(&pool))
                .expect("failed to spawn worker thread");
            return;
        }
        if !forced {
            inner.budget.release();
        }
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    loop {
        if let Some(work) = inner.queue.pop() {
            // A panicking closure must not take the worker down with it.
            let _ = catch_unwind(AssertUnwindSafe(work));
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        inner.idle.fetch_add(1, Ordering::AcqRel);
        let timed_out = {
            let mut guard = inner.lock.lock();
            inner.cvar.wait_for(&mut guard, IDLE_RETIRE).timed_out()
        };
        inner.idle.fetch_sub(1, Ordering::AcqRel);
        if timed_out && inner.queue.is_empty() {
            break;
        }
    }
    inner.active.fetch_sub(1, Ordering::AcqRel);
    inner.budget.release();
}

/// The runtime's offload pools plus the outstanding-work counter the driver
/// uses to decide whether parking is safe.
pub(crate) struct WorkerSet {
    compute: WorkerPool,
    blocking: WorkerPool,
    outstanding: Arc<AtomicUsize>,
    injector: Arc<Injector>,
}

impl WorkerSet {
    pub(crate) fn new(
        compute_cap: usize,
        blocking_cap: usize,
        budget_limit: usize,
        injector: Arc<Injector>,
    ) -> Self {
        let budget = Arc::new(ThreadBudget::new(budget_limit));
        Self {
            compute: WorkerPool::new("compute", compute_cap, Arc::clone(&budget)),
            blocking: WorkerPool::new("blocking", blocking_cap, budget),
            outstanding: Arc::new(AtomicUsize::new(0)),
            injector,
        }
    }

    /// Submits a closure to the chosen pool, tracking it for quiescence.
    pub(crate) fn submit(&self, kind: OffloadKind, work: impl FnOnce() + Send + 'static) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let outstanding = Arc::clone(&self.outstanding);
        let injector = Arc::clone(&self.injector);
        let wrapped = Box::new(move || {
            work();
            outstanding.fetch_sub(1, Ordering::AcqRel);
            // The closure's own resume already unparks the driver; this
            // covers closures whose waiter disarmed in the meantime.
            injector.unpark();
        });
        match kind {
            OffloadKind::Compute => self.compute.submit(wrapped),
            OffloadKind::Blocking => self.blocking.submit(wrapped),
        }
    }

    /// Number of submitted closures that have not finished.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSet")
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn pool_runs_submitted_work() {
        let budget = Arc::new(ThreadBudget::new(4));
        let pool = WorkerPool::new("test", 2, budget);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 16 {
            assert!(std::time::Instant::now() < deadline, "pool stalled");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(pool.active_threads() <= 2);
    }

    #[test]
    fn pool_survives_panicking_work() {
        let budget = Arc::new(ThreadBudget::new(2));
        let pool = WorkerPool::new("test", 1, budget);
        pool.submit(Box::new(|| panic!("ouch")));

        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        pool.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "pool stalled");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn budget_bounds_total_threads() {
        let budget = Arc::new(ThreadBudget::new(1));
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
        budget.release();
        assert!(budget.try_acquire());
        assert_eq!(budget.used(), 1);
    }

    #[test]
    fn worker_set_tracks_outstanding() {
        let injector = Arc::new(Injector::new());
        let set = WorkerSet::new(1, 1, 2, injector);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();

        let blocked = Arc::clone(&gate);
        set.submit(OffloadKind::Blocking, move || {
            let _ = blocked.lock();
        });
        assert_eq!(set.outstanding(), 1);
        drop(held);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while set.outstanding() > 0 {
            assert!(std::time::Instant::now() < deadline, "offload stalled");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
