//! Cross-thread wake plumbing.
//!
//! Wakes from any thread (timer expiry handled by the driver, worker-pool
//! completions, continuation resumes) funnel through the [`Injector`]: a
//! lock-free queue of task ids plus a parker so an idle driver is unparked.
//! The driver drains the queue into the scheduler at the top of each step.

use crate::types::TaskId;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::task::{Wake, Waker};
use std::time::Duration;

/// Wake queue shared by every waker the runtime hands out.
pub(crate) struct Injector {
    queue: SegQueue<TaskId>,
    parker: Parker,
}

impl Injector {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            parker: Parker::new(),
        }
    }

    /// Enqueues a wake and unparks the driver.
    pub(crate) fn push(&self, task: TaskId) {
        self.queue.push(task);
        self.parker.unpark();
    }

    pub(crate) fn pop(&self) -> Option<TaskId> {
        self.queue.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Parks the driver until a wake arrives or `timeout` elapses.
    pub(crate) fn park(&self, timeout: Option<Duration>) {
        self.parker.park(timeout);
    }

    pub(crate) fn unpark(&self) {
        self.parker.unpark();
    }

    /// Builds a waker that enqueues `task` on wake.
    pub(crate) fn waker_for(self: &Arc<Self>, task: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            injector: Arc::clone(self),
            task,
        }))
    }
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("pending", &self.queue.len())
            .finish()
    }
}

struct TaskWaker {
    injector: Arc<Injector>,
    task: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.injector.push(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.injector.push(self.task);
    }
}

/// One-permit parker: an unpark before park makes the next park return
/// immediately, so wakes between the idle check and the park are not lost.
struct Parker {
    notified: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    fn park(&self, timeout: Option<Duration>) {
        let mut notified = self.notified.lock();
        if !*notified {
            match timeout {
                Some(duration) => {
                    let _ = self.cvar.wait_for(&mut notified, duration);
                }
                None => self.cvar.wait(&mut notified),
            }
        }
        *notified = false;
    }

    fn unpark(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cvar.notify_one();
    }
}
