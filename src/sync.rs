//! Single-owner exclusive cell.
//!
//! [`Exclusive`] funnels mutation of a shared value through one owner at a
//! time: acquisition suspends, waiters queue FIFO, and release hands the
//! cell directly to the next waiter. The lock is never held across a
//! suspension point by the runtime itself; guard lifetime is the caller's
//! responsibility.
//!
//! Re-acquiring the cell from the task that already owns it would deadlock
//! silently; it is treated as a protocol violation and panics instead.

use crate::cont::Continuation;
use crate::cx::Cx;
use crate::error::Error;
use crate::types::TaskId;
use core::fmt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

struct ExWaiter {
    id: u64,
    cont: Continuation<()>,
}

struct OwnerState {
    holder: Option<TaskId>,
    waiters: VecDeque<ExWaiter>,
    next_id: u64,
}

struct ExCore<T> {
    owner: Mutex<OwnerState>,
    value: Mutex<T>,
}

/// Releases the cell: hands ownership to the next queued waiter, or clears
/// the holder. Resumes under the owner lock.
fn release<T>(core: &ExCore<T>) {
    let mut owner = core.owner.lock();
    match owner.waiters.pop_front() {
        Some(waiter) => {
            owner.holder = Some(waiter.cont.owner());
            waiter.cont.resume(Ok(()));
        }
        None => owner.holder = None,
    }
}

/// An async single-owner cell protecting a value of type `T`.
///
/// Cloning shares the same cell.
pub struct Exclusive<T> {
    core: Arc<ExCore<T>>,
}

impl<T> Clone for Exclusive<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> Exclusive<T> {
    /// Wraps `value` in a new cell.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            core: Arc::new(ExCore {
                owner: Mutex::new(OwnerState {
                    holder: None,
                    waiters: VecDeque::new(),
                    next_id: 0,
                }),
                value: Mutex::new(value),
            }),
        }
    }

    /// Acquires the cell, suspending while another task owns it.
    ///
    /// # Panics
    ///
    /// Panics if the calling task already owns the cell — double
    /// acquisition is a protocol violation, not a wait.
    pub fn lock(&self, cx: &Cx) -> LockFuture<T> {
        LockFuture {
            core: Arc::clone(&self.core),
            cx: cx.clone(),
            state: LockState::Init,
        }
    }

    /// Acquires the cell only if it is free.
    ///
    /// # Panics
    ///
    /// Panics if the calling task already owns the cell.
    pub fn try_lock(&self, cx: &Cx) -> Option<ExclusiveGuard<T>> {
        let me = cx.task_id();
        let mut owner = self.core.owner.lock();
        match owner.holder {
            None => {
                owner.holder = Some(me);
                Some(ExclusiveGuard {
                    core: Arc::clone(&self.core),
                })
            }
            Some(holder) if holder == me => {
                panic!("exclusive cell re-entered by its owner {me} (protocol violation)")
            }
            Some(_) => None,
        }
    }
}

impl<T> fmt::Debug for Exclusive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = self.core.owner.lock();
        f.debug_struct("Exclusive")
            .field("holder", &owner.holder)
            .field("waiters", &owner.waiters.len())
            .finish()
    }
}

/// Ownership of an [`Exclusive`] cell; released on drop.
pub struct ExclusiveGuard<T> {
    core: Arc<ExCore<T>>,
}

impl<T> ExclusiveGuard<T> {
    /// Accesses the protected value.
    ///
    /// The inner lock is uncontended while the guard is held; this is the
    /// only access path, so holding it across a suspension point is
    /// impossible by construction.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut value = self.core.value.lock();
        f(&mut value)
    }
}

impl<T> Drop for ExclusiveGuard<T> {
    fn drop(&mut self) {
        release(&self.core);
    }
}

impl<T> fmt::Debug for ExclusiveGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveGuard").finish()
    }
}

enum LockState {
    Init,
    Waiting { id: u64, cont: Continuation<()> },
    Done,
}

/// Suspension frame for acquiring an [`Exclusive`] cell.
pub struct LockFuture<T> {
    core: Arc<ExCore<T>>,
    cx: Cx,
    state: LockState,
}

impl<T> Future for LockFuture<T> {
    type Output = Result<ExclusiveGuard<T>, Error>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            LockState::Init => {
                if let Err(err) = this.cx.checkpoint() {
                    this.state = LockState::Done;
                    return Poll::Ready(Err(err));
                }
                let me = this.cx.task_id();
                let mut owner = this.core.owner.lock();
                match owner.holder {
                    None => {
                        owner.holder = Some(me);
                        drop(owner);
                        this.state = LockState::Done;
                        Poll::Ready(Ok(ExclusiveGuard {
                            core: Arc::clone(&this.core),
                        }))
                    }
                    Some(holder) if holder == me => {
                        panic!(
                            "exclusive cell re-entered by its owner {me} (protocol violation)"
                        )
                    }
                    Some(_) => {
                        let id = owner.next_id;
                        owner.next_id += 1;
                        let cont = Continuation::new(me, task_cx.waker().clone());
                        owner.waiters.push_back(ExWaiter {
                            id,
                            cont: cont.clone(),
                        });
                        drop(owner);
                        this.state = LockState::Waiting { id, cont };
                        Poll::Pending
                    }
                }
            }
            LockState::Waiting { id, cont } => {
                if let Some(result) = cont.try_claim() {
                    this.state = LockState::Done;
                    return Poll::Ready(result.map(|()| ExclusiveGuard {
                        core: Arc::clone(&this.core),
                    }));
                }
                match this.cx.checkpoint() {
                    Ok(()) => {
                        cont.set_waker(task_cx.waker());
                        Poll::Pending
                    }
                    Err(err) => {
                        let withdrawn = {
                            let mut owner = this.core.owner.lock();
                            match owner.waiters.iter().position(|w| w.id == *id) {
                                Some(position) => {
                                    owner.waiters.remove(position);
                                    true
                                }
                                None => false,
                            }
                        };
                        let outcome = if withdrawn {
                            Err(err)
                        } else {
                            // Ownership was handed over under the lock;
                            // take the guard even though we are cancelling.
                            cont.try_claim()
                                .expect("dequeued waiter must have been resumed")
                                .map(|()| ExclusiveGuard {
                                    core: Arc::clone(&this.core),
                                })
                        };
                        this.state = LockState::Done;
                        Poll::Ready(outcome)
                    }
                }
            }
            LockState::Done => panic!("LockFuture polled after completion"),
        }
    }
}

impl<T> Drop for LockFuture<T> {
    fn drop(&mut self) {
        if let LockState::Waiting { id, cont } = &self.state {
            let withdrawn = {
                let mut owner = self.core.owner.lock();
                match owner.waiters.iter().position(|w| w.id == *id) {
                    Some(position) => {
                        owner.waiters.remove(position);
                        true
                    }
                    None => false,
                }
            };
            if !withdrawn {
                // Ownership arrived for a future that is going away;
                // release it onward.
                if cont.try_claim().is_some() {
                    release(&self.core);
                }
            }
        }
    }
}

impl<T> fmt::Debug for LockFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            LockState::Init => "init",
            LockState::Waiting { .. } => "waiting",
            LockState::Done => "done",
        };
        f.debug_struct("LockFuture").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_excludes_and_releases() {
        let cell = Exclusive::new(0u32);
        let cx_a = Cx::for_testing();
        let cx_b = Cx::for_testing();

        let guard = cell.try_lock(&cx_a).expect("cell was free");
        guard.with(|v| *v += 1);
        assert!(cell.try_lock(&cx_b).is_none());

        drop(guard);
        let guard = cell.try_lock(&cx_b).expect("released cell is free");
        guard.with(|v| assert_eq!(*v, 1));
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn reentry_panics() {
        let cell = Exclusive::new(());
        let cx = Cx::for_testing();
        let _guard = cell.try_lock(&cx).expect("cell was free");
        let _ = cell.try_lock(&cx);
    }
}
