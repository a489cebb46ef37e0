//! Resumption handles.
//!
//! A [`Continuation`] is the handle a suspension point leaves behind: the
//! event source that will eventually produce the result holds one end, the
//! suspended frame holds the other. Resumption delivers exactly one tagged
//! `Result` — success and failure share the channel — and wakes the owning
//! task so the scheduler re-enters the frame.
//!
//! Resuming a continuation that has already been resumed is a protocol
//! violation and panics. A continuation that is *disarmed* (its frame gave
//! up, typically through cancellation or drop) swallows a late resume
//! silently; a timer firing after its sleeper was cancelled is normal, not a
//! bug.
//!
//! Event sources that must not lose values (channels) call [`resume`] while
//! holding their own queue lock, so a waiter is either still queued or
//! guaranteed to observe the delivered result — never neither.
//!
//! [`resume`]: Continuation::resume

use crate::error::Error;
use crate::types::TaskId;
use core::fmt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::task::Waker;

enum Slot<T> {
    /// Waiting for the event source; holds the waker to fire on resume.
    Waiting(Waker),
    /// Resumed; the result is waiting to be claimed by the frame.
    Resumed(Result<T, Error>),
    /// The frame claimed the result.
    Claimed,
    /// The frame gave up; a late resume is dropped.
    Disarmed,
}

struct Inner<T> {
    owner: TaskId,
    slot: Mutex<Slot<T>>,
}

/// A resume-at-most-once handle linking a suspended frame to the event
/// source that will complete it.
pub struct Continuation<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Continuation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Continuation<T> {
    /// Creates a continuation owned by `owner`, waking `waker` on resume.
    #[must_use]
    pub fn new(owner: TaskId, waker: Waker) -> Self {
        Self {
            inner: Arc::new(Inner {
                owner,
                slot: Mutex::new(Slot::Waiting(waker)),
            }),
        }
    }

    /// The task that registered this continuation.
    #[must_use]
    pub fn owner(&self) -> TaskId {
        self.inner.owner
    }

    /// Delivers the result and wakes the owner.
    ///
    /// Ignored if the frame disarmed itself first.
    ///
    /// # Panics
    ///
    /// Panics if the continuation was already resumed — that is a protocol
    /// violation, never a recoverable condition.
    pub fn resume(&self, result: Result<T, Error>) {
        let waker = {
            let mut slot = self.inner.slot.lock();
            match &*slot {
                Slot::Waiting(_) => {
                    let previous = std::mem::replace(&mut *slot, Slot::Resumed(result));
                    match previous {
                        Slot::Waiting(waker) => waker,
                        _ => unreachable!(),
                    }
                }
                Slot::Disarmed => return,
                Slot::Resumed(_) | Slot::Claimed => {
                    panic!(
                        "continuation for {} resumed twice (protocol violation)",
                        self.inner.owner
                    );
                }
            }
        };
        waker.wake();
    }

    /// Takes the delivered result, if any.
    pub fn try_claim(&self) -> Option<Result<T, Error>> {
        let mut slot = self.inner.slot.lock();
        if matches!(&*slot, Slot::Resumed(_)) {
            match std::mem::replace(&mut *slot, Slot::Claimed) {
                Slot::Resumed(result) => Some(result),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    /// Refreshes the waker after a re-poll, if still waiting.
    pub fn set_waker(&self, waker: &Waker) {
        let mut slot = self.inner.slot.lock();
        if let Slot::Waiting(current) = &mut *slot {
            if !current.will_wake(waker) {
                *current = waker.clone();
            }
        }
    }

    /// Abandons the wait. Returns `true` if the continuation was still
    /// pending; `false` means a result was already delivered and should be
    /// claimed instead of discarded.
    pub fn disarm(&self) -> bool {
        let mut slot = self.inner.slot.lock();
        match &*slot {
            Slot::Waiting(_) => {
                *slot = Slot::Disarmed;
                true
            }
            Slot::Disarmed => true,
            Slot::Resumed(_) | Slot::Claimed => false,
        }
    }

    /// True once a result has been delivered (claimed or not).
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        matches!(&*self.inner.slot.lock(), Slot::Resumed(_) | Slot::Claimed)
    }

    /// True while the frame is still waiting for a resume.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(&*self.inner.slot.lock(), Slot::Waiting(_))
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.slot.lock() {
            Slot::Waiting(_) => "waiting",
            Slot::Resumed(_) => "resumed",
            Slot::Claimed => "claimed",
            Slot::Disarmed => "disarmed",
        };
        f.debug_struct("Continuation")
            .field("owner", &self.inner.owner)
            .field("state", &state)
            .finish()
    }
}
