//! Type-erased storage for task bodies.

use crate::error::Error;
use crate::types::{Outcome, PanicPayload};
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

/// A pinned, boxed task body.
///
/// The body's typed result is routed to its handle before the body returns;
/// what the driver sees is only the unit-shaped outcome. Panics are caught
/// at this boundary and converted to [`Outcome::Panicked`] so one misbehaving
/// task cannot take down the driver.
pub(crate) struct StoredTask {
    future: Pin<Box<dyn Future<Output = Outcome<(), Error>> + Send>>,
    polls: u64,
}

impl StoredTask {
    pub(crate) fn new<F>(future: F) -> Self
    where
        F: Future<Output = Outcome<(), Error>> + Send + 'static,
    {
        Self {
            future: Box::pin(future),
            polls: 0,
        }
    }

    /// Polls the body, capturing panics.
    pub(crate) fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Outcome<(), Error>> {
        self.polls += 1;
        match catch_unwind(AssertUnwindSafe(|| self.future.as_mut().poll(cx))) {
            Ok(poll) => poll,
            Err(payload) => Poll::Ready(Outcome::Panicked(PanicPayload::new(panic_message(
                payload.as_ref(),
            )))),
        }
    }

    /// Number of times this body has been polled.
    pub(crate) fn polls(&self) -> u64 {
        self.polls
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_owned()
    }
}

impl std::fmt::Debug for StoredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredTask")
            .field("polls", &self.polls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::task::{Wake, Waker};

    struct NoopWaker;

    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
    }

    fn poll_cx(waker: &Waker) -> Context<'_> {
        Context::from_waker(waker)
    }

    #[test]
    fn completes_immediately_for_ready_bodies() {
        let mut task = StoredTask::new(async { Outcome::Ok(()) });
        let waker = Waker::from(Arc::new(NoopWaker));
        match task.poll(&mut poll_cx(&waker)) {
            Poll::Ready(outcome) => assert!(outcome.is_ok()),
            Poll::Pending => panic!("ready body reported pending"),
        }
        assert_eq!(task.polls(), 1);
    }

    #[test]
    fn panic_is_captured_as_outcome() {
        let mut task = StoredTask::new(async { panic!("kaboom") });
        let waker = Waker::from(Arc::new(NoopWaker));
        match task.poll(&mut poll_cx(&waker)) {
            Poll::Ready(Outcome::Panicked(payload)) => {
                assert!(payload.message().contains("kaboom"));
            }
            other => panic!("expected Panicked, got {other:?}"),
        }
    }
}
