//! Sleep and timeout.
//!
//! A sleeping task holds no worker: the sleep frame parks a continuation in
//! the timer registry and yields. Timeouts are built from the same
//! primitive as a race — the inner future against an elapsed deadline, the
//! loser dropped at the decision point.

use crate::cont::Continuation;
use crate::cx::Cx;
use crate::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error as ThisError;

/// A deadline expired.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
#[error("deadline elapsed after {duration:?}")]
pub struct Elapsed {
    /// The duration that was allowed.
    pub duration: Duration,
}

impl From<Elapsed> for Error {
    fn from(_: Elapsed) -> Self {
        Error::deadline_exceeded()
    }
}

/// Suspends the calling task for `duration`.
///
/// Resolves `Ok(())` after the delay, or the cancellation error if the task
/// is cancelled first.
pub fn sleep(cx: &Cx, duration: Duration) -> Sleep {
    Sleep {
        cx: cx.clone(),
        duration,
        state: SleepState::Init,
    }
}

enum SleepState {
    Init,
    Waiting(Continuation<()>),
    Done,
}

/// Suspension frame for a timer delay.
pub struct Sleep {
    cx: Cx,
    duration: Duration,
    state: SleepState,
}

impl Future for Sleep {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            SleepState::Init => {
                if let Err(err) = this.cx.checkpoint() {
                    this.state = SleepState::Done;
                    return Poll::Ready(Err(err));
                }
                let shared = this.cx.shared_rt();
                let deadline = shared.clock.now() + this.duration;
                let cont = Continuation::new(this.cx.task_id(), task_cx.waker().clone());
                shared.timers.lock().insert(deadline, cont.clone());
                // The driver may be parked against an older deadline.
                shared.injector.unpark();
                this.state = SleepState::Waiting(cont);
                Poll::Pending
            }
            SleepState::Waiting(cont) => {
                if let Some(result) = cont.try_claim() {
                    this.state = SleepState::Done;
                    return Poll::Ready(result);
                }
                match this.cx.checkpoint() {
                    Ok(()) => {
                        cont.set_waker(task_cx.waker());
                        Poll::Pending
                    }
                    Err(err) => {
                        if cont.disarm() {
                            this.state = SleepState::Done;
                            return Poll::Ready(Err(err));
                        }
                        let result = cont
                            .try_claim()
                            .expect("resumed timer must hold a result");
                        this.state = SleepState::Done;
                        Poll::Ready(result)
                    }
                }
            }
            SleepState::Done => panic!("Sleep polled after completion"),
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let SleepState::Waiting(cont) = &self.state {
            // The registry prunes disarmed entries lazily.
            cont.disarm();
        }
    }
}

impl std::fmt::Debug for Sleep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            SleepState::Init => "init",
            SleepState::Waiting(_) => "waiting",
            SleepState::Done => "done",
        };
        f.debug_struct("Sleep")
            .field("duration", &self.duration)
            .field("state", &state)
            .finish()
    }
}

/// Runs `fut` under a deadline.
///
/// The future races an elapsed-deadline cancellation; whichever loses is
/// dropped at the decision point.
///
/// # Errors
///
/// [`Error`] with kind `DeadlineExceeded` on expiry, or the caller's own
/// cancellation while waiting.
pub fn timeout<F: Future>(cx: &Cx, duration: Duration, fut: F) -> Timeout<F> {
    Timeout {
        sleep: sleep(cx, duration),
        duration,
        inner: Box::pin(fut),
    }
}

/// A future racing its inner computation against a deadline.
pub struct Timeout<F> {
    sleep: Sleep,
    duration: Duration,
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Error>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // Completion wins ties against the deadline.
        if let Poll::Ready(output) = this.inner.as_mut().poll(task_cx) {
            return Poll::Ready(Ok(output));
        }
        match Pin::new(&mut this.sleep).poll(task_cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Err(Elapsed {
                duration: this.duration,
            }
            .into())),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<F> std::fmt::Debug for Timeout<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

/// Reschedules the calling task, letting peers on its context run.
///
/// A suspension point: observes cancellation like any other.
pub fn yield_now(cx: &Cx) -> YieldNow {
    YieldNow {
        cx: cx.clone(),
        yielded: false,
    }
}

/// Suspension frame for a cooperative reschedule.
#[derive(Debug)]
pub struct YieldNow {
    cx: Cx,
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Err(err) = this.cx.checkpoint() {
            return Poll::Ready(Err(err));
        }
        if this.yielded {
            Poll::Ready(Ok(()))
        } else {
            this.yielded = true;
            task_cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use crate::types::Time;

    fn rt() -> Runtime {
        Runtime::with_config(RuntimeConfig::virtual_time())
    }

    #[test]
    fn sleep_advances_virtual_time() {
        let rt = rt();
        rt.block_on(|cx| async move {
            sleep(&cx, Duration::from_millis(250)).await?;
            Ok(())
        })
        .unwrap();
        assert_eq!(rt.now(), Time::from_millis(250));
    }

    #[test]
    fn sequential_sleeps_accumulate() {
        let rt = rt();
        rt.block_on(|cx| async move {
            sleep(&cx, Duration::from_millis(100)).await?;
            sleep(&cx, Duration::from_millis(100)).await?;
            Ok(())
        })
        .unwrap();
        assert_eq!(rt.now(), Time::from_millis(200));
    }

    #[test]
    fn timeout_expires_before_slow_future() {
        let rt = rt();
        let outcome = rt.block_on(|cx| async move {
            let slow = sleep(&cx, Duration::from_secs(60));
            match timeout(&cx, Duration::from_millis(50), slow).await {
                Err(err) => {
                    assert_eq!(err.kind(), crate::error::ErrorKind::DeadlineExceeded);
                    Ok(())
                }
                Ok(_) => Err(Error::user("slow future beat the deadline")),
            }
        });
        assert!(outcome.is_ok());
        assert_eq!(rt.now(), Time::from_millis(50));
    }

    #[test]
    fn timeout_passes_through_fast_future() {
        let rt = rt();
        let value = rt
            .block_on(|cx| async move {
                let fast = async { 7u32 };
                timeout(&cx, Duration::from_secs(1), fast).await
            })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn yield_now_returns() {
        let rt = rt();
        rt.block_on(|cx| async move { yield_now(&cx).await })
            .unwrap();
    }
}
