//! The capability context.
//!
//! `Cx` is the explicit token a task uses to reach the runtime: identity,
//! cancellation checks, launching children, and offloading synchronous work.
//! There is no ambient current-task state — every operation that needs the
//! runtime takes a `Cx` (or was built from one), so effects stay traceable
//! and testable.
//!
//! Cancellation is cooperative: a task observes a pending request at a
//! suspension point or at an explicit [`checkpoint`]. CPU-bound loops that
//! never suspend must call [`checkpoint`] periodically; code that does
//! neither cannot be cancelled mid-flight.
//!
//! [`checkpoint`]: Cx::checkpoint

use crate::cont::Continuation;
use crate::error::Error;
use crate::record::CancelSignal;
use crate::runtime::{OffloadKind, Shared};
use crate::scope::{SpawnOptions, TaskHandle};
use crate::types::{ContextMap, ExecContext, PanicPayload, ScopeId, TaskId};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

/// Capability context handed to every task body.
///
/// Cheap to clone; clones share the same cancellation signal.
#[derive(Clone)]
pub struct Cx {
    shared: Weak<Shared>,
    task: TaskId,
    scope: ScopeId,
    signal: Arc<CancelSignal>,
    context: ContextMap,
    exec: ExecContext,
}

impl Cx {
    pub(crate) fn new(
        shared: Weak<Shared>,
        task: TaskId,
        scope: ScopeId,
        signal: Arc<CancelSignal>,
        context: ContextMap,
        exec: ExecContext,
    ) -> Self {
        Self {
            shared,
            task,
            scope,
            signal,
            context,
            exec,
        }
    }

    /// A detached context for unit tests that never touch the driver.
    /// Each call gets a distinct task id.
    #[doc(hidden)]
    #[must_use]
    pub fn for_testing() -> Self {
        static NEXT: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);
        let task = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self {
            shared: Weak::new(),
            task: TaskId::new_for_test(task, u32::MAX),
            scope: ScopeId::from_arena(crate::util::ArenaIndex::new(0, 0)),
            signal: Arc::new(CancelSignal::new()),
            context: ContextMap::new(),
            exec: ExecContext::Default,
        }
    }

    /// This task's id.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// The owning scope's id.
    #[must_use]
    pub fn scope_id(&self) -> ScopeId {
        self.scope
    }

    /// The execution context this task runs on.
    #[must_use]
    pub fn exec(&self) -> ExecContext {
        self.exec
    }

    /// The task's context data.
    #[must_use]
    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    /// The current runtime instant.
    ///
    /// # Panics
    ///
    /// Panics if the runtime has been dropped.
    #[must_use]
    pub fn now(&self) -> crate::types::Time {
        self.shared_rt().clock.now()
    }

    /// True if cancellation has been requested, masked or not.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.signal.requested().is_some()
    }

    /// True if the task may keep running (no unmasked cancellation pending).
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.signal.check().is_none()
    }

    /// Explicit liveness check: the cooperative cancellation point for code
    /// that does not otherwise suspend.
    ///
    /// # Errors
    ///
    /// Returns a cancellation error once a request is pending and unmasked.
    pub fn checkpoint(&self) -> Result<(), Error> {
        match self.signal.check() {
            Some(reason) => Err(Error::cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Enters an uncancellable section; the mask lifts when the guard drops.
    ///
    /// While masked, checkpoints and suspension points behave as if the task
    /// were live, letting cleanup run to completion.
    #[must_use]
    pub fn mask(&self) -> MaskGuard {
        self.signal.mask_enter();
        MaskGuard {
            signal: Arc::clone(&self.signal),
        }
    }

    /// Runs a suspending finalizer under the cancellation mask.
    ///
    /// For cleanup that must itself suspend (releasing a remote lock,
    /// flushing a buffer) after the task has begun cancelling.
    pub async fn shielded<F: Future>(&self, fut: F) -> F::Output {
        let _guard = self.mask();
        fut.await
    }

    /// Launches a child task with default options.
    ///
    /// # Panics
    ///
    /// Panics if this task is no longer active (protocol violation) or the
    /// runtime has been dropped.
    pub fn launch<T, F, Fut>(&self, body: F) -> TaskHandle<T>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        self.launch_with(SpawnOptions::new(), body)
    }

    /// Launches a child task with explicit options.
    ///
    /// # Panics
    ///
    /// Panics if this task is no longer active (protocol violation) or the
    /// runtime has been dropped.
    pub fn launch_with<T, F, Fut>(&self, options: SpawnOptions, body: F) -> TaskHandle<T>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        crate::scope::spawn_task(
            &self.shared_rt(),
            self.task,
            self.exec,
            &self.context,
            options,
            body,
        )
    }

    /// Runs a synchronous closure on the blocking pool, suspending this task
    /// until it finishes.
    pub fn run_blocking<T, F>(&self, work: F) -> Offload<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Offload::new(self.clone(), OffloadKind::Blocking, work)
    }

    /// Runs a CPU-shaped closure on the compute pool, suspending this task
    /// until it finishes.
    pub fn run_compute<T, F>(&self, work: F) -> Offload<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Offload::new(self.clone(), OffloadKind::Compute, work)
    }

    pub(crate) fn shared_rt(&self) -> Arc<Shared> {
        self.shared
            .upgrade()
            .expect("runtime was dropped while a task context was still in use")
    }

    pub(crate) fn signal(&self) -> &Arc<CancelSignal> {
        &self.signal
    }
}

impl std::fmt::Debug for Cx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cx")
            .field("task", &self.task)
            .field("scope", &self.scope)
            .field("exec", &self.exec)
            .finish_non_exhaustive()
    }
}

/// RAII guard for an uncancellable section. Dropping it lifts the mask.
pub struct MaskGuard {
    signal: Arc<CancelSignal>,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        self.signal.mask_exit();
    }
}

impl std::fmt::Debug for MaskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskGuard").finish()
    }
}

enum OffloadState<T> {
    Start(Option<Box<dyn FnOnce() -> T + Send>>),
    Waiting(Continuation<T>),
    Done,
}

/// Suspension frame for a closure offloaded to a worker pool.
///
/// Cancellation while waiting is soft: the closure runs to completion on its
/// worker, but the result is discarded if the waiter already gave up. A
/// result that arrives before cancellation is observed is still delivered.
pub struct Offload<T> {
    cx: Cx,
    kind: OffloadKind,
    state: OffloadState<T>,
}

impl<T: Send + 'static> Offload<T> {
    fn new<F>(cx: Cx, kind: OffloadKind, work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            cx,
            kind,
            state: OffloadState::Start(Some(Box::new(work))),
        }
    }
}

impl<T: Send + 'static> Future for Offload<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            OffloadState::Start(work) => {
                if let Err(err) = this.cx.checkpoint() {
                    this.state = OffloadState::Done;
                    return Poll::Ready(Err(err));
                }
                let work = work.take().expect("offload work already taken");
                let cont = Continuation::new(this.cx.task_id(), task_cx.waker().clone());
                let remote = cont.clone();
                this.cx.shared_rt().workers.submit(this.kind, move || {
                    match catch_unwind(AssertUnwindSafe(work)) {
                        Ok(value) => remote.resume(Ok(value)),
                        Err(payload) => {
                            let message = payload
                                .downcast_ref::<&str>()
                                .map(|m| (*m).to_owned())
                                .or_else(|| payload.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "offloaded closure panicked".to_owned());
                            remote.resume(Err(Error::panicked(&PanicPayload::new(message))));
                        }
                    }
                });
                this.state = OffloadState::Waiting(cont);
                Poll::Pending
            }
            OffloadState::Waiting(cont) => {
                if let Some(result) = cont.try_claim() {
                    this.state = OffloadState::Done;
                    return Poll::Ready(result);
                }
                match this.cx.checkpoint() {
                    Ok(()) => {
                        cont.set_waker(task_cx.waker());
                        Poll::Pending
                    }
                    Err(err) => {
                        if cont.disarm() {
                            this.state = OffloadState::Done;
                            return Poll::Ready(Err(err));
                        }
                        // The result landed between the claim and the
                        // checkpoint; deliver it.
                        let result = cont
                            .try_claim()
                            .expect("resumed offload must hold a result");
                        this.state = OffloadState::Done;
                        Poll::Ready(result)
                    }
                }
            }
            OffloadState::Done => panic!("Offload polled after completion"),
        }
    }
}

impl<T> std::fmt::Debug for Offload<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            OffloadState::Start(_) => "start",
            OffloadState::Waiting(_) => "waiting",
            OffloadState::Done => "done",
        };
        f.debug_struct("Offload")
            .field("kind", &self.kind)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CancelReason;

    #[test]
    fn checkpoint_reflects_signal() {
        let cx = Cx::for_testing();
        assert!(cx.checkpoint().is_ok());
        assert!(cx.is_live());

        cx.signal().request(&CancelReason::timeout());
        assert!(cx.is_cancel_requested());
        let err = cx.checkpoint().unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn mask_suppresses_checkpoint_until_dropped() {
        let cx = Cx::for_testing();
        cx.signal().request(&CancelReason::timeout());

        let guard = cx.mask();
        assert!(cx.checkpoint().is_ok());
        assert!(cx.is_live());
        assert!(cx.is_cancel_requested());

        drop(guard);
        assert!(cx.checkpoint().is_err());
    }

    #[test]
    fn nested_masks_unwind_in_order() {
        let cx = Cx::for_testing();
        cx.signal().request(&CancelReason::timeout());

        let outer = cx.mask();
        let inner = cx.mask();
        drop(inner);
        assert!(cx.checkpoint().is_ok());
        drop(outer);
        assert!(cx.checkpoint().is_err());
    }
}
