//! Scopes and task handles: the public face of the task tree.
//!
//! A [`Scope`] owns a root container task; everything launched through it
//! (directly or via a child's [`Cx`]) is a descendant of that root, so no
//! task outlives its scope. Closing a scope cancels whatever is still
//! running and waits for the subtree to drain.

use crate::cx::Cx;
use crate::error::Error;
use crate::record::Completion;
use crate::runtime::{Effects, Shared, StoredTask};
use crate::types::{CancelReason, ContextMap, ExecContext, Outcome, ScopeId, TaskId};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

/// Options for launching a task.
#[derive(Debug, Default, Clone)]
pub struct SpawnOptions {
    name: Option<String>,
    exec: Option<ExecContext>,
    supervisor: bool,
    context: ContextMap,
}

impl SpawnOptions {
    /// Default options: inherit the parent's execution context, no name,
    /// linked (non-supervising) failure handling.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the task for logs and diagnostics.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pins the task to an execution context instead of inheriting.
    #[must_use]
    pub fn on(mut self, exec: ExecContext) -> Self {
        self.exec = Some(exec);
        self
    }

    /// Makes the task a supervising parent: its children's failures are
    /// isolated instead of cancelling their siblings and this task.
    #[must_use]
    pub fn supervisor(mut self) -> Self {
        self.supervisor = true;
        self
    }

    /// Adds context overrides for the task (merged over the parent's).
    #[must_use]
    pub fn context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }
}

/// Options for opening a scope.
#[derive(Debug, Default, Clone)]
pub struct ScopeConfig {
    /// Name for logs and diagnostics.
    pub name: Option<String>,
    /// A supervised scope isolates each child's failure to that child.
    pub supervised: bool,
    /// Context data inherited by every task in the scope.
    pub context: ContextMap,
}

impl ScopeConfig {
    /// A supervised scope.
    #[must_use]
    pub fn supervisor() -> Self {
        Self {
            supervised: true,
            ..Self::default()
        }
    }
}

/// A lexical owner of tasks.
///
/// Dropping a scope requests close: remaining children are cancelled the
/// next time the driver runs. Call [`close`](Scope::close) (and drive the
/// runtime) for a deterministic shutdown point.
pub struct Scope {
    shared: Weak<Shared>,
    id: ScopeId,
    root: TaskId,
    completion: Arc<Completion>,
    context: ContextMap,
}

impl Scope {
    pub(crate) fn open(shared: &Arc<Shared>, config: ScopeConfig) -> Self {
        let name: Option<Arc<str>> = config.name.map(Into::into);
        let (id, root) = shared.state.lock().create_scope(
            config.supervised,
            name,
            config.context.clone(),
        );
        let completion = shared
            .state
            .lock()
            .tasks
            .get(root.arena_index())
            .expect("root record just created")
            .completion
            .clone();
        Self {
            shared: Arc::downgrade(shared),
            id,
            root,
            completion,
            context: config.context,
        }
    }

    /// This scope's id.
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// The root task every launch in this scope attaches under.
    #[must_use]
    pub fn root_task(&self) -> TaskId {
        self.root
    }

    /// Launches a task in this scope with default options.
    ///
    /// # Panics
    ///
    /// Panics if the scope has already closed (protocol violation) or the
    /// runtime was dropped.
    pub fn launch<T, F, Fut>(&self, body: F) -> TaskHandle<T>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        self.launch_with(SpawnOptions::new(), body)
    }

    /// Launches a task in this scope with explicit options.
    ///
    /// # Panics
    ///
    /// Panics if the scope has already closed (protocol violation) or the
    /// runtime was dropped.
    pub fn launch_with<T, F, Fut>(&self, options: SpawnOptions, body: F) -> TaskHandle<T>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        let shared = self
            .shared
            .upgrade()
            .expect("runtime was dropped while its scope was still open");
        spawn_task(
            &shared,
            self.root,
            ExecContext::Default,
            &self.context,
            options,
            body,
        )
    }

    /// Cancels every task in the scope, root included.
    pub fn cancel(&self, reason: CancelReason) {
        if let Some(shared) = self.shared.upgrade() {
            let mut effects = Effects::default();
            shared
                .state
                .lock()
                .cancel_task(self.root, &reason, &mut effects);
            effects.apply(&shared);
        }
    }

    /// Closes the scope: cancels remaining children and lets the root
    /// complete once the subtree drains. Idempotent.
    pub fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut effects = Effects::default();
            shared.state.lock().close_scope(self.id, &mut effects);
            effects.apply(&shared);
        }
    }

    /// True once the root task is terminal.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.completion.is_done()
    }

    /// The root's terminal outcome, if the scope has closed.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome<(), Error>> {
        self.completion.summary()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to a launched task.
///
/// The handle observes the task; it does not own it. Dropping the handle
/// leaves the task running under its parent. The task's value is delivered
/// exactly once, through [`wait`](TaskHandle::wait) or
/// [`outcome_now`](TaskHandle::outcome_now).
pub struct TaskHandle<T> {
    id: TaskId,
    completion: Arc<Completion>,
    slot: Arc<Mutex<Option<T>>>,
    shared: Weak<Shared>,
}

impl<T> TaskHandle<T> {
    /// The task's id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True once the task is terminal.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.completion.is_done()
    }

    /// Requests cancellation of the task and its subtree. Idempotent.
    pub fn cancel(&self, reason: CancelReason) {
        if let Some(shared) = self.shared.upgrade() {
            let mut effects = Effects::default();
            shared
                .state
                .lock()
                .cancel_task(self.id, &reason, &mut effects);
            effects.apply(&shared);
        }
    }

    /// The terminal cause without the value; `None` while still running.
    #[must_use]
    pub fn outcome_summary(&self) -> Option<Outcome<(), Error>> {
        self.completion.summary()
    }

    /// Consumes the handle, returning the full outcome if the task is
    /// already terminal.
    #[must_use]
    pub fn outcome_now(self) -> Option<Outcome<T, Error>> {
        let summary = self.completion.summary()?;
        Some(match summary {
            Outcome::Ok(()) => {
                let value = self
                    .slot
                    .lock()
                    .take()
                    .expect("task value published before terminal transition");
                Outcome::Ok(value)
            }
            Outcome::Err(err) => Outcome::Err(err),
            Outcome::Cancelled(reason) => Outcome::Cancelled(reason),
            Outcome::Panicked(payload) => Outcome::Panicked(payload),
        })
    }

    /// Suspends until the task is terminal, re-raising its failure.
    ///
    /// Returns the task's value on success. A failed task's error, a
    /// cancelled task's cancellation, and a panicked task's payload are all
    /// re-raised here as errors. Delivery is exactly-once: the handle is
    /// consumed.
    ///
    /// # Errors
    ///
    /// The target's failure or cancellation, or this caller's own
    /// cancellation while waiting.
    pub async fn wait(self, cx: &Cx) -> Result<T, Error> {
        TerminalWait {
            completion: Arc::clone(&self.completion),
            cx: cx.clone(),
        }
        .await?;
        match self
            .outcome_now()
            .expect("terminal task must publish an outcome")
        {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(err) => Err(err),
            Outcome::Cancelled(reason) => Err(Error::cancelled(reason)),
            Outcome::Panicked(payload) => Err(Error::panicked(&payload)),
        }
    }

    /// Suspends until the task is terminal without raising its failure;
    /// the terminal cause is returned for inspection.
    ///
    /// # Errors
    ///
    /// Only this caller's own cancellation while waiting.
    pub async fn join(&self, cx: &Cx) -> Result<Outcome<(), Error>, Error> {
        TerminalWait {
            completion: Arc::clone(&self.completion),
            cx: cx.clone(),
        }
        .await?;
        Ok(self
            .completion
            .summary()
            .expect("terminal task must publish an outcome"))
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Suspension frame for awaiting a terminal transition.
struct TerminalWait {
    completion: Arc<Completion>,
    cx: Cx,
}

impl Future for TerminalWait {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Deliver a terminal result even to a cancelled waiter; the result
        // exists and must not be lost.
        if self.completion.is_done() {
            return Poll::Ready(Ok(()));
        }
        if let Err(err) = self.cx.checkpoint() {
            return Poll::Ready(Err(err));
        }
        self.completion.register(task_cx.waker());
        if self.completion.is_done() {
            return Poll::Ready(Ok(()));
        }
        Poll::Pending
    }
}

/// Attaches, wraps, installs, and schedules a new task under `parent`.
pub(crate) fn spawn_task<T, F, Fut>(
    shared: &Arc<Shared>,
    parent: TaskId,
    parent_exec: ExecContext,
    parent_context: &ContextMap,
    options: SpawnOptions,
    body: F,
) -> TaskHandle<T>
where
    F: FnOnce(Cx) -> Fut,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
    T: Send + 'static,
{
    let exec = options.exec.unwrap_or(parent_exec);
    let context = parent_context.merge(&options.context);
    let name: Option<Arc<str>> = options.name.map(Into::into);

    let (task, scope, signal, completion) = {
        let mut state = shared.state.lock();
        let task = state.attach_task(parent, exec, options.supervisor, name, context.clone());
        let record = state
            .tasks
            .get(task.arena_index())
            .expect("record just attached");
        (
            task,
            record.scope,
            record.signal.clone(),
            record.completion.clone(),
        )
    };

    let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let child_cx = Cx::new(
        Arc::downgrade(shared),
        task,
        scope,
        Arc::clone(&signal),
        context,
        exec,
    );
    // User code runs outside the state lock; it may launch further tasks.
    let fut = body(child_cx);
    let value_slot = Arc::clone(&slot);
    let wrapped = async move {
        match fut.await {
            Ok(value) => {
                *value_slot.lock() = Some(value);
                Outcome::Ok(())
            }
            Err(err) => match err.cancellation() {
                Some(reason) => Outcome::Cancelled(reason),
                None => Outcome::Err(err),
            },
        }
    };

    // A rejected body (cancellation won the race) is dropped here, after
    // the lock statement has released the state mutex.
    let rejected = shared
        .state
        .lock()
        .install_body(task, StoredTask::new(wrapped));
    if rejected.is_none() {
        let mut effects = Effects::default();
        effects.schedule.push((task, exec));
        effects.apply(shared);
    }
    drop(rejected);

    TaskHandle {
        id: task,
        completion,
        slot,
        shared: Arc::downgrade(shared),
    }
}
