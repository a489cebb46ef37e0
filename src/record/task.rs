//! Task record: the lifecycle state machine for one node of the task tree.

use crate::error::Error;
use crate::runtime::StoredTask;
use crate::types::{CancelReason, ContextMap, ExecContext, Outcome, ScopeId, TaskId};
use core::fmt;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::Waker;

/// The lifecycle state of a task.
///
/// ```text
/// New → Active → Completing → Completed
///         │           │
///         └───────────┴→ Cancelling → Cancelled
/// ```
///
/// States only move forward. `Completing` is the children gate: a task with
/// a finished body stays there until every tracked child is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet polled.
    New,
    /// Body is running (or suspended).
    Active,
    /// Body finished; waiting for children to reach terminal states.
    Completing,
    /// Cancellation requested; body and children are winding down.
    Cancelling(CancelReason),
    /// Terminal: completed normally.
    Completed,
    /// Terminal: stopped by cancellation or failure.
    Cancelled,
}

impl TaskState {
    /// True for `Completed` and `Cancelled`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// True while a cancellation request is being honoured.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        matches!(self, Self::Cancelling(_))
    }

    /// True if new children may attach.
    #[must_use]
    pub fn can_attach(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Active => write!(f, "active"),
            Self::Completing => write!(f, "completing"),
            Self::Cancelling(reason) => write!(f, "cancelling ({reason})"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Cancellation flag shared between a task's record and its `Cx`.
///
/// The mask counter implements uncancellable sections: while it is non-zero,
/// `check` reports the task as live even when cancellation is pending.
#[derive(Debug, Default)]
pub(crate) struct CancelSignal {
    reason: Mutex<Option<CancelReason>>,
    mask: AtomicU32,
}

impl CancelSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records (or strengthens) a cancellation request.
    pub(crate) fn request(&self, reason: &CancelReason) {
        let mut slot = self.reason.lock();
        match &mut *slot {
            Some(existing) => {
                existing.strengthen(reason);
            }
            None => *slot = Some(reason.clone()),
        }
    }

    /// The pending reason, unless masked.
    pub(crate) fn check(&self) -> Option<CancelReason> {
        if self.mask.load(Ordering::Acquire) > 0 {
            return None;
        }
        self.reason.lock().clone()
    }

    /// The pending reason, ignoring the mask.
    pub(crate) fn requested(&self) -> Option<CancelReason> {
        self.reason.lock().clone()
    }

    pub(crate) fn mask_enter(&self) {
        self.mask.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mask_exit(&self) {
        let previous = self.mask.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "cancellation mask underflow");
    }
}

/// Terminal-state notification shared with task handles.
///
/// `finish` runs exactly once; waiters registered before it are woken, and
/// registrations after it observe `done` immediately.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    done: AtomicBool,
    summary: Mutex<Option<Outcome<(), Error>>>,
    waiters: Mutex<Vec<Waker>>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn summary(&self) -> Option<Outcome<(), Error>> {
        self.summary.lock().clone()
    }

    /// Publishes the terminal outcome and wakes all waiters.
    pub(crate) fn finish(&self, outcome: Outcome<(), Error>) {
        {
            let mut summary = self.summary.lock();
            assert!(summary.is_none(), "task finished twice");
            *summary = Some(outcome);
        }
        self.done.store(true, Ordering::Release);
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waker in waiters {
            waker.wake();
        }
    }

    /// Registers a waker to fire at terminal transition.
    pub(crate) fn register(&self, waker: &Waker) {
        let mut waiters = self.waiters.lock();
        if !waiters.iter().any(|w| w.will_wake(waker)) {
            waiters.push(waker.clone());
        }
    }
}

/// Internal record for one task.
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub scope: ScopeId,
    /// Parent task; `None` only for scope roots.
    pub parent: Option<TaskId>,
    /// Child membership. The record tracks lifecycle only; child memory is
    /// owned by the arena.
    pub children: SmallVec<[TaskId; 4]>,
    pub state: TaskState,
    pub exec: ExecContext,
    /// A supervising parent isolates child failures: siblings and the parent
    /// are left untouched when a child fails.
    pub supervisor: bool,
    pub name: Option<Arc<str>>,
    pub context: ContextMap,
    pub signal: Arc<CancelSignal>,
    pub completion: Arc<Completion>,
    /// The stored body, absent for container tasks and after completion.
    pub body: Option<StoredTask>,
    /// True once the body returned (or will never run).
    pub body_done: bool,
    /// The body's outcome, parked until children are terminal.
    pub pending: Option<Outcome<(), Error>>,
    /// Failure escalated from a child; overrides the terminal outcome.
    pub failure: Option<Outcome<(), Error>>,
}

impl TaskRecord {
    /// Creates a record for a task with a body, in `New` state.
    pub(crate) fn new(
        id: TaskId,
        scope: ScopeId,
        parent: Option<TaskId>,
        exec: ExecContext,
        supervisor: bool,
        name: Option<Arc<str>>,
        context: ContextMap,
    ) -> Self {
        Self {
            id,
            scope,
            parent,
            children: SmallVec::new(),
            state: TaskState::New,
            exec,
            supervisor,
            name,
            context,
            signal: Arc::new(CancelSignal::new()),
            completion: Arc::new(Completion::new()),
            body: None,
            body_done: false,
            pending: None,
            failure: None,
        }
    }

    /// Creates a bodyless container record (a scope root), already `Active`.
    pub(crate) fn new_container(
        id: TaskId,
        scope: ScopeId,
        supervisor: bool,
        name: Option<Arc<str>>,
        context: ContextMap,
    ) -> Self {
        let mut record = Self::new(
            id,
            scope,
            None,
            ExecContext::Default,
            supervisor,
            name,
            context,
        );
        record.state = TaskState::Active;
        record.body_done = true;
        record
    }

    /// `New → Active`. Returns `true` if the transition happened.
    pub(crate) fn start(&mut self) -> bool {
        if self.state == TaskState::New {
            self.state = TaskState::Active;
            true
        } else {
            false
        }
    }

    /// Requests cancellation. Idempotent: a second request strengthens the
    /// reason and returns `false`.
    ///
    /// A `New` task will never run its body; the caller takes the body out
    /// and drops it outside the state lock (its captures may run arbitrary
    /// drop code).
    pub(crate) fn request_cancel(&mut self, reason: &CancelReason) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.signal.request(reason);
        match &mut self.state {
            TaskState::Cancelling(existing) => {
                existing.strengthen(reason);
                false
            }
            TaskState::New => {
                self.body_done = true;
                self.state = TaskState::Cancelling(reason.clone());
                true
            }
            TaskState::Active | TaskState::Completing => {
                self.state = TaskState::Cancelling(reason.clone());
                true
            }
            TaskState::Completed | TaskState::Cancelled => false,
        }
    }

    /// Records the body's outcome. The caller decides the follow-on
    /// transition (`Completing` vs finalization under `Cancelling`).
    pub(crate) fn note_body_outcome(&mut self, outcome: Outcome<(), Error>) {
        self.body_done = true;
        self.pending = Some(outcome);
    }

    /// True once nothing remains before the terminal transition.
    pub(crate) fn ready_to_finish(&self) -> bool {
        match self.state {
            TaskState::Completing => self.children.is_empty(),
            TaskState::Cancelling(_) => self.children.is_empty() && self.body_done,
            _ => false,
        }
    }

    /// The outcome this task will publish when it finishes.
    ///
    /// An escalated child failure takes precedence, then the body's own
    /// outcome, then plain cancellation.
    pub(crate) fn terminal_outcome(&self) -> Outcome<(), Error> {
        if let Some(failure) = &self.failure {
            return failure.clone();
        }
        if let Some(pending) = &self.pending {
            if !pending.is_ok() || !self.state.is_cancelling() {
                return pending.clone();
            }
        }
        match &self.state {
            TaskState::Cancelling(reason) => Outcome::Cancelled(reason.clone()),
            _ => self
                .pending
                .clone()
                .unwrap_or(Outcome::Ok(())),
        }
    }
}

impl TaskRecord {
    /// The task's name for logs, falling back to its display id.
    pub(crate) fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.to_string(),
            None => self.id.to_string(),
        }
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("children", &self.children.len())
            .field("supervisor", &self.supervisor)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CancelKind;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::new_for_test(0, 0),
            ScopeId::from_arena(crate::util::ArenaIndex::new(0, 0)),
            None,
            ExecContext::Default,
            false,
            None,
            ContextMap::new(),
        )
    }

    #[test]
    fn forward_only_lifecycle() {
        let mut t = record();
        assert_eq!(t.state, TaskState::New);
        assert!(t.start());
        assert_eq!(t.state, TaskState::Active);
        assert!(!t.start());

        t.note_body_outcome(Outcome::Ok(()));
        t.state = TaskState::Completing;
        assert!(t.ready_to_finish());
    }

    #[test]
    fn cancel_is_idempotent_and_strengthens() {
        let mut t = record();
        t.start();
        assert!(t.request_cancel(&CancelReason::user("stop")));
        assert!(!t.request_cancel(&CancelReason::shutdown()));
        match &t.state {
            TaskState::Cancelling(reason) => assert_eq!(reason.kind, CancelKind::Shutdown),
            other => panic!("expected Cancelling, got {other:?}"),
        }
    }

    #[test]
    fn cancel_before_start_finishes_without_running() {
        let mut t = record();
        assert!(t.request_cancel(&CancelReason::timeout()));
        assert!(t.body_done);
        assert!(t.ready_to_finish());
        assert!(t.terminal_outcome().is_cancelled());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut t = record();
        t.state = TaskState::Completed;
        assert!(!t.request_cancel(&CancelReason::timeout()));
        assert!(t.state.is_terminal());
    }

    #[test]
    fn completing_gates_on_children() {
        let mut t = record();
        t.start();
        t.children.push(TaskId::new_for_test(9, 0));
        t.note_body_outcome(Outcome::Ok(()));
        t.state = TaskState::Completing;
        assert!(!t.ready_to_finish());
        t.children.clear();
        assert!(t.ready_to_finish());
    }

    #[test]
    fn escalated_failure_wins_over_cancellation() {
        let mut t = record();
        t.start();
        t.request_cancel(&CancelReason::sibling_failed());
        t.note_body_outcome(Outcome::Cancelled(CancelReason::sibling_failed()));
        t.failure = Some(Outcome::Err(Error::user("child blew up")));
        assert!(t.terminal_outcome().is_err());
    }

    #[test]
    fn body_failure_surfaces_through_cancelling() {
        let mut t = record();
        t.start();
        t.note_body_outcome(Outcome::Err(Error::user("boom")));
        t.state = TaskState::Cancelling(CancelReason::parent_cancelled());
        assert!(t.terminal_outcome().is_err());
    }

    #[test]
    fn signal_masking_suppresses_check() {
        let signal = CancelSignal::new();
        signal.request(&CancelReason::timeout());
        assert!(signal.check().is_some());
        signal.mask_enter();
        assert!(signal.check().is_none());
        assert!(signal.requested().is_some());
        signal.mask_exit();
        assert!(signal.check().is_some());
    }

    #[test]
    fn completion_wakes_registered_waiters() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::task::Wake;

        struct Counter(AtomicUsize);
        impl Wake for Counter {
            fn wake(self: Arc<Self>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));

        let completion = Completion::new();
        completion.register(&waker);
        completion.register(&waker);
        assert!(!completion.is_done());

        completion.finish(Outcome::Ok(()));
        assert!(completion.is_done());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(completion.summary().unwrap().is_ok());
    }
}
