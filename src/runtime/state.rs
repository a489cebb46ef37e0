//! Runtime state: the task tree and all cross-record orchestration.
//!
//! Everything here runs under the state mutex, held only across short
//! critical sections and never across a suspension point. Cancellation
//! recursion and completion propagation are worklist loops, not recursive
//! calls, so tree depth never translates into native stack depth.

use crate::error::Error;
use crate::record::{ScopeRecord, TaskRecord, TaskState};
use crate::types::{CancelReason, ContextMap, ExecContext, Outcome, ScopeId, TaskId};
use crate::util::Arena;

use super::{Shared, StoredTask};

/// Work produced while the state lock was held, applied (and dropped) after
/// it is released.
///
/// `defer_drop` exists because dropping a task body can run arbitrary user
/// code through the captures' destructors; doing that under the state lock
/// would invite re-entrant deadlock.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub(crate) schedule: Vec<(TaskId, ExecContext)>,
    pub(crate) cancel_lane: Vec<TaskId>,
    pub(crate) defer_drop: Vec<StoredTask>,
}

impl Effects {
    pub(crate) fn apply(self, shared: &Shared) {
        if !self.schedule.is_empty() || !self.cancel_lane.is_empty() {
            {
                let mut scheduler = shared.scheduler.lock();
                for task in self.cancel_lane {
                    scheduler.schedule_cancel(task);
                }
                for (task, exec) in self.schedule {
                    scheduler.schedule(task, exec);
                }
            }
            shared.injector.unpark();
        }
        // `defer_drop` falls out of scope here, outside every lock.
    }
}

#[derive(Debug, Default)]
pub(crate) struct RuntimeState {
    pub(crate) tasks: Arena<TaskRecord>,
    pub(crate) scopes: Arena<ScopeRecord>,
}

impl RuntimeState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Live (non-terminal) tasks, containers included.
    pub(crate) fn tasks_live(&self) -> usize {
        self.tasks.len()
    }

    /// Creates a scope and its root container task.
    pub(crate) fn create_scope(
        &mut self,
        supervised: bool,
        name: Option<std::sync::Arc<str>>,
        context: ContextMap,
    ) -> (ScopeId, TaskId) {
        let placeholder = ScopeId::from_arena(crate::util::ArenaIndex::new(u32::MAX, u32::MAX));
        let root = self.tasks.insert_with(|index| {
            TaskRecord::new_container(
                TaskId::from_arena(index),
                placeholder,
                supervised,
                name.clone(),
                context.clone(),
            )
        });
        let root = TaskId::from_arena(root);
        let scope = self.scopes.insert_with(|index| {
            ScopeRecord::new(ScopeId::from_arena(index), root, supervised, name, context)
        });
        let scope = ScopeId::from_arena(scope);
        self.tasks
            .get_mut(root.arena_index())
            .expect("root record just inserted")
            .scope = scope;
        tracing::debug!(scope = %scope, root = %root, supervised, "scope created");
        (scope, root)
    }

    /// Attaches a new task under `parent`.
    ///
    /// # Panics
    ///
    /// Panics if `parent` is not `Active` — attaching children to a task
    /// that is winding down or done is a protocol violation.
    pub(crate) fn attach_task(
        &mut self,
        parent: TaskId,
        exec: ExecContext,
        supervisor: bool,
        name: Option<std::sync::Arc<str>>,
        context: ContextMap,
    ) -> TaskId {
        let (scope, parent_state_ok) = match self.tasks.get(parent.arena_index()) {
            Some(record) => (record.scope, record.state.can_attach()),
            None => (
                ScopeId::from_arena(crate::util::ArenaIndex::new(0, 0)),
                false,
            ),
        };
        assert!(
            parent_state_ok,
            "launch under {parent} (protocol violation: children may only attach to an active task)"
        );
        let child = self.tasks.insert_with(|index| {
            TaskRecord::new(
                TaskId::from_arena(index),
                scope,
                Some(parent),
                exec,
                supervisor,
                name,
                context,
            )
        });
        let child = TaskId::from_arena(child);
        self.tasks
            .get_mut(parent.arena_index())
            .expect("parent checked above")
            .children
            .push(child);
        tracing::trace!(task = %child, parent = %parent, context = %exec, "task attached");
        child
    }

    /// Installs the body for a freshly attached task.
    ///
    /// Hands the body back when cancellation won the race and the task will
    /// never run; the caller drops it outside the state lock.
    pub(crate) fn install_body(&mut self, task: TaskId, body: StoredTask) -> Option<StoredTask> {
        match self.tasks.get_mut(task.arena_index()) {
            Some(record) if record.state == TaskState::New && !record.body_done => {
                record.body = Some(body);
                None
            }
            _ => Some(body),
        }
    }

    /// Requests cancellation of `task` and, top-down, of its whole subtree.
    pub(crate) fn cancel_task(&mut self, task: TaskId, reason: &CancelReason, effects: &mut Effects) {
        let mut finish = Vec::new();
        self.mark_cancel(task, reason, effects, &mut finish);
        self.drain_finishes(finish, effects);
    }

    /// Records the outcome of a task body and advances the lifecycle.
    pub(crate) fn body_finished(
        &mut self,
        task: TaskId,
        outcome: Outcome<(), Error>,
        effects: &mut Effects,
    ) {
        let mut finish = Vec::new();
        let follow_up = {
            let Some(record) = self.tasks.get_mut(task.arena_index()) else {
                return;
            };
            record.body = None;
            record.note_body_outcome(outcome.clone());
            match &outcome {
                Outcome::Ok(()) => {
                    if record.state == TaskState::Active {
                        record.state = TaskState::Completing;
                    }
                    None
                }
                Outcome::Cancelled(reason) => {
                    // Usually an acknowledgement of a pending request; a body
                    // may also raise cancellation spontaneously, which then
                    // cancels its subtree like any other request.
                    (!record.state.is_cancelling()).then(|| reason.clone())
                }
                Outcome::Err(_) | Outcome::Panicked(_) => {
                    Some(CancelReason::user("task body failed"))
                }
            }
        };
        if let Some(reason) = follow_up {
            self.mark_cancel(task, &reason, effects, &mut finish);
        }
        finish.push(task);
        self.drain_finishes(finish, effects);
    }

    /// Closes a scope: cancels every remaining child of the root, then lets
    /// the root complete once they are terminal. Idempotent.
    pub(crate) fn close_scope(&mut self, scope: ScopeId, effects: &mut Effects) {
        let root = {
            let Some(record) = self.scopes.get_mut(scope.arena_index()) else {
                return;
            };
            if !record.begin_close() {
                return;
            }
            record.root
        };
        tracing::debug!(scope = %scope, "scope closing");
        let mut finish = Vec::new();
        let children = match self.tasks.get(root.arena_index()) {
            Some(record) => record.children.to_vec(),
            None => return,
        };
        for child in children {
            self.mark_cancel(child, &CancelReason::scope_closed(), effects, &mut finish);
        }
        if let Some(record) = self.tasks.get_mut(root.arena_index()) {
            if record.state == TaskState::Active {
                record.state = TaskState::Completing;
                record.pending = Some(Outcome::Ok(()));
            }
        }
        finish.push(root);
        self.drain_finishes(finish, effects);
    }

    /// Marks `task` and its subtree as cancelling, parent before children.
    /// Newly marked tasks land on the cancel lane so they observe promptly;
    /// candidates that may already be finishable are pushed onto `finish`.
    fn mark_cancel(
        &mut self,
        task: TaskId,
        reason: &CancelReason,
        effects: &mut Effects,
        finish: &mut Vec<TaskId>,
    ) {
        let mut stack = vec![(task, reason.clone())];
        while let Some((id, reason)) = stack.pop() {
            let Some(record) = self.tasks.get_mut(id.arena_index()) else {
                continue;
            };
            if record.state.is_terminal() {
                continue;
            }
            let was_new = record.state == TaskState::New;
            if record.request_cancel(&reason) {
                tracing::trace!(task = %id, %reason, "cancellation requested");
                if was_new {
                    // Never polled; the body is dropped outside the lock.
                    effects.defer_drop.extend(record.body.take());
                }
                effects.cancel_lane.push(id);
                for child in record.children.iter().copied() {
                    stack.push((child, CancelReason::parent_cancelled()));
                }
                finish.push(id);
            }
        }
    }

    /// Finishes every task on the worklist that is ready, publishing
    /// outcomes, detaching from parents, and escalating failures. Iterative:
    /// the worklist carries parent follow-ups and escalation targets.
    fn drain_finishes(&mut self, mut stack: Vec<TaskId>, effects: &mut Effects) {
        while let Some(id) = stack.pop() {
            let ready = match self.tasks.get(id.arena_index()) {
                Some(record) => record.ready_to_finish(),
                None => continue,
            };
            if !ready {
                continue;
            }
            let mut record = self
                .tasks
                .remove(id.arena_index())
                .expect("record checked above");
            let outcome = record.terminal_outcome();
            record.state = if outcome.is_ok() {
                TaskState::Completed
            } else {
                TaskState::Cancelled
            };
            tracing::debug!(
                task = %record.display_name(),
                severity = outcome.severity(),
                "task terminal"
            );
            record.completion.finish(outcome.clone());

            match record.parent {
                Some(parent_id) => {
                    let mut escalate = false;
                    if let Some(parent) = self.tasks.get_mut(parent_id.arena_index()) {
                        if let Some(position) = parent.children.iter().position(|c| *c == id) {
                            parent.children.swap_remove(position);
                        }
                        if outcome.is_failure()
                            && !parent.supervisor
                            && !parent.state.is_terminal()
                        {
                            if parent.failure.is_none() {
                                parent.failure = Some(outcome.clone());
                            }
                            escalate = true;
                        }
                        stack.push(parent_id);
                    }
                    if escalate {
                        tracing::debug!(task = %id, parent = %parent_id, "failure escalated");
                        self.mark_cancel(
                            parent_id,
                            &CancelReason::sibling_failed(),
                            effects,
                            &mut stack,
                        );
                    }
                }
                None => {
                    // Scope root: the scope record goes with it.
                    self.scopes.remove(record.scope.arena_index());
                }
            }
        }
    }
}
