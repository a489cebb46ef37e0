//! Ready-queue scheduler.
//!
//! Two tiers: a cancel lane that is always drained first, so tasks honouring
//! a cancellation request observe it promptly, and one FIFO ready queue per
//! execution context. Ready queues are served round-robin; a saturated
//! context slows itself down but never starves the others. Each queue has an
//! advisory backpressure watermark — crossing it is logged, wakes are never
//! dropped.

use crate::types::{ExecContext, TaskId};
use std::collections::{HashSet, VecDeque};

const CONTEXTS: [ExecContext; ExecContext::COUNT] = [
    ExecContext::Default,
    ExecContext::Blocking,
    ExecContext::Affinity,
];

#[derive(Debug)]
pub(crate) struct Scheduler {
    cancel_lane: VecDeque<TaskId>,
    ready: [VecDeque<TaskId>; ExecContext::COUNT],
    cursor: usize,
    scheduled: HashSet<TaskId>,
    pressure: usize,
}

impl Scheduler {
    pub(crate) fn new(pressure: usize) -> Self {
        Self {
            cancel_lane: VecDeque::new(),
            ready: Default::default(),
            cursor: 0,
            scheduled: HashSet::new(),
            pressure,
        }
    }

    /// Number of distinct tasks currently queued.
    pub(crate) fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Queues a task on its context's ready queue. Duplicate wakes collapse.
    pub(crate) fn schedule(&mut self, task: TaskId, exec: ExecContext) {
        if !self.scheduled.insert(task) {
            return;
        }
        let queue = &mut self.ready[exec.index()];
        queue.push_back(task);
        if queue.len() == self.pressure {
            tracing::warn!(
                context = %exec,
                depth = queue.len(),
                "ready queue crossed its backpressure watermark"
            );
        }
    }

    /// Queues a task on the cancel lane, pulling it out of any ready queue.
    pub(crate) fn schedule_cancel(&mut self, task: TaskId) {
        if self.scheduled.insert(task) {
            self.cancel_lane.push_back(task);
            return;
        }
        if self.cancel_lane.contains(&task) {
            return;
        }
        for queue in &mut self.ready {
            queue.retain(|t| *t != task);
        }
        self.cancel_lane.push_back(task);
    }

    /// Pops the next task: cancel lane first, then ready queues round-robin.
    pub(crate) fn pop(&mut self) -> Option<TaskId> {
        if let Some(task) = self.cancel_lane.pop_front() {
            self.scheduled.remove(&task);
            return Some(task);
        }
        for offset in 0..CONTEXTS.len() {
            let index = (self.cursor + offset) % CONTEXTS.len();
            if let Some(task) = self.ready[index].pop_front() {
                self.cursor = (index + 1) % CONTEXTS.len();
                self.scheduled.remove(&task);
                return Some(task);
            }
        }
        None
    }

    /// True if a context's ready queue is at or past its watermark.
    pub(crate) fn is_saturated(&self, exec: ExecContext) -> bool {
        self.ready[exec.index()].len() >= self.pressure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(n: u32) -> TaskId {
        TaskId::new_for_test(n, 0)
    }

    #[test]
    fn cancel_lane_preempts_ready_queues() {
        let mut sched = Scheduler::new(1024);
        sched.schedule(task(1), ExecContext::Default);
        sched.schedule_cancel(task(2));
        assert_eq!(sched.pop(), Some(task(2)));
        assert_eq!(sched.pop(), Some(task(1)));
        assert!(sched.pop().is_none());
    }

    #[test]
    fn duplicate_wakes_collapse() {
        let mut sched = Scheduler::new(1024);
        sched.schedule(task(1), ExecContext::Default);
        sched.schedule(task(1), ExecContext::Default);
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn round_robin_across_contexts() {
        let mut sched = Scheduler::new(1024);
        sched.schedule(task(1), ExecContext::Default);
        sched.schedule(task(2), ExecContext::Default);
        sched.schedule(task(3), ExecContext::Affinity);

        let first = sched.pop().unwrap();
        let second = sched.pop().unwrap();
        let third = sched.pop().unwrap();
        // The affinity task must not wait behind both default tasks.
        assert_ne!([first, second], [task(1), task(2)]);
        assert_eq!(
            {
                let mut all = [first, second, third];
                all.sort();
                all
            },
            [task(1), task(2), task(3)]
        );
    }

    #[test]
    fn escalation_moves_task_to_cancel_lane() {
        let mut sched = Scheduler::new(1024);
        sched.schedule(task(1), ExecContext::Default);
        sched.schedule(task(2), ExecContext::Default);
        sched.schedule_cancel(task(2));
        assert_eq!(sched.pop(), Some(task(2)));
        assert_eq!(sched.pop(), Some(task(1)));
        assert_eq!(sched.len(), 0);
    }

    #[test]
    fn saturation_watermark() {
        let mut sched = Scheduler::new(2);
        sched.schedule(task(1), ExecContext::Blocking);
        assert!(!sched.is_saturated(ExecContext::Blocking));
        sched.schedule(task(2), ExecContext::Blocking);
        assert!(sched.is_saturated(ExecContext::Blocking));
        assert!(!sched.is_saturated(ExecContext::Default));
    }
}
