//! Scheduled-callback registry.
//!
//! Timers are continuations parked in a deadline-ordered heap. Nothing
//! blocks for the duration: the driver asks for the next deadline when idle
//! and either advances the virtual clock to it or parks until it. Cancelled
//! sleepers disarm their continuation and leave the entry behind; it is
//! dropped when it surfaces.

use crate::cont::Continuation;
use crate::types::Time;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct TimerEntry {
    deadline: Time,
    seq: u64,
    cont: Continuation<()>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline
        // on top, FIFO among equal deadlines.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct TimerRegistry {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl TimerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers `cont` to resume at `deadline`.
    pub(crate) fn insert(&mut self, deadline: Time, cont: Continuation<()>) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            cont,
        });
    }

    /// Removes and returns every continuation whose deadline has passed.
    /// Disarmed entries are dropped on the way out.
    pub(crate) fn take_due(&mut self, now: Time) -> Vec<Continuation<()>> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry vanished");
            if entry.cont.is_waiting() {
                due.push(entry.cont);
            }
        }
        due
    }

    /// The earliest armed deadline, pruning disarmed entries off the top.
    pub(crate) fn next_deadline(&mut self) -> Option<Time> {
        while let Some(entry) = self.heap.peek() {
            if entry.cont.is_waiting() {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Number of armed timers.
    pub(crate) fn pending(&self) -> usize {
        self.heap.iter().filter(|e| e.cont.is_waiting()).count()
    }
}

impl std::fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("entries", &self.heap.len())
            .finish()
    }
}
