//! Scope record.
//!
//! A scope is the lexical owner of a task subtree: every task created
//! through it has the scope's root task as an ancestor, so nothing the scope
//! spawned can outlive it.

use crate::types::{ContextMap, ScopeId, TaskId};
use core::fmt;
use std::sync::Arc;

/// Internal record for one scope.
pub(crate) struct ScopeRecord {
    pub id: ScopeId,
    /// The container task owning every task launched in this scope.
    pub root: TaskId,
    /// Supervising scopes isolate child failures from siblings.
    pub supervised: bool,
    pub name: Option<Arc<str>>,
    pub context: ContextMap,
    /// Set once close has been requested; closing twice is a no-op.
    pub closing: bool,
}

impl ScopeRecord {
    pub(crate) fn new(
        id: ScopeId,
        root: TaskId,
        supervised: bool,
        name: Option<Arc<str>>,
        context: ContextMap,
    ) -> Self {
        Self {
            id,
            root,
            supervised,
            name,
            context,
            closing: false,
        }
    }

    /// Marks the scope as closing. Returns `false` if already closing.
    pub(crate) fn begin_close(&mut self) -> bool {
        if self.closing {
            false
        } else {
            self.closing = true;
            true
        }
    }
}

impl fmt::Debug for ScopeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("root", &self.root)
            .field("supervised", &self.supervised)
            .field("closing", &self.closing)
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ArenaIndex;

    #[test]
    fn close_is_idempotent() {
        let mut scope = ScopeRecord::new(
            ScopeId::from_arena(ArenaIndex::new(0, 0)),
            TaskId::new_for_test(0, 0),
            false,
            None,
            ContextMap::new(),
        );
        assert!(scope.begin_close());
        assert!(!scope.begin_close());
    }
}
