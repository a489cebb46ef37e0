//! Context data carried by tasks.
//!
//! There is no ambient "current task" pointer anywhere in the runtime; every
//! operation receives its context explicitly. `ContextMap` is the immutable
//! keyed bag of values a task inherits from its parent: merging overrides by
//! key, child entries win, everything else is inherited.

use core::fmt;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// The execution context a task is scheduled on.
///
/// Each context has its own ready queue in the scheduler with an independent
/// backpressure watermark; queues are served round-robin so one saturated
/// context cannot starve another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecContext {
    /// General-purpose CPU-bound context.
    #[default]
    Default,
    /// Context for tasks that interleave long synchronous sections.
    Blocking,
    /// The single designated worker; operations that must serialize on one
    /// specific worker run here.
    Affinity,
}

impl ExecContext {
    /// Number of distinct contexts.
    pub(crate) const COUNT: usize = 3;

    /// Dense index for per-context tables.
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Default => 0,
            Self::Blocking => 1,
            Self::Affinity => 2,
        }
    }
}

impl fmt::Display for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Blocking => write!(f, "blocking"),
            Self::Affinity => write!(f, "affinity"),
        }
    }
}

type ContextValue = Arc<dyn Any + Send + Sync>;

/// An immutable set of keyed context values.
///
/// Cloning is cheap (the map is shared); `with` and `merge` build new maps
/// rather than mutating in place.
#[derive(Clone, Default)]
pub struct ContextMap {
    entries: Option<Arc<HashMap<&'static str, ContextValue>>>,
}

impl ContextMap {
    /// An empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new context with `key` bound to `value`, overriding any
    /// existing binding for the same key.
    #[must_use]
    pub fn with<V: Any + Send + Sync>(&self, key: &'static str, value: V) -> Self {
        let mut entries: HashMap<&'static str, ContextValue> = self
            .entries
            .as_deref()
            .cloned()
            .unwrap_or_default();
        entries.insert(key, Arc::new(value));
        Self {
            entries: Some(Arc::new(entries)),
        }
    }

    /// Looks up `key`, downcasting to `V`.
    #[must_use]
    pub fn get<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        let value = self.entries.as_ref()?.get(key)?.clone();
        value.downcast::<V>().ok()
    }

    /// True if `key` is bound.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.contains_key(key))
    }

    /// Merges `child` over `self`: child bindings override same-key entries,
    /// all other bindings are inherited.
    #[must_use]
    pub fn merge(&self, child: &Self) -> Self {
        match (&self.entries, &child.entries) {
            (None, _) => child.clone(),
            (_, None) => self.clone(),
            (Some(parent), Some(overrides)) => {
                let mut entries = parent.as_ref().clone();
                for (key, value) in overrides.iter() {
                    entries.insert(key, value.clone());
                }
                Self {
                    entries: Some(Arc::new(entries)),
                }
            }
        }
    }
}

impl fmt::Debug for ContextMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self
            .entries
            .as_ref()
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        f.debug_tuple("ContextMap").field(&keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_and_get() {
        let map = ContextMap::new().with("answer", 42u32);
        assert_eq!(map.get::<u32>("answer").as_deref(), Some(&42));
        assert!(map.get::<String>("answer").is_none());
        assert!(map.get::<u32>("missing").is_none());
    }

    #[test]
    fn merge_overrides_by_key() {
        let parent = ContextMap::new().with("a", 1u32).with("b", 2u32);
        let child = ContextMap::new().with("b", 20u32);
        let merged = parent.merge(&child);
        assert_eq!(merged.get::<u32>("a").as_deref(), Some(&1));
        assert_eq!(merged.get::<u32>("b").as_deref(), Some(&20));
    }

    #[test]
    fn with_does_not_mutate_original() {
        let original = ContextMap::new().with("k", 1u32);
        let updated = original.with("k", 2u32);
        assert_eq!(original.get::<u32>("k").as_deref(), Some(&1));
        assert_eq!(updated.get::<u32>("k").as_deref(), Some(&2));
    }

    #[test]
    fn exec_context_indices_are_dense() {
        assert_eq!(ExecContext::Default.index(), 0);
        assert_eq!(ExecContext::Blocking.index(), 1);
        assert_eq!(ExecContext::Affinity.index(), 2);
        assert_eq!(ExecContext::COUNT, 3);
    }
}
