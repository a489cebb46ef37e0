//! Cancellation reasons.
//!
//! Cancellation is cooperative and carries a reason describing why the task
//! is being asked to stop. Reasons are ordered by severity; competing
//! requests strengthen an existing reason but never weaken it, so repeated
//! cancellation is idempotent.
//!
//! A cancellation reason never propagates upward through the task tree by
//! itself; only computation failures do.

use core::fmt;

/// Why a task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelKind {
    /// Explicit request from user code.
    Cancel,
    /// A deadline elapsed.
    Timeout,
    /// The owning scope closed with work still pending.
    ScopeClosed,
    /// A sibling task failed under a non-supervising parent.
    SiblingFailed,
    /// The parent task was cancelled or failed.
    ParentCancelled,
    /// The runtime is shutting down.
    Shutdown,
}

impl CancelKind {
    /// Severity rank; higher-severity requests win when reasons merge.
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::Cancel => 0,
            Self::Timeout => 1,
            Self::ScopeClosed => 2,
            Self::SiblingFailed => 3,
            Self::ParentCancelled => 4,
            Self::Shutdown => 5,
        }
    }
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancel => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
            Self::ScopeClosed => write!(f, "scope closed"),
            Self::SiblingFailed => write!(f, "sibling failed"),
            Self::ParentCancelled => write!(f, "parent cancelled"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A cancellation kind plus an optional static message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason {
    /// The kind of request.
    pub kind: CancelKind,
    /// Optional human-readable context.
    pub message: Option<&'static str>,
}

impl CancelReason {
    /// A reason of the given kind with no message.
    #[must_use]
    pub const fn new(kind: CancelKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// An explicit user cancellation with a message.
    #[must_use]
    pub const fn user(message: &'static str) -> Self {
        Self {
            kind: CancelKind::Cancel,
            message: Some(message),
        }
    }

    /// A timeout-driven cancellation.
    #[must_use]
    pub const fn timeout() -> Self {
        Self::new(CancelKind::Timeout)
    }

    /// Cancellation because the owning scope closed.
    #[must_use]
    pub const fn scope_closed() -> Self {
        Self::new(CancelKind::ScopeClosed)
    }

    /// Cancellation because a sibling failed.
    #[must_use]
    pub const fn sibling_failed() -> Self {
        Self::new(CancelKind::SiblingFailed)
    }

    /// Cancellation cascading from the parent.
    #[must_use]
    pub const fn parent_cancelled() -> Self {
        Self::new(CancelKind::ParentCancelled)
    }

    /// Cancellation because the runtime is shutting down.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(CancelKind::Shutdown)
    }

    /// Merges `other` into `self`, keeping the more severe request.
    ///
    /// Returns `true` if `self` changed. Equal-severity merges keep a
    /// deterministic message (lexicographically least).
    pub fn strengthen(&mut self, other: &Self) -> bool {
        if other.kind > self.kind {
            self.kind = other.kind;
            self.message = other.message;
            return true;
        }
        if other.kind < self.kind {
            return false;
        }
        match (self.message, other.message) {
            (None, Some(message)) => {
                self.message = Some(message);
                true
            }
            (Some(current), Some(candidate)) if candidate < current => {
                self.message = Some(candidate);
                true
            }
            _ => false,
        }
    }

    /// The kind of this reason.
    #[must_use]
    pub const fn kind(&self) -> CancelKind {
        self.kind
    }
}

impl Default for CancelReason {
    fn default() -> Self {
        Self::new(CancelKind::Cancel)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(message) = self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}
