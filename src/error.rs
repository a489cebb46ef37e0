//! Error types for the runtime.
//!
//! Errors are explicit and typed. Cancellation, channel closure, and
//! deadline expiry are ordinary error values that travel the normal result
//! channel; protocol violations (resuming a continuation twice, attaching a
//! child to a non-active task, re-entering an exclusive cell) are programmer
//! errors and panic instead of becoming `Error` values.

use crate::types::{CancelReason, PanicPayload};
use core::fmt;
use std::borrow::Cow;

/// The kind of a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled cooperatively.
    Cancelled,
    /// A channel closed while the operation was pending on it.
    ChannelClosed,
    /// A deadline elapsed.
    DeadlineExceeded,
    /// The owning scope closed.
    ScopeClosed,
    /// The runtime is shutting down.
    Shutdown,
    /// A task body panicked.
    Panicked,
    /// Application-level failure raised by user code.
    User,
    /// Internal runtime invariant failure.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::ScopeClosed => write!(f, "scope closed"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Panicked => write!(f, "panicked"),
            Self::User => write!(f, "user error"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

/// A runtime error: a kind, an optional message, and — for cancellation —
/// the reason that triggered it.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<Cow<'static, str>>,
    reason: Option<CancelReason>,
}

impl Error {
    /// An error of the given kind with no message.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            reason: None,
        }
    }

    /// A cancellation error carrying its reason.
    #[must_use]
    pub fn cancelled(reason: CancelReason) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: None,
            reason: Some(reason),
        }
    }

    /// A channel-closed error.
    #[must_use]
    pub const fn channel_closed() -> Self {
        Self::new(ErrorKind::ChannelClosed)
    }

    /// A deadline-exceeded error.
    #[must_use]
    pub const fn deadline_exceeded() -> Self {
        Self::new(ErrorKind::DeadlineExceeded)
    }

    /// An application-level failure with a message.
    #[must_use]
    pub fn user(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: ErrorKind::User,
            message: Some(message.into()),
            reason: None,
        }
    }

    /// An internal invariant failure with a message.
    #[must_use]
    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: Some(message.into()),
            reason: None,
        }
    }

    /// A failure derived from a caught panic.
    #[must_use]
    pub fn panicked(payload: &PanicPayload) -> Self {
        Self {
            kind: ErrorKind::Panicked,
            message: Some(Cow::Owned(payload.message().to_owned())),
            reason: None,
        }
    }

    /// The error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The attached message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The cancellation reason, if this error is a cancellation.
    #[must_use]
    pub fn cancellation(&self) -> Option<CancelReason> {
        if self.kind == ErrorKind::Cancelled {
            Some(self.reason.clone().unwrap_or_default())
        } else {
            None
        }
    }

    /// True if this error is a cooperative cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

impl Eq for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(reason) = &self.reason {
            write!(f, " ({reason})")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CancelKind;

    #[test]
    fn cancellation_carries_reason() {
        let err = Error::cancelled(CancelReason::timeout());
        assert!(err.is_cancellation());
        assert_eq!(err.cancellation().unwrap().kind, CancelKind::Timeout);
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn non_cancellation_has_no_reason() {
        let err = Error::user("bad input");
        assert!(!err.is_cancellation());
        assert!(err.cancellation().is_none());
        assert_eq!(err.message(), Some("bad input"));
    }

    #[test]
    fn equality_ignores_reason_detail() {
        assert_eq!(
            Error::cancelled(CancelReason::timeout()),
            Error::cancelled(CancelReason::user("stop"))
        );
        assert_ne!(Error::user("a"), Error::user("b"));
    }
}
