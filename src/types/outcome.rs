//! Four-valued outcome of a concurrent operation.
//!
//! `Ok < Err < Cancelled < Panicked` forms a severity lattice; aggregation
//! keeps the worst outcome. Success and failure travel the same channel: a
//! resumed computation always receives one tagged value, never two code
//! paths.

use super::cancel::CancelReason;
use core::fmt;

/// Message captured from a caught panic, safe to move across tasks.
#[derive(Debug, Clone)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Wraps a panic message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The captured message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// The terminal outcome of a task or operation.
#[derive(Debug, Clone)]
pub enum Outcome<T, E> {
    /// Completed with a value.
    Ok(T),
    /// Failed with an application error.
    Err(E),
    /// Stopped by cancellation.
    Cancelled(CancelReason),
    /// The computation panicked.
    Panicked(PanicPayload),
}

impl<T, E> Outcome<T, E> {
    /// Severity rank: 0 for `Ok` through 3 for `Panicked`.
    #[must_use]
    pub const fn severity(&self) -> u8 {
        match self {
            Self::Ok(_) => 0,
            Self::Err(_) => 1,
            Self::Cancelled(_) => 2,
            Self::Panicked(_) => 3,
        }
    }

    /// True for `Ok`.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// True for `Err`.
    #[must_use]
    pub const fn is_err(&self) -> bool {
        matches!(self, Self::Err(_))
    }

    /// True for `Cancelled`.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// True for `Panicked`.
    #[must_use]
    pub const fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// True for `Err` or `Panicked` — the outcomes that propagate through
    /// the task tree as failures.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Err(_) | Self::Panicked(_))
    }

    /// Maps the success value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U, E> {
        match self {
            Self::Ok(value) => Outcome::Ok(f(value)),
            Self::Err(err) => Outcome::Err(err),
            Self::Cancelled(reason) => Outcome::Cancelled(reason),
            Self::Panicked(payload) => Outcome::Panicked(payload),
        }
    }

    /// Drops the success value, keeping the shape.
    pub fn erase(&self) -> Outcome<(), E>
    where
        E: Clone,
    {
        match self {
            Self::Ok(_) => Outcome::Ok(()),
            Self::Err(err) => Outcome::Err(err.clone()),
            Self::Cancelled(reason) => Outcome::Cancelled(reason.clone()),
            Self::Panicked(payload) => Outcome::Panicked(payload.clone()),
        }
    }

    /// Returns the success value or panics with the outcome's description.
    #[track_caller]
    pub fn unwrap(self) -> T
    where
        E: fmt::Debug,
    {
        match self {
            Self::Ok(value) => value,
            Self::Err(err) => panic!("called `Outcome::unwrap()` on an `Err` value: {err:?}"),
            Self::Cancelled(reason) => {
                panic!("called `Outcome::unwrap()` on a `Cancelled` value: {reason}")
            }
            Self::Panicked(payload) => {
                panic!("called `Outcome::unwrap()` on a `Panicked` value: {payload}")
            }
        }
    }

    /// The cancellation reason, if cancelled.
    #[must_use]
    pub const fn cancel_reason(&self) -> Option<&CancelReason> {
        match self {
            Self::Cancelled(reason) => Some(reason),
            _ => None,
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => Self::Err(err),
        }
    }
}
