//! Bounded channels with backpressure.
//!
//! A channel moves values between independently-scheduled tasks with
//! explicit buffering and no shared mutable state. Capacity policies:
//!
//! - [`Capacity::Rendezvous`] — no buffer; sender and receiver meet.
//! - [`Capacity::Bounded`]`(n)` — FIFO buffer of `n`; senders suspend at the
//!   boundary (or displace, under a drop policy).
//! - [`Capacity::Unbounded`] — never suspends a sender.
//! - [`Capacity::Conflated`] — holds the latest value; a new send replaces
//!   it instead of suspending.
//!
//! Waiting senders and receivers queue FIFO; receivers are served strictly
//! in arrival order, which distributes values round-robin-fair across
//! competing receivers. Every value is delivered to exactly one receiver.
//!
//! Closing is idempotent: queued senders fail, buffered values stay
//! receivable until drained, and receivers then see end-of-stream. An
//! optional discard hook receives any value that can no longer be delivered
//! — displaced by a drop policy, in flight at close, or buffered when the
//! last receiver goes away — so owned resources are not leaked.
//!
//! All waiter resumption happens under the channel lock: a waiter is either
//! still queued or certain to observe its delivered result, so values are
//! never lost to a cancellation race and never duplicated.

use crate::cont::Continuation;
use crate::cx::Cx;
use crate::error::{Error, ErrorKind};
use crate::types::CancelReason;
use core::fmt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error as ThisError;

/// Buffering mode of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// No buffer: send and receive complete together.
    Rendezvous,
    /// FIFO buffer of the given size.
    Bounded(usize),
    /// No backpressure; sends always complete immediately.
    Unbounded,
    /// Latest-value buffer of one; new sends replace.
    Conflated,
}

/// What a send does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Suspend the sender until capacity frees.
    #[default]
    Suspend,
    /// Discard the oldest buffered value to make room.
    DropOldest,
    /// Discard the incoming value instead.
    DropNewest,
}

/// Error from a suspending send.
pub enum SendError<T> {
    /// The channel closed. Carries the value back unless the discard hook
    /// already consumed it.
    Closed(Option<T>),
    /// The sending task was cancelled while waiting for capacity. Carries
    /// the value back unless it had already been handed off.
    Cancelled(Option<T>, CancelReason),
}

impl<T> SendError<T> {
    /// Recovers the undelivered value, if it was not consumed by the hook.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Closed(value) | Self::Cancelled(value, _) => value,
        }
    }

    /// True if the channel closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// True if the sender was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(..))
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(value) => f
                .debug_tuple("Closed")
                .field(&value.is_some().then_some("value"))
                .finish(),
            Self::Cancelled(value, reason) => f
                .debug_tuple("Cancelled")
                .field(&value.is_some().then_some("value"))
                .field(reason)
                .finish(),
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => write!(f, "channel closed"),
            Self::Cancelled(_, reason) => write!(f, "send cancelled: {reason}"),
        }
    }
}

impl<T> std::error::Error for SendError<T> {}

impl<T> From<SendError<T>> for Error {
    fn from(err: SendError<T>) -> Self {
        match err {
            SendError::Closed(_) => Error::channel_closed(),
            SendError::Cancelled(_, reason) => Error::cancelled(reason),
        }
    }
}

/// Error from a suspending receive.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum RecvError {
    /// The channel closed and the buffer is drained: end of stream.
    #[error("channel closed")]
    Closed,
    /// The receiving task was cancelled while waiting.
    #[error("receive cancelled: {0}")]
    Cancelled(CancelReason),
}

impl From<RecvError> for Error {
    fn from(err: RecvError) -> Self {
        match err {
            RecvError::Closed => Error::channel_closed(),
            RecvError::Cancelled(reason) => Error::cancelled(reason),
        }
    }
}

/// Error from a non-suspending send attempt.
pub enum TrySendError<T> {
    /// The channel is at capacity with no waiting receiver.
    Full(T),
    /// The channel closed.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recovers the value.
    pub fn into_value(self) -> T {
        match self {
            Self::Full(value) | Self::Closed(value) => value,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "Full(..)"),
            Self::Closed(_) => write!(f, "Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "channel full"),
            Self::Closed(_) => write!(f, "channel closed"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// Error from a non-suspending receive attempt.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// Nothing buffered and no waiting sender.
    #[error("channel empty")]
    Empty,
    /// The channel closed and the buffer is drained.
    #[error("channel closed")]
    Closed,
}

type DiscardHook<T> = Arc<dyn Fn(T) + Send + Sync>;

struct WaitingSend<T> {
    id: u64,
    value: Option<T>,
    cont: Continuation<()>,
    /// On close without a hook, the value is handed back here.
    returned: Arc<Mutex<Option<T>>>,
}

struct WaitingRecv<T> {
    id: u64,
    cont: Continuation<T>,
}

struct Inner<T> {
    capacity: Capacity,
    policy: OverflowPolicy,
    buffer: VecDeque<T>,
    senders: VecDeque<WaitingSend<T>>,
    receivers: VecDeque<WaitingRecv<T>>,
    closed: bool,
    next_waiter: u64,
    sender_count: usize,
    receiver_count: usize,
    on_undelivered: Option<DiscardHook<T>>,
}

impl<T> Inner<T> {
    fn buffer_limit(&self) -> Option<usize> {
        match self.capacity {
            Capacity::Rendezvous => Some(0),
            Capacity::Bounded(n) => Some(n),
            Capacity::Unbounded => None,
            Capacity::Conflated => Some(1),
        }
    }

    fn has_room(&self) -> bool {
        self.buffer_limit()
            .map_or(true, |limit| self.buffer.len() < limit)
    }

    fn next_waiter_id(&mut self) -> u64 {
        let id = self.next_waiter;
        self.next_waiter += 1;
        id
    }
}

struct ChannelCore<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> ChannelCore<T> {
    /// Closes the channel; optionally discards the buffer. Returns `true`
    /// on the transition. Displaced values are returned for hook dispatch
    /// outside the lock.
    fn close(&self, discard_buffer: bool) -> bool {
        let (first_close, hook, discarded) = {
            let mut inner = self.inner.lock();
            let first_close = !inner.closed;
            inner.closed = true;
            let hook = inner.on_undelivered.clone();
            let mut discarded = Vec::new();
            if first_close {
                while let Some(mut waiter) = inner.senders.pop_front() {
                    if let Some(value) = waiter.value.take() {
                        if hook.is_some() {
                            discarded.push(value);
                        } else {
                            *waiter.returned.lock() = Some(value);
                        }
                    }
                    waiter.cont.resume(Err(Error::channel_closed()));
                }
                while let Some(waiter) = inner.receivers.pop_front() {
                    waiter.cont.resume(Err(Error::channel_closed()));
                }
            }
            if discard_buffer {
                discarded.extend(inner.buffer.drain(..));
            }
            (first_close, hook, discarded)
        };
        if let Some(hook) = hook {
            for value in discarded {
                hook(value);
            }
        }
        first_close
    }
}

/// Builder for channels with a non-default overflow policy or discard hook.
pub struct ChannelBuilder<T> {
    capacity: Capacity,
    policy: Option<OverflowPolicy>,
    on_undelivered: Option<DiscardHook<T>>,
}

impl<T> ChannelBuilder<T> {
    /// Starts a builder for the given capacity.
    #[must_use]
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            policy: None,
            on_undelivered: None,
        }
    }

    /// Sets the overflow policy.
    #[must_use]
    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Registers a hook for values that can no longer be delivered.
    #[must_use]
    pub fn on_undelivered(mut self, hook: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_undelivered = Some(Arc::new(hook));
        self
    }

    /// Builds the channel.
    ///
    /// # Panics
    ///
    /// Panics on contradictory configuration: a rendezvous channel with a
    /// drop policy (there is no buffer to drop from), or a conflated
    /// channel with [`OverflowPolicy::Suspend`] (conflation means replace).
    #[must_use]
    pub fn build(self) -> (Sender<T>, Receiver<T>) {
        let capacity = match self.capacity {
            Capacity::Bounded(0) => Capacity::Rendezvous,
            other => other,
        };
        let policy = self.policy.unwrap_or(match capacity {
            Capacity::Conflated => OverflowPolicy::DropOldest,
            _ => OverflowPolicy::Suspend,
        });
        match (capacity, policy) {
            (Capacity::Rendezvous, OverflowPolicy::DropOldest | OverflowPolicy::DropNewest) => {
                panic!("rendezvous channels have no buffer to drop from");
            }
            (Capacity::Conflated, OverflowPolicy::Suspend) => {
                panic!("conflated channels replace values, they never suspend");
            }
            _ => {}
        }
        let core = Arc::new(ChannelCore {
            inner: Mutex::new(Inner {
                capacity,
                policy,
                buffer: VecDeque::new(),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                closed: false,
                next_waiter: 0,
                sender_count: 1,
                receiver_count: 1,
                on_undelivered: self.on_undelivered,
            }),
        });
        (
            Sender {
                core: Arc::clone(&core),
            },
            Receiver { core },
        )
    }
}

/// Creates a channel with the given capacity and default policies.
#[must_use]
pub fn channel<T>(capacity: Capacity) -> (Sender<T>, Receiver<T>) {
    ChannelBuilder::new(capacity).build()
}

/// The sending half. Clonable for multiple producers.
pub struct Sender<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Sender<T> {
    /// Sends `value`, suspending when the channel is at capacity with no
    /// waiting receiver (under [`OverflowPolicy::Suspend`]).
    ///
    /// The returned future resolves `Ok(())` once the value is buffered or
    /// handed to a receiver.
    pub fn send(&self, cx: &Cx, value: T) -> SendFuture<T> {
        SendFuture {
            core: Arc::clone(&self.core),
            cx: cx.clone(),
            state: SendState::Start(Some(value)),
        }
    }

    /// Attempts to send without suspending.
    ///
    /// # Errors
    ///
    /// [`TrySendError::Full`] when the send would have to wait,
    /// [`TrySendError::Closed`] after close.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let (result, displaced, hook) = {
            let mut inner = self.core.inner.lock();
            if inner.closed {
                return Err(TrySendError::Closed(value));
            }
            if let Some(waiter) = inner.receivers.pop_front() {
                waiter.cont.resume(Ok(value));
                return Ok(());
            }
            let hook = inner.on_undelivered.clone();
            match place_or_displace(&mut inner, value) {
                Placement::Stored(displaced) => (Ok(()), displaced, hook),
                Placement::WouldBlock(value) => return Err(TrySendError::Full(value)),
            }
        };
        if let (Some(hook), Some(value)) = (hook, displaced) {
            hook(value);
        }
        result
    }

    /// Closes the channel. Buffered values remain receivable. Idempotent.
    pub fn close(&self) -> bool {
        self.core.close(false)
    }

    /// True after close.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.inner.lock().closed
    }

    /// Number of buffered values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.inner.lock().buffer.len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.core.inner.lock().sender_count += 1;
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let last = {
            let mut inner = self.core.inner.lock();
            inner.sender_count -= 1;
            inner.sender_count == 0
        };
        if last {
            // End of stream: buffered values stay receivable.
            self.core.close(false);
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("Sender")
            .field("buffered", &inner.buffer.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// The receiving half. Clonable for multiple consumers; waiting receivers
/// are served strictly FIFO.
pub struct Receiver<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Receiver<T> {
    /// Receives the next value, suspending while the channel is empty.
    pub fn recv(&self, cx: &Cx) -> RecvFuture<T> {
        RecvFuture {
            core: Arc::clone(&self.core),
            cx: cx.clone(),
            state: RecvState::Start,
        }
    }

    /// Attempts to receive without suspending.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] when nothing is available,
    /// [`TryRecvError::Closed`] at end of stream.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.core.inner.lock();
        if let Some(value) = take_next(&mut inner) {
            return Ok(value);
        }
        if inner.closed {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Closes the channel. Buffered values remain receivable. Idempotent.
    pub fn close(&self) -> bool {
        self.core.close(false)
    }

    /// Closes the channel and discards the buffer through the discard hook.
    pub fn cancel(&self) {
        self.core.close(true);
    }

    /// True after close.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.inner.lock().closed
    }

    /// Number of buffered values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.inner.lock().buffer.len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.core.inner.lock().receiver_count += 1;
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let last = {
            let mut inner = self.core.inner.lock();
            inner.receiver_count -= 1;
            inner.receiver_count == 0
        };
        if last {
            // Nobody can drain the buffer any more; run the hook over it.
            self.core.close(true);
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("Receiver")
            .field("buffered", &inner.buffer.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

enum Placement<T> {
    /// Value stored (or replaced); carries a displaced value for the hook.
    Stored(Option<T>),
    /// Suspension (or `Full`) is required.
    WouldBlock(T),
}

/// Buffers `value` if the capacity/policy allows, reporting any displaced
/// value. Assumes no receiver is waiting.
fn place_or_displace<T>(inner: &mut Inner<T>, value: T) -> Placement<T> {
    if inner.has_room() {
        inner.buffer.push_back(value);
        return Placement::Stored(None);
    }
    match inner.policy {
        OverflowPolicy::Suspend => Placement::WouldBlock(value),
        OverflowPolicy::DropOldest => {
            let displaced = inner.buffer.pop_front();
            inner.buffer.push_back(value);
            Placement::Stored(displaced)
        }
        OverflowPolicy::DropNewest => Placement::Stored(Some(value)),
    }
}

/// Pops the next deliverable value: the buffer head (refilled from a queued
/// sender) or a direct rendezvous handoff. Resumes under the channel lock.
fn take_next<T>(inner: &mut Inner<T>) -> Option<T> {
    if let Some(value) = inner.buffer.pop_front() {
        if let Some(mut waiter) = inner.senders.pop_front() {
            let queued = waiter.value.take().expect("queued sender holds a value");
            inner.buffer.push_back(queued);
            waiter.cont.resume(Ok(()));
        }
        return Some(value);
    }
    if let Some(mut waiter) = inner.senders.pop_front() {
        let value = waiter.value.take().expect("queued sender holds a value");
        waiter.cont.resume(Ok(()));
        return Some(value);
    }
    None
}

enum SendState<T> {
    Start(Option<T>),
    Waiting {
        id: u64,
        cont: Continuation<()>,
        returned: Arc<Mutex<Option<T>>>,
    },
    Done,
}

/// Suspension frame for a send: one state per suspension point, dispatched
/// on re-entry.
pub struct SendFuture<T> {
    core: Arc<ChannelCore<T>>,
    cx: Cx,
    state: SendState<T>,
}

// `SendState` holds the value by move, so the auto impl would demand
// `T: Unpin`; nothing in the frame is address-sensitive.
impl<T> Unpin for SendFuture<T> {}

impl<T> Future for SendFuture<T> {
    type Output = Result<(), SendError<T>>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            SendState::Start(slot) => {
                let value = slot.take().expect("send value already taken");
                if let Err(err) = this.cx.checkpoint() {
                    this.state = SendState::Done;
                    let reason = err.cancellation().unwrap_or_default();
                    return Poll::Ready(Err(SendError::Cancelled(Some(value), reason)));
                }
                let (displaced, hook) = {
                    let mut inner = this.core.inner.lock();
                    if inner.closed {
                        this.state = SendState::Done;
                        return Poll::Ready(Err(SendError::Closed(Some(value))));
                    }
                    if let Some(waiter) = inner.receivers.pop_front() {
                        waiter.cont.resume(Ok(value));
                        this.state = SendState::Done;
                        return Poll::Ready(Ok(()));
                    }
                    let hook = inner.on_undelivered.clone();
                    match place_or_displace(&mut inner, value) {
                        Placement::Stored(displaced) => (displaced, hook),
                        Placement::WouldBlock(value) => {
                            let id = inner.next_waiter_id();
                            let cont =
                                Continuation::new(this.cx.task_id(), task_cx.waker().clone());
                            let returned = Arc::new(Mutex::new(None));
                            inner.senders.push_back(WaitingSend {
                                id,
                                value: Some(value),
                                cont: cont.clone(),
                                returned: Arc::clone(&returned),
                            });
                            this.state = SendState::Waiting {
                                id,
                                cont,
                                returned,
                            };
                            return Poll::Pending;
                        }
                    }
                };
                if let (Some(hook), Some(value)) = (hook, displaced) {
                    hook(value);
                }
                this.state = SendState::Done;
                Poll::Ready(Ok(()))
            }
            SendState::Waiting {
                id,
                cont,
                returned,
            } => {
                if let Some(result) = cont.try_claim() {
                    let outcome = finish_send(result, returned);
                    this.state = SendState::Done;
                    return Poll::Ready(outcome);
                }
                match this.cx.checkpoint() {
                    Ok(()) => {
                        cont.set_waker(task_cx.waker());
                        Poll::Pending
                    }
                    Err(err) => {
                        let reason = err.cancellation().unwrap_or_default();
                        let withdrawn = {
                            let mut inner = this.core.inner.lock();
                            let position = inner.senders.iter().position(|s| s.id == *id);
                            position.and_then(|p| {
                                inner.senders.remove(p).and_then(|mut s| s.value.take())
                            })
                        };
                        let outcome = match withdrawn {
                            Some(value) => Err(SendError::Cancelled(Some(value), reason)),
                            None => {
                                // Dequeued under the lock before we got
                                // here, so the result is already in.
                                let result = cont
                                    .try_claim()
                                    .expect("dequeued sender must have been resumed");
                                finish_send(result, returned)
                            }
                        };
                        this.state = SendState::Done;
                        Poll::Ready(outcome)
                    }
                }
            }
            SendState::Done => panic!("SendFuture polled after completion"),
        }
    }
}

fn finish_send<T>(
    result: Result<(), Error>,
    returned: &Arc<Mutex<Option<T>>>,
) -> Result<(), SendError<T>> {
    match result {
        Ok(()) => Ok(()),
        Err(_) => Err(SendError::Closed(returned.lock().take())),
    }
}

impl<T> Drop for SendFuture<T> {
    fn drop(&mut self) {
        if let SendState::Waiting {
            id,
            cont,
            returned,
        } = &self.state
        {
            let (abandoned, hook) = {
                let mut inner = self.core.inner.lock();
                let hook = inner.on_undelivered.clone();
                let position = inner.senders.iter().position(|s| s.id == *id);
                let value =
                    position.and_then(|p| inner.senders.remove(p).and_then(|mut s| s.value.take()));
                cont.disarm();
                // A close may have handed the value back already.
                (value.or_else(|| returned.lock().take()), hook)
            };
            if let Some(value) = abandoned {
                if let Some(hook) = hook {
                    hook(value);
                }
            }
        }
    }
}

impl<T> fmt::Debug for SendFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            SendState::Start(_) => "start",
            SendState::Waiting { .. } => "waiting",
            SendState::Done => "done",
        };
        f.debug_struct("SendFuture").field("state", &state).finish()
    }
}

enum RecvState<T> {
    Start,
    Waiting { id: u64, cont: Continuation<T> },
    Done,
}

/// Suspension frame for a receive.
pub struct RecvFuture<T> {
    core: Arc<ChannelCore<T>>,
    cx: Cx,
    state: RecvState<T>,
}

impl<T> Future for RecvFuture<T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            RecvState::Start => {
                if let Err(err) = this.cx.checkpoint() {
                    this.state = RecvState::Done;
                    let reason = err.cancellation().unwrap_or_default();
                    return Poll::Ready(Err(RecvError::Cancelled(reason)));
                }
                let mut inner = this.core.inner.lock();
                if let Some(value) = take_next(&mut inner) {
                    drop(inner);
                    this.state = RecvState::Done;
                    return Poll::Ready(Ok(value));
                }
                if inner.closed {
                    drop(inner);
                    this.state = RecvState::Done;
                    return Poll::Ready(Err(RecvError::Closed));
                }
                let id = inner.next_waiter_id();
                let cont = Continuation::new(this.cx.task_id(), task_cx.waker().clone());
                inner.receivers.push_back(WaitingRecv {
                    id,
                    cont: cont.clone(),
                });
                drop(inner);
                this.state = RecvState::Waiting { id, cont };
                Poll::Pending
            }
            RecvState::Waiting { id, cont } => {
                if let Some(result) = cont.try_claim() {
                    this.state = RecvState::Done;
                    return Poll::Ready(map_recv(result));
                }
                match this.cx.checkpoint() {
                    Ok(()) => {
                        cont.set_waker(task_cx.waker());
                        Poll::Pending
                    }
                    Err(err) => {
                        let reason = err.cancellation().unwrap_or_default();
                        let withdrawn = {
                            let mut inner = this.core.inner.lock();
                            let position = inner.receivers.iter().position(|r| r.id == *id);
                            match position {
                                Some(p) => {
                                    inner.receivers.remove(p);
                                    true
                                }
                                None => false,
                            }
                        };
                        let outcome = if withdrawn {
                            Err(RecvError::Cancelled(reason))
                        } else {
                            // A value raced in under the lock; it must be
                            // delivered, cancellation or not.
                            let result = cont
                                .try_claim()
                                .expect("dequeued receiver must have been resumed");
                            map_recv(result)
                        };
                        this.state = RecvState::Done;
                        Poll::Ready(outcome)
                    }
                }
            }
            RecvState::Done => panic!("RecvFuture polled after completion"),
        }
    }
}

fn map_recv<T>(result: Result<T, Error>) -> Result<T, RecvError> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.kind() == ErrorKind::ChannelClosed => Err(RecvError::Closed),
        Err(err) => Err(RecvError::Cancelled(
            err.cancellation().unwrap_or_default(),
        )),
    }
}

impl<T> Drop for RecvFuture<T> {
    fn drop(&mut self) {
        if let RecvState::Waiting { id, cont } = &self.state {
            let (delivered, hook) = {
                let mut inner = self.core.inner.lock();
                let hook = inner.on_undelivered.clone();
                if let Some(position) = inner.receivers.iter().position(|r| r.id == *id) {
                    inner.receivers.remove(position);
                }
                cont.disarm();
                // A value delivered to a receiver that then went away is
                // undeliverable.
                let delivered = cont.try_claim().and_then(Result::ok);
                (delivered, hook)
            };
            if let Some(value) = delivered {
                if let Some(hook) = hook {
                    hook(value);
                }
            }
        }
    }
}

impl<T> fmt::Debug for RecvFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            RecvState::Start => "start",
            RecvState::Waiting { .. } => "waiting",
            RecvState::Done => "done",
        };
        f.debug_struct("RecvFuture").field("state", &state).finish()
    }
}
