// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{fmt, mem};

use crate::{Context, ERR_POISONED_LOCK, Error};

/// A callback registered by a blocked receiver (or a selector receive case).
///
/// Invoked with `(value, more)` when a value (or the close signal, `more = false`) becomes
/// available. The callback returns `None` when it consumed the value and `Some(value)` to hand
/// it back, in which case the channel offers it to the next waiter. This hand-back convention
/// is what makes selectors composable: a selector's callback refuses values once another of
/// its cases has already won.
pub(crate) type ReceiveCallback<T> = Box<dyn FnOnce(Option<T>, bool) -> Option<T> + Send>;

/// A callback attached to a pending (blocked) send. Invoked when a receiver is about to take
/// the value; returns whether the sender still wants the value delivered.
pub(crate) type AcceptCallback = Box<dyn FnOnce() -> bool + Send>;

/// The outcome of a non-registering or register-on-miss receive attempt.
pub(crate) enum TryReceive<T> {
    /// A value was synchronously available.
    Value(T),

    /// The channel is closed and its buffer is drained.
    Closed,

    /// Nothing was available. If a callback was supplied it is now registered.
    Pending,
}

enum SendAttempt<T> {
    /// The value was handed to a waiting receiver or deposited into the buffer.
    Delivered,

    /// The value was parked as a pending send, to be picked up by a future receiver.
    Registered,

    /// The value could not be delivered and no registration was requested; handed back.
    Refused(T),
}

struct PendingSend<T> {
    value: T,
    accepted: AcceptCallback,
}

struct ChannelState<T> {
    /// Buffered values, oldest first. Never longer than the channel capacity.
    buffer: VecDeque<T>,

    /// Senders blocked because the buffer is full (or the channel is unbuffered), FIFO.
    pending_sends: VecDeque<PendingSend<T>>,

    /// Callbacks of blocked receivers, FIFO. Non-empty only while the buffer is empty.
    pending_receives: VecDeque<ReceiveCallback<T>>,

    /// Monotonic: a closed channel stays closed.
    closed: bool,
}

struct ChannelCore<T> {
    name: String,
    capacity: usize,
    state: Mutex<ChannelState<T>>,
}

/// A named FIFO channel for communication between coroutines of one dispatcher.
///
/// Channels are the sole communication medium inside a workflow: buffered or unbuffered
/// (capacity 0), with blocking operations that suspend the calling coroutine and async
/// variants that never do. Senders and receivers are serviced strictly in the order they
/// blocked, and a synchronous rendezvous always outruns buffering - if a receiver is waiting,
/// a send hands the value over directly rather than depositing it into the buffer.
///
/// The handle is cheap to clone; clones refer to the same channel. Construct channels through
/// [`Context::new_channel`] so their diagnostic names stay deterministic.
///
/// # Thread safety
///
/// The handle is `Send + Sync` because coroutines live on separate host threads, but all
/// operations happen while their coroutine holds the dispatcher baton, so the interior state
/// is never actually contended.
pub struct Channel<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.core.name)
            .field("capacity", &self.core.capacity)
            .finish()
    }
}

impl<T> Channel<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(name: String, capacity: usize) -> Self {
        Self {
            core: Arc::new(ChannelCore {
                name,
                capacity,
                state: Mutex::new(ChannelState {
                    buffer: VecDeque::new(),
                    pending_sends: VecDeque::new(),
                    pending_receives: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// The human-readable name of the channel, used in block statuses and diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Whether the channel has been closed. Buffered values may still be receivable.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.state.lock().expect(ERR_POISONED_LOCK).closed
    }

    /// Sends a value, suspending the calling coroutine until the value is delivered to a
    /// receiver or deposited into the buffer.
    ///
    /// # Panics
    ///
    /// Panics with [`Error::ClosedChannel`] if the channel is closed, or becomes closed while
    /// the send is parked. The panic aborts the calling coroutine and is surfaced through the
    /// dispatcher.
    pub fn send(&self, ctx: &Context, value: T) {
        let consumed = Arc::new(AtomicBool::new(false));
        let accepted: AcceptCallback = Box::new({
            let consumed = Arc::clone(&consumed);
            move || {
                consumed.store(true, Ordering::Relaxed);
                true
            }
        });

        match self.send_impl(value, Some(accepted)) {
            SendAttempt::Delivered => ctx.coroutine().unblocked(),
            SendAttempt::Registered => {
                let status = format!("blocked on {}.Send", self.name());

                loop {
                    ctx.coroutine().suspend(&status);

                    if self.is_closed() {
                        panic::panic_any(Error::ClosedChannel(self.name().to_string()));
                    }

                    if consumed.load(Ordering::Relaxed) {
                        ctx.coroutine().unblocked();
                        return;
                    }
                }
            }
            SendAttempt::Refused(_) => {
                unreachable!("a send with an accept callback is always delivered or registered")
            }
        }
    }

    /// Attempts to send without blocking. On failure the value is handed back to the caller.
    ///
    /// # Errors
    ///
    /// Returns `Err(value)` when no receiver is waiting and the buffer is full.
    ///
    /// # Panics
    ///
    /// Panics with [`Error::ClosedChannel`] if the channel is closed.
    pub fn send_async(&self, value: T) -> std::result::Result<(), T> {
        match self.send_impl(value, None) {
            SendAttempt::Delivered => Ok(()),
            SendAttempt::Refused(value) => Err(value),
            SendAttempt::Registered => {
                unreachable!("a send without an accept callback is never registered")
            }
        }
    }

    /// Selector support: attempt a synchronous send, parking `value` with `accepted` as a
    /// pending send on failure. Returns whether the send completed synchronously.
    pub(crate) fn send_or_register(&self, value: T, accepted: AcceptCallback) -> bool {
        match self.send_impl(value, Some(accepted)) {
            SendAttempt::Delivered => true,
            SendAttempt::Registered => false,
            SendAttempt::Refused(_) => {
                unreachable!("a send with an accept callback is always delivered or registered")
            }
        }
    }

    fn send_impl(&self, value: T, accepted: Option<AcceptCallback>) -> SendAttempt<T> {
        let mut state = self.core.state.lock().expect(ERR_POISONED_LOCK);

        if state.closed {
            drop(state);
            panic::panic_any(Error::ClosedChannel(self.name().to_string()));
        }

        // A waiting receiver always outruns the buffer. Receivers may refuse (a selector whose
        // other case already won), in which case the value passes to the next one in line.
        let mut value = value;
        while let Some(receiver) = state.pending_receives.pop_front() {
            match receiver(Some(value), true) {
                None => return SendAttempt::Delivered,
                Some(refused) => value = refused,
            }
        }

        if state.buffer.len() < self.core.capacity {
            state.buffer.push_back(value);
            return SendAttempt::Delivered;
        }

        match accepted {
            Some(accepted) => {
                state.pending_sends.push_back(PendingSend { value, accepted });
                SendAttempt::Registered
            }
            None => SendAttempt::Refused(value),
        }
    }

    /// Receives a value, suspending the calling coroutine until one is available.
    ///
    /// Returns `None` once the channel is closed and its buffer is drained; every subsequent
    /// call returns `None` immediately.
    pub fn receive(&self, ctx: &Context) -> Option<T> {
        self.receive_with_more(ctx).0
    }

    /// Like [`receive`][Self::receive], but also reports whether more values may follow.
    ///
    /// `(Some(value), true)` for a delivered value; `(None, false)` once the channel is closed
    /// and drained.
    pub fn receive_with_more(&self, ctx: &Context) -> (Option<T>, bool) {
        let outcome: Arc<Mutex<Option<(Option<T>, bool)>>> = Arc::new(Mutex::new(None));
        let callback: ReceiveCallback<T> = Box::new({
            let outcome = Arc::clone(&outcome);
            move |value, more| {
                *outcome.lock().expect(ERR_POISONED_LOCK) = Some((value, more));
                None
            }
        });

        match self.receive_impl(Some(callback)) {
            TryReceive::Value(value) => {
                ctx.coroutine().unblocked();
                (Some(value), true)
            }
            TryReceive::Closed => {
                ctx.coroutine().unblocked();
                (None, false)
            }
            TryReceive::Pending => {
                let status = format!("blocked on {}.Receive", self.name());

                loop {
                    ctx.coroutine().suspend(&status);

                    if let Some(result) = outcome.lock().expect(ERR_POISONED_LOCK).take() {
                        ctx.coroutine().unblocked();
                        return result;
                    }
                }
            }
        }
    }

    /// Attempts to receive without blocking. `None` means either "nothing available" or
    /// "closed"; use [`receive_async_with_more`][Self::receive_async_with_more] to tell the
    /// two apart.
    #[must_use]
    pub fn receive_async(&self) -> Option<T> {
        self.receive_async_with_more().0
    }

    /// Attempts to receive without blocking. `(None, true)` means the channel is open but has
    /// nothing available; `(None, false)` means it is closed and drained.
    #[must_use]
    pub fn receive_async_with_more(&self) -> (Option<T>, bool) {
        match self.receive_impl(None) {
            TryReceive::Value(value) => (Some(value), true),
            TryReceive::Closed => (None, false),
            TryReceive::Pending => (None, true),
        }
    }

    /// Selector support: attempt a synchronous receive, registering `callback` on failure.
    pub(crate) fn receive_or_register(&self, callback: ReceiveCallback<T>) -> TryReceive<T> {
        self.receive_impl(Some(callback))
    }

    fn receive_impl(&self, callback: Option<ReceiveCallback<T>>) -> TryReceive<T> {
        let mut state = self.core.state.lock().expect(ERR_POISONED_LOCK);

        if let Some(value) = state.buffer.pop_front() {
            // The freed buffer slot goes to the longest-waiting sender that still wants it.
            while let Some(pending) = state.pending_sends.pop_front() {
                if (pending.accepted)() {
                    state.buffer.push_back(pending.value);
                    break;
                }
            }

            return TryReceive::Value(value);
        }

        if state.closed {
            return TryReceive::Closed;
        }

        while let Some(pending) = state.pending_sends.pop_front() {
            if (pending.accepted)() {
                return TryReceive::Value(pending.value);
            }
        }

        if let Some(callback) = callback {
            state.pending_receives.push_back(callback);
        }

        TryReceive::Pending
    }

    /// Closes the channel.
    ///
    /// Every registered receiver is woken with `(None, false)` in FIFO order. Every pending
    /// sender's accept callback is invoked and its value dropped; those senders observe the
    /// closed channel on their next resume and fail with [`Error::ClosedChannel`]. Closing an
    /// already-closed channel is a no-op.
    pub fn close(&self) {
        let (receivers, senders) = {
            let mut state = self.core.state.lock().expect(ERR_POISONED_LOCK);

            if state.closed {
                return;
            }
            state.closed = true;

            (
                mem::take(&mut state.pending_receives),
                mem::take(&mut state.pending_sends),
            )
        };

        // Callbacks run outside the lock; they may latch selector state but never re-enter
        // this channel.
        for receiver in receivers {
            _ = receiver(None, false);
        }

        for pending in senders {
            _ = (pending.accepted)();
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_receive_count(&self) -> usize {
        self.core
            .state
            .lock()
            .expect(ERR_POISONED_LOCK)
            .pending_receives
            .len()
    }
}
