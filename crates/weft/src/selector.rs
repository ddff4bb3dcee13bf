// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::panic;
use std::sync::{Arc, Mutex};

use crate::channel::{AcceptCallback, ReceiveCallback, TryReceive};
use crate::{Channel, Context, ERR_POISONED_LOCK, Error, Promise, Result};

type Branch = Box<dyn FnOnce() + Send>;

/// The one-winner latch shared by every registered callback of a selector.
///
/// The first callback to observe `Pending` latches its branch; every later callback sees
/// `Ready` or `Fired` and refuses, handing values back to their channels. The slot never
/// returns to `Pending`, so callbacks left behind on channels after the selector returned
/// keep refusing forever.
enum WinnerState {
    Pending,
    Ready(Branch),
    Fired,
}

type WinnerSlot = Arc<Mutex<WinnerState>>;

fn is_pending(slot: &WinnerState) -> bool {
    matches!(slot, WinnerState::Pending)
}

/// One case of a selector. Each implementation holds its event source and its handler; the
/// handler lives in a take-once slot so it can fire at most once no matter which path wins.
trait SelectorCase: Send {
    /// Non-registering probe. Fires the handler and returns `true` on synchronous readiness.
    fn probe(&mut self) -> bool;

    /// Probe; on a miss, register a callback that latches into `winner` when the external
    /// event fires. Fires the handler and returns `true` on synchronous readiness.
    fn probe_or_register(&mut self, winner: &WinnerSlot) -> bool;
}

/// A one-shot disjunctive wait over channel receive/send readiness and future completion.
///
/// Cases are probed in insertion order: [`select`][Self::select] fires the first
/// synchronously-ready case, or the default if one is configured and nothing is ready, or
/// suspends the calling coroutine until the first external event arrives - at which point
/// exactly one handler runs and every other case stands down.
///
/// Construct selectors through [`Context::new_selector`] so their diagnostic names stay
/// deterministic. A selector is consumed by its single `select` call.
pub struct Selector {
    name: String,
    cases: Vec<Box<dyn SelectorCase>>,
    default_case: Option<Branch>,
    consumed: bool,
}

impl fmt::Debug for Selector {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("name", &self.name)
            .field("cases", &self.cases.len())
            .field("has_default", &self.default_case.is_some())
            .finish()
    }
}

impl Selector {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            cases: Vec::new(),
            default_case: None,
            consumed: false,
        }
    }

    /// The human-readable name of the selector, used in block statuses and diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a receive case. The handler receives the value, or `None` when the channel
    /// delivered its close signal.
    pub fn add_receive<T>(
        &mut self,
        channel: &Channel<T>,
        handler: impl FnOnce(Option<T>) + Send + 'static,
    ) -> &mut Self
    where
        T: Send + 'static,
    {
        self.add_receive_with_more(channel, move |value, _more| handler(value))
    }

    /// Adds a receive case whose handler also observes the more-values-may-follow flag.
    pub fn add_receive_with_more<T>(
        &mut self,
        channel: &Channel<T>,
        handler: impl FnOnce(Option<T>, bool) + Send + 'static,
    ) -> &mut Self
    where
        T: Send + 'static,
    {
        self.cases.push(Box::new(ReceiveCase {
            channel: channel.clone(),
            handler: Arc::new(Mutex::new(Some(Box::new(handler)))),
        }));
        self
    }

    /// Adds a send case offering `value` to `channel`. The handler runs once the value has
    /// been delivered or buffered.
    pub fn add_send<T>(
        &mut self,
        channel: &Channel<T>,
        value: T,
        handler: impl FnOnce() + Send + 'static,
    ) -> &mut Self
    where
        T: Send + 'static,
    {
        self.cases.push(Box::new(SendCase {
            channel: channel.clone(),
            value: Some(value),
            handler: Arc::new(Mutex::new(Some(Box::new(handler)))),
        }));
        self
    }

    /// Adds a future-ready case. The handler receives a clone of the future's outcome.
    pub fn add_promise<T>(
        &mut self,
        promise: &Promise<T>,
        handler: impl FnOnce(Result<T>) + Send + 'static,
    ) -> &mut Self
    where
        T: Clone + Send + 'static,
    {
        self.cases.push(Box::new(PromiseCase {
            promise: promise.clone(),
            handler: Arc::new(Mutex::new(Some(Box::new(handler)))),
        }));
        self
    }

    /// Sets the default case, which fires when no other case is synchronously ready.
    ///
    /// # Panics
    ///
    /// Panics if a default is already configured.
    pub fn add_default(&mut self, handler: impl FnOnce() + Send + 'static) -> &mut Self {
        assert!(
            self.default_case.is_none(),
            "selector already has a default case"
        );

        self.default_case = Some(Box::new(handler));
        self
    }

    /// Waits for the first ready case and runs its handler.
    ///
    /// Performs one round of probes in insertion order. If a case is synchronously ready its
    /// handler runs immediately; otherwise the default fires if present; otherwise the calling
    /// coroutine suspends until the first external event latches a winner. With a default
    /// configured the probes never register callbacks, so no trace of the selector is left on
    /// any channel.
    ///
    /// # Panics
    ///
    /// Panics if the selector has already been consumed by an earlier `select`.
    pub fn select(&mut self, ctx: &Context) {
        assert!(!self.consumed, "selector was already consumed");
        self.consumed = true;

        if self.default_case.is_some() {
            for case in &mut self.cases {
                if case.probe() {
                    ctx.coroutine().unblocked();
                    return;
                }
            }

            let default_case = self
                .default_case
                .take()
                .expect("presence checked just above");
            default_case();
            return;
        }

        let winner: WinnerSlot = Arc::new(Mutex::new(WinnerState::Pending));

        for case in &mut self.cases {
            if case.probe_or_register(&winner) {
                // Callbacks already registered by earlier cases must refuse from now on.
                *winner.lock().expect(ERR_POISONED_LOCK) = WinnerState::Fired;
                ctx.coroutine().unblocked();
                return;
            }
        }

        let status = format!("blocked on {}.Select", self.name);

        loop {
            let branch = {
                let mut slot = winner.lock().expect(ERR_POISONED_LOCK);

                if matches!(*slot, WinnerState::Ready(_)) {
                    match std::mem::replace(&mut *slot, WinnerState::Fired) {
                        WinnerState::Ready(branch) => Some(branch),
                        _ => unreachable!("we are re-matching an already matched pattern"),
                    }
                } else {
                    None
                }
            };

            if let Some(branch) = branch {
                branch();
                ctx.coroutine().unblocked();
                return;
            }

            ctx.coroutine().suspend(&status);
        }
    }
}

struct ReceiveCase<T> {
    channel: Channel<T>,
    handler: Arc<Mutex<Option<Box<dyn FnOnce(Option<T>, bool) + Send>>>>,
}

impl<T> ReceiveCase<T> {
    fn fire(&self, value: Option<T>, more: bool) {
        let handler = self
            .handler
            .lock()
            .expect(ERR_POISONED_LOCK)
            .take()
            .expect("selector case fired twice");
        handler(value, more);
    }
}

impl<T> SelectorCase for ReceiveCase<T>
where
    T: Send + 'static,
{
    fn probe(&mut self) -> bool {
        match self.channel.receive_async_with_more() {
            (None, true) => false,
            (value, more) => {
                self.fire(value, more);
                true
            }
        }
    }

    fn probe_or_register(&mut self, winner: &WinnerSlot) -> bool {
        let handler = Arc::clone(&self.handler);
        let winner_slot = Arc::clone(winner);

        let callback: ReceiveCallback<T> = Box::new(move |value, more| {
            let mut slot = winner_slot.lock().expect(ERR_POISONED_LOCK);

            if !is_pending(&slot) {
                return value;
            }

            let Some(handler) = handler.lock().expect(ERR_POISONED_LOCK).take() else {
                return value;
            };

            *slot = WinnerState::Ready(Box::new(move || handler(value, more)));
            None
        });

        match self.channel.receive_or_register(callback) {
            TryReceive::Value(value) => {
                self.fire(Some(value), true);
                true
            }
            TryReceive::Closed => {
                self.fire(None, false);
                true
            }
            TryReceive::Pending => false,
        }
    }
}

struct SendCase<T> {
    channel: Channel<T>,
    value: Option<T>,
    handler: Arc<Mutex<Option<Branch>>>,
}

impl<T> SendCase<T> {
    fn fire(&self) {
        let handler = self
            .handler
            .lock()
            .expect(ERR_POISONED_LOCK)
            .take()
            .expect("selector case fired twice");
        handler();
    }
}

impl<T> SelectorCase for SendCase<T>
where
    T: Send + 'static,
{
    fn probe(&mut self) -> bool {
        let value = self.value.take().expect("send case probed twice");

        match self.channel.send_async(value) {
            Ok(()) => {
                self.fire();
                true
            }
            Err(value) => {
                self.value = Some(value);
                false
            }
        }
    }

    fn probe_or_register(&mut self, winner: &WinnerSlot) -> bool {
        let value = self.value.take().expect("send case probed twice");
        let handler = Arc::clone(&self.handler);
        let winner_slot = Arc::clone(winner);

        let accepted: AcceptCallback = Box::new(move || {
            let mut slot = winner_slot.lock().expect(ERR_POISONED_LOCK);

            if !is_pending(&slot) {
                return false;
            }

            let Some(handler) = handler.lock().expect(ERR_POISONED_LOCK).take() else {
                return false;
            };

            *slot = WinnerState::Ready(handler);
            true
        });

        if self.channel.send_or_register(value, accepted) {
            self.fire();
            true
        } else {
            false
        }
    }
}

struct PromiseCase<T> {
    promise: Promise<T>,
    handler: Arc<Mutex<Option<Box<dyn FnOnce(Result<T>) + Send>>>>,
}

impl<T> PromiseCase<T>
where
    T: Clone + Send + 'static,
{
    fn fire(&self) {
        let handler = self
            .handler
            .lock()
            .expect(ERR_POISONED_LOCK)
            .take()
            .expect("selector case fired twice");

        let outcome = self
            .promise
            .outcome_cloned()
            .unwrap_or_else(|| panic::panic_any(Error::NotReady));
        handler(outcome);
    }
}

impl<T> SelectorCase for PromiseCase<T>
where
    T: Clone + Send + 'static,
{
    fn probe(&mut self) -> bool {
        if self.promise.is_ready() {
            self.fire();
            true
        } else {
            false
        }
    }

    fn probe_or_register(&mut self, winner: &WinnerSlot) -> bool {
        let handler = Arc::clone(&self.handler);
        let winner_slot = Arc::clone(winner);
        let promise = self.promise.clone();

        let callback: ReceiveCallback<()> = Box::new(move |_value, _more| {
            let mut slot = winner_slot.lock().expect(ERR_POISONED_LOCK);

            if !is_pending(&slot) {
                return None;
            }

            let Some(handler) = handler.lock().expect(ERR_POISONED_LOCK).take() else {
                return None;
            };

            let outcome = promise
                .outcome_cloned()
                .unwrap_or_else(|| panic::panic_any(Error::NotReady));
            *slot = WinnerState::Ready(Box::new(move || handler(outcome)));
            None
        });

        if self.promise.subscribe(callback) {
            self.fire();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::test_support::run_workflow;

    #[test]
    fn default_fires_and_leaves_no_callback_behind() {
        // A selector over an empty channel with a default must fire the default and must not
        // leave a registered receiver on the channel.

        let (_dispatcher, result) = run_workflow(|ctx| {
            let chan = ctx.new_channel::<i32>(0);
            let default_fired = Arc::new(AtomicBool::new(false));

            let mut selector = ctx.new_selector();
            selector
                .add_receive(&chan, |_value| {
                    panic!("the receive case must not fire");
                })
                .add_default({
                    let default_fired = Arc::clone(&default_fired);
                    move || default_fired.store(true, Ordering::Relaxed)
                });
            selector.select(&ctx);

            assert!(default_fired.load(Ordering::Relaxed));
            assert_eq!(chan.pending_receive_count(), 0);
        });

        assert!(result.is_ok());
    }

    #[test]
    fn default_stands_down_when_a_case_is_ready() {
        let (_dispatcher, result) = run_workflow(|ctx| {
            let chan = ctx.new_channel::<i32>(1);
            assert!(chan.send_async(3).is_ok());

            let received = Arc::new(Mutex::new(None));

            let mut selector = ctx.new_selector();
            selector
                .add_receive(&chan, {
                    let received = Arc::clone(&received);
                    move |value| *received.lock().expect(ERR_POISONED_LOCK) = value
                })
                .add_default(|| panic!("the default must not fire"));
            selector.select(&ctx);

            assert_eq!(*received.lock().expect(ERR_POISONED_LOCK), Some(3));
        });

        assert!(result.is_ok());
    }

    #[test]
    fn earliest_ready_case_wins_and_no_other_handler_runs() {
        // Both channels hold a value; the case added first must fire and the other channel
        // must keep its value.

        let (_dispatcher, result) = run_workflow(|ctx| {
            let first = ctx.new_channel::<i32>(1);
            let second = ctx.new_channel::<i32>(1);
            assert!(first.send_async(1).is_ok());
            assert!(second.send_async(2).is_ok());

            let winner = Arc::new(Mutex::new(None));

            let mut selector = ctx.new_selector();
            selector
                .add_receive(&first, {
                    let winner = Arc::clone(&winner);
                    move |value| *winner.lock().expect(ERR_POISONED_LOCK) = value
                })
                .add_receive(&second, |_value| {
                    panic!("only the earliest ready case may fire");
                });
            selector.select(&ctx);

            assert_eq!(*winner.lock().expect(ERR_POISONED_LOCK), Some(1));
            assert_eq!(second.receive_async(), Some(2));
        });

        assert!(result.is_ok());
    }

    #[test]
    fn blocked_select_wakes_on_the_first_external_event() {
        let observed = Arc::new(Mutex::new(None));
        let fired = Arc::clone(&observed);

        let (dispatcher, result) = run_workflow(move |ctx| {
            let quiet = ctx.new_channel::<i32>(0);
            let active = ctx.new_channel::<i32>(0);

            ctx.new_coroutine({
                let quiet = quiet.clone();
                let active = active.clone();
                move |ctx| {
                    let mut selector = ctx.new_selector();
                    selector
                        .add_receive(&quiet, |_value| panic!("no event arrives on this channel"))
                        .add_receive(&active, {
                            let fired = Arc::clone(&fired);
                            move |value| *fired.lock().expect(ERR_POISONED_LOCK) = value
                        });
                    selector.select(&ctx);
                }
            });

            ctx.new_coroutine(move |ctx| active.send(&ctx, 11));
        });

        assert!(result.is_ok());
        assert!(dispatcher.is_done());
        assert_eq!(*observed.lock().expect(ERR_POISONED_LOCK), Some(11));
    }

    #[test]
    fn stale_callbacks_refuse_values_after_the_selector_returned() {
        // The losing case's callback stays registered on its channel but must hand any later
        // value straight back.

        let (_dispatcher, result) = run_workflow(|ctx| {
            let loser = ctx.new_channel::<i32>(0);
            let winner_chan = ctx.new_channel::<i32>(1);
            assert!(winner_chan.send_async(1).is_ok());

            let mut selector = ctx.new_selector();
            selector
                .add_receive(&loser, |_value| panic!("the losing case must not fire"))
                .add_receive(&winner_chan, |_value| {});
            selector.select(&ctx);

            // The stale callback refuses the value, so an async send finds no taker.
            assert_eq!(loser.pending_receive_count(), 1);
            assert_eq!(loser.send_async(99), Err(99));
            assert_eq!(loser.pending_receive_count(), 0);
        });

        assert!(result.is_ok());
    }

    #[test]
    fn send_case_completes_when_a_receiver_arrives() {
        let observed = Arc::new(Mutex::new(None));
        let received = Arc::clone(&observed);
        let sent = Arc::new(AtomicBool::new(false));
        let sent_flag = Arc::clone(&sent);

        let (dispatcher, result) = run_workflow(move |ctx| {
            let chan = ctx.new_channel::<i32>(0);

            ctx.new_coroutine({
                let chan = chan.clone();
                move |ctx| {
                    let mut selector = ctx.new_selector();
                    selector.add_send(&chan, 7, move || sent_flag.store(true, Ordering::Relaxed));
                    selector.select(&ctx);
                }
            });

            ctx.new_coroutine(move |ctx| {
                *received.lock().expect(ERR_POISONED_LOCK) = chan.receive(&ctx);
            });
        });

        assert!(result.is_ok());
        assert!(dispatcher.is_done());
        assert!(sent.load(Ordering::Relaxed));
        assert_eq!(*observed.lock().expect(ERR_POISONED_LOCK), Some(7));
    }

    #[test]
    fn ready_promise_case_fires_synchronously() {
        let (_dispatcher, result) = run_workflow(|ctx| {
            let promise = ctx.new_promise::<i32>();
            promise.set_value(21);

            let observed = Arc::new(Mutex::new(None));

            let mut selector = ctx.new_selector();
            selector.add_promise(&promise, {
                let observed = Arc::clone(&observed);
                move |outcome| *observed.lock().expect(ERR_POISONED_LOCK) = Some(outcome)
            });
            selector.select(&ctx);

            assert_eq!(*observed.lock().expect(ERR_POISONED_LOCK), Some(Ok(21)));
        });

        assert!(result.is_ok());
    }

    #[test]
    fn blocked_promise_case_wakes_when_the_promise_is_set() {
        let observed = Arc::new(Mutex::new(None));
        let outcome_slot = Arc::clone(&observed);

        let (dispatcher, result) = run_workflow(move |ctx| {
            let promise = ctx.new_promise::<String>();

            ctx.new_coroutine({
                let promise = promise.clone();
                move |ctx| {
                    let mut selector = ctx.new_selector();
                    selector.add_promise(&promise, move |outcome| {
                        *outcome_slot.lock().expect(ERR_POISONED_LOCK) = Some(outcome);
                    });
                    selector.select(&ctx);
                }
            });

            ctx.new_coroutine(move |_ctx| promise.set_value("ready".to_string()));
        });

        assert!(result.is_ok());
        assert!(dispatcher.is_done());
        assert_eq!(
            *observed.lock().expect(ERR_POISONED_LOCK),
            Some(Ok("ready".to_string()))
        );
    }

    #[test]
    fn selecting_twice_aborts_the_coroutine() {
        let (_dispatcher, result) = run_workflow(|ctx| {
            let mut selector = ctx.new_selector();
            selector.add_default(|| {});
            selector.select(&ctx);
            selector.select(&ctx);
        });

        let panic = result.expect_err("the second select must abort the workflow");
        assert!(panic.message().contains("already consumed"));
    }

    #[test]
    fn closed_channel_counts_as_a_ready_receive_case() {
        let (_dispatcher, result) = run_workflow(|ctx| {
            let chan = ctx.new_channel::<i32>(0);
            chan.close();

            let observed = Arc::new(Mutex::new(None));

            let mut selector = ctx.new_selector();
            selector.add_receive_with_more(&chan, {
                let observed = Arc::clone(&observed);
                move |value, more| *observed.lock().expect(ERR_POISONED_LOCK) = Some((value, more))
            });
            selector.select(&ctx);

            assert_eq!(
                *observed.lock().expect(ERR_POISONED_LOCK),
                Some((None, false))
            );
        });

        assert!(result.is_ok());
    }
}
