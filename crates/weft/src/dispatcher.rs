// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::{fmt, mem, panic, thread};

use scopeguard::defer;

use crate::coroutine::{CoroutineState, spawn_host_thread};
use crate::{Context, ERR_POISONED_LOCK, Error, PanicError, RootState};

/// Owns the coroutines of one workflow execution and drives them round-robin until every
/// survivor is blocked or the workflow is finished.
///
/// The dispatcher is invoked by the outer engine once per decision task via
/// [`execute_until_all_blocked`][Self::execute_until_all_blocked]. Coroutines spawned during a
/// pass are appended to the round-robin and observed before the pass is allowed to conclude.
/// Dropping the dispatcher closes it, terminating any still-live coroutines.
///
/// # Thread safety
///
/// The handle may be held on any thread, but only one thread may drive it at a time -
/// re-entrant execution is rejected as misuse.
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
}

impl fmt::Debug for Dispatcher {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field(
                "live_coroutines",
                &self.core.coroutines.lock().expect(ERR_POISONED_LOCK).len(),
            )
            .finish()
    }
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            core: Arc::new_cyclic(|weak_self| DispatcherCore {
                weak_self: weak_self.clone(),
                coroutine_sequence: AtomicU64::new(0),
                channel_sequence: AtomicU64::new(0),
                selector_sequence: AtomicU64::new(0),
                coroutines: Mutex::new(Vec::new()),
                run_state: Mutex::new(RunState {
                    executing: false,
                    closed: false,
                }),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<DispatcherCore> {
        &self.core
    }

    /// Drives every live coroutine until all of them are blocked without progress and no new
    /// coroutine was spawned during the final pass, or until the first captured panic.
    ///
    /// # Errors
    ///
    /// Returns the first panic captured from a coroutine during the run.
    ///
    /// # Panics
    ///
    /// Panics on misuse: re-entrant invocation or invocation after [`close`][Self::close].
    pub fn execute_until_all_blocked(&self) -> std::result::Result<(), PanicError> {
        self.core.execute_until_all_blocked()
    }

    /// Whether no coroutines remain.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    /// Terminates every live coroutine and joins its host thread. Safe to call multiple times.
    pub fn close(&self) {
        self.core.close();
    }

    /// Captures the stack of every live coroutine at its current block point, without
    /// resuming any of them.
    #[must_use]
    pub fn stack_trace(&self) -> String {
        self.core.stack_trace()
    }
}

impl Drop for Dispatcher {
    // Inconvenient to test because we would be checking for "does some code stop executing".
    #[cfg_attr(test, mutants::skip)]
    fn drop(&mut self) {
        self.close();
    }
}

struct RunState {
    executing: bool,
    closed: bool,
}

struct CoroutineEntry {
    state: Arc<CoroutineState>,
    host: Option<thread::JoinHandle<()>>,
}

/// Shared dispatcher state. Contexts hold a `Weak` reference to this so that channel, selector
/// and coroutine construction can consult the naming counters; the dispatcher in turn owns the
/// coroutine states, so no reference cycle forms.
pub(crate) struct DispatcherCore {
    /// Handed to every spawned coroutine state so contexts can find their way back here
    /// without keeping the dispatcher alive.
    weak_self: Weak<DispatcherCore>,

    /// Count of coroutines ever spawned. Doubles as the progress check for spawns: a pass that
    /// observes the same sequence at both ends spawned nothing.
    coroutine_sequence: AtomicU64,

    channel_sequence: AtomicU64,
    selector_sequence: AtomicU64,

    coroutines: Mutex<Vec<CoroutineEntry>>,

    /// The only fields touched outside the single-runner discipline, hence the mutex.
    run_state: Mutex<RunState>,
}

impl DispatcherCore {
    /// Spawns a coroutine on a fresh host thread and appends it to the round-robin.
    ///
    /// Unnamed coroutines are named by their spawn ordinal as a decimal string.
    pub(crate) fn spawn(
        &self,
        root: &Arc<RootState>,
        name: Option<String>,
        f: Box<dyn FnOnce(Context) + Send>,
    ) -> Arc<CoroutineState> {
        let ordinal = self
            .coroutine_sequence
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let name = name.unwrap_or_else(|| ordinal.to_string());

        let state = CoroutineState::new(name, self.weak_self.clone());
        let ctx = Context::new(Arc::clone(root), Arc::clone(&state));
        let host = spawn_host_thread(&state, ctx, f);

        self.coroutines
            .lock()
            .expect(ERR_POISONED_LOCK)
            .push(CoroutineEntry {
                state: Arc::clone(&state),
                host: Some(host),
            });

        state
    }

    pub(crate) fn next_channel_name(&self) -> String {
        let ordinal = self
            .channel_sequence
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        format!("chan-{ordinal}")
    }

    pub(crate) fn next_selector_name(&self) -> String {
        let ordinal = self
            .selector_sequence
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        format!("selector-{ordinal}")
    }

    #[cfg_attr(test, mutants::skip)] // Critical scheduling loop - tests hang if tampered with.
    fn execute_until_all_blocked(&self) -> std::result::Result<(), PanicError> {
        // The misuse asserts fire after the lock is released so a rejected nested call cannot
        // poison the run state of the outer one.
        let (was_closed, was_executing) = {
            let mut run_state = self.run_state.lock().expect(ERR_POISONED_LOCK);
            let snapshot = (run_state.closed, run_state.executing);

            if snapshot == (false, false) {
                run_state.executing = true;
            }

            snapshot
        };

        if was_closed {
            panic::panic_any(Error::DispatcherMisuse(
                "execute_until_all_blocked on a closed dispatcher".to_string(),
            ));
        }

        if was_executing {
            panic::panic_any(Error::DispatcherMisuse(
                "execute_until_all_blocked is not reentrant".to_string(),
            ));
        }

        defer! {
            self.run_state.lock().expect(ERR_POISONED_LOCK).executing = false;
        }

        loop {
            let last_sequence = self.coroutine_sequence.load(Ordering::Relaxed);
            let mut all_blocked = true;
            let mut index = 0;

            // The list is re-inspected on every step because a running coroutine may append
            // new entries behind the cursor; they get their first call within this same pass.
            loop {
                let Some(state) = self.coroutine_at(index) else {
                    break;
                };

                if !state.is_closed() {
                    state.call();
                }

                if state.is_closed() {
                    if let Some(host) = self.remove_coroutine(index) {
                        _ = host.join();
                    }

                    if let Some(panic) = state.take_panic() {
                        return Err(panic);
                    }
                } else {
                    all_blocked = all_blocked && state.kept_blocked();
                    index += 1;
                }
            }

            if self.is_done() {
                break;
            }

            let spawned_during_pass =
                last_sequence != self.coroutine_sequence.load(Ordering::Relaxed);
            if all_blocked && !spawned_during_pass {
                break;
            }
        }

        Ok(())
    }

    fn coroutine_at(&self, index: usize) -> Option<Arc<CoroutineState>> {
        self.coroutines
            .lock()
            .expect(ERR_POISONED_LOCK)
            .get(index)
            .map(|entry| Arc::clone(&entry.state))
    }

    fn remove_coroutine(&self, index: usize) -> Option<thread::JoinHandle<()>> {
        let mut entry = self
            .coroutines
            .lock()
            .expect(ERR_POISONED_LOCK)
            .remove(index);
        entry.host.take()
    }

    fn is_done(&self) -> bool {
        self.coroutines
            .lock()
            .expect(ERR_POISONED_LOCK)
            .is_empty()
    }

    #[cfg_attr(test, mutants::skip)] // Tests hang on leaked host threads if mutated away.
    fn close(&self) {
        {
            let mut run_state = self.run_state.lock().expect(ERR_POISONED_LOCK);

            if run_state.closed {
                return;
            }
            run_state.closed = true;
        }

        let entries = mem::take(&mut *self.coroutines.lock().expect(ERR_POISONED_LOCK));

        for mut entry in entries {
            entry.state.exit();

            if let Some(host) = entry.host.take() {
                _ = host.join();
            }
        }
    }

    fn stack_trace(&self) -> String {
        let states: Vec<_> = self
            .coroutines
            .lock()
            .expect(ERR_POISONED_LOCK)
            .iter()
            .map(|entry| Arc::clone(&entry.state))
            .collect();

        states
            .iter()
            .filter_map(|state| state.capture_stack_trace())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl fmt::Debug for DispatcherCore {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherCore").finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::test_support::run_workflow;

    #[test]
    fn coroutines_spawned_mid_pass_run_within_the_same_call() {
        // The root spawns A, which spawns B; a single dispatcher call must run all three to
        // completion.

        let log = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::clone(&log);

        let (dispatcher, result) = run_workflow(move |ctx| {
            events.lock().expect(ERR_POISONED_LOCK).push("root");

            ctx.new_coroutine({
                let events = Arc::clone(&events);
                move |ctx| {
                    events.lock().expect(ERR_POISONED_LOCK).push("a");

                    ctx.new_coroutine(move |_ctx| {
                        events.lock().expect(ERR_POISONED_LOCK).push("b");
                    });
                }
            });
        });

        assert!(result.is_ok());
        assert!(dispatcher.is_done());
        assert_eq!(
            *log.lock().expect(ERR_POISONED_LOCK),
            vec!["root", "a", "b"]
        );
    }

    #[test]
    fn execute_returns_while_a_coroutine_stays_blocked() {
        let (dispatcher, result) = run_workflow(|ctx| {
            let chan = ctx.new_channel::<i32>(0);

            ctx.new_coroutine(move |ctx| {
                chan.receive(&ctx);
            });
        });

        assert!(result.is_ok());
        assert!(!dispatcher.is_done());

        dispatcher.close();
        assert!(dispatcher.is_done());
    }

    #[test]
    fn panic_in_a_coroutine_is_returned_with_a_clean_trace() {
        let (dispatcher, result) = run_workflow(|_ctx| {
            panic!("explode");
        });

        let panic = result.expect_err("the panic must surface");
        assert_eq!(panic.message(), "explode");
        assert!(!panic.backtrace().contains("weft::coroutine::CoroutineState"));
        assert!(dispatcher.is_done());
    }

    #[test]
    fn reentrant_execution_is_rejected() {
        let (_dispatcher, result) = run_workflow(|ctx| {
            // Reach back into the dispatcher from workflow code; the nested call must be
            // rejected and the rejection surfaces like any other coroutine panic.
            _ = ctx.coroutine().dispatcher().execute_until_all_blocked();
        });

        let panic = result.expect_err("the nested call must abort the workflow");
        assert!(panic.message().contains("not reentrant"));
    }

    #[test]
    fn execution_after_close_is_rejected() {
        let (dispatcher, result) = run_workflow(|_ctx| {});
        assert!(result.is_ok());

        dispatcher.close();

        let payload =
            panic::catch_unwind(panic::AssertUnwindSafe(|| dispatcher.execute_until_all_blocked()))
                .expect_err("executing a closed dispatcher must panic");
        assert!(matches!(
            payload.downcast_ref::<Error>(),
            Some(Error::DispatcherMisuse(reason)) if reason.contains("closed dispatcher")
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let (dispatcher, result) = run_workflow(|ctx| {
            let chan = ctx.new_channel::<i32>(0);
            ctx.new_coroutine(move |ctx| {
                chan.receive(&ctx);
            });
        });

        assert!(result.is_ok());

        dispatcher.close();
        dispatcher.close();
        assert!(dispatcher.is_done());
    }

    #[test]
    fn stack_trace_reports_block_statuses_without_resuming() {
        let (dispatcher, result) = run_workflow(|ctx| {
            let chan = ctx.new_named_channel::<i32>("inbox", 0);
            ctx.new_named_coroutine("listener", move |ctx| {
                chan.receive(&ctx);
            });
        });

        assert!(result.is_ok());

        let trace = dispatcher.stack_trace();
        assert!(trace.contains("listener"));
        assert!(trace.contains("blocked on inbox.Receive"));

        // The probe is observational: the listener must still be blocked afterwards.
        assert!(dispatcher.execute_until_all_blocked().is_ok());
        assert!(!dispatcher.is_done());

        dispatcher.close();
    }

    #[test]
    fn identical_runs_produce_identical_event_sequences() {
        // Two executions of the same workflow over the same inputs must interleave their
        // coroutines identically. This is the replay guarantee the outer engine depends on.

        fn run_once() -> Vec<String> {
            let log = Arc::new(Mutex::new(Vec::new()));
            let events = Arc::clone(&log);

            let (dispatcher, result) = run_workflow(move |ctx| {
                let chan = ctx.new_channel::<i32>(1);

                for worker in 0..3 {
                    let chan = chan.clone();
                    let events = Arc::clone(&events);
                    ctx.new_coroutine(move |ctx| {
                        while let Some(value) = chan.receive(&ctx) {
                            events
                                .lock()
                                .expect(ERR_POISONED_LOCK)
                                .push(format!("worker-{worker} got {value}"));
                        }
                    });
                }

                ctx.new_coroutine(move |ctx| {
                    for value in 0..6 {
                        chan.send(&ctx, value);
                    }
                    chan.close();
                });
            });

            assert!(result.is_ok());
            assert!(dispatcher.is_done());

            Arc::try_unwrap(log)
                .expect("all other references are gone once the dispatcher is done")
                .into_inner()
                .expect(ERR_POISONED_LOCK)
        }

        assert_eq!(run_once(), run_once());
    }
}
