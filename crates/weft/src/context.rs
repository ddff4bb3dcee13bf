// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::coroutine::CoroutineState;
use crate::{
    Channel, ERR_POISONED_LOCK, Promise, Result, Selector, WorkflowEnvironment, WorkflowInfo,
};

/// The terminal outcome of the root coroutine: serialized result bytes or an error.
pub(crate) type WorkflowOutcome = Result<Option<Vec<u8>>>;

/// State shared by every context of one workflow execution: the environment handle, the root
/// result slot, and the cancellation signal.
pub(crate) struct RootState {
    env: Arc<dyn WorkflowEnvironment>,

    /// Initially empty; set exactly once, when the root coroutine returns. The driver reads it
    /// after each dispatcher run to decide whether the workflow is complete.
    result: Mutex<Option<WorkflowOutcome>>,

    /// Closed when cancellation is requested. Handed to workflow code via [`Context::done`] so
    /// cancellation composes with selectors like any other channel event.
    done: Channel<()>,

    cancel_requested: AtomicBool,
}

impl RootState {
    pub(crate) fn new(env: Arc<dyn WorkflowEnvironment>) -> Arc<Self> {
        Arc::new(Self {
            env,
            result: Mutex::new(None),
            done: Channel::new("done".to_string(), 0),
            cancel_requested: AtomicBool::new(false),
        })
    }

    pub(crate) fn env(&self) -> &Arc<dyn WorkflowEnvironment> {
        &self.env
    }

    pub(crate) fn done(&self) -> &Channel<()> {
        &self.done
    }

    /// Requests cancellation. May be invoked any number of times, from any thread, including
    /// before the dispatcher ever ran; only the first request closes the done channel.
    pub(crate) fn cancel(&self) {
        if !self.cancel_requested.swap(true, Ordering::Relaxed) {
            self.done.close();
        }
    }

    pub(crate) fn set_result(&self, outcome: WorkflowOutcome) {
        let mut slot = self.result.lock().expect(ERR_POISONED_LOCK);

        assert!(slot.is_none(), "root workflow result was set twice");
        *slot = Some(outcome);
    }

    pub(crate) fn take_result(&self) -> Option<WorkflowOutcome> {
        self.result.lock().expect(ERR_POISONED_LOCK).take()
    }
}

impl fmt::Debug for RootState {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootState")
            .field("cancel_requested", &self.cancel_requested)
            .finish()
    }
}

/// The cooperative context handed to every coroutine.
///
/// A context identifies the coroutine it belongs to and carries the execution-wide root state.
/// It is the factory for everything a workflow interacts with - child coroutines, channels,
/// selectors and promises - so that their diagnostic names stay deterministic across replays.
/// Child coroutines receive their own context; a context must only be used from the coroutine
/// it was issued to.
///
/// Auto-generated names are `chan-<n>` for channels and `selector-<n>` for selectors, with a
/// monotonic per-kind counter; unnamed coroutines are named by their spawn ordinal as a
/// decimal string. These names appear only in diagnostics.
#[derive(Clone)]
pub struct Context {
    root: Arc<RootState>,
    coroutine: Arc<CoroutineState>,
}

impl fmt::Debug for Context {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("coroutine", &self.coroutine.name())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(root: Arc<RootState>, coroutine: Arc<CoroutineState>) -> Self {
        Self { root, coroutine }
    }

    pub(crate) fn coroutine(&self) -> &Arc<CoroutineState> {
        &self.coroutine
    }

    pub(crate) fn root(&self) -> &Arc<RootState> {
        &self.root
    }

    /// The name of the coroutine this context belongs to.
    #[must_use]
    pub fn coroutine_name(&self) -> &str {
        self.coroutine.name()
    }

    /// Spawns a new coroutine with an auto-generated name. The coroutine is appended to the
    /// dispatcher's round-robin and gets its first run during the current dispatcher call.
    pub fn new_coroutine(&self, f: impl FnOnce(Context) + Send + 'static) {
        self.spawn(None, Box::new(f));
    }

    /// Spawns a new coroutine with the given name.
    pub fn new_named_coroutine(&self, name: &str, f: impl FnOnce(Context) + Send + 'static) {
        self.spawn(Some(name.to_string()), Box::new(f));
    }

    fn spawn(&self, name: Option<String>, f: Box<dyn FnOnce(Context) + Send>) {
        _ = self.coroutine.dispatcher().spawn(&self.root, name, f);
    }

    /// Creates a channel with an auto-generated name. Capacity 0 makes it unbuffered.
    #[must_use]
    pub fn new_channel<T>(&self, capacity: usize) -> Channel<T>
    where
        T: Send + 'static,
    {
        let name = self.coroutine.dispatcher().next_channel_name();
        Channel::new(name, capacity)
    }

    /// Creates a channel with the given name. Capacity 0 makes it unbuffered.
    #[must_use]
    pub fn new_named_channel<T>(&self, name: &str, capacity: usize) -> Channel<T>
    where
        T: Send + 'static,
    {
        Channel::new(name.to_string(), capacity)
    }

    /// Creates a selector with an auto-generated name.
    #[must_use]
    pub fn new_selector(&self) -> Selector {
        Selector::new(self.coroutine.dispatcher().next_selector_name())
    }

    /// Creates a selector with the given name.
    #[must_use]
    pub fn new_named_selector(&self, name: &str) -> Selector {
        Selector::new(name.to_string())
    }

    /// Creates an unready promise. Its internal signal channel takes the next channel name.
    #[must_use]
    pub fn new_promise<T>(&self) -> Promise<T>
    where
        T: Clone + Send + 'static,
    {
        Promise::new(self.new_channel::<()>(0))
    }

    /// Execution metadata from the environment.
    #[must_use]
    pub fn workflow_info(&self) -> WorkflowInfo {
        self.root.env().workflow_info()
    }

    /// The cancellation channel: closed when the engine requests cancellation, so it can be
    /// combined with other events in a selector.
    #[must_use]
    pub fn done(&self) -> Channel<()> {
        self.root.done().clone()
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.root.done().is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::test_support::run_workflow;

    assert_impl_all!(Context: Send, Sync);

    #[test]
    fn channels_and_selectors_are_named_by_monotonic_counters() {
        let (_dispatcher, result) = run_workflow(|ctx| {
            assert_eq!(ctx.new_channel::<i32>(0).name(), "chan-1");
            assert_eq!(ctx.new_channel::<i32>(0).name(), "chan-2");
            assert_eq!(ctx.new_selector().name(), "selector-1");
            assert_eq!(ctx.new_named_channel::<i32>("inbox", 1).name(), "inbox");

            // The promise's internal signal channel draws from the channel counter too.
            _ = ctx.new_promise::<i32>();
            assert_eq!(ctx.new_channel::<i32>(0).name(), "chan-4");
        });

        assert!(result.is_ok());
    }

    #[test]
    fn unnamed_coroutines_are_named_by_spawn_ordinal() {
        let names = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&names);

        let (_dispatcher, result) = run_workflow(move |ctx| {
            assert_eq!(ctx.coroutine_name(), "root");

            for _ in 0..2 {
                let observed = Arc::clone(&observed);
                ctx.new_coroutine(move |ctx| {
                    observed
                        .lock()
                        .expect(ERR_POISONED_LOCK)
                        .push(ctx.coroutine_name().to_string());
                });
            }

            ctx.new_named_coroutine("worker", move |ctx| {
                assert_eq!(ctx.coroutine_name(), "worker");
            });
        });

        assert!(result.is_ok());
        assert_eq!(*names.lock().expect(ERR_POISONED_LOCK), vec!["2", "3"]);
    }

    #[test]
    fn context_is_not_cancelled_by_default() {
        let (_dispatcher, result) = run_workflow(|ctx| {
            assert!(!ctx.is_cancelled());
            assert_eq!(ctx.done().name(), "done");
        });

        assert!(result.is_ok());
    }
}
