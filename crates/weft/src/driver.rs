// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{Level, event};

use crate::context::RootState;
use crate::{Context, Dispatcher, Error, Result, WorkflowEnvironment, WorkflowRegistry};

/// A workflow function: imperative user code receiving its cooperative [`Context`] and
/// returning serialized result bytes or an error. Registered in a
/// [`WorkflowRegistry`] and invoked once per execution by the driver.
pub type WorkflowFn = Arc<dyn Fn(Context) -> Result<Option<Vec<u8>>> + Send + Sync>;

/// The driver's verdict after one decision task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    /// The workflow is blocked on external events and will be driven again later.
    Running,

    /// The workflow reached a terminal outcome (result, error or panic) and the environment
    /// has been notified.
    Completed,
}

/// Wires a user workflow function to a dispatcher and the hosting environment.
///
/// Construction spawns the workflow as the root coroutine and registers a cancellation
/// callback with the environment; cancellation may arrive at any time, including before the
/// dispatcher ever ran, and repeated requests are harmless. Each decision task tick drives the
/// dispatcher until all coroutines are blocked, then inspects the root result slot: a set slot
/// or a captured panic completes the workflow exactly once via
/// [`WorkflowEnvironment::complete`].
pub struct WorkflowDriver {
    dispatcher: Dispatcher,
    root: Arc<RootState>,
    completed: AtomicBool,
}

impl fmt::Debug for WorkflowDriver {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDriver")
            .field("completed", &self.completed)
            .finish()
    }
}

impl WorkflowDriver {
    /// Starts a new workflow execution for the given workflow function.
    #[must_use]
    pub fn new(env: Arc<dyn WorkflowEnvironment>, workflow: WorkflowFn) -> Self {
        let dispatcher = Dispatcher::new();
        let root = RootState::new(env);

        root.env().register_cancel_handler(Box::new({
            let root = Arc::clone(&root);
            move || root.cancel()
        }));

        _ = dispatcher.core().spawn(
            &root,
            Some("root".to_string()),
            Box::new({
                let root = Arc::clone(&root);
                move |ctx: Context| {
                    let outcome = workflow(ctx);
                    root.set_result(outcome);
                }
            }),
        );

        event!(Level::DEBUG, "workflow execution started");

        Self {
            dispatcher,
            root,
            completed: AtomicBool::new(false),
        }
    }

    /// Starts a new workflow execution for the named workflow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when no workflow is registered under `name`.
    pub fn from_registry(
        env: Arc<dyn WorkflowEnvironment>,
        registry: &WorkflowRegistry,
        name: &str,
    ) -> Result<Self> {
        let workflow = registry.resolve(name)?;
        Ok(Self::new(env, workflow))
    }

    /// Drives the workflow for one decision task.
    ///
    /// Runs the dispatcher until every coroutine is blocked. A captured panic is reported to
    /// the environment as a workflow-fatal completion error; a set root result slot is
    /// reported as completion. Ticks after completion are no-ops.
    pub fn on_decision_task_started(&self) -> WorkflowStatus {
        if self.is_completed() {
            return WorkflowStatus::Completed;
        }

        match self.dispatcher.execute_until_all_blocked() {
            Err(panic) => {
                event!(Level::ERROR, panic = panic.message(), "workflow panicked");
                self.finish(None, Some(Error::from(panic)));
                WorkflowStatus::Completed
            }
            Ok(()) => match self.root.take_result() {
                Some(Ok(result)) => {
                    self.finish(result, None);
                    WorkflowStatus::Completed
                }
                Some(Err(error)) => {
                    self.finish(None, Some(error));
                    WorkflowStatus::Completed
                }
                None => WorkflowStatus::Running,
            },
        }
    }

    /// Whether the workflow has reached a terminal outcome.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }

    /// Captures the stack of every live coroutine for diagnostics.
    #[must_use]
    pub fn stack_trace(&self) -> String {
        self.dispatcher.stack_trace()
    }

    /// Shuts the execution down without reporting an outcome, e.g. when the engine evicts it
    /// from its cache. Safe to call multiple times.
    pub fn close(&self) {
        self.dispatcher.close();
    }

    #[cfg_attr(test, mutants::skip)] // Double completion is enforced by the mock environment.
    fn finish(&self, result: Option<Vec<u8>>, error: Option<Error>) {
        self.completed.store(true, Ordering::Relaxed);
        self.dispatcher.close();
        self.root.env().complete(result, error);

        event!(Level::DEBUG, "workflow execution completed");
    }
}
