// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::Error;

/// Metadata describing the workflow execution, provided by the hosting environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowInfo {
    /// The domain the workflow executes in.
    pub domain: String,

    /// The task list decision tasks for this workflow arrive on.
    pub task_list: String,

    /// Maximum wall-clock time for the whole execution.
    pub execution_start_to_close_timeout: Duration,

    /// Maximum wall-clock time for a single decision task.
    pub task_start_to_close_timeout: Duration,
}

/// The contract the runtime consumes from the outer workflow engine.
///
/// The runtime core knows nothing about history replay, activity invocation or persistence;
/// it only reads execution metadata, installs a cancellation callback, and reports the
/// terminal outcome. Structured logging goes through the process-global `tracing` dispatcher
/// rather than through this trait.
///
/// Implementations must be callable from arbitrary threads: the cancel callback in particular
/// may fire from engine threads between dispatcher runs.
pub trait WorkflowEnvironment: Send + Sync {
    /// Execution metadata for the running workflow.
    fn workflow_info(&self) -> WorkflowInfo;

    /// Installs the callback the engine invokes to request cancellation. Invoking the callback
    /// more than once is harmless.
    fn register_cancel_handler(&self, handler: Box<dyn Fn() + Send + Sync>);

    /// Reports the terminal outcome of the workflow: serialized result bytes on success, an
    /// error otherwise. Called at most once per execution.
    fn complete(&self, result: Option<Vec<u8>>, error: Option<Error>);
}


#[cfg(test)]
pub(crate) use mocks::MockWorkflowEnvironment;
