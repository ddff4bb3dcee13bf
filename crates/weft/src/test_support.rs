// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use weft_testing::run_with_watchdog;

use crate::context::RootState;
use crate::{Context, Dispatcher, Error, PanicError, WorkflowEnvironment, WorkflowInfo};

/// Minimal environment for tests that exercise the runtime below the driver layer.
#[derive(Debug)]
pub(crate) struct StubEnvironment;

impl WorkflowEnvironment for StubEnvironment {
    fn workflow_info(&self) -> WorkflowInfo {
        WorkflowInfo::default()
    }

    fn register_cancel_handler(&self, _handler: Box<dyn Fn() + Send + Sync>) {}

    fn complete(&self, _result: Option<Vec<u8>>, _error: Option<Error>) {}
}

/// Spawns `f` as the root coroutine of a fresh dispatcher and drives one
/// `execute_until_all_blocked` call under the test watchdog.
///
/// Returns the dispatcher (so tests can assert on liveness, drive further passes, or close
/// it) together with the result of the first pass.
pub(crate) fn run_workflow(
    f: impl FnOnce(Context) + Send + 'static,
) -> (Dispatcher, Result<(), PanicError>) {
    run_with_watchdog(move || {
        let dispatcher = Dispatcher::new();
        let root = RootState::new(Arc::new(StubEnvironment));

        _ = dispatcher
            .core()
            .spawn(&root, Some("root".to_string()), Box::new(f));

        let result = dispatcher.execute_until_all_blocked();
        (dispatcher, result)
    })
}
