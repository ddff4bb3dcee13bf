// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test aids shared by the Weft workspace: a conservative timeout for anything a test waits
//! on, a watchdog that converts hangs into failures, and a logging initializer.

use std::panic::resume_unwind;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::level_filters::LevelFilter;

/// If something (whatever) does not happen in a test within this time, the test will fail.
///
/// We are conservative here and allow much time - this is only to break out of infinite
/// loops, not for any situations that are actually expected.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes a test body on a background thread and fails the test if it does not complete
/// within [`TEST_TIMEOUT`].
///
/// The runtime under test suspends coroutines by parking their host threads, so a scheduling
/// bug shows up as a hang rather than an assertion failure; this converts the hang into a
/// failure the harness can report. A panic inside the body is re-raised on the calling
/// thread, preserving `should_panic` expectations and failure messages.
///
/// # Panics
///
/// Panics if the body panics or does not complete in time.
pub fn run_with_watchdog<F, R>(f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (result_tx, result_rx) = mpsc::channel();

    let body = thread::Builder::new()
        .name("test-body".to_string())
        .spawn(move || {
            _ = result_tx.send(f());
        })
        .expect("failed to spawn test body thread");

    match result_rx.recv_timeout(TEST_TIMEOUT) {
        Ok(result) => {
            _ = body.join();
            result
        }
        Err(RecvTimeoutError::Disconnected) => {
            // The body dropped its sender without sending, which means it panicked.
            match body.join() {
                Err(payload) => resume_unwind(payload),
                Ok(()) => unreachable!("test body exited without a result or a panic"),
            }
        }
        Err(RecvTimeoutError::Timeout) => {
            // The body thread is abandoned; there is nothing useful left to do with it.
            panic!("test body did not complete within {TEST_TIMEOUT:?} - probably deadlocked");
        }
    }
}

/// Routes `tracing` events emitted during a test to the captured test output.
///
/// Safe to call from multiple tests; only the first call installs the subscriber.
pub fn init_test_logging() {
    _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_test_writer()
        .try_init();
}
