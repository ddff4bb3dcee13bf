// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, Weak, mpsc};
use std::{fmt, thread};

use scopeguard::defer;

use crate::{Context, DispatcherCore, ERR_POISONED_LOCK, Error, PanicError};

/// An unblock command delivered from the dispatcher to a suspended coroutine.
///
/// The function receives the status string the coroutine suspended with and returns whether the
/// coroutine should stay blocked (`true`) or resume execution (`false`). A purely observational
/// command (e.g. a stack-trace probe) does its work and returns `true`.
pub(crate) type UnblockFn = Box<dyn FnOnce(&str) -> bool + Send>;

/// Panic payload used to terminate a coroutine host thread when the dispatcher closes while the
/// coroutine is still live. The host entrypoint recognizes the sentinel and ends the thread
/// without recording a panic; user code must not run again afterwards.
pub(crate) struct Terminate;

/// The state of one cooperative coroutine, shared between the dispatcher that owns it, the
/// host thread that runs it, and every [`Context`] handed to code running on it.
///
/// Control is exchanged through a pair of single-slot rendezvous channels per coroutine:
/// `about_to_block` (host thread -> dispatcher) and `unblock` (dispatcher -> host thread).
/// Exactly one side holds the baton at any instant: the dispatcher is blocked inside
/// [`call()`][Self::call] while the coroutine runs, and the coroutine is blocked inside
/// [`wait_for_dispatch()`][Self::wait_for_dispatch] at all other times. All remaining fields
/// are therefore uncontended; the atomics and mutexes exist to satisfy the compiler, not to
/// arbitrate races.
pub(crate) struct CoroutineState {
    name: String,

    dispatcher: Weak<DispatcherCore>,

    about_to_block_tx: mpsc::SyncSender<()>,
    about_to_block_rx: Mutex<mpsc::Receiver<()>>,

    unblock_tx: mpsc::SyncSender<UnblockFn>,
    unblock_rx: Mutex<mpsc::Receiver<UnblockFn>>,

    /// Set when the coroutine resumes from a suspension and cleared by `unblocked()` when a
    /// channel or selector operation completes for it. A coroutine whose flag is still set at
    /// the end of a dispatcher pass made no progress during that pass.
    kept_blocked: AtomicBool,

    /// Monotonic. Set when the host thread finishes, whether by returning, panicking or being
    /// terminated.
    closed: AtomicBool,

    captured_panic: Mutex<Option<PanicError>>,
}

impl CoroutineState {
    pub(crate) fn new(name: String, dispatcher: Weak<DispatcherCore>) -> Arc<Self> {
        let (about_to_block_tx, about_to_block_rx) = mpsc::sync_channel(1);
        let (unblock_tx, unblock_rx) = mpsc::sync_channel(1);

        Arc::new(Self {
            name,
            dispatcher,
            about_to_block_tx,
            about_to_block_rx: Mutex::new(about_to_block_rx),
            unblock_tx,
            unblock_rx: Mutex::new(unblock_rx),
            kept_blocked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            captured_panic: Mutex::new(None),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// The dispatcher this coroutine belongs to.
    ///
    /// # Panics
    ///
    /// Panics if the dispatcher has already been dropped - constructing channels or coroutines
    /// from a context that outlived its dispatcher is a programming error.
    pub(crate) fn dispatcher(&self) -> Arc<DispatcherCore> {
        self.dispatcher
            .upgrade()
            .expect("dispatcher was dropped while a context still references it")
    }

    /// Dispatcher side: authorize the coroutine to run until it next suspends or completes.
    ///
    /// Returns once the coroutine signals `about_to_block`, which it does both when suspending
    /// and from its cleanup path on completion. A disconnected handoff channel means the host
    /// thread is already gone; the caller observes that through the `closed` flag.
    #[cfg_attr(test, mutants::skip)] // Critical handoff primitive - tests hang if tampered with.
    pub(crate) fn call(&self) {
        if self.unblock_tx.send(Box::new(|_status| false)).is_err() {
            return;
        }

        _ = self
            .about_to_block_rx
            .lock()
            .expect(ERR_POISONED_LOCK)
            .recv();
    }

    /// Coroutine side: give the baton back to the dispatcher and wait to be resumed.
    ///
    /// The status string names the operation the coroutine is blocked on and shows up in
    /// dispatcher stack traces.
    #[cfg_attr(test, mutants::skip)] // Critical handoff primitive - tests hang if tampered with.
    pub(crate) fn suspend(&self, status: &str) {
        _ = self.about_to_block_tx.send(());
        self.wait_for_dispatch(status);
        self.kept_blocked.store(true, Ordering::Relaxed);
    }

    /// Coroutine side: wait for an unblock command that actually resumes us.
    ///
    /// Observational commands (stack-trace probes) return `true` and keep us in the loop. Every
    /// freshly spawned host thread enters here before any user code runs, so the dispatcher
    /// controls first execution.
    #[cfg_attr(test, mutants::skip)] // Critical handoff primitive - tests hang if tampered with.
    pub(crate) fn wait_for_dispatch(&self, status: &str) {
        loop {
            let unblock = self
                .unblock_rx
                .lock()
                .expect(ERR_POISONED_LOCK)
                .recv()
                .expect("dispatcher dropped the handoff while the coroutine was blocked");

            if !unblock(status) {
                return;
            }
        }
    }

    /// Called by channels and selectors when an operation completes for this coroutine,
    /// marking that it made progress since the dispatcher last resumed it.
    pub(crate) fn unblocked(&self) {
        self.kept_blocked.store(false, Ordering::Relaxed);
    }

    pub(crate) fn kept_blocked(&self) -> bool {
        self.kept_blocked.load(Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Coroutine side: mark the coroutine finished and wake the dispatcher if it is waiting
    /// inside [`call()`][Self::call]. Runs on every exit path of the host thread.
    #[cfg_attr(test, mutants::skip)] // Critical handoff primitive - tests hang if tampered with.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        _ = self.about_to_block_tx.try_send(());
    }

    pub(crate) fn record_panic(&self, panic: PanicError) {
        *self.captured_panic.lock().expect(ERR_POISONED_LOCK) = Some(panic);
    }

    pub(crate) fn take_panic(&self) -> Option<PanicError> {
        self.captured_panic.lock().expect(ERR_POISONED_LOCK).take()
    }

    /// Dispatcher side: terminate the host thread of a still-live coroutine.
    ///
    /// The delivered unblock function raises the [`Terminate`] sentinel on the coroutine's own
    /// thread; the unwind is recognized by the host entrypoint, which closes the state without
    /// recording a panic.
    #[cfg_attr(test, mutants::skip)] // Tests hang on dispatcher close if mutated away.
    pub(crate) fn exit(&self) {
        if self.is_closed() {
            return;
        }

        _ = self
            .unblock_tx
            .send(Box::new(|_status| panic::panic_any(Terminate)));
    }

    /// Dispatcher side: capture the live stack of a blocked coroutine without resuming it.
    ///
    /// Delivers a purely observational unblock function that captures a backtrace on the
    /// coroutine's own thread, reports it back and returns `true` (stay blocked). Returns
    /// `None` for coroutines that are already closed or whose host thread is gone.
    pub(crate) fn capture_stack_trace(&self) -> Option<String> {
        if self.is_closed() {
            return None;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let name = self.name.clone();

        let sent = self.unblock_tx.send(Box::new(move |status| {
            let backtrace = trim_runtime_frames(&Backtrace::force_capture().to_string());
            _ = reply_tx.send(format!("coroutine {name} [{status}]:\n{backtrace}"));
            true
        }));

        if sent.is_err() {
            return None;
        }

        reply_rx.recv().ok()
    }
}

impl fmt::Debug for CoroutineState {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineState")
            .field("name", &self.name)
            .field("kept_blocked", &self.kept_blocked)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Host thread entrypoint shared by every coroutine.
///
/// Performs the initial yield, runs the user function, and converts any escaping unwind into
/// either a silent termination (the [`Terminate`] sentinel) or a captured [`PanicError`]. The
/// close signal is guaranteed to fire on every exit path so the dispatcher always wakes up.
pub(crate) fn run_coroutine(
    state: &Arc<CoroutineState>,
    ctx: Context,
    f: Box<dyn FnOnce(Context) + Send>,
) {
    mark_coroutine_host();

    let closer = Arc::clone(state);
    defer! {
        closer.close();
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        state.wait_for_dispatch("created");
        f(ctx);
    }));

    if let Err(payload) = outcome {
        if payload.downcast_ref::<Terminate>().is_none() {
            let message = panic_message(payload.as_ref());
            let backtrace = take_captured_backtrace();
            state.record_panic(PanicError::new(message, backtrace));
        }
    }
}

thread_local! {
    static IS_COROUTINE_HOST: Cell<bool> = const { Cell::new(false) };
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

/// Flags the current thread as a coroutine host and installs the process-wide panic hook that
/// captures backtraces for coroutine panics.
///
/// On host threads the hook records the backtrace into a thread-local and suppresses the
/// default stderr report - the panic is expected to be caught and surfaced through the
/// dispatcher instead. Other threads keep the previously installed behavior.
fn mark_coroutine_host() {
    IS_COROUTINE_HOST.set(true);

    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();

        panic::set_hook(Box::new(move |info| {
            if IS_COROUTINE_HOST.get() {
                PANIC_BACKTRACE.with_borrow_mut(|slot| *slot = Some(Backtrace::force_capture()));
            } else {
                previous(info);
            }
        }));
    });
}

fn take_captured_backtrace() -> String {
    PANIC_BACKTRACE
        .with_borrow_mut(Option::take)
        .map_or_else(String::new, |backtrace| {
            trim_runtime_frames(&backtrace.to_string())
        })
}

/// Renders a panic payload to text. Payloads raised via `panic!` are strings; the runtime's
/// own fatal conditions are raised as [`Error`] values via `panic_any`.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(error) = payload.downcast_ref::<Error>() {
        error.to_string()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Frames dropped from captured backtraces so the topmost remaining frames belong to workflow
/// code rather than panic machinery or runtime internals.
const TRIMMED_FRAME_MARKERS: &[&str] = &[
    "std::panicking",
    "core::panicking",
    "std::panic::",
    "std::backtrace",
    "rust_begin_unwind",
    "__rust_begin_short_backtrace",
    "weft::coroutine::CoroutineState",
    "weft::coroutine::run_coroutine",
    "weft::coroutine::mark_coroutine_host",
    "weft::channel::Channel",
    "weft::channel::ChannelCore",
    "weft::promise::Promise",
    "weft::selector::Selector",
    "weft::dispatcher::Dispatcher",
];

/// Removes runtime-internal frames from a rendered backtrace.
///
/// Backtraces render each frame as a numbered symbol line optionally followed by an `at
/// file:line` line; both lines of a trimmed frame are dropped.
fn trim_runtime_frames(backtrace: &str) -> String {
    let mut kept = Vec::new();
    let mut skipping = false;

    for line in backtrace.lines() {
        let trimmed = line.trim_start();
        let is_frame_header = trimmed
            .split_once(':')
            .is_some_and(|(index, _)| index.chars().all(|c| c.is_ascii_digit()));

        if is_frame_header {
            skipping = TRIMMED_FRAME_MARKERS
                .iter()
                .any(|marker| line.contains(marker));
        }

        if !skipping {
            kept.push(line);
        }
    }

    kept.join("\n")
}

/// Spawns the host thread for a coroutine.
pub(crate) fn spawn_host_thread(
    state: &Arc<CoroutineState>,
    ctx: Context,
    f: Box<dyn FnOnce(Context) + Send>,
) -> thread::JoinHandle<()> {
    let state = Arc::clone(state);

    thread::Builder::new()
        .name(format!("weft-{}", state.name()))
        .spawn(move || run_coroutine(&state, ctx, f))
        .expect("failed to spawn coroutine host thread")
}
