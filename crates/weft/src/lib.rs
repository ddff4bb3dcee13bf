// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Weft is the deterministic cooperative coroutine runtime that underpins a durable-workflow
//! execution framework.
//!
//! Workflow authors write imperative code that blocks on [channels][Channel],
//! [selectors][Selector] and [futures][Promise]; the runtime executes that code one coroutine
//! at a time, in a reproducible order, so that identical inputs always yield an identical
//! schedule. Determinism is what lets the outer engine checkpoint, replay and resume
//! long-running logic across process restarts: execution is a pure function of a prefix of
//! external inputs.
//!
//! The [`Dispatcher`] drives coroutines round-robin until all are blocked; the
//! [`WorkflowDriver`] wires a user workflow function to a dispatcher and the hosting
//! [`WorkflowEnvironment`]. There is no preemption, no parallelism and no I/O in here -
//! timers and real-world effects are the environment's business.

// Public API surface.
mod channel;
mod context;
mod dispatcher;
mod driver;
mod env;
mod error;
mod promise;
mod registry;
mod selector;

pub use channel::Channel;
pub use context::Context;
pub use dispatcher::Dispatcher;
pub use driver::{WorkflowDriver, WorkflowFn, WorkflowStatus};
pub use env::{WorkflowEnvironment, WorkflowInfo};
pub use error::{Error, PanicError, Result};
pub use promise::{DecodedPromise, Promise};
pub use registry::WorkflowRegistry;
pub use selector::Selector;

// Internal to the crate but re-exported at crate root for reduced hassle.
mod constants;
mod coroutine;

pub(crate) use constants::ERR_POISONED_LOCK;
pub(crate) use context::RootState;
pub(crate) use dispatcher::DispatcherCore;

#[cfg(test)]
mod test_support;
