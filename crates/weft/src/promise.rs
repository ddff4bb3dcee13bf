// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::panic;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;

use crate::channel::{ReceiveCallback, TryReceive};
use crate::{Channel, Context, ERR_POISONED_LOCK, Error, Result};

/// A set-once value-or-error slot with chain-on-completion semantics.
///
/// A promise wraps an internal channel that is used purely as a one-shot close signal: setting
/// the promise closes the channel, which wakes every blocked [`get`][Self::get] and every
/// selector case registered on it. The outcome is a [`Result<T>`]: producers call
/// [`set_value`][Self::set_value] / [`set_error`][Self::set_error] (or [`set`][Self::set]),
/// and the same outcome cascades to every promise chained onto this one - which is why `T`
/// must be `Clone`.
///
/// Construct promises through [`Context::new_promise`] so the internal signal channel gets a
/// deterministic diagnostic name.
pub struct Promise<T> {
    core: Arc<PromiseCore<T>>,
}

struct PromiseCore<T> {
    /// Closed exactly once, when the outcome is set. Never carries a value.
    ready_signal: Channel<()>,

    state: Mutex<PromiseState<T>>,
}

struct PromiseState<T> {
    outcome: Option<Result<T>>,

    /// Downstream promises to complete with a clone of our outcome. Upstream promises are not
    /// referenced, so correct use cannot form cycles.
    chained: Vec<Promise<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for Promise<T>
where
    T: Clone + Send + 'static,
{
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(ready_signal: Channel<()>) -> Self {
        Self {
            core: Arc::new(PromiseCore {
                ready_signal,
                state: Mutex::new(PromiseState {
                    outcome: None,
                    chained: Vec::new(),
                }),
            }),
        }
    }

    /// Whether an outcome has been set.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.core
            .state
            .lock()
            .expect(ERR_POISONED_LOCK)
            .outcome
            .is_some()
    }

    /// Sets the outcome, wakes every waiter, and completes every chained promise with a clone
    /// of the same outcome.
    ///
    /// # Panics
    ///
    /// Panics with [`Error::AlreadySet`] if the promise is already ready. The panic aborts the
    /// calling coroutine.
    pub fn set(&self, outcome: Result<T>) {
        let chained = {
            let mut state = self.core.state.lock().expect(ERR_POISONED_LOCK);

            if state.outcome.is_some() {
                drop(state);
                panic::panic_any(Error::AlreadySet);
            }

            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.chained)
        };

        self.core.ready_signal.close();

        for downstream in chained {
            downstream.set(outcome.clone());
        }
    }

    /// Completes the promise with a value. See [`set`][Self::set].
    pub fn set_value(&self, value: T) {
        self.set(Ok(value));
    }

    /// Completes the promise with an error. See [`set`][Self::set].
    pub fn set_error(&self, error: Error) {
        self.set(Err(error));
    }

    /// Blocks the calling coroutine until the promise is ready, then returns a clone of the
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns the error the producer set, if any.
    ///
    /// # Panics
    ///
    /// Panics with [`Error::NotReady`] if the internal signal fires without a stored outcome,
    /// which indicates a runtime invariant violation.
    pub fn get(&self, ctx: &Context) -> Result<T> {
        let (value, more) = self.core.ready_signal.receive_with_more(ctx);
        assert!(
            value.is_none() && !more,
            "promise signal channel delivered a value instead of the close signal"
        );

        self.outcome_cloned()
            .unwrap_or_else(|| panic::panic_any(Error::NotReady))
    }

    /// Non-blocking variant of [`get`][Self::get]: a clone of the outcome if the promise is
    /// already ready, `None` otherwise.
    #[must_use]
    pub fn get_async(&self) -> Option<Result<T>> {
        self.outcome_cloned()
    }

    pub(crate) fn outcome_cloned(&self) -> Option<Result<T>> {
        self.core
            .state
            .lock()
            .expect(ERR_POISONED_LOCK)
            .outcome
            .clone()
    }

    /// Selector support: register a callback on the ready signal, or report that the promise
    /// is already ready (`true`) without registering.
    pub(crate) fn subscribe(&self, callback: ReceiveCallback<()>) -> bool {
        match self.core.ready_signal.receive_or_register(callback) {
            TryReceive::Closed => true,
            TryReceive::Pending => false,
            TryReceive::Value(()) => {
                unreachable!("promise signal channel never carries values")
            }
        }
    }

    /// Chains this promise onto `other`: when `other` completes, this promise is completed
    /// with a clone of the same outcome. If `other` is already ready the outcome is copied
    /// synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when chaining a promise onto itself.
    ///
    /// # Panics
    ///
    /// Panics with [`Error::AlreadySet`] if this promise completes twice as a result (e.g. it
    /// was set directly and is also chained).
    pub fn chain(&self, other: &Self) -> Result<()> {
        if Arc::ptr_eq(&self.core, &other.core) {
            return Err(Error::InvalidArgument(
                "cannot chain a future onto itself".to_string(),
            ));
        }

        let ready_outcome = {
            let mut other_state = other.core.state.lock().expect(ERR_POISONED_LOCK);

            match &other_state.outcome {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    other_state.chained.push(self.clone());
                    None
                }
            }
        };

        if let Some(outcome) = ready_outcome {
            self.set(outcome);
        }

        Ok(())
    }
}

/// A promise over raw payload bytes with a decoding step layered on top.
///
/// The producer side completes the underlying [`Promise<Vec<u8>>`]; consumers calling
/// [`get`][Self::get] receive the bytes run through the decoder. The default decoder is
/// `serde_json`; a custom one can be supplied via [`with_decoder`][Self::with_decoder].
pub struct DecodedPromise<T> {
    inner: Promise<Vec<u8>>,
    decoder: Arc<dyn Fn(&[u8]) -> Result<T> + Send + Sync>,
}

impl<T> Clone for DecodedPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            decoder: Arc::clone(&self.decoder),
        }
    }
}

impl<T> fmt::Debug for DecodedPromise<T> {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedPromise")
            .field("ready", &self.inner.is_ready())
            .finish()
    }
}

impl<T> DecodedPromise<T>
where
    T: DeserializeOwned,
{
    /// Wraps a raw payload promise with a `serde_json` decoder.
    #[must_use]
    pub fn json(inner: Promise<Vec<u8>>) -> Self {
        Self::with_decoder(inner, |bytes| {
            serde_json::from_slice(bytes)
                .map_err(|error| Error::InvalidArgument(format!("failed to decode payload: {error}")))
        })
    }
}

impl<T> DecodedPromise<T> {
    /// Wraps a raw payload promise with a caller-supplied decoder.
    pub fn with_decoder(
        inner: Promise<Vec<u8>>,
        decoder: impl Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            decoder: Arc::new(decoder),
        }
    }

    /// Whether the underlying payload promise is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// The underlying payload promise, for producers and selector cases.
    #[must_use]
    pub fn raw(&self) -> &Promise<Vec<u8>> {
        &self.inner
    }

    /// Blocks until the payload is ready, then decodes it.
    ///
    /// # Errors
    ///
    /// Returns the producer's error, or [`Error::InvalidArgument`] when decoding fails.
    pub fn get(&self, ctx: &Context) -> Result<T> {
        let bytes = self.inner.get(ctx)?;
        (self.decoder)(&bytes)
    }
}
