// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::{ERR_POISONED_LOCK, Error, Result, WorkflowFn};

/// The name-to-function map the root driver consults to look up user workflows.
///
/// This is deliberately an explicit, injectable collaborator rather than process-global state:
/// the hosting engine constructs one, registers its workflow functions, and hands it to
/// [`WorkflowDriver::from_registry`][crate::WorkflowDriver::from_registry].
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: Mutex<HashMap<String, WorkflowFn>>,
}

impl fmt::Debug for WorkflowRegistry {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field(
                "registered",
                &self.workflows.lock().expect(ERR_POISONED_LOCK).len(),
            )
            .finish()
    }
}

impl WorkflowRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workflow function under `name`.
    ///
    /// # Panics
    ///
    /// Panics if a workflow is already registered under the same name.
    pub fn register(
        &self,
        name: &str,
        workflow: impl Fn(crate::Context) -> Result<Option<Vec<u8>>> + Send + Sync + 'static,
    ) {
        let previous = self
            .workflows
            .lock()
            .expect(ERR_POISONED_LOCK)
            .insert(name.to_string(), std::sync::Arc::new(workflow));

        assert!(
            previous.is_none(),
            "workflow {name} is already registered"
        );
    }

    /// Looks up a registered workflow function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when no workflow is registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<WorkflowFn> {
        self.workflows
            .lock()
            .expect(ERR_POISONED_LOCK)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown workflow type: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_workflow_resolves() {
        let registry = WorkflowRegistry::new();
        registry.register("greet", |_ctx| Ok(Some(b"hello".to_vec())));

        assert!(registry.resolve("greet").is_ok());
    }

    #[test]
    fn unknown_workflow_is_an_invalid_argument() {
        let registry = WorkflowRegistry::new();

        let error = match registry.resolve("missing") {
            Err(error) => error,
            Ok(_) => panic!("lookup must fail"),
        };
        assert_eq!(
            error,
            Error::InvalidArgument("unknown workflow type: missing".to_string())
        );
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let registry = WorkflowRegistry::new();
        registry.register("greet", |_ctx| Ok(None));
        registry.register("greet", |_ctx| Ok(None));
    }
}
