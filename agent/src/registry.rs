//! Registry of actions the model may call.
//!
//! Actions are registered before the loop starts. Dispatch validates the name
//! and required arguments, then converts handler failures into failed
//! [`ActionResult`]s so one bad action never aborts the run.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::error::DispatchError;
use crate::core::types::ActionResult;

/// Named text arguments of a call.
pub type Arguments = BTreeMap<String, String>;

/// Action implementation. Borrowed state (e.g. a sandbox) must outlive the registry.
pub type Handler<'a> = Box<dyn Fn(&Arguments) -> Result<String> + 'a>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Declared shape of an action, rendered into the system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// Dispatching this action successfully ends the run.
    pub terminal: bool,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
            terminal: false,
        }
    }

    pub fn param(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            description: description.into(),
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            description: description.into(),
            required: false,
        });
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    fn missing_arguments(&self, arguments: &Arguments) -> Vec<&str> {
        self.params
            .iter()
            .filter(|param| param.required && !arguments.contains_key(&param.name))
            .map(|param| param.name.as_str())
            .collect()
    }
}

struct Registered<'a> {
    spec: ActionSpec,
    handler: Handler<'a>,
}

/// Actions available to one controller, in registration order.
#[derive(Default)]
pub struct FunctionRegistry<'a> {
    actions: Vec<Registered<'a>>,
}

impl<'a> FunctionRegistry<'a> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Register an action. Names must be unique.
    pub fn register(
        &mut self,
        spec: ActionSpec,
        handler: impl Fn(&Arguments) -> Result<String> + 'a,
    ) -> Result<()> {
        if spec.name.trim().is_empty() {
            bail!("action name must be non-empty");
        }
        if self.get(&spec.name).is_some() {
            bail!("action '{}' already registered", spec.name);
        }
        debug!(action = %spec.name, "registered action");
        self.actions.push(Registered {
            spec,
            handler: Box::new(handler),
        });
        Ok(())
    }

    pub fn specs(&self) -> impl Iterator<Item = &ActionSpec> {
        self.actions.iter().map(|action| &action.spec)
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.get(name).is_some_and(|action| action.spec.terminal)
    }

    /// Run the named action.
    ///
    /// Unknown names and missing required arguments are rejected; arguments
    /// the action does not declare are ignored.
    pub fn dispatch(
        &self,
        name: &str,
        arguments: &Arguments,
    ) -> std::result::Result<ActionResult, DispatchError> {
        let action = self
            .get(name)
            .ok_or_else(|| DispatchError::UnknownAction {
                name: name.to_string(),
                available: self.names().join(", "),
            })?;

        let missing = action.spec.missing_arguments(arguments);
        if !missing.is_empty() {
            return Err(DispatchError::MissingArguments {
                name: name.to_string(),
                missing: missing.join(", "),
            });
        }

        match (action.handler)(arguments) {
            Ok(output) => Ok(ActionResult::success(output)),
            Err(err) => {
                warn!(action = name, err = %err, "action failed");
                Ok(ActionResult::failure(format!("{err:#}")))
            }
        }
    }

    fn names(&self) -> Vec<&str> {
        self.actions
            .iter()
            .map(|action| action.spec.name.as_str())
            .collect()
    }

    fn get(&self, name: &str) -> Option<&Registered<'a>> {
        self.actions.iter().find(|action| action.spec.name == name)
    }
}
