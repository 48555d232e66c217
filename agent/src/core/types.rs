//! Shared deterministic types for the agent loop.
//!
//! These types define stable contracts between the codec, the registry, the
//! controller, and the persisted trajectory. They carry no I/O handles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Function call extracted from a model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedCall {
    /// Free-form reasoning preceding the call block.
    pub thought: String,
    pub name: String,
    /// Argument values keyed by name, ordered for stable serialization.
    pub arguments: BTreeMap<String, String>,
}

/// Outcome of a single action dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub ok: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// Render as the observation text fed back to the model.
    pub fn observation(&self) -> String {
        match (&self.error, self.output.is_empty()) {
            (None, _) => self.output.clone(),
            (Some(error), true) => format!("Error: {error}"),
            (Some(error), false) => format!("Error: {error}\n{}", self.output),
        }
    }
}

/// Record of one loop iteration (1-indexed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u32,
    /// Number of conversation turns sent to the model for this step.
    pub prompt_turns: usize,
    pub raw_response: Option<String>,
    pub parsed_call: Option<ParsedCall>,
    pub action_result: Option<ActionResult>,
    /// Protocol, dispatch, or transport error observed during the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal state of one controller run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// The terminal action was dispatched successfully.
    Submitted,
    /// The model transport failed after exhausting the retry policy.
    TransportFailed { message: String },
    /// The step budget was consumed without a submission.
    Exhausted,
    /// The optional wall-clock budget elapsed.
    TimedOut,
    /// A halt was requested through the cancellation token.
    Cancelled,
}

impl Termination {
    /// Stable label used in trajectories and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Termination::Submitted => "submitted",
            Termination::TransportFailed { .. } => "transport_failed",
            Termination::Exhausted => "exhausted",
            Termination::TimedOut => "timed_out",
            Termination::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_prefixes_errors() {
        assert_eq!(ActionResult::success("ok").observation(), "ok");
        assert_eq!(ActionResult::failure("boom").observation(), "Error: boom");

        let partial = ActionResult {
            ok: false,
            output: "partial".to_string(),
            error: Some("timed out".to_string()),
        };
        assert_eq!(partial.observation(), "Error: timed out\npartial");
    }

    #[test]
    fn turns_serialize_with_lowercase_roles() {
        let json = serde_json::to_string(&Turn::assistant("hi")).expect("json");
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
