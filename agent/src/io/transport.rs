//! Model transport: the capability the controller calls once per step.
//!
//! [`OpenAiModel`] speaks the chat-completions API of any OpenAI-compatible
//! endpoint. Tests use scripted models that never touch the network.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::error::TransportError;
use crate::core::types::Turn;
use crate::io::call_log::CallLog;
use crate::io::config::ModelConfig;

/// Longest error body kept from a failed HTTP response.
const ERROR_BODY_LIMIT: usize = 2_000;

/// Text-generation backend.
pub trait Model {
    /// Identifier recorded in trajectories and predictions.
    fn name(&self) -> &str;

    /// Send the whole conversation and return the reply, truncated at the stop
    /// marker with the marker re-appended. Never retries.
    fn generate(&mut self, conversation: &[Turn]) -> Result<String, TransportError>;
}

/// Keep the text before the first `stop`, trimmed, then re-append the marker
/// on its own line.
pub fn truncate_at_stop(text: &str, stop: &str) -> String {
    let head = match text.find(stop) {
        Some(idx) => &text[..idx],
        None => text,
    };
    format!("{}\n{stop}", head.trim())
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    temperature: f32,
    max_completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Chat-completions backend over blocking HTTP.
pub struct OpenAiModel {
    client: HttpClient,
    endpoint: String,
    api_key: String,
    config: ModelConfig,
    stop: String,
    call_log: Option<CallLog>,
}

impl OpenAiModel {
    /// Build a model client. Fails when the API key variable is unset.
    pub fn new(config: &ModelConfig, stop: &str) -> Result<Self> {
        let api_key = env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                config.base_url.trim_end_matches('/')
            ),
            api_key,
            config: config.clone(),
            stop: stop.to_string(),
            call_log: None,
        })
    }

    /// Record every call attempt to `log`.
    pub fn with_call_log(mut self, log: CallLog) -> Self {
        self.call_log = Some(log);
        self
    }

    fn request(&self, conversation: &[Turn]) -> Result<String, TransportError> {
        let body = ChatRequest {
            model: &self.config.name,
            messages: conversation,
            temperature: self.config.temperature,
            max_completion_tokens: self.config.max_output_tokens,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|err| TransportError::Request(format!("POST {}: {err}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .map(|text| truncate_body(&text))
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|err| TransportError::MalformedResponse(err.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                TransportError::MalformedResponse("response has no message content".to_string())
            })?;
        Ok(truncate_at_stop(&content, &self.stop))
    }
}

impl Model for OpenAiModel {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip_all, fields(model = %self.config.name, turns = conversation.len()))]
    fn generate(&mut self, conversation: &[Turn]) -> Result<String, TransportError> {
        let result = self.request(conversation);
        match &result {
            Ok(text) => debug!(bytes = text.len(), "model replied"),
            Err(err) => warn!(err = %err, "model call failed"),
        }
        if let Some(log) = self.call_log.as_mut() {
            match &result {
                Ok(text) => log.record_best_effort(&self.config.name, conversation, Ok(text.as_str())),
                Err(err) => {
                    let message = err.to_string();
                    log.record_best_effort(&self.config.name, conversation, Err(message.as_str()));
                }
            }
        }
        result
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= ERROR_BODY_LIMIT {
        return body.to_string();
    }
    let mut end = ERROR_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOP: &str = "----END_FUNCTION_CALL----";

    #[test]
    fn truncates_at_first_stop_marker() {
        let text = format!("  think\nblock\n{STOP}\ntrailing chatter\n{STOP}");
        assert_eq!(truncate_at_stop(&text, STOP), format!("think\nblock\n{STOP}"));
    }

    #[test]
    fn appends_stop_marker_when_absent() {
        assert_eq!(truncate_at_stop("no call here\n", STOP), format!("no call here\n{STOP}"));
    }

    #[test]
    fn missing_api_key_fails_construction() {
        let config = ModelConfig {
            api_key_env: "AGENT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..ModelConfig::default()
        };
        let err = OpenAiModel::new(&config, STOP).err().expect("missing key");
        assert!(err.to_string().contains("AGENT_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "é".repeat(ERROR_BODY_LIMIT);
        let truncated = truncate_body(&body);
        assert!(truncated.len() <= ERROR_BODY_LIMIT + 3);
        assert!(truncated.ends_with("..."));
    }
}
