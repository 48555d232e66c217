//! ReAct controller: think, act, observe until a terminal condition.
//!
//! Each model call costs one step. A step appends the assistant turn and one
//! observation turn, so a completed step grows the conversation by exactly
//! two turns. Halt requests and the optional deadline are honored at step
//! boundaries only.

use std::thread;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::budget::RunLimits;
use crate::core::error::{ProtocolError, TransportError};
use crate::core::protocol::CallCodec;
use crate::core::types::{ActionResult, StepRecord, Termination, Turn};
use crate::io::prompt::PromptEngine;
use crate::io::transport::Model;
use crate::registry::FunctionRegistry;

/// How a run ended and what it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub termination: Termination,
    /// Output of the terminal action; empty unless submitted.
    pub result: String,
    /// Steps consumed (model calls made).
    pub steps: u32,
}

pub struct Agent<'a> {
    name: String,
    codec: CallCodec,
    model: &'a mut dyn Model,
    registry: FunctionRegistry<'a>,
    prompts: PromptEngine,
    workdir: Option<String>,
    conversation: Vec<Turn>,
    steps: Vec<StepRecord>,
}

impl<'a> Agent<'a> {
    pub fn new(
        name: impl Into<String>,
        codec: CallCodec,
        model: &'a mut dyn Model,
        registry: FunctionRegistry<'a>,
    ) -> Self {
        Self {
            name: name.into(),
            codec,
            model,
            registry,
            prompts: PromptEngine::new(),
            workdir: None,
            conversation: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Mention the repository location in the system prompt.
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn conversation(&self) -> &[Turn] {
        &self.conversation
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Run the loop on `task` until submission, failure, or a budget runs out.
    ///
    /// Only prompt rendering errors are returned as `Err`; every loop-level
    /// outcome is a [`Termination`].
    #[instrument(skip_all, fields(agent = %self.name, max_steps = limits.max_steps))]
    pub fn run(
        &mut self,
        task: &str,
        limits: &RunLimits,
        cancel: &CancelToken,
    ) -> Result<RunOutcome> {
        self.init(task)?;

        let mut step = 0u32;
        loop {
            if cancel.is_halted() {
                return Ok(self.terminate(Termination::Cancelled, String::new(), step));
            }
            if limits.deadline_passed() {
                return Ok(self.terminate(Termination::TimedOut, String::new(), step));
            }
            if step >= limits.max_steps {
                return Ok(self.terminate(Termination::Exhausted, String::new(), step));
            }
            step += 1;

            let prompt_turns = self.conversation.len();
            let response = match self.call_model(limits, cancel) {
                Ok(text) => text,
                Err(err) => {
                    let message = err.to_string();
                    self.steps.push(StepRecord {
                        index: step,
                        prompt_turns,
                        raw_response: None,
                        parsed_call: None,
                        action_result: None,
                        error: Some(message.clone()),
                    });
                    return Ok(self.terminate(
                        Termination::TransportFailed { message },
                        String::new(),
                        step,
                    ));
                }
            };
            self.conversation.push(Turn::assistant(response.clone()));
            let decoded = self.codec.decode(&response);

            let mut record = StepRecord {
                index: step,
                prompt_turns,
                raw_response: Some(response),
                parsed_call: None,
                action_result: None,
                error: None,
            };

            let call = match decoded {
                Ok(call) => call,
                Err(err) => {
                    debug!(step, err = %err, "malformed response");
                    let correction = self.protocol_correction(&err);
                    self.conversation.push(Turn::user(correction));
                    record.error = Some(err.to_string());
                    self.steps.push(record);
                    continue;
                }
            };

            debug!(step, action = %call.name, "dispatching");
            let result = match self.registry.dispatch(&call.name, &call.arguments) {
                Ok(result) => result,
                Err(err) => {
                    record.error = Some(err.to_string());
                    ActionResult::failure(err.to_string())
                }
            };
            self.conversation.push(Turn::user(result.observation()));

            let submitted = result.ok && self.registry.is_terminal(&call.name);
            let output = result.output.clone();
            record.parsed_call = Some(call);
            record.action_result = Some(result);
            self.steps.push(record);

            if submitted {
                return Ok(self.terminate(Termination::Submitted, output, step));
            }
        }
    }

    fn init(&mut self, task: &str) -> Result<()> {
        let system = self.prompts.render_system(
            &self.codec,
            self.registry.specs(),
            self.workdir.as_deref(),
        )?;
        self.conversation = vec![Turn::system(system), Turn::user(task)];
        self.steps.clear();
        Ok(())
    }

    fn call_model(
        &mut self,
        limits: &RunLimits,
        cancel: &CancelToken,
    ) -> std::result::Result<String, TransportError> {
        let mut retry = 0;
        loop {
            match self.model.generate(&self.conversation) {
                Ok(text) => return Ok(text),
                Err(err)
                    if retry < limits.retry.max_retries
                        && !cancel.is_halted()
                        && !limits.deadline_passed() =>
                {
                    retry += 1;
                    let delay = limits.retry.delay(retry);
                    warn!(retry, delay_ms = delay.as_millis() as u64, err = %err, "retrying model call");
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn protocol_correction(&self, err: &ProtocolError) -> String {
        format!(
            "Error: {err}\nYour response must end with exactly one function call in this format:\n{}",
            self.codec.format_template()
        )
    }

    fn terminate(&self, termination: Termination, result: String, steps: u32) -> RunOutcome {
        info!(
            termination = termination.label(),
            steps,
            turns = self.conversation.len(),
            "run finished"
        );
        RunOutcome {
            termination,
            result,
            steps,
        }
    }
}
