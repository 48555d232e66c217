//! Prompt rendering for the system and task turns.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::protocol::CallCodec;
use crate::registry::ActionSpec;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const INSTANCE_TEMPLATE: &str = include_str!("prompts/instance.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("instance", INSTANCE_TEMPLATE)
            .expect("instance template should be valid");
        Self { env }
    }

    /// System turn: response format plus the declared actions.
    pub fn render_system<'s>(
        &self,
        codec: &CallCodec,
        actions: impl IntoIterator<Item = &'s ActionSpec>,
        workdir: Option<&str>,
    ) -> Result<String> {
        let actions: Vec<&ActionSpec> = actions.into_iter().collect();
        let finish = actions
            .iter()
            .find(|action| action.terminal)
            .map(|action| action.name.as_str());
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            format => codec.format_template(),
            actions => actions,
            workdir => workdir.map(str::trim).filter(|s| !s.is_empty()),
            finish => finish,
        })?;
        Ok(rendered.trim().to_string())
    }

    /// Task turn for one instance.
    pub fn render_instance(&self, problem_statement: &str, workdir: &str) -> Result<String> {
        let template = self.env.get_template("instance")?;
        let rendered = template.render(context! {
            problem_statement => problem_statement.trim(),
            workdir => workdir,
        })?;
        Ok(rendered.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{BEGIN_CALL, END_CALL};

    fn specs() -> Vec<ActionSpec> {
        vec![
            ActionSpec::new("run_bash_cmd", "Run a shell command").param("command", "The command"),
            ActionSpec::new("show_file", "Print a file")
                .param("file_path", "Path")
                .optional("start_line", "First line"),
            ActionSpec::new("finish", "Submit").param("result", "Summary").terminal(),
        ]
    }

    #[test]
    fn system_prompt_lists_format_and_actions_in_order() {
        let engine = PromptEngine::new();
        let specs = specs();
        let prompt = engine
            .render_system(&CallCodec::default(), &specs, Some("/testbed"))
            .expect("render");

        assert!(prompt.contains("/testbed"));
        assert!(prompt.contains(BEGIN_CALL));
        assert!(prompt.contains(END_CALL));
        let bash = prompt.find("### run_bash_cmd").expect("bash");
        let show = prompt.find("### show_file").expect("show");
        let finish = prompt.find("### finish").expect("finish");
        assert!(bash < show && show < finish);
        assert!(prompt.contains("`start_line` (optional)"));
        assert!(prompt.contains("call `finish`"));
    }

    #[test]
    fn system_prompt_without_workdir_or_terminal_action() {
        let engine = PromptEngine::new();
        let specs = [ActionSpec::new("noop", "Does nothing")];
        let prompt = engine
            .render_system(&CallCodec::default(), &specs, None)
            .expect("render");
        assert!(prompt.starts_with("You are an autonomous software engineer fixing a reported defect."));
        assert!(!prompt.contains("When the fix is complete"));
    }

    #[test]
    fn instance_prompt_wraps_problem_statement() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render_instance("  TypeError in parser\n", "/testbed")
            .expect("render");
        assert!(prompt.starts_with("<task>\nTypeError in parser\n</task>"));
        assert!(prompt.contains("/testbed"));
    }
}
