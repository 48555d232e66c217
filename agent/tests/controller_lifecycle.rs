//! Loop-level tests that drive the controller against real sandboxes.
//!
//! A scripted model stands in for the HTTP transport; actions run against a
//! local git workspace so the produced patch is a real `git diff`.

use std::time::Duration;

use agent::actions::{FINISH, REPLACE_IN_FILE, RUN_BASH_CMD, SHOW_FILE, register_sandbox_actions};
use agent::cancel::CancelToken;
use agent::controller::Agent;
use agent::core::budget::RunLimits;
use agent::core::protocol::CallCodec;
use agent::core::types::Termination;
use agent::io::config::{SandboxConfig, SandboxKind};
use agent::io::sandbox::{LocalSandbox, NoopSandbox, Sandbox, SandboxTarget};
use agent::registry::FunctionRegistry;
use agent::test_support::{ScriptedModel, TestRepo, call_text};

fn local_sandbox(repo: &TestRepo, workspaces: &std::path::Path) -> LocalSandbox {
    let config = SandboxConfig {
        kind: SandboxKind::Local,
        workspaces_dir: workspaces.to_path_buf(),
        ..SandboxConfig::default()
    };
    let target = SandboxTarget {
        instance_id: "demo__widget-42".to_string(),
        repo: repo.path_str(),
        base_commit: repo.head().expect("head"),
    };
    LocalSandbox::create(&config, &target).expect("sandbox")
}

/// Full repair: inspect, edit, verify, submit; the patch names the edited file.
#[test]
fn repair_run_produces_patch_for_edited_file() {
    let repo = TestRepo::new().expect("repo");
    let workspaces = tempfile::tempdir().expect("tempdir");
    let sandbox = local_sandbox(&repo, workspaces.path());

    let mut model = ScriptedModel::new([
        call_text("Read the readme first.", SHOW_FILE, &[("file_path", "README.md")]),
        call_text(
            "Fix the greeting.",
            REPLACE_IN_FILE,
            &[
                ("file_path", "README.md"),
                ("old_text", "hello"),
                ("new_text", "hello, world"),
            ],
        ),
        call_text("Verify.", RUN_BASH_CMD, &[("command", "grep -c world README.md")]),
        call_text("Done.", FINISH, &[("result", "greeting fixed")]),
    ]);

    let mut registry = FunctionRegistry::new();
    register_sandbox_actions(&mut registry, &sandbox, Duration::from_secs(30)).expect("register");
    let mut agent = Agent::new("swe-agent", CallCodec::default(), &mut model, registry)
        .with_workdir(sandbox.workdir());

    let outcome = agent
        .run("Make the greeting friendlier.", &RunLimits::new(10), &CancelToken::new())
        .expect("run");

    assert_eq!(outcome.termination, Termination::Submitted);
    assert_eq!(outcome.result, "greeting fixed");
    assert_eq!(outcome.steps, 4);
    assert_eq!(agent.conversation().len(), 2 + 4 * 2);
    assert_eq!(agent.conversation()[3].content, "     1\thello");
    assert_eq!(agent.conversation()[7].content.trim(), "1");

    let patch = sandbox.generate_patch(&outcome.result).expect("patch");
    assert!(patch.contains("README.md"));
    assert!(patch.contains("+hello, world"));
}

/// A run that never edits anything yields an empty patch even when exhausted.
#[test]
fn exhausted_run_leaves_empty_patch() {
    let repo = TestRepo::new().expect("repo");
    let workspaces = tempfile::tempdir().expect("tempdir");
    let sandbox = local_sandbox(&repo, workspaces.path());

    let mut model = ScriptedModel::repeating(call_text("", RUN_BASH_CMD, &[("command", "ls")]));
    let mut registry = FunctionRegistry::new();
    register_sandbox_actions(&mut registry, &sandbox, Duration::from_secs(30)).expect("register");
    let outcome = Agent::new("swe-agent", CallCodec::default(), &mut model, registry)
        .run("Look around.", &RunLimits::new(3), &CancelToken::new())
        .expect("run");

    assert_eq!(outcome.termination, Termination::Exhausted);
    assert_eq!(model.calls(), 3);
    assert_eq!(sandbox.generate_patch(&outcome.result).expect("patch"), "");
}

/// Never more than `max_steps` dispatches, whatever the model keeps asking for.
#[test]
fn dispatches_are_bounded_by_max_steps() {
    for max_steps in [1u32, 2, 5] {
        let sandbox = agent::test_support::FakeSandbox::new();
        let mut model =
            ScriptedModel::repeating(call_text("", RUN_BASH_CMD, &[("command", "true")]));
        let mut registry = FunctionRegistry::new();
        register_sandbox_actions(&mut registry, &sandbox, Duration::from_secs(1))
            .expect("register");
        Agent::new("swe-agent", CallCodec::default(), &mut model, registry)
            .run("Loop.", &RunLimits::new(max_steps), &CancelToken::new())
            .expect("run");
        assert_eq!(sandbox.commands().len(), max_steps as usize);
    }
}

/// The no-op sandbox returns the controller's result as the patch.
#[test]
fn noop_sandbox_patch_is_submission_text() {
    let sandbox = NoopSandbox;
    let mut model = ScriptedModel::new([call_text("", FINISH, &[("result", "dry run")])]);
    let mut registry = FunctionRegistry::new();
    register_sandbox_actions(&mut registry, &sandbox, Duration::from_secs(1)).expect("register");
    let outcome = Agent::new("swe-agent", CallCodec::default(), &mut model, registry)
        .run("Nothing to do.", &RunLimits::new(2), &CancelToken::new())
        .expect("run");

    assert_eq!(
        sandbox.generate_patch(&outcome.result).expect("patch"),
        "dry run"
    );
}
