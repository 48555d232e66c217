//! Bounded ReAct agent for automated software repair.
//!
//! A controller drives a language model through think, act, observe steps.
//! Each response must end in one textual function call, which is dispatched
//! against a per-instance sandbox until the model submits or a budget runs
//! out. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (call protocol, budgets, error kinds).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (processes, git, containers, HTTP,
//!   persisted artifacts). Isolated behind traits so tests can script them.
//!
//! [`controller`] ties them together through the [`registry`] of [`actions`].

pub mod actions;
pub mod cancel;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
