//! Planner → Coder → Critic code-modification pipeline.
//!
//! A run turns a free-text ticket into a validated unified diff applied to a
//! local git repository, then runs the plan's verification commands and feeds
//! failures back to a critic for a bounded number of repair cycles.
//!
//! - **[`core`]**: Pure logic (diff validation, plan parsing, events, reports).
//!   No I/O.
//! - **[`io`]**: Side effects (scanning, git, subprocesses, artifacts, the
//!   model backend).
//! - **[`agents`]**: The LLM-backed stages.
//!
//! [`run`] sequences the stages and [`stream`] exposes a run as an event
//! stream.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
pub mod stream;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
