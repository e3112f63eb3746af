//! Side-effecting helpers: filesystem, git, subprocesses and the model backend.

pub mod artifacts;
pub mod broker;
pub mod config;
pub mod git;
pub mod patch;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod scanner;
pub mod snippets;
