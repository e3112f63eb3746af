//! Shared deterministic types for the pipeline core.
//!
//! These types define stable contracts between stages. They do not depend on
//! external state or I/O and serialize deterministically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Model identifiers for the three LLM-backed stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSet {
    pub planner: String,
    pub coder: String,
    pub critic: String,
}

/// Inputs for one pipeline run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Root of the target repository.
    pub repo: PathBuf,
    /// Free-text ticket describing the change.
    pub ticket: String,
    /// Glob patterns a touched path must match (at least one).
    pub allow: Vec<String>,
    pub models: ModelSet,
    /// Free-text constraints forwarded to the planner.
    pub constraints: Vec<String>,
    /// Wall-clock limit for each verification command.
    pub timeout_sec: u64,
    /// Maximum number of files in the repo map.
    pub max_map: usize,
}

/// Kind of change the planner expects for an impacted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Edit,
    Add,
    Remove,
}

/// Planner-assessed risk tier for an impacted file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
}

/// A file the plan expects to touch. Only scopes snippet collection; the diff
/// validator re-checks every path on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactedFile {
    pub path: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub risk: Risk,
}

/// A test the planner proposes to add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTest {
    pub path: String,
    #[serde(default)]
    pub why: String,
}

/// Advisory test strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub existing_suites: Vec<String>,
    #[serde(default)]
    pub new_tests: Vec<NewTest>,
}

impl Default for TestPlan {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            existing_suites: Vec::new(),
            new_tests: Vec::new(),
        }
    }
}

fn default_strategy() -> String {
    "unit".to_string()
}

/// Phase tag of the commands the pipeline executes.
pub const AFTER_PATCH: &str = "after_patch";

/// Label used for a command the planner left unnamed.
const UNNAMED_COMMAND: &str = "cmd";

/// A verification command declared by the plan.
///
/// `name` and `when` keep whatever the planner wrote, absent keys included,
/// so the plan forwarded to later stages is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

impl PlanCommand {
    /// Name for events and logs; blank or missing names become `cmd`.
    pub fn label(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => UNNAMED_COMMAND,
        }
    }

    pub fn is_after_patch(&self) -> bool {
        self.when.as_deref() == Some(AFTER_PATCH)
    }
}

/// Structured change plan produced once by the planner stage.
///
/// Keys outside the typed fields are preserved in `extra` so the plan JSON
/// forwarded to later stages matches what the planner produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub acceptance_checks: Vec<String>,
    pub impacted: Vec<ImpactedFile>,
    #[serde(default)]
    pub tests: TestPlan,
    pub commands: Vec<PlanCommand>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Plan {
    /// Commands that run after every patch, in declaration order.
    pub fn after_patch_commands(&self) -> impl Iterator<Item = &PlanCommand> {
        self.commands
            .iter()
            .filter(|command| command.is_after_patch())
    }
}

/// Outcome of one verification command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub name: String,
    pub ok: bool,
    /// Exit code, or -1 when the process was terminated by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}
