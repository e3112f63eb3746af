//! Run events, the pipeline error taxonomy and the sink events are pushed into.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::CommandResult;

/// One record of the run event stream.
///
/// Serializes as `{"event": "<name>", "data": ...}`, one object per NDJSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RunEvent {
    RepoMap {
        count: usize,
    },
    PlannerStart {
        model: String,
        attempt: u32,
    },
    PlannerChunk(String),
    PlannerDone {
        ok: bool,
        attempt: u32,
        fallback: bool,
    },
    PlannerFallback(String),
    SnippetsReady {
        len: usize,
    },
    CoderStart {
        model: String,
        attempt: u32,
    },
    CoderChunk(String),
    CoderFallback(String),
    CoderDebugChunk(String),
    DiffValid {
        touched: Vec<String>,
        attempt: u32,
    },
    PatchApplied {
        ok: bool,
        attempt: u32,
        debugged: bool,
    },
    CmdStart {
        name: String,
        cmd: String,
    },
    CmdEnd(CommandResult),
    CriticStart {
        iter: u32,
        model: String,
    },
    CriticChunk(String),
    CriticPatchApplied {
        iter: u32,
    },
    Error(ErrorInfo),
    Done {
        ok: bool,
        artifacts_dir: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl RunEvent {
    /// `error` and `done` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Error(_) | RunEvent::Done { .. })
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RepoMap { .. } => "repo_map",
            RunEvent::PlannerStart { .. } => "planner_start",
            RunEvent::PlannerChunk(_) => "planner_chunk",
            RunEvent::PlannerDone { .. } => "planner_done",
            RunEvent::PlannerFallback(_) => "planner_fallback",
            RunEvent::SnippetsReady { .. } => "snippets_ready",
            RunEvent::CoderStart { .. } => "coder_start",
            RunEvent::CoderChunk(_) => "coder_chunk",
            RunEvent::CoderFallback(_) => "coder_fallback",
            RunEvent::CoderDebugChunk(_) => "coder_debug_chunk",
            RunEvent::DiffValid { .. } => "diff_valid",
            RunEvent::PatchApplied { .. } => "patch_applied",
            RunEvent::CmdStart { .. } => "cmd_start",
            RunEvent::CmdEnd(_) => "cmd_end",
            RunEvent::CriticStart { .. } => "critic_start",
            RunEvent::CriticChunk(_) => "critic_chunk",
            RunEvent::CriticPatchApplied { .. } => "critic_patch_applied",
            RunEvent::Error(_) => "error",
            RunEvent::Done { .. } => "done",
        }
    }
}

/// Payload of the `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    /// Classify `err` and render its full context chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            kind: classify(err),
            message: format!("{err:#}"),
        }
    }
}

/// Fatal error classes surfaced on the `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Unrecoverable plan or diff that breaks the output contract.
    Protocol,
    /// `git apply` rejected a patch with no recovery left.
    Application,
    /// Missing repository, timeouts, transport or artifact I/O failures.
    Environment,
}

/// Typed fatal failures raised by the pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("repository not found: {}", .0.display())]
    RepoNotFound(PathBuf),

    #[error("planner produced no usable plan after {attempts} attempts: {last}")]
    PlannerExhausted { attempts: u32, last: String },

    #[error("coder produced no applicable diff after {attempts} attempts: {last}")]
    CoderExhausted {
        attempts: u32,
        last: String,
        apply_failed: bool,
    },

    #[error("critic diff rejected in cycle {iter}: {message}")]
    CriticDiffInvalid { iter: u32, message: String },

    #[error("critic patch failed to apply in cycle {iter}: {message}")]
    CriticApplyFailed { iter: u32, message: String },

    #[error("command '{name}' timed out after {timeout_sec}s")]
    CommandTimeout { name: String, timeout_sec: u64 },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::RepoNotFound(_) | PipelineError::CommandTimeout { .. } => {
                ErrorKind::Environment
            }
            PipelineError::PlannerExhausted { .. } | PipelineError::CriticDiffInvalid { .. } => {
                ErrorKind::Protocol
            }
            PipelineError::CoderExhausted { apply_failed, .. } => {
                if *apply_failed {
                    ErrorKind::Application
                } else {
                    ErrorKind::Protocol
                }
            }
            PipelineError::CriticApplyFailed { .. } => ErrorKind::Application,
        }
    }
}

/// The event consumer went away; the run stops without reporting.
#[derive(Debug, Error)]
#[error("event consumer disconnected")]
pub struct ConsumerGone;

/// Error kind for `err`. Anything untyped counts as an environment failure.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    err.downcast_ref::<PipelineError>()
        .map(PipelineError::kind)
        .unwrap_or(ErrorKind::Environment)
}

/// Destination for run events.
///
/// Returning an error (typically [`ConsumerGone`]) stops the run at the next
/// emit.
pub trait EventSink {
    fn emit(&mut self, event: RunEvent) -> Result<()>;
}

impl EventSink for Vec<RunEvent> {
    fn emit(&mut self, event: RunEvent) -> Result<()> {
        self.push(event);
        Ok(())
    }
}
