//! Eager run summary folded from the event sequence.

use serde::Serialize;

use crate::core::events::{ErrorInfo, RunEvent};
use crate::core::types::CommandResult;

/// Final outcome of a drained run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub ok: bool,
    pub artifacts_dir: Option<String>,
    pub last_error: Option<ErrorInfo>,
    /// Paths from the most recent `diff_valid` event.
    pub touched: Vec<String>,
    pub critic_cycles: u32,
    /// Latest result per command name, in first-run order.
    pub commands: Vec<CommandResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<RunEvent>,
}

impl RunSummary {
    pub fn from_events(events: Vec<RunEvent>) -> Self {
        let mut summary = RunSummary {
            ok: false,
            artifacts_dir: None,
            last_error: None,
            touched: Vec::new(),
            critic_cycles: 0,
            commands: Vec::new(),
            events: Vec::new(),
        };
        for event in &events {
            match event {
                RunEvent::DiffValid { touched, .. } => summary.touched = touched.clone(),
                RunEvent::CriticStart { iter, .. } => {
                    summary.critic_cycles = summary.critic_cycles.max(*iter);
                }
                RunEvent::CmdEnd(result) => {
                    match summary
                        .commands
                        .iter_mut()
                        .find(|seen| seen.name == result.name)
                    {
                        Some(seen) => *seen = result.clone(),
                        None => summary.commands.push(result.clone()),
                    }
                }
                RunEvent::Error(info) => {
                    summary.ok = false;
                    summary.last_error = Some(info.clone());
                }
                RunEvent::Done {
                    ok, artifacts_dir, ..
                } => {
                    summary.ok = *ok;
                    summary.artifacts_dir = Some(artifacts_dir.clone());
                }
                _ => {}
            }
        }
        summary.events = events;
        summary
    }

    /// Drop the event list, keeping only the folded fields.
    pub fn without_events(mut self) -> Self {
        self.events.clear();
        self
    }
}
