//! LLM-backed pipeline stages: planner, coder (with diff debugger) and critic.
//!
//! Each stage borrows a [`StageContext`] for the run it belongs to and reports
//! progress through the context's event sink.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::allowlist::AllowList;
use crate::core::events::{EventSink, RunEvent};
use crate::core::report::tail_chars;
use crate::core::types::RunRequest;
use crate::io::artifacts::RunArtifacts;
use crate::io::broker::{GenerateRequest, TextGenerator};
use crate::io::config::Limits;
use crate::io::patch::PatchEngine;
use crate::io::prompt::Prompts;

pub mod coder;
pub mod critic;
pub mod planner;

/// Everything a stage needs for one run.
pub struct StageContext<'a> {
    pub generator: &'a dyn TextGenerator,
    pub prompts: &'a Prompts,
    pub limits: &'a Limits,
    pub request: &'a RunRequest,
    /// Canonical repository root.
    pub repo: &'a Path,
    pub allow: &'a AllowList,
    pub artifacts: &'a RunArtifacts,
    pub patches: &'a mut PatchEngine,
    pub sink: &'a mut dyn EventSink,
}

impl StageContext<'_> {
    pub fn emit(&mut self, event: RunEvent) -> Result<()> {
        self.sink.emit(event)
    }

    /// Stream a completion, forwarding each chunk as an event built by `wrap`.
    ///
    /// Returns the concatenated response text.
    pub fn complete(
        &mut self,
        model: &str,
        system: &str,
        input: &str,
        wrap: fn(String) -> RunEvent,
    ) -> Result<String> {
        let generator = self.generator;
        let request = GenerateRequest::new(model, system, input);
        let stream = generator
            .generate_stream(&request)
            .with_context(|| format!("request completion from model '{model}'"))?;
        let mut text = String::new();
        for chunk in stream {
            let chunk = chunk.with_context(|| format!("read completion from model '{model}'"))?;
            text.push_str(&chunk);
            let tail = tail_chars(&chunk, self.limits.event_chunk_chars).to_string();
            self.sink.emit(wrap(tail))?;
        }
        Ok(text)
    }
}
