//! Orchestration for one pipeline run.
//!
//! Planning, snippet collection, coding, verification and the critic loop run
//! strictly in sequence. Progress leaves the pipeline only as [`RunEvent`]s;
//! fatal failures become a single `error` event, everything else ends in
//! `done`.

use std::fs;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::agents::critic::REPAIR_MAX;
use crate::agents::{StageContext, coder, critic, planner};
use crate::core::allowlist::AllowList;
use crate::core::events::{ConsumerGone, ErrorInfo, EventSink, PipelineError, RunEvent};
use crate::core::report::tail_chars;
use crate::core::types::{CommandResult, PlanCommand, RunRequest};
use crate::io::artifacts::RunArtifacts;
use crate::io::broker::TextGenerator;
use crate::io::config::Limits;
use crate::io::patch::PatchEngine;
use crate::io::prompt::Prompts;
use crate::io::sandbox::{SandboxOutcome, run_shell};
use crate::io::{scanner, snippets};

const STILL_FAILING: &str = "Some commands still failing after critic loop.";

/// A configured pipeline. Holds no per-run state, so one value can serve any
/// number of sequential runs.
pub struct Pipeline<G> {
    generator: G,
    prompts: Prompts,
    limits: Limits,
}

impl<G: TextGenerator> Pipeline<G> {
    pub fn new(generator: G, prompts: Prompts, limits: Limits) -> Self {
        Self {
            generator,
            prompts,
            limits,
        }
    }

    /// Drive one run to completion, pushing every event into `sink`.
    ///
    /// The stream always ends with `done` or `error` unless the sink reports
    /// [`ConsumerGone`], in which case the run stops quietly. The returned error
    /// is reserved for a sink that fails for any other reason.
    pub fn run(&self, request: &RunRequest, sink: &mut dyn EventSink) -> Result<()> {
        let err = match self.execute(request, sink) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if err.downcast_ref::<ConsumerGone>().is_some() {
            debug!("event consumer gone, run stopped");
            return Ok(());
        }
        let info = ErrorInfo::from_error(&err);
        warn!(kind = ?info.kind, err = %info.message, "run aborted");
        match sink.emit(RunEvent::Error(info)) {
            Err(err) if err.downcast_ref::<ConsumerGone>().is_some() => Ok(()),
            other => other,
        }
    }

    #[instrument(skip_all, fields(repo = %request.repo.display()))]
    fn execute(&self, request: &RunRequest, sink: &mut dyn EventSink) -> Result<()> {
        let repo = match fs::canonicalize(&request.repo) {
            Ok(path) if path.is_dir() => path,
            _ => return Err(PipelineError::RepoNotFound(request.repo.clone()).into()),
        };
        let allow = AllowList::new(&request.allow).context("build allowlist")?;
        let artifacts = RunArtifacts::create(&repo)?;
        let mut patches = PatchEngine::new(&repo);
        info!(artifacts = %artifacts.dir().display(), "run started");

        let mut ctx = StageContext {
            generator: &self.generator,
            prompts: &self.prompts,
            limits: &self.limits,
            request,
            repo: &repo,
            allow: &allow,
            artifacts: &artifacts,
            patches: &mut patches,
            sink,
        };

        let repo_map = scanner::scan(&repo, request.max_map, &allow)?;
        ctx.emit(RunEvent::RepoMap {
            count: repo_map.len(),
        })?;

        let plan = planner::plan(&mut ctx, &repo_map)?;
        let plan_json = serde_json::to_string(&plan).context("serialize plan")?;

        let snippets = snippets::collect(
            &repo,
            &plan.impacted,
            self.limits.context_lines,
            self.limits.fallback_cap_lines,
        );
        ctx.emit(RunEvent::SnippetsReady {
            len: snippets.chars().count(),
        })?;

        let applied = coder::code(&mut ctx, &plan_json, &snippets)?;
        info!(
            attempt = applied.attempt,
            debugged = applied.debugged,
            touched = ?applied.touched,
            "coder stage finished"
        );

        let commands: Vec<PlanCommand> = plan.after_patch_commands().cloned().collect();
        let mut results = run_commands(&mut ctx, &commands, 0)?;
        let mut cycle = 0;
        while !all_ok(&results) && cycle < REPAIR_MAX {
            cycle += 1;
            critic::repair(&mut ctx, cycle, &plan_json, &snippets, &results)?;
            results = run_commands(&mut ctx, &commands, cycle)?;
        }

        let ok = all_ok(&results);
        info!(ok, critic_cycles = cycle, "run finished");
        ctx.emit(RunEvent::Done {
            ok,
            artifacts_dir: artifacts.dir().display().to_string(),
            message: (!ok).then(|| STILL_FAILING.to_string()),
        })
    }
}

/// Run every command in order and persist its logs.
///
/// A timeout is fatal, but only after the partial output is on disk.
fn run_commands(
    ctx: &mut StageContext<'_>,
    commands: &[PlanCommand],
    cycle: u32,
) -> Result<Vec<CommandResult>> {
    let timeout_sec = ctx.request.timeout_sec;
    let limits = *ctx.limits;
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let name = command.label();
        ctx.emit(RunEvent::CmdStart {
            name: name.to_string(),
            cmd: command.cmd.clone(),
        })?;
        let outcome = run_shell(
            name,
            &command.cmd,
            ctx.repo,
            timeout_sec,
            limits.command_output_limit_bytes,
        )?;
        let (result, timed_out) = match outcome {
            SandboxOutcome::Finished(result) => (result, false),
            SandboxOutcome::TimedOut(result) => (result, true),
        };
        ctx.artifacts.write_command_log(cycle, &result)?;
        ctx.emit(RunEvent::CmdEnd(bounded(&result, limits.event_chunk_chars)))?;
        if timed_out {
            return Err(PipelineError::CommandTimeout {
                name: result.name,
                timeout_sec,
            }
            .into());
        }
        results.push(result);
    }
    Ok(results)
}

/// Vacuously true for an empty set.
fn all_ok(results: &[CommandResult]) -> bool {
    results.iter().all(|result| result.ok)
}

/// Copy of `result` with output tails fit for an event payload.
fn bounded(result: &CommandResult, max_chars: usize) -> CommandResult {
    CommandResult {
        name: result.name.clone(),
        ok: result.ok,
        code: result.code,
        stdout: tail_chars(&result.stdout, max_chars).to_string(),
        stderr: tail_chars(&result.stderr, max_chars).to_string(),
    }
}
