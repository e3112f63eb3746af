//! Critic stage: one repair cycle driven by failing verification output.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::agents::StageContext;
use crate::core::diff::validate_unified_diff;
use crate::core::events::{PipelineError, RunEvent};
use crate::core::extract::diff_candidate;
use crate::core::report::failure_report;
use crate::core::types::CommandResult;

/// Upper bound on critic cycles per run.
pub const REPAIR_MAX: u32 = 3;

/// Ask the critic for a corrective diff and apply it.
///
/// There is no retry inside a cycle: an invalid or unappliable critic diff is
/// fatal. The extracted diff is kept as `critic/critic_<iter>.diff` either way.
#[instrument(skip_all, fields(iter = iter, model = %ctx.request.models.critic))]
pub fn repair(
    ctx: &mut StageContext<'_>,
    iter: u32,
    plan_json: &str,
    snippets: &str,
    results: &[CommandResult],
) -> Result<()> {
    let prompts = ctx.prompts;
    let request = ctx.request;
    let model = request.models.critic.as_str();
    ctx.emit(RunEvent::CriticStart {
        iter,
        model: model.to_string(),
    })?;

    let limits = *ctx.limits;
    let report = failure_report(results, limits.report_tail_chars, limits.report_total_chars);
    ctx.artifacts
        .write_text(&format!("critic/report_{iter}.txt"), &report)?;

    let input = prompts.critic_input(plan_json, &report, snippets)?;
    let response = ctx.complete(model, prompts.critic_system(), &input, RunEvent::CriticChunk)?;
    let diff = diff_candidate(&response);
    let stored = if diff.is_empty() { &response } else { &diff };
    ctx.artifacts
        .write_text(&format!("critic/critic_{iter}.diff"), stored)?;

    let validation = validate_unified_diff(&diff, ctx.allow);
    if !validation.ok {
        warn!(reason = %validation.message, "critic diff rejected");
        return Err(PipelineError::CriticDiffInvalid {
            iter,
            message: validation.message,
        }
        .into());
    }
    ctx.emit(RunEvent::DiffValid {
        touched: validation.touched.clone(),
        attempt: iter,
    })?;

    let outcome = ctx.patches.apply(&diff, &validation.touched)?;
    if !outcome.ok {
        ctx.artifacts.write_text(
            &format!("critic/critic_apply_error_{iter}.txt"),
            &outcome.message,
        )?;
        return Err(PipelineError::CriticApplyFailed {
            iter,
            message: outcome.message,
        }
        .into());
    }

    ctx.emit(RunEvent::CriticPatchApplied { iter })?;
    info!(touched = ?validation.touched, "critic patch applied");
    Ok(())
}
