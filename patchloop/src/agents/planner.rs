//! Planner stage: ticket and repo map in, validated plan out.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::agents::StageContext;
use crate::core::events::{PipelineError, RunEvent};
use crate::core::plan::parse_plan;
use crate::core::types::Plan;
use crate::io::scanner::RepoFile;

/// Planner requests made before the run aborts.
pub const PLANNER_ATTEMPTS: u32 = 3;

/// Ask the planner for a plan until one parses and validates.
///
/// Every attempt's raw text is kept as `planner/attempt_<n>.txt`; the final
/// attempt is also `plan_raw.txt`, and an accepted plan is `plan.json`.
#[instrument(skip_all, fields(model = %ctx.request.models.planner))]
pub fn plan(ctx: &mut StageContext<'_>, repo_map: &[RepoFile]) -> Result<Plan> {
    let prompts = ctx.prompts;
    let request = ctx.request;
    let model = request.models.planner.as_str();
    let input = prompts.planner_input(&request.ticket, repo_map, &request.constraints)?;

    let mut last_raw = String::new();
    let mut last_err = String::new();
    for attempt in 1..=PLANNER_ATTEMPTS {
        ctx.emit(RunEvent::PlannerStart {
            model: model.to_string(),
            attempt,
        })?;
        let raw = ctx.complete(
            model,
            prompts.planner_system(),
            &input,
            RunEvent::PlannerChunk,
        )?;
        ctx.artifacts
            .write_text(&format!("planner/attempt_{attempt}.txt"), &raw)?;

        match parse_plan(&raw) {
            Ok(parsed) => {
                ctx.artifacts.write_text("plan_raw.txt", &raw)?;
                ctx.artifacts.write_json("plan.json", &parsed.plan)?;
                info!(
                    attempt,
                    fallback = parsed.fallback,
                    impacted = parsed.plan.impacted.len(),
                    "plan accepted"
                );
                ctx.emit(RunEvent::PlannerDone {
                    ok: true,
                    attempt,
                    fallback: parsed.fallback,
                })?;
                return Ok(parsed.plan);
            }
            Err(err) => {
                warn!(attempt, err = %format!("{err:#}"), "planner output rejected");
                ctx.emit(RunEvent::PlannerFallback(format!(
                    "attempt {attempt}: {err:#}"
                )))?;
                last_err = format!("{err:#}");
                last_raw = raw;
            }
        }
    }

    ctx.artifacts.write_text("plan_raw.txt", &last_raw)?;
    ctx.emit(RunEvent::PlannerDone {
        ok: false,
        attempt: PLANNER_ATTEMPTS,
        fallback: false,
    })?;
    Err(PipelineError::PlannerExhausted {
        attempts: PLANNER_ATTEMPTS,
        last: last_err,
    }
    .into())
}
