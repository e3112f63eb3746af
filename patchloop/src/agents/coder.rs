//! Coder stage: plan and excerpts in, one applied patch out.
//!
//! A diff that validates but does not apply gets exactly one repair request to
//! the diff debugger before the attempt counts as failed.

use std::fs;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::agents::StageContext;
use crate::core::diff::validate_unified_diff;
use crate::core::events::{PipelineError, RunEvent};
use crate::core::extract::diff_candidate;
use crate::io::prompt::FilePreview;

/// Coder attempts before the run aborts.
pub const CODER_ATTEMPTS: u32 = 3;

/// The diff that made it into the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPatch {
    pub attempt: u32,
    pub touched: Vec<String>,
    /// True when the debugger's repaired diff was the one applied.
    pub debugged: bool,
}

/// Why one attempt produced nothing applicable.
struct AttemptFailure {
    message: String,
    apply_failed: bool,
}

/// Run coder attempts until a diff validates and applies.
#[instrument(skip_all, fields(model = %ctx.request.models.coder))]
pub fn code(ctx: &mut StageContext<'_>, plan_json: &str, snippets: &str) -> Result<AppliedPatch> {
    let prompts = ctx.prompts;
    let request = ctx.request;
    let model = request.models.coder.as_str();
    let input = prompts.coder_input(plan_json, snippets)?;

    let mut last: Option<AttemptFailure> = None;
    for attempt in 1..=CODER_ATTEMPTS {
        ctx.emit(RunEvent::CoderStart {
            model: model.to_string(),
            attempt,
        })?;
        let response = ctx.complete(model, prompts.coder_system(), &input, RunEvent::CoderChunk)?;
        let diff = diff_candidate(&response);
        if diff.is_empty() {
            let message = format!("no diff content on attempt {attempt}");
            ctx.emit(RunEvent::CoderFallback(message.clone()))?;
            last = Some(AttemptFailure {
                message,
                apply_failed: false,
            });
            continue;
        }
        ctx.artifacts
            .write_text(&format!("coder/attempt_{attempt}.diff"), &diff)?;

        let validation = validate_unified_diff(&diff, ctx.allow);
        if !validation.ok {
            let message = format!("coder diff invalid on attempt {attempt}: {}", validation.message);
            warn!(attempt, reason = %validation.message, "coder diff rejected");
            ctx.emit(RunEvent::CoderFallback(message.clone()))?;
            last = Some(AttemptFailure {
                message,
                apply_failed: false,
            });
            continue;
        }
        ctx.emit(RunEvent::DiffValid {
            touched: validation.touched.clone(),
            attempt,
        })?;

        let outcome = ctx.patches.apply(&diff, &validation.touched)?;
        if outcome.ok {
            ctx.artifacts.write_text("coder.diff", &diff)?;
            ctx.emit(RunEvent::PatchApplied {
                ok: true,
                attempt,
                debugged: false,
            })?;
            info!(attempt, "coder patch applied");
            return Ok(AppliedPatch {
                attempt,
                touched: validation.touched,
                debugged: false,
            });
        }

        record_apply_error(ctx, attempt, "coder", &outcome.message)?;
        ctx.emit(RunEvent::CoderFallback(format!(
            "git apply failed (attempt {attempt}): {} {}",
            outcome.message,
            outcome.patch_path.display()
        )))?;

        match debug_patch(ctx, attempt, &diff, &outcome.message, &validation.touched)? {
            Ok(touched) => {
                ctx.emit(RunEvent::PatchApplied {
                    ok: true,
                    attempt,
                    debugged: true,
                })?;
                info!(attempt, "debugged patch applied");
                return Ok(AppliedPatch {
                    attempt,
                    touched,
                    debugged: true,
                });
            }
            Err(failure) => {
                ctx.emit(RunEvent::PatchApplied {
                    ok: false,
                    attempt,
                    debugged: true,
                })?;
                last = Some(failure);
            }
        }
    }

    let (last, apply_failed) = match last {
        Some(failure) => (failure.message, failure.apply_failed),
        None => ("no attempts made".to_string(), false),
    };
    Err(PipelineError::CoderExhausted {
        attempts: CODER_ATTEMPTS,
        last,
        apply_failed,
    }
    .into())
}

/// One repair request for a diff `git apply` rejected.
///
/// The outer `Result` carries fatal errors; the inner one says whether the
/// repaired diff applied (with its touched paths) or why not.
fn debug_patch(
    ctx: &mut StageContext<'_>,
    attempt: u32,
    diff: &str,
    apply_error: &str,
    touched: &[String],
) -> Result<std::result::Result<Vec<String>, AttemptFailure>> {
    let prompts = ctx.prompts;
    let request = ctx.request;
    let model = request.models.coder.as_str();
    let previews = previews(ctx, touched);
    let input = prompts.debugger_input(apply_error, diff, &previews)?;
    let response = ctx.complete(
        model,
        prompts.debugger_system(),
        &input,
        RunEvent::CoderDebugChunk,
    )?;

    let fixed = diff_candidate(&response);
    if fixed.is_empty() {
        let message = format!("debugger produced no diff on attempt {attempt}");
        ctx.emit(RunEvent::CoderFallback(message.clone()))?;
        return Ok(Err(AttemptFailure {
            message,
            apply_failed: true,
        }));
    }
    ctx.artifacts
        .write_text(&format!("coder/debug_{attempt}.diff"), &fixed)?;

    let validation = validate_unified_diff(&fixed, ctx.allow);
    if !validation.ok {
        let message = format!(
            "debugger diff invalid on attempt {attempt}: {}",
            validation.message
        );
        ctx.emit(RunEvent::CoderFallback(message.clone()))?;
        return Ok(Err(AttemptFailure {
            message,
            apply_failed: false,
        }));
    }
    ctx.emit(RunEvent::DiffValid {
        touched: validation.touched.clone(),
        attempt,
    })?;

    let outcome = ctx.patches.apply(&fixed, &validation.touched)?;
    if outcome.ok {
        ctx.artifacts.write_text("coder.diff", &fixed)?;
        return Ok(Ok(validation.touched));
    }
    record_apply_error(ctx, attempt, "debugger", &outcome.message)?;
    let message = format!(
        "git apply failed again on attempt {attempt}: {}",
        outcome.message
    );
    ctx.emit(RunEvent::CoderFallback(message.clone()))?;
    Ok(Err(AttemptFailure {
        message,
        apply_failed: true,
    }))
}

/// Leading lines of each touched file that currently exists.
fn previews(ctx: &StageContext<'_>, touched: &[String]) -> Vec<FilePreview> {
    let limit = ctx.limits.debug_preview_lines;
    touched
        .iter()
        .filter_map(|rel| {
            let bytes = match fs::read(ctx.repo.join(rel)) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(path = %rel, err = %err, "no preview for touched file");
                    return None;
                }
            };
            let text = String::from_utf8_lossy(&bytes);
            let content = text.lines().take(limit).collect::<Vec<_>>().join("\n");
            Some(FilePreview {
                path: rel.clone(),
                content,
            })
        })
        .collect()
}

fn record_apply_error(
    ctx: &StageContext<'_>,
    attempt: u32,
    source: &str,
    message: &str,
) -> Result<()> {
    ctx.artifacts.append_text(
        "apply_error.txt",
        &format!("=== attempt {attempt} ({source}) ===\n{message}\n\n"),
    )?;
    Ok(())
}
