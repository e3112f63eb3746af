//! Planner output parsing: strict JSON first, then recovery from prose.

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::extract::{fenced_block, raw_json};
use crate::core::types::Plan;

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");

/// A plan accepted from planner output.
#[derive(Debug, Clone)]
pub struct ParsedPlan {
    pub plan: Plan,
    /// True when the plan was recovered from a fenced block or embedded JSON.
    pub fallback: bool,
}

/// Parse planner output into a [`Plan`].
///
/// Order: whole text as JSON, then the first fenced `json` block, then the
/// first bracket-balanced JSON value anywhere in the text. The winning
/// candidate must satisfy the plan schema.
pub fn parse_plan(raw: &str) -> Result<ParsedPlan> {
    if let Ok(value) = serde_json::from_str::<Value>(raw.trim()) {
        let plan = plan_from_value(value)?;
        return Ok(ParsedPlan {
            plan,
            fallback: false,
        });
    }

    let candidates = [
        fenced_block(raw, "json").filter(|block| !block.is_empty()),
        raw_json(raw),
    ];
    let mut last_err = None;
    for candidate in candidates.into_iter().flatten() {
        let parsed = serde_json::from_str::<Value>(&candidate)
            .map_err(|err| anyhow!("extracted plan is not valid JSON: {err}"))
            .and_then(plan_from_value);
        match parsed {
            Ok(plan) => {
                return Ok(ParsedPlan {
                    plan,
                    fallback: true,
                });
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("no JSON found in planner output")))
}

/// Validate `value` against the plan schema and convert it.
pub fn plan_from_value(value: Value) -> Result<Plan> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile plan schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("plan does not match schema:\n- {}", messages.join("\n- "));
    }
    serde_json::from_value(value).context("convert plan")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{"impacted": [], "commands": []}"#;

    #[test]
    fn strict_json_is_not_a_fallback() {
        let parsed = parse_plan(MINIMAL).expect("parse");
        assert!(!parsed.fallback);
        assert!(parsed.plan.impacted.is_empty());
    }

    #[test]
    fn fenced_json_is_recovered() {
        let raw = format!("Here is the plan:\n```json\n{MINIMAL}\n```\n");
        let parsed = parse_plan(&raw).expect("parse");
        assert!(parsed.fallback);
    }

    #[test]
    fn embedded_json_is_recovered() {
        let raw = format!("Sure. {MINIMAL} Let me know if you need more.");
        let parsed = parse_plan(&raw).expect("parse");
        assert!(parsed.fallback);
    }

    #[test]
    fn non_json_fence_falls_through_to_embedded_json() {
        let raw = format!("```text\nnotes\n```\nplan: {MINIMAL}");
        let parsed = parse_plan(&raw).expect("parse");
        assert!(parsed.fallback);
    }

    #[test]
    fn fence_failing_schema_falls_through_to_embedded_json() {
        let raw = format!("Plan: {MINIMAL}\nAs a block:\n```json\n{{\"impacted\": []}}\n```");
        let parsed = parse_plan(&raw).expect("parse");
        assert!(parsed.fallback);
        assert!(parsed.plan.commands.is_empty());
    }

    #[test]
    fn schema_error_of_last_candidate_is_reported() {
        let raw = "```json\n{\"impacted\": \"all\"}\n```";
        let err = parse_plan(raw).unwrap_err();
        assert!(err.to_string().contains("does not match schema"), "{err}");
    }

    #[test]
    fn prose_without_json_is_rejected() {
        let err = parse_plan("I am not sure what to do.").unwrap_err();
        assert!(err.to_string().contains("no JSON found"));
    }

    #[test]
    fn plan_missing_commands_is_rejected() {
        let err = parse_plan(r#"{"impacted": []}"#).unwrap_err();
        assert!(err.to_string().contains("does not match schema"));
    }

    #[test]
    fn plan_with_bad_risk_is_rejected() {
        let raw = r#"{
            "impacted": [{"path": "src/a.ts", "risk": "extreme"}],
            "commands": []
        }"#;
        assert!(parse_plan(raw).is_err());
    }

    #[test]
    fn full_plan_parses_typed_fields() {
        let raw = r#"{
            "rationale": "small fix",
            "acceptance_checks": ["tests pass"],
            "impacted": [{
                "path": "src/app.ts",
                "reason": "bug",
                "operations": ["edit"],
                "symbols": ["App#render"],
                "risk": "medium"
            }],
            "tests": {"strategy": "unit", "existing_suites": [], "new_tests": []},
            "commands": [{"name": "unit", "cmd": "npm test", "when": "after_patch"}],
            "constraints": ["patch-only"]
        }"#;
        let plan = parse_plan(raw).expect("parse").plan;
        assert_eq!(plan.impacted[0].symbols, vec!["App#render".to_string()]);
        assert_eq!(plan.after_patch_commands().count(), 1);
    }
}
