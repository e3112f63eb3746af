//! System prompts and stage inputs.
//!
//! Built-in prompts are compiled in. A prompts directory may replace any of
//! them by file name (`planner.md`, `coder_input.md`, ...).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::io::scanner::RepoFile;

const PLANNER_SYSTEM: &str = include_str!("prompts/planner.md");
const CODER_SYSTEM: &str = include_str!("prompts/coder.md");
const DEBUGGER_SYSTEM: &str = include_str!("prompts/debugger.md");
const CRITIC_SYSTEM: &str = include_str!("prompts/critic.md");
const CODER_INPUT: &str = include_str!("prompts/coder_input.md");
const CRITIC_INPUT: &str = include_str!("prompts/critic_input.md");
const DEBUGGER_INPUT: &str = include_str!("prompts/debugger_input.md");

/// Constraints sent to the planner when the request has none.
pub const DEFAULT_CONSTRAINTS: [&str; 2] = ["patch-only unified diff", "respect path allowlist"];
const EXCERPTS_PLACEHOLDER: &str = "(none yet, collected after planning)";

/// Current content of one file, shown to the diff debugger.
#[derive(Debug, Clone, Serialize)]
pub struct FilePreview {
    pub path: String,
    pub content: String,
}

/// Loaded prompt set.
#[derive(Debug)]
pub struct Prompts {
    env: Environment<'static>,
    planner: String,
    coder: String,
    debugger: String,
    critic: String,
}

impl Prompts {
    /// Built-in prompts only.
    pub fn builtin() -> Result<Self> {
        Self::load(None)
    }

    /// Built-in prompts with per-file overrides from `dir`.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let pick = |file: &str, builtin: &str| -> Result<String> {
            match dir.map(|dir| dir.join(file)) {
                Some(path) if path.is_file() => {
                    debug!(path = %path.display(), "prompt override");
                    fs::read_to_string(&path)
                        .with_context(|| format!("read prompt {}", path.display()))
                }
                _ => Ok(builtin.to_string()),
            }
        };

        let mut env = Environment::new();
        for (name, builtin) in [
            ("coder_input", CODER_INPUT),
            ("critic_input", CRITIC_INPUT),
            ("debugger_input", DEBUGGER_INPUT),
        ] {
            let source = pick(&format!("{name}.md"), builtin)?;
            env.add_template_owned(name, source)
                .with_context(|| format!("compile template {name}"))?;
        }

        Ok(Self {
            env,
            planner: pick("planner.md", PLANNER_SYSTEM)?,
            coder: pick("coder.md", CODER_SYSTEM)?,
            debugger: pick("debugger.md", DEBUGGER_SYSTEM)?,
            critic: pick("critic.md", CRITIC_SYSTEM)?,
        })
    }

    pub fn planner_system(&self) -> &str {
        &self.planner
    }

    pub fn coder_system(&self) -> &str {
        &self.coder
    }

    pub fn debugger_system(&self) -> &str {
        &self.debugger
    }

    pub fn critic_system(&self) -> &str {
        &self.critic
    }

    /// JSON envelope the planner reads.
    pub fn planner_input(
        &self,
        ticket: &str,
        repo_map: &[RepoFile],
        constraints: &[String],
    ) -> Result<String> {
        let constraints: Vec<&str> = if constraints.is_empty() {
            DEFAULT_CONSTRAINTS.to_vec()
        } else {
            constraints.iter().map(String::as_str).collect()
        };
        let envelope = json!({
            "format": "planner_input_v1",
            "sections": {
                "task": ticket.trim(),
                "repo_map": repo_map,
                "relevant_excerpts": EXCERPTS_PLACEHOLDER,
                "constraints": constraints,
            }
        });
        serde_json::to_string(&envelope).context("serialize planner input")
    }

    pub fn coder_input(&self, plan_json: &str, snippets: &str) -> Result<String> {
        self.render(
            "coder_input",
            context! { plan_json => plan_json, snippets => snippets },
        )
    }

    pub fn critic_input(&self, plan_json: &str, report: &str, snippets: &str) -> Result<String> {
        self.render(
            "critic_input",
            context! { plan_json => plan_json, report => report, snippets => snippets },
        )
    }

    pub fn debugger_input(
        &self,
        error: &str,
        diff: &str,
        previews: &[FilePreview],
    ) -> Result<String> {
        self.render(
            "debugger_input",
            context! { error => error, diff => diff, previews => previews },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("load template {name}"))?;
        template
            .render(ctx)
            .with_context(|| format!("render template {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies the planner envelope carries the task, map and default constraints.
    #[test]
    fn planner_input_uses_default_constraints() {
        let prompts = Prompts::builtin().expect("prompts");
        let map = vec![RepoFile {
            path: "src/app.ts".into(),
            lang: "ts".into(),
            loc: 12,
        }];
        let raw = prompts
            .planner_input("  add a flag \n", &map, &[])
            .expect("render");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["format"], "planner_input_v1");
        assert_eq!(value["sections"]["task"], "add a flag");
        assert_eq!(value["sections"]["repo_map"][0]["loc"], 12);
        assert_eq!(
            value["sections"]["constraints"],
            json!(["patch-only unified diff", "respect path allowlist"])
        );
    }

    #[test]
    fn planner_input_keeps_explicit_constraints() {
        let prompts = Prompts::builtin().expect("prompts");
        let raw = prompts
            .planner_input("t", &[], &["no new deps".to_string()])
            .expect("render");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["sections"]["constraints"], json!(["no new deps"]));
    }

    /// Verifies coder input sections appear in order with the answer cue last.
    #[test]
    fn coder_input_sections_are_ordered() {
        let prompts = Prompts::builtin().expect("prompts");
        let text = prompts
            .coder_input("{\"impacted\":[]}", "FILE: a.ts")
            .expect("render");
        let plan = text.find("[PLAN_JSON]\n{\"impacted\":[]}").expect("plan");
        let excerpts = text.find("[RELEVANT_EXCERPTS]\nFILE: a.ts").expect("excerpts");
        let cue = text.find("Git Diff:").expect("cue");
        assert!(plan < excerpts && excerpts < cue);
    }

    #[test]
    fn critic_input_embeds_report() {
        let prompts = Prompts::builtin().expect("prompts");
        let text = prompts
            .critic_input("{}", "## unit (exit=1)", "FILE: a.ts")
            .expect("render");
        assert!(text.contains("[TEST_OUTPUT]\n## unit (exit=1)"));
        assert!(text.contains("[RELEVANT_EXCERPTS]\nFILE: a.ts"));
    }

    #[test]
    fn debugger_input_lists_previews() {
        let prompts = Prompts::builtin().expect("prompts");
        let previews = [
            FilePreview {
                path: "src/a.ts".into(),
                content: "const a = 1;".into(),
            },
            FilePreview {
                path: "src/b.ts".into(),
                content: "const b = 2;".into(),
            },
        ];
        let text = prompts
            .debugger_input("corrupt patch at line 4", "--- a/src/a.ts", &previews)
            .expect("render");
        assert!(text.starts_with("git apply failed: corrupt patch at line 4\n\n--- a/src/a.ts"));
        assert!(text.contains("File content for src/a.ts:\nconst a = 1;"));
        assert!(text.contains("File content for src/b.ts:\nconst b = 2;"));
        assert!(text.trim_end().ends_with("Git diff:"));
    }

    #[test]
    fn directory_overrides_replace_named_prompts() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("critic.md"), "custom critic").expect("write");
        fs::write(temp.path().join("coder_input.md"), "PLAN={{ plan_json }}").expect("write");

        let prompts = Prompts::load(Some(temp.path())).expect("prompts");
        assert_eq!(prompts.critic_system(), "custom critic");
        assert_eq!(prompts.coder_system(), CODER_SYSTEM);
        assert_eq!(prompts.coder_input("{}", "").expect("render"), "PLAN={}");
    }

    #[test]
    fn broken_override_template_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("critic_input.md"), "{% if %}").expect("write");
        let err = Prompts::load(Some(temp.path())).unwrap_err();
        assert!(err.to_string().contains("critic_input"));
    }
}
