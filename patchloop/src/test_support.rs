//! Test-only fakes and fixtures: a scripted model backend, a scratch git
//! repository, and builders for planner and coder responses.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::types::{ModelSet, RunRequest};
use crate::io::artifacts::ARTIFACTS_DIR;
use crate::io::broker::{GenerateRequest, TextGenerator, TokenStream};
use crate::io::git::Git;

/// Characters per streamed chunk.
const CHUNK_CHARS: usize = 7;

/// Model backend that replays queued responses in order.
///
/// Every request is recorded. Streaming splits a response into small chunks so
/// consumers see more than one.
#[derive(Debug, Default)]
pub struct ScriptedBroker {
    responses: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: impl Into<String>) {
        self.queue().push_back(Ok(response.into()));
    }

    /// Queue a transport failure.
    pub fn push_error(&self, message: impl Into<String>) {
        self.queue().push_back(Err(message.into()));
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Panics if any queued response was never requested.
    pub fn assert_drained(&self) {
        let left = self.queue().len();
        assert_eq!(left, 0, "scripted broker still holds {left} response(s)");
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, String>>> {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_response(&self, request: &GenerateRequest) -> Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        match self.queue().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!(
                "scripted broker has no response left for model '{}'",
                request.model
            )),
        }
    }
}

impl TextGenerator for ScriptedBroker {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        self.next_response(request)
    }

    fn generate_stream(&self, request: &GenerateRequest) -> Result<TokenStream<'_>> {
        let text = self.next_response(request)?;
        let chars: Vec<char> = text.chars().collect();
        let chunks: Vec<String> = chars
            .chunks(CHUNK_CHARS)
            .map(|chunk| chunk.iter().collect())
            .collect();
        Ok(Box::new(chunks.into_iter().map(Ok)))
    }
}

/// Git repository in a temp dir with one committed source file.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    /// Path of the seeded file.
    pub const SEED_FILE: &'static str = "src/app.ts";
    /// Only line of the seeded file.
    pub const SEED_LINE: &'static str = "export const answer = 41;";

    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let git = Git::new(dir.path());
        git.init()?;
        let repo = Self { dir };
        repo.write(Self::SEED_FILE, &format!("{}\n", Self::SEED_LINE))?;
        git.commit_all("seed")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Request with `src/**` and `tests/**` allowed and a short command timeout.
    pub fn request(&self, ticket: &str) -> RunRequest {
        RunRequest {
            repo: self.path().to_path_buf(),
            ticket: ticket.to_string(),
            allow: vec!["src/**".to_string(), "tests/**".to_string()],
            models: ModelSet {
                planner: "test-planner".to_string(),
                coder: "test-coder".to_string(),
                critic: "test-critic".to_string(),
            },
            constraints: Vec::new(),
            timeout_sec: 30,
            max_map: 100,
        }
    }

    /// Artifact directories created so far, sorted.
    pub fn artifact_dirs(&self) -> Vec<PathBuf> {
        let root = self.path().join(ARTIFACTS_DIR);
        let Ok(entries) = fs::read_dir(&root) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        dirs
    }

    /// The single artifact directory of a one-run test.
    pub fn only_artifact_dir(&self) -> PathBuf {
        let mut dirs = self.artifact_dirs();
        assert_eq!(dirs.len(), 1, "expected one artifact dir, found {dirs:?}");
        dirs.remove(0)
    }
}

/// Planner response builder.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    impacted: Vec<Value>,
    commands: Vec<Value>,
}

pub fn plan() -> PlanBuilder {
    PlanBuilder::default()
}

impl PlanBuilder {
    pub fn impacted(mut self, path: &str, symbols: &[&str]) -> Self {
        self.impacted.push(json!({
            "path": path,
            "operations": ["edit"],
            "symbols": symbols,
            "risk": "low",
        }));
        self
    }

    /// An `after_patch` command.
    pub fn command(mut self, name: &str, cmd: &str) -> Self {
        self.commands
            .push(json!({ "name": name, "cmd": cmd, "when": "after_patch" }));
        self
    }

    /// Plan JSON exactly as a well-behaved planner would answer.
    pub fn build(self) -> String {
        json!({
            "rationale": "scripted plan",
            "impacted": self.impacted,
            "commands": self.commands,
        })
        .to_string()
    }
}

/// Diff replacing the only line of a one-line file.
pub fn replace_line_diff(path: &str, old: &str, new: &str) -> String {
    format!("--- a/{path}\n+++ b/{path}\n@@ -1 +1 @@\n-{old}\n+{new}\n")
}

/// Diff creating `path` with the given lines.
pub fn new_file_diff(path: &str, lines: &[&str]) -> String {
    let mut diff = format!("--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,{} @@\n", lines.len());
    for line in lines {
        diff.push('+');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}

/// Wrap `body` in a fenced block the way chatty models answer.
pub fn fenced(lang: &str, body: &str) -> String {
    format!("Here is the change:\n\n```{lang}\n{}\n```\nLet me know if you need more.", body.trim_end())
}
