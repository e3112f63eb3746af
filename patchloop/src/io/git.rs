//! Git adapter.
//!
//! The pipeline only ever mutates a repository through `git apply`, so the
//! wrapper stays small and explicit about every subprocess it runs.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

/// Result of one `git apply` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitApply {
    pub ok: bool,
    /// stderr, or stdout when stderr is empty. Empty on success.
    pub message: String,
}

/// Files a patch would write, or git's complaint when it cannot read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchTargets {
    Paths(Vec<String>),
    Unreadable(String),
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// `git apply --whitespace=fix <patch>`.
    ///
    /// A rejected patch is a normal outcome, not an error. Errors are reserved
    /// for failing to spawn git at all.
    #[instrument(skip_all, fields(patch = %patch.display()))]
    pub fn apply(&self, patch: &Path) -> Result<GitApply> {
        let patch_arg = patch.to_string_lossy();
        let output = self.run(&["apply", "--whitespace=fix", &patch_arg])?;
        if output.status.success() {
            debug!("patch applied");
            return Ok(GitApply {
                ok: true,
                message: String::new(),
            });
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        };
        warn!(message = %message, "git apply rejected patch");
        Ok(GitApply { ok: false, message })
    }

    /// Paths `git apply` would write for `patch`, read with `--numstat`.
    ///
    /// This is git's own reading of the patch, including hunks before any
    /// `diff --git` line and its `-p1` prefix stripping.
    #[instrument(skip_all, fields(patch = %patch.display()))]
    pub fn patch_targets(&self, patch: &Path) -> Result<PatchTargets> {
        let patch_arg = patch.to_string_lossy();
        let output = self.run(&["apply", "--numstat", "-z", &patch_arg])?;
        if !output.status.success() {
            let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if message.is_empty() {
                message = "git could not read the patch".to_string();
            }
            debug!(message = %message, "git could not read patch");
            return Ok(PatchTargets::Unreadable(message));
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        let paths = listing
            .split('\0')
            .filter_map(|record| record.splitn(3, '\t').nth(2))
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect();
        Ok(PatchTargets::Paths(paths))
    }

    /// Initialise a repository with a fixed identity for local commits.
    #[cfg(any(test, feature = "test-support"))]
    pub fn init(&self) -> Result<()> {
        self.run_checked(&["init", "--quiet"])?;
        self.run_checked(&["config", "user.email", "patchloop@localhost"])?;
        self.run_checked(&["config", "user.name", "patchloop"])?;
        Ok(())
    }

    /// Stage everything and commit. Returns false when there was nothing to commit.
    #[cfg(any(test, feature = "test-support"))]
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.run_checked(&["add", "-A"])?;
        let staged = self.run_capture(&["diff", "--cached", "--name-only"])?;
        if staged.trim().is_empty() {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "--quiet", "-m", message])?;
        Ok(true)
    }

    #[cfg(any(test, feature = "test-support"))]
    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    #[cfg(any(test, feature = "test-support"))]
    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn repo_with(file: &str, contents: &str) -> (tempfile::TempDir, Git) {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.init().expect("init");
        fs::write(temp.path().join(file), contents).expect("write");
        git.commit_all("seed").expect("commit");
        (temp, git)
    }

    #[test]
    fn applies_clean_patch() {
        let (temp, git) = repo_with("a.txt", "old\n");
        let patch = temp.path().join("p.diff");
        fs::write(&patch, "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-old\n+new\n").expect("write");

        let result = git.apply(&patch).expect("apply");
        assert!(result.ok, "{}", result.message);
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("read"), "new\n");
    }

    #[test]
    fn rejected_patch_reports_git_message() {
        let (temp, git) = repo_with("a.txt", "old\n");
        let patch = temp.path().join("p.diff");
        fs::write(&patch, "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-other\n+new\n")
            .expect("write");

        let result = git.apply(&patch).expect("apply");
        assert!(!result.ok);
        assert!(result.message.contains("patch does not apply"), "{}", result.message);
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("read"), "old\n");
    }

    #[test]
    fn targets_follow_git_path_stripping() {
        let (temp, git) = repo_with("a.txt", "old\n");
        let patch = temp.path().join("p.diff");
        fs::write(
            &patch,
            "--- src/Cargo.toml\n+++ src/Cargo.toml\n@@ -1 +1 @@\n-a\n+b\n\
             --- /dev/null\n+++ b/docs/new.md\n@@ -0,0 +1 @@\n+hello\n",
        )
        .expect("write");

        let targets = git.patch_targets(&patch).expect("numstat");
        assert_eq!(
            targets,
            PatchTargets::Paths(vec!["Cargo.toml".to_string(), "docs/new.md".to_string()])
        );
    }

    #[test]
    fn unreadable_patch_reports_git_message() {
        let (temp, git) = repo_with("a.txt", "old\n");
        let patch = temp.path().join("p.diff");
        fs::write(&patch, "--- a/a.txt\n+++ b/a.txt\n@@ -1,5 +1 @@\n-old\n").expect("write");

        let PatchTargets::Unreadable(message) = git.patch_targets(&patch).expect("numstat") else {
            panic!("expected git to refuse the truncated hunk");
        };
        assert!(!message.is_empty());
    }

    #[test]
    fn commit_all_skips_clean_tree() {
        let (_temp, git) = repo_with("a.txt", "x\n");
        assert!(!git.commit_all("again").expect("commit"));
    }
}
