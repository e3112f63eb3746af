//! Patch application: persist the diff inside the repository, then `git apply`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::artifacts::utc_stamp;
use crate::io::git::{Git, PatchTargets};

/// Outcome of applying one diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub ok: bool,
    pub message: String,
    /// Patch file left on disk for inspection.
    pub patch_path: PathBuf,
}

/// Applies diffs to one repository, numbering patch files per run.
#[derive(Debug)]
pub struct PatchEngine {
    git: Git,
    seq: u32,
}

impl PatchEngine {
    pub fn new(repo: &Path) -> Self {
        Self {
            git: Git::new(repo),
            seq: 0,
        }
    }

    /// Write `diff` to `.agent_patch_<stamp>_<seq>.diff` in the repo root and
    /// apply it. `touched` is the validated path set for the diff.
    ///
    /// Git is asked which files the patch writes before anything changes. A
    /// patch reaching any file outside `touched` is refused untouched, as is
    /// one git rejects. Errors mean the patch file could not be written or git
    /// could not be run.
    #[instrument(skip_all, fields(seq = self.seq + 1))]
    pub fn apply(&mut self, diff: &str, touched: &[String]) -> Result<ApplyOutcome> {
        self.seq += 1;
        let name = format!(".agent_patch_{}_{:03}.diff", utc_stamp(), self.seq);
        let patch_path = self.git.workdir().join(name);
        fs::write(&patch_path, diff)
            .with_context(|| format!("write patch {}", patch_path.display()))?;

        let refused = match self.git.patch_targets(&patch_path)? {
            PatchTargets::Unreadable(message) => Some(message),
            PatchTargets::Paths(paths) => {
                let stray: Vec<String> = paths
                    .into_iter()
                    .filter(|path| !touched.contains(path))
                    .collect();
                (!stray.is_empty()).then(|| {
                    warn!(stray = ?stray, "patch reaches beyond validated paths");
                    format!("patch writes outside the validated paths: {}", stray.join(", "))
                })
            }
        };
        if let Some(message) = refused {
            return Ok(ApplyOutcome {
                ok: false,
                message,
                patch_path,
            });
        }

        let applied = self.git.apply(&patch_path)?;
        info!(ok = applied.ok, patch = %patch_path.display(), "patch apply finished");
        Ok(ApplyOutcome {
            ok: applied.ok,
            message: applied.message,
            patch_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::allowlist::AllowList;
    use crate::core::diff::validate_unified_diff;

    fn seeded_repo(files: &[(&str, &str)]) -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.init().expect("init");
        for (rel, contents) in files {
            let path = temp.path().join(rel);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(path, contents).expect("write");
        }
        git.commit_all("seed").expect("commit");
        temp
    }

    fn touched(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|path| path.to_string()).collect()
    }

    #[test]
    fn patch_files_are_numbered_and_kept() {
        let temp = seeded_repo(&[("a.txt", "old\n")]);
        let mut engine = PatchEngine::new(temp.path());
        let only_a = touched(&["a.txt"]);

        let bad = engine
            .apply("--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-nope\n+new\n", &only_a)
            .expect("apply");
        assert!(!bad.ok);
        assert!(!bad.message.is_empty());
        assert!(bad.patch_path.is_file());

        let good = engine
            .apply("--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-old\n+new\n", &only_a)
            .expect("apply");
        assert!(good.ok, "{}", good.message);
        assert_ne!(bad.patch_path, good.patch_path);

        let name = good
            .patch_path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("name");
        assert!(name.starts_with(".agent_patch_"));
        assert!(name.ends_with("_002.diff"));
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("read"), "new\n");
    }

    /// Verifies a hunk placed before the first `diff --git` line cannot slip
    /// past the allowlist: the validator ignores it, git would not.
    #[test]
    fn hunk_before_git_header_is_refused() {
        let temp = seeded_repo(&[
            ("Cargo.toml", "name = \"demo\"\n"),
            ("src/app.ts", "old\n"),
        ]);
        let diff = "--- a/Cargo.toml\n+++ b/Cargo.toml\n@@ -1 +1 @@\n-name = \"demo\"\n+PWNED\n\
                    diff --git a/src/app.ts b/src/app.ts\n--- a/src/app.ts\n+++ b/src/app.ts\n\
                    @@ -1 +1 @@\n-old\n+new\n";
        let allow = AllowList::new(&["src/**"]).expect("allowlist");
        let validation = validate_unified_diff(diff, &allow);
        assert!(validation.ok, "{}", validation.message);
        assert_eq!(validation.touched, touched(&["src/app.ts"]));

        let mut engine = PatchEngine::new(temp.path());
        let outcome = engine.apply(diff, &validation.touched).expect("apply");
        assert!(!outcome.ok);
        assert!(outcome.message.contains("Cargo.toml"), "{}", outcome.message);
        let manifest = fs::read_to_string(temp.path().join("Cargo.toml")).expect("read");
        assert_eq!(manifest, "name = \"demo\"\n");
        let app = fs::read_to_string(temp.path().join("src/app.ts")).expect("read");
        assert_eq!(app, "old\n");
    }

    #[test]
    fn unprefixed_header_resolving_elsewhere_is_refused() {
        let temp = seeded_repo(&[("Cargo.toml", "x\n"), ("src/app.ts", "old\n")]);
        let diff = "--- src/Cargo.toml\n+++ src/Cargo.toml\n@@ -1 +1 @@\n-x\n+y\n";

        let mut engine = PatchEngine::new(temp.path());
        let outcome = engine.apply(diff, &touched(&["src/Cargo.toml"])).expect("apply");
        assert!(!outcome.ok);
        assert!(outcome.message.contains("outside the validated paths"));
        assert_eq!(fs::read_to_string(temp.path().join("Cargo.toml")).expect("read"), "x\n");
    }
}
