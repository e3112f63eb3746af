//! Per-run artifact directory under `<repo>/.agent_artifacts/`.
//!
//! Files are created once and never rewritten. The only growing file is
//! `apply_error.txt`, which is appended to.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::core::types::CommandResult;

/// Directory (relative to the repository root) holding all run artifacts.
pub const ARTIFACTS_DIR: &str = ".agent_artifacts";
const MAX_DIR_SUFFIX: u32 = 1000;

/// UTC timestamp used for artifact directories and patch files.
pub fn utc_stamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Handle on one run's artifact directory.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    dir: PathBuf,
}

impl RunArtifacts {
    /// Create a fresh directory for a run starting now.
    pub fn create(repo: &Path) -> Result<Self> {
        Self::create_with_stamp(repo, &utc_stamp())
    }

    /// Create `<repo>/.agent_artifacts/<stamp>`, or `<stamp>_<k>` if taken.
    pub fn create_with_stamp(repo: &Path, stamp: &str) -> Result<Self> {
        let root = repo.join(ARTIFACTS_DIR);
        fs::create_dir_all(&root)
            .with_context(|| format!("create artifacts root {}", root.display()))?;
        for k in 0..MAX_DIR_SUFFIX {
            let name = if k == 0 {
                stamp.to_string()
            } else {
                format!("{stamp}_{k}")
            };
            let dir = root.join(name);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "artifacts directory created");
                    return Ok(Self { dir });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create artifacts dir {}", dir.display()));
                }
            }
        }
        Err(anyhow!(
            "no free artifacts directory for stamp {stamp} under {}",
            root.display()
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a new file. Fails if the file already exists.
    pub fn write_text(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.join(rel);
        ensure_parent(&path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create {}", path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn write_json<T: Serialize>(&self, rel: &str, value: &T) -> Result<PathBuf> {
        let mut buf = serde_json::to_string_pretty(value)
            .with_context(|| format!("serialize {rel}"))?;
        buf.push('\n');
        self.write_text(rel, &buf)
    }

    /// Append to a file, creating it on first use.
    pub fn append_text(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.join(rel);
        ensure_parent(&path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        Ok(path)
    }

    /// Persist one command result as `logs/<name>[.critic_<cycle>].{out,err}.txt`.
    ///
    /// Cycle 0 is the run right after the coder patch. Repeated names within a
    /// cycle get a numeric suffix instead of overwriting.
    pub fn write_command_log(&self, cycle: u32, result: &CommandResult) -> Result<()> {
        let base = sanitize_name(&result.name);
        let stem = if cycle == 0 {
            base
        } else {
            format!("{base}.critic_{cycle}")
        };
        let mut candidate = stem.clone();
        let mut n = 2;
        while self.dir.join(format!("logs/{candidate}.out.txt")).exists() {
            candidate = format!("{stem}_{n}");
            n += 1;
        }
        self.write_text(&format!("logs/{candidate}.out.txt"), &result.stdout)?;
        self.write_text(&format!("logs/{candidate}.err.txt"), &result.stderr)?;
        Ok(())
    }
}

/// Command names become file stems: anything outside `[A-Za-z0-9._-]` is `_`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "cmd".to_string()
    } else {
        cleaned
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    Ok(())
}
