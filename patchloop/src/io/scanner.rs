//! Repository scanner producing the bounded repo map sent to the planner.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use walkdir::{DirEntry, WalkDir};

use crate::core::allowlist::AllowList;
use crate::io::artifacts::ARTIFACTS_DIR;

/// Directory and file names never descended into or listed.
const EXCLUDED: &[&str] = &[
    "venv",
    ".venv",
    "env",
    ".env",
    "node_modules",
    "bower_components",
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".pytest_cache",
    "dist",
    "build",
    "out",
    "target",
    ".next",
    ".turbo",
    ".idea",
    ".vscode",
    ".DS_Store",
    "vectorstore",
    ARTIFACTS_DIR,
];

/// One entry of the repo map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoFile {
    /// Forward-slash path relative to the repository root.
    pub path: String,
    pub lang: String,
    pub loc: usize,
}

/// Language tag for a file extension, or `None` if unsupported.
pub fn lang_for_extension(ext: &str) -> Option<&'static str> {
    let lang = match ext.to_ascii_lowercase().as_str() {
        "ts" => "ts",
        "tsx" => "tsx",
        "js" => "js",
        "jsx" => "jsx",
        "php" => "php",
        "py" => "py",
        "json" => "json",
        "rs" => "rs",
        "go" => "go",
        _ => return None,
    };
    Some(lang)
}

/// Scan `root` for supported source files matching `include`.
///
/// Siblings are visited in name order, depth first, so results come out
/// ordered component by component (`src/a/inner.py` before `src/a.ts`). The
/// walk stops once `max_files` files are listed.
#[instrument(skip_all, fields(root = %root.display(), max_files))]
pub fn scan(root: &Path, max_files: usize, include: &AllowList) -> Result<Vec<RepoFile>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_excluded(entry));
    for entry in walker {
        if files.len() >= max_files {
            debug!(max_files, "repo map cap reached");
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(err = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = relative_path(root, entry.path()) else {
            continue;
        };
        if !include.matches(&path) {
            continue;
        }
        let Some(lang) = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(lang_for_extension)
        else {
            continue;
        };
        files.push(RepoFile {
            path,
            lang: lang.to_string(),
            loc: count_lines(entry.path()),
        });
    }
    debug!(count = files.len(), "repo map built");
    Ok(files)
}

/// Validate that `root` is a directory before scanning it.
pub fn ensure_repo_dir(root: &Path) -> Result<()> {
    let meta = fs::metadata(root).with_context(|| format!("stat {}", root.display()))?;
    if !meta.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    Ok(())
}

fn is_excluded(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| EXCLUDED.contains(&name))
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Line count with lossy decoding. Unreadable files count as zero.
fn count_lines(path: &Path) -> usize {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).lines().count(),
        Err(err) => {
            debug!(path = %path.display(), err = %err, "unreadable file counted as empty");
            0
        }
    }
}
