//! Syntactic validation of unified diffs against the path policy.
//!
//! Only file headers are inspected. Hunks are left to `git apply`, which is the
//! authority on whether a patch actually applies.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::allowlist::AllowList;

/// Lockfiles that must never be patched.
const LOCKFILES: [&str; 3] = ["package-lock.json", "yarn.lock", "pnpm-lock.yaml"];
const DEV_NULL: &str = "/dev/null";
pub const NO_HEADERS: &str = "No file headers found in diff.";

/// Result of validating one diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffValidation {
    pub ok: bool,
    pub message: String,
    /// Sorted, deduplicated relative paths. Empty when `ok` is false.
    pub touched: Vec<String>,
}

impl DiffValidation {
    fn reject(message: String) -> Self {
        Self {
            ok: false,
            message,
            touched: Vec::new(),
        }
    }
}

/// Validate `diff_text` against the denylist and `allow`.
///
/// Pure: no filesystem access, identical input yields identical output.
pub fn validate_unified_diff(diff_text: &str, allow: &AllowList) -> DiffValidation {
    let mut lines: Vec<&str> = diff_text
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .collect();
    if let Some(k) = lines
        .iter()
        .position(|line| line.trim_start().starts_with("diff --git"))
    {
        lines.drain(..=k);
    }

    let mut touched = BTreeSet::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim_start();
        if line.starts_with("--- ") {
            let old = header_path(line, "--- ");
            let new = lines
                .get(i + 1)
                .and_then(|next| header_path(next.trim_start(), "+++ "));
            let (Some(old), Some(new)) = (old, new) else {
                return DiffValidation::reject(format!("Malformed diff headers near line {}", i + 1));
            };

            let path = canonical_path(if new != DEV_NULL { new } else { old });
            if is_forbidden(&path) {
                return DiffValidation::reject(format!("Forbidden target in diff: {path}"));
            }
            if !allow.matches(&path) {
                return DiffValidation::reject(format!("Path not allowed by allowlist: {path}"));
            }
            touched.insert(path);
            // The `+++` line was consumed together with this one.
            i += 1;
        }
        i += 1;
    }

    if touched.is_empty() {
        return DiffValidation::reject(NO_HEADERS.to_string());
    }
    DiffValidation {
        ok: true,
        message: "OK".to_string(),
        touched: touched.into_iter().collect(),
    }
}

/// Path portion of a `--- ` / `+++ ` header. A tab ends the path (`diff -u`
/// appends timestamps after one).
fn header_path<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(marker)?;
    let path = rest.split('\t').next().unwrap_or(rest).trim_end();
    if path.is_empty() {
        return None;
    }
    Some(path)
}

fn canonical_path(raw: &str) -> String {
    let path = raw.replace('\\', "/");
    match path.strip_prefix("a/").or_else(|| path.strip_prefix("b/")) {
        Some(stripped) => stripped.to_string(),
        None => path,
    }
}

fn is_forbidden(path: &str) -> bool {
    if path.contains(".env") || LOCKFILES.iter().any(|name| path.ends_with(name)) {
        return true;
    }
    path.starts_with('/') || path.split('/').any(|segment| segment == "..")
}
