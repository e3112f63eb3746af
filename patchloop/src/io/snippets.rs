//! Source excerpts for the coder prompt, scoped by the plan's impacted files.

use std::fs;
use std::path::{Component, Path};

use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::types::ImpactedFile;

/// Separator between excerpt blocks.
pub const BLOCK_SEPARATOR: &str = "\n\n=====\n\n";
const MAX_SYMBOLS: usize = 4;
const MAX_MATCHES_PER_SYMBOL: usize = 2;

/// Collect excerpts for every impacted file that exists under `root`.
///
/// Symbol hints produce windows of `context_lines` centred on up to two
/// matches each. A file without hints, or whose hints never match, gets one
/// excerpt from its first line. Blocks keep the order of `impacted`.
#[instrument(skip_all, fields(root = %root.display(), impacted = impacted.len()))]
pub fn collect(
    root: &Path,
    impacted: &[ImpactedFile],
    context_lines: usize,
    fallback_cap_lines: usize,
) -> String {
    let mut blocks = Vec::new();
    for item in impacted {
        let rel = item.path.replace('\\', "/");
        if rel.is_empty() {
            continue;
        }
        if !is_contained(&rel) {
            warn!(path = %rel, "skipping impacted path outside the repository");
            continue;
        }
        let path = root.join(&rel);
        if !path.is_file() {
            debug!(path = %rel, "impacted file absent, nothing to excerpt");
            continue;
        }
        let text = match fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                warn!(path = %rel, err = %err, "failed to read impacted file");
                continue;
            }
        };
        let lines: Vec<&str> = text.lines().collect();

        let mut added = false;
        for symbol in item.symbols.iter().take(MAX_SYMBOLS) {
            let needle = normalize_symbol(symbol);
            if needle.is_empty() {
                continue;
            }
            let pattern = match Regex::new(&regex::escape(needle)) {
                Ok(pattern) => pattern,
                Err(err) => {
                    warn!(symbol = %symbol, err = %err, "unusable symbol hint");
                    continue;
                }
            };
            for found in pattern.find_iter(&text).take(MAX_MATCHES_PER_SYMBOL) {
                let line_no = text[..found.start()].matches('\n').count() + 1;
                let start = line_no.saturating_sub(context_lines / 2).max(1);
                let end = (line_no + context_lines / 2).min(lines.len());
                blocks.push(excerpt(&rel, &lines, start, end));
                added = true;
            }
        }

        if !added {
            if !item.symbols.is_empty() {
                debug!(path = %rel, "no symbol matched, using leading excerpt");
            }
            let cap = lines.len().min(context_lines.max(fallback_cap_lines));
            blocks.push(excerpt(&rel, &lines, 1, cap));
        }
    }
    blocks.join(BLOCK_SEPARATOR)
}

/// `Class#method()` becomes `method`.
fn normalize_symbol(symbol: &str) -> &str {
    let name = symbol.rsplit('#').next().unwrap_or(symbol);
    name.trim_end_matches(['(', ')'])
}

fn is_contained(rel: &str) -> bool {
    Path::new(rel)
        .components()
        .all(|part| matches!(part, Component::Normal(_) | Component::CurDir))
}

fn excerpt(rel: &str, lines: &[&str], start: usize, end: usize) -> String {
    let body = if start <= end && start >= 1 {
        lines[start - 1..end].join("\n")
    } else {
        String::new()
    };
    format!("FILE: {rel}\nLINES: {start}-{end}\n{body}")
}
