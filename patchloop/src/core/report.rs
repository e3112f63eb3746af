//! Character-bounded text slicing and the critic failure report.

use crate::core::types::CommandResult;

/// Last `max` characters of `text`.
pub fn tail_chars(text: &str, max: usize) -> &str {
    if max == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// First `max` characters of `text`.
pub fn head_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Build the report of failing commands that the critic receives.
///
/// Each failing command contributes a section with the tails of its stdout and
/// stderr (`tail` characters each). Sections are separated by a blank line and
/// the whole report is cut to its first `total` characters.
pub fn failure_report(results: &[CommandResult], tail: usize, total: usize) -> String {
    let sections: Vec<String> = results
        .iter()
        .filter(|result| !result.ok)
        .map(|result| {
            format!(
                "## {} (exit={})\nSTDOUT:\n{}\n\nSTDERR:\n{}\n",
                result.name,
                result.code,
                tail_chars(&result.stdout, tail),
                tail_chars(&result.stderr, tail),
            )
        })
        .collect();
    head_chars(&sections.join("\n\n"), total).to_string()
}
