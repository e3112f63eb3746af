//! Recovery of structured payloads from free-form model output.

/// Return the body of the first fenced block (```` ``` ````) in `text`.
///
/// A leading info string equal to `lang` (case-insensitive) is stripped from
/// the body, as are the line breaks and fence indentation at its end. Returns
/// `None` when no closed fence exists.
pub fn fenced_block(text: &str, lang: &str) -> Option<String> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let end = after.find("```")?;
    let mut block = after[..end].trim_start();
    if block.len() >= lang.len()
        && block.is_char_boundary(lang.len())
        && block[..lang.len()].eq_ignore_ascii_case(lang)
    {
        block = block[lang.len()..].trim_start();
    }
    let block = match block.rfind('\n') {
        Some(idx) if block[idx + 1..].trim().is_empty() => &block[..=idx],
        _ => block,
    };
    Some(trim_line_breaks(block).to_string())
}

/// Find the first JSON object or array in `text` and return it.
///
/// Prefers a bracket-balanced slice (quotes and escapes respected). Falls back
/// to the slice ending at the last matching closer, kept only if it parses.
pub fn raw_json(text: &str) -> Option<String> {
    let start = text.find(['{', '['])?;
    if let Some(balanced) = balanced_slice(text, start) {
        return Some(balanced.to_string());
    }
    slice_to_last_closer(text, start)
}

fn balanced_slice(text: &str, start: usize) -> Option<&str> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for (offset, byte) in text.as_bytes()[start..].iter().copied().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if byte == b'\\' {
                escape = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => stack.push(byte),
            b'}' | b']' => {
                let opener = stack.pop()?;
                let expected = if opener == b'{' { b'}' } else { b']' };
                if byte != expected {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn slice_to_last_closer(text: &str, start: usize) -> Option<String> {
    let closer = if text.as_bytes()[start] == b'{' { '}' } else { ']' };
    let end = text.rfind(closer)?;
    if end <= start {
        return None;
    }
    let candidate = &text[start..=end];
    serde_json::from_str::<serde_json::Value>(candidate).ok()?;
    Some(candidate.to_string())
}

/// True if `text` starts like a diff (`diff --git` framing or a `--- ` header).
pub fn looks_like_diff(text: &str) -> bool {
    text.starts_with("diff --git") || text.starts_with("--- ")
}

/// Extract a diff candidate from a model response.
///
/// A response that already starts with a diff marker is used as-is; otherwise
/// the first fenced `diff` block is used. Only leading whitespace and trailing
/// line breaks are removed, so a final context line of a single space stays
/// intact. Empty when nothing usable was found.
pub fn diff_candidate(response: &str) -> String {
    let text = response.trim_start();
    if looks_like_diff(text) {
        return with_trailing_newline(trim_line_breaks(text));
    }
    match fenced_block(text, "diff") {
        Some(block) if !block.trim().is_empty() => with_trailing_newline(&block),
        _ => String::new(),
    }
}

fn trim_line_breaks(text: &str) -> &str {
    text.trim_end_matches(['\n', '\r'])
}

/// `git apply` rejects a patch whose last hunk line lacks a newline.
fn with_trailing_newline(text: &str) -> String {
    format!("{text}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_block_strips_language_tag() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(fenced_block(text, "json"), Some("{\"a\": 1}".to_string()));
    }

    #[test]
    fn fenced_block_without_close_is_none() {
        assert_eq!(fenced_block("```diff\n--- a/x", "diff"), None);
    }

    #[test]
    fn fenced_block_keeps_other_language_tag() {
        let text = "```patch\n--- a/x\n```";
        assert_eq!(fenced_block(text, "diff"), Some("patch\n--- a/x".to_string()));
    }

    #[test]
    fn raw_json_finds_balanced_object_in_prose() {
        let text = "Plan follows {\"a\": {\"b\": \"}\"}} and then more text }";
        assert_eq!(raw_json(text), Some("{\"a\": {\"b\": \"}\"}}".to_string()));
    }

    #[test]
    fn raw_json_handles_escaped_quotes() {
        let text = r#"x {"s": "say \"hi\" {"} y"#;
        assert_eq!(raw_json(text), Some(r#"{"s": "say \"hi\" {"}"#.to_string()));
    }

    #[test]
    fn raw_json_none_without_brackets() {
        assert_eq!(raw_json("no json here"), None);
    }

    #[test]
    fn raw_json_mismatched_falls_back_to_last_closer() {
        // Balanced scan bails on the stray `]`; the last-closer slice is not valid JSON either.
        assert_eq!(raw_json("{\"a\": ]}"), None);
    }

    #[test]
    fn diff_candidate_uses_raw_diff() {
        let response = "  diff --git a/x b/x\n--- a/x\n+++ b/x";
        assert_eq!(
            diff_candidate(response),
            "diff --git a/x b/x\n--- a/x\n+++ b/x\n"
        );
    }

    #[test]
    fn diff_candidate_extracts_fenced_diff() {
        let response = "Sure!\n```diff\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n```";
        assert_eq!(
            diff_candidate(response),
            "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n"
        );
    }

    #[test]
    fn trailing_blank_context_line_survives() {
        let body = "--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n-a\n+b\n \n";
        assert_eq!(diff_candidate(body), body);

        let fenced = format!("```diff\n{body}  ```\n");
        assert_eq!(diff_candidate(&fenced), body);
    }

    #[test]
    fn diff_candidate_empty_for_prose() {
        assert_eq!(diff_candidate("I cannot help with that."), "");
    }
}
