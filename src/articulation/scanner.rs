//! Byte-level scanner for balanced top-level JSON objects.
//!
//! User input can contain decoy JSON, so the parser must see *every*
//! balanced `{...}` candidate in the raw text and pick among them itself.
//! The scanner is string- and escape-aware, bounds nesting depth, and
//! bounds per-candidate size; a candidate breaking either bound is skipped
//! without derailing the scan.

/// Maximum nesting depth inside one candidate.
pub const MAX_DEPTH: usize = 200;

/// Maximum size of one candidate in bytes.
pub const MAX_CANDIDATE_BYTES: usize = 5 * 1024 * 1024;

/// Enumerate every balanced top-level JSON object slice in `text`, in
/// order of appearance.
pub fn scan_candidates(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();

    let mut start: Option<usize> = None;
    let mut depth = 0usize;
    let mut overflowed = false;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                    overflowed = false;
                }
                depth += 1;
                if depth > MAX_DEPTH {
                    overflowed = true;
                }
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            let candidate = &text[s..=i];
                            if !overflowed && candidate.len() <= MAX_CANDIDATE_BYTES {
                                candidates.push(candidate);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    candidates
}

/// Strip markdown code fences so fenced JSON scans like bare JSON.
pub fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_object() {
        let candidates = scan_candidates(r#"prefix {"a": 1} suffix"#);
        assert_eq!(candidates, vec![r#"{"a": 1}"#]);
    }

    #[test]
    fn test_nested_and_multiple() {
        let text = r#"{"a": {"b": 2}} noise {"c": 3}"#;
        let candidates = scan_candidates(text);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], r#"{"a": {"b": 2}}"#);
        assert_eq!(candidates[1], r#"{"c": 3}"#);
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let text = r#"{"text": "fake } closer and { opener"} {"tail": 1}"#;
        let candidates = scan_candidates(text);
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].contains("fake } closer"));
    }

    #[test]
    fn test_escaped_quote_in_string() {
        let text = r#"{"text": "quote \" then } brace"}"#;
        let candidates = scan_candidates(text);
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_unbalanced_prefix_skipped() {
        let text = r#"} } {"ok": true}"#;
        let candidates = scan_candidates(text);
        assert_eq!(candidates, vec![r#"{"ok": true}"#]);
    }

    #[test]
    fn test_depth_bound() {
        let mut text = String::new();
        for _ in 0..(MAX_DEPTH + 1) {
            text.push_str("{\"a\":");
        }
        text.push('1');
        for _ in 0..(MAX_DEPTH + 1) {
            text.push('}');
        }
        text.push_str(r#" {"ok": 1}"#);
        let candidates = scan_candidates(&text);
        assert_eq!(candidates, vec![r#"{"ok": 1}"#]);
    }

    #[test]
    fn test_strip_fences() {
        let text = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_fences(text), "{\"a\": 1}");
    }
}
