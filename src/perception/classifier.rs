//! Heuristic intent classifier.
//!
//! The fallback path when the transducer's LLM output cannot be parsed:
//! keyword patterns map free text to a verb, category, and target with a
//! deliberately modest confidence so the gate downstream asks for
//! clarification rather than acting on a guess.

use regex::Regex;
use std::sync::LazyLock;

/// Verbs that mutate state; these gate at the confidence threshold.
pub const MUTATING_VERBS: &[&str] = &["write", "refactor", "fix", "delete", "commit", "exec"];

/// Verbs that only read; safe to act on at low confidence.
pub const READ_VERBS: &[&str] = &["read", "search", "explain", "review"];

/// Declared intent categories.
pub const CATEGORIES: &[&str] = &["code_edit", "inquiry", "navigation", "vcs", "execution"];

static REFACTOR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(refactor|rename|extract|restructure|rewrite)\b").expect("Invalid regex")
});

static FIX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(fix|repair|resolve|debug|patch)\b").expect("Invalid regex")
});

static WRITE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(write|create|add|implement|generate)\b").expect("Invalid regex")
});

static DELETE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(delete|remove|drop|strip out)\b").expect("Invalid regex")
});

static COMMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(commit|push|stage)\b").expect("Invalid regex")
});

static EXEC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(run|execute|invoke)\b").expect("Invalid regex")
});

static SEARCH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(find|search|grep|locate|where is)\b").expect("Invalid regex")
});

static EXPLAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(explain|describe|what|why|how)\b").expect("Invalid regex")
});

static REVIEW_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(review|check|audit|inspect)\b").expect("Invalid regex")
});

/// Backticked, quoted, or path-like target references.
static TARGET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:`([^`]+)`|"([^"]+)"|'([^']+)'|\b([\w./-]+\.[A-Za-z]{1,4})\b)"#)
        .expect("Invalid regex")
});

/// Anaphoric references ("that function") that cannot resolve without
/// prior focus.
static ANAPHORA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(that|this|it|the one|previous|last)\s+(function|file|method|struct|test|class|module)?\b")
        .expect("Invalid regex")
});

/// A heuristic guess at the user's intent.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentGuess {
    /// Category name, one of [`CATEGORIES`]
    pub category: String,
    /// Verb name
    pub verb: String,
    /// Extracted target reference, if any
    pub target: Option<String>,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl IntentGuess {
    /// Whether the guessed verb mutates state.
    pub fn is_mutating(&self) -> bool {
        MUTATING_VERBS.contains(&self.verb.as_str())
    }
}

/// Classify free text. Always succeeds; unknown text becomes a
/// low-confidence `/explain` inquiry.
pub fn classify(text: &str) -> IntentGuess {
    let (verb, category) = if REFACTOR_PATTERN.is_match(text) {
        ("refactor", "code_edit")
    } else if FIX_PATTERN.is_match(text) {
        ("fix", "code_edit")
    } else if DELETE_PATTERN.is_match(text) {
        ("delete", "code_edit")
    } else if WRITE_PATTERN.is_match(text) {
        ("write", "code_edit")
    } else if COMMIT_PATTERN.is_match(text) {
        ("commit", "vcs")
    } else if EXEC_PATTERN.is_match(text) {
        ("exec", "execution")
    } else if SEARCH_PATTERN.is_match(text) {
        ("search", "navigation")
    } else if REVIEW_PATTERN.is_match(text) {
        ("review", "inquiry")
    } else if EXPLAIN_PATTERN.is_match(text) {
        ("explain", "inquiry")
    } else {
        ("explain", "inquiry")
    };

    let target = extract_target(text);
    let anaphoric = ANAPHORA_PATTERN.is_match(text) && target.is_none();

    let mut confidence: f64 = 0.55;
    if target.is_some() {
        confidence += 0.15;
    }
    if anaphoric {
        confidence = 0.40;
    }

    IntentGuess {
        category: category.to_string(),
        verb: verb.to_string(),
        target,
        confidence,
    }
}

/// First explicit target reference in the text.
pub fn extract_target(text: &str) -> Option<String> {
    TARGET_PATTERN.captures(text).and_then(|caps| {
        (1..=4)
            .filter_map(|i| caps.get(i))
            .map(|m| m.as_str().to_string())
            .next()
    })
}
