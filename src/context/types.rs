//! Compressed-turn records and the rolling summary.
//!
//! After articulation, a turn survives only as logical state: intent atom,
//! focus atoms, result atoms, and the control updates that were applied.
//! Surface text is deliberately absent; that is the whole compression
//! trade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::datalog::Fact;

/// Rough token estimate: ~4 chars per token for English text.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// One turn, reduced to its logical residue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedTurn {
    /// Turn number
    pub turn: u64,
    /// The turn's intent atom, when perception produced one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Fact>,
    /// Focus-resolution atoms
    #[serde(default)]
    pub focus: Vec<Fact>,
    /// Execution-result atoms
    #[serde(default)]
    pub results: Vec<Fact>,
    /// Control updates applied this turn (schema-text syntax)
    #[serde(default)]
    pub control_updates: Vec<String>,
    /// When the turn completed
    pub completed_at: DateTime<Utc>,
}

impl CompressedTurn {
    /// Create an empty record for a turn.
    pub fn new(turn: u64) -> Self {
        Self {
            turn,
            intent: None,
            focus: Vec::new(),
            results: Vec::new(),
            control_updates: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    /// Attach the intent atom.
    pub fn with_intent(mut self, intent: Fact) -> Self {
        self.intent = Some(intent);
        self
    }

    /// Render as prompt lines.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("turn {}:", self.turn)];
        if let Some(intent) = &self.intent {
            lines.push(format!("  intent: {}", intent));
        }
        for f in &self.focus {
            lines.push(format!("  focus: {}", f));
        }
        for f in &self.results {
            lines.push(format!("  result: {}", f));
        }
        for u in &self.control_updates {
            lines.push(format!("  update: {}", u));
        }
        lines.join("\n")
    }

    /// Approximate prompt cost of this record.
    pub fn approx_tokens(&self) -> usize {
        estimate_tokens(&self.render())
    }
}

/// The LLM-maintained summary of everything older than the window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingSummary {
    /// Summary text
    pub text: String,
    /// Highest turn folded into the summary
    pub through_turn: u64,
}

impl RollingSummary {
    /// Approximate prompt cost of the summary.
    pub fn approx_tokens(&self) -> usize {
        estimate_tokens(&self.text)
    }

    /// Whether anything has been summarized yet.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::Const;

    #[test]
    fn test_render_and_tokens() {
        let turn = CompressedTurn::new(3)
            .with_intent(Fact::new(
                "user_intent",
                vec![
                    Const::name("t3"),
                    Const::name("code_edit"),
                    Const::name("fix"),
                    Const::string("src/a.rs"),
                    Const::string(""),
                ],
            ));
        let rendered = turn.render();
        assert!(rendered.contains("turn 3:"));
        assert!(rendered.contains("user_intent"));
        assert!(turn.approx_tokens() > 0);
    }

    #[test]
    fn test_round_trip() {
        let turn = CompressedTurn::new(1).with_intent(Fact::new(
            "user_intent",
            vec![
                Const::name("t1"),
                Const::name("inquiry"),
                Const::name("explain"),
                Const::string("kernel"),
                Const::string(""),
            ],
        ));
        let json = serde_json::to_string(&turn).unwrap();
        let back: CompressedTurn = serde_json::from_str(&json).unwrap();
        assert_eq!(turn, back);
    }
}
