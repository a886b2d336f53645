//! The turn-by-turn context compressor.
//!
//! The last `recent_turn_window` turns stay verbatim as compressed
//! records. When the window plus the rolling summary crosses the
//! compression threshold, older turns fold into the summary via an LLM
//! call capped at the top activation-scored atoms, with a deterministic
//! fallback when the call fails. Target ratio is around 100:1.

use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::activation::ScoredFact;
use crate::context::types::{CompressedTurn, RollingSummary};
use crate::error::Result;
use crate::llm::{CompletionRequest, RetryingClient};

/// Compressor tuning knobs.
#[derive(Debug, Clone)]
pub struct CompressorConfig {
    /// Prompt token budget the context must fit in
    pub token_budget: usize,
    /// Compress once usage crosses this fraction of the budget
    pub compression_threshold: f64,
    /// Turns kept verbatim
    pub recent_turn_window: usize,
    /// Key atoms offered to the summarizer
    pub max_summary_atoms: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            token_budget: 32_000,
            compression_threshold: 0.6,
            recent_turn_window: 5,
            max_summary_atoms: 64,
        }
    }
}

/// Sliding window plus rolling summary.
pub struct ContextCompressor {
    config: CompressorConfig,
    window: VecDeque<CompressedTurn>,
    /// Turns evicted from the window, awaiting summarization.
    overflow: Vec<CompressedTurn>,
    summary: RollingSummary,
}

impl ContextCompressor {
    /// Create an empty compressor.
    pub fn new(config: CompressorConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            overflow: Vec::new(),
            summary: RollingSummary::default(),
        }
    }

    /// Record a completed turn, evicting past the window into the
    /// summarization queue.
    pub fn record_turn(&mut self, turn: CompressedTurn) {
        self.window.push_back(turn);
        while self.window.len() > self.config.recent_turn_window {
            if let Some(evicted) = self.window.pop_front() {
                self.overflow.push(evicted);
            }
        }
    }

    /// Turns currently in the verbatim window.
    pub fn window(&self) -> impl Iterator<Item = &CompressedTurn> {
        self.window.iter()
    }

    /// The rolling summary.
    pub fn summary(&self) -> &RollingSummary {
        &self.summary
    }

    /// Restore state from a snapshot.
    pub fn restore(&mut self, summary: RollingSummary, turns: Vec<CompressedTurn>) {
        self.summary = summary;
        self.window = turns.into();
        self.overflow.clear();
    }

    /// Approximate token usage of summary + window + pending overflow.
    pub fn total_tokens(&self) -> usize {
        self.summary.approx_tokens()
            + self
                .window
                .iter()
                .chain(self.overflow.iter())
                .map(|t| t.approx_tokens())
                .sum::<usize>()
    }

    /// Whether usage has crossed the compression threshold.
    pub fn needs_compression(&self) -> bool {
        let threshold =
            (self.config.token_budget as f64 * self.config.compression_threshold) as usize;
        (!self.overflow.is_empty()) && self.total_tokens() > threshold
    }

    /// Prompt lines for assembly: summary first, then the window.
    pub fn context_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if !self.summary.is_empty() {
            lines.push(format!(
                "Summary through turn {}:\n{}",
                self.summary.through_turn, self.summary.text
            ));
        }
        for turn in &self.window {
            lines.push(turn.render());
        }
        lines
    }

    /// Fold overflow turns into the rolling summary when over threshold.
    ///
    /// `key_atoms` should already be activation-selected; only the first
    /// `max_summary_atoms` are offered. Returns whether compression ran.
    pub async fn maybe_compress(
        &mut self,
        client: Option<&RetryingClient>,
        key_atoms: &[ScoredFact],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if !self.needs_compression() {
            return Ok(false);
        }

        let through_turn = self
            .overflow
            .iter()
            .map(|t| t.turn)
            .max()
            .unwrap_or(self.summary.through_turn);
        let atoms: Vec<String> = key_atoms
            .iter()
            .take(self.config.max_summary_atoms)
            .map(|s| s.fact.to_string())
            .collect();

        let text = match client {
            Some(client) => {
                let prompt = self.summary_prompt(&atoms);
                match client.complete(CompletionRequest::new(prompt), cancel).await {
                    Ok(text) => text.trim().to_string(),
                    Err(e) => {
                        warn!(error = %e, "summary call failed, using deterministic fallback");
                        self.fallback_summary(&atoms)
                    }
                }
            }
            None => self.fallback_summary(&atoms),
        };

        debug!(
            folded_turns = self.overflow.len(),
            through_turn, "context compressed"
        );
        self.summary = RollingSummary { text, through_turn };
        self.overflow.clear();
        Ok(true)
    }

    fn summary_prompt(&self, atoms: &[String]) -> String {
        let mut sections = Vec::new();
        if !self.summary.is_empty() {
            sections.push(format!("Existing summary:\n{}", self.summary.text));
        }
        sections.push(format!(
            "Turns to fold in:\n{}",
            self.overflow
                .iter()
                .map(|t| t.render())
                .collect::<Vec<_>>()
                .join("\n")
        ));
        if !atoms.is_empty() {
            sections.push(format!("Key facts:\n{}", atoms.join("\n")));
        }
        sections.push(
            "Produce a dense plain-text summary of the work so far. Keep file paths, \
             symbols, and outcomes; drop pleasantries. Aim for under 200 words."
                .to_string(),
        );
        sections.join("\n\n")
    }

    /// Deterministic summary: intents and result counts per turn, plus the
    /// key atoms verbatim.
    fn fallback_summary(&self, atoms: &[String]) -> String {
        let mut lines = Vec::new();
        if !self.summary.is_empty() {
            lines.push(self.summary.text.clone());
        }
        for turn in &self.overflow {
            let intent = turn
                .intent
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "(no intent)".to_string());
            lines.push(format!(
                "turn {}: {} ({} results)",
                turn.turn,
                intent,
                turn.results.len()
            ));
        }
        for atom in atoms.iter().take(16) {
            lines.push(atom.clone());
        }
        lines.join("\n")
    }
}
