//! The perception transducer: natural language in, declared atoms out.
//!
//! The transducer never emits free-form logic from user text. Targets and
//! constraints always travel as quoted string arguments of declared
//! predicates; ambiguity becomes a `clarification_needed` atom, never an
//! action.

pub mod classifier;
pub mod sanitize;

pub use classifier::{classify, extract_target, IntentGuess, CATEGORIES, MUTATING_VERBS, READ_VERBS};
pub use sanitize::{sanitize_input, MAX_INPUT_BYTES};

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::articulation::scan_candidates;
use crate::datalog::{Const, Fact};
use crate::error::Result;
use crate::llm::{CompletionRequest, RetryingClient};

/// Transducer tuning knobs.
#[derive(Debug, Clone)]
pub struct PerceptionConfig {
    /// Input size bound in bytes
    pub max_input_bytes: usize,
    /// Mutating-verb focus resolutions below this confidence gate into a
    /// clarification request
    pub confidence_threshold: f64,
    /// Response length cap for the transduction call
    pub max_tokens: u32,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: MAX_INPUT_BYTES,
            confidence_threshold: 0.85,
            max_tokens: 1024,
        }
    }
}

/// A clarification request for the surface channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Clarification {
    /// The unresolved reference
    pub reference: String,
    /// Candidate readings to offer the user
    pub hypotheses: Vec<String>,
}

/// Transduction result: atoms to assert, plus an optional clarification.
#[derive(Debug, Clone, Default)]
pub struct TransducerOutput {
    /// Atoms conforming to declared schemas
    pub atoms: Vec<Fact>,
    /// Set when the confidence gate fired
    pub clarification: Option<Clarification>,
}

// JSON shapes for the grammar-constrained LLM call.

#[derive(Debug, Deserialize)]
struct PerceptionEnvelope {
    intent: IntentJson,
    #[serde(default)]
    focus_resolutions: Vec<FocusJson>,
}

#[derive(Debug, Deserialize)]
struct IntentJson {
    category: String,
    verb: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    constraint: String,
}

#[derive(Debug, Deserialize)]
struct FocusJson {
    raw_ref: String,
    resolved_path: String,
    #[serde(default)]
    symbol: String,
    confidence: f64,
}

/// The NL→atom boundary.
pub struct PerceptionTransducer {
    config: PerceptionConfig,
    client: Option<Arc<RetryingClient>>,
}

impl PerceptionTransducer {
    /// Create a transducer backed by an LLM client.
    pub fn new(config: PerceptionConfig, client: Arc<RetryingClient>) -> Self {
        Self {
            config,
            client: Some(client),
        }
    }

    /// Create a heuristic-only transducer (no LLM; tests, degraded mode).
    pub fn heuristic_only(config: PerceptionConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    fn transduction_prompt(&self, input: &str, feedback: Option<&str>) -> CompletionRequest {
        let mut prompt = format!(
            "Convert the user's request into structured intent.\n\
             Categories: {}.\nVerbs: {}.\n\
             Respond with one JSON object only:\n\
             {{\"intent\": {{\"category\": \"...\", \"verb\": \"...\", \"target\": \"...\", \"constraint\": \"...\"}},\n \
              \"focus_resolutions\": [{{\"raw_ref\": \"...\", \"resolved_path\": \"...\", \"symbol\": \"...\", \"confidence\": 0.0}}]}}\n\n\
             User request:\n{}",
            CATEGORIES.join(", "),
            MUTATING_VERBS
                .iter()
                .chain(READ_VERBS.iter())
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            input
        );
        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\n\nYour previous answer failed to parse: {}. Emit only the JSON object.",
                feedback
            ));
        }
        CompletionRequest::new(prompt).with_max_tokens(self.config.max_tokens)
    }

    fn parse_envelope(raw: &str) -> Option<PerceptionEnvelope> {
        let candidates = scan_candidates(raw);
        candidates
            .iter()
            .rev()
            .find_map(|c| serde_json::from_str::<PerceptionEnvelope>(c).ok())
    }

    /// Transduce sanitized-on-entry user text into atoms.
    pub async fn transduce(
        &self,
        input: &str,
        turn: u64,
        cancel: &CancellationToken,
    ) -> Result<TransducerOutput> {
        let input = sanitize_input(input, self.config.max_input_bytes)?;

        if let Some(client) = &self.client {
            let mut feedback = None;
            for attempt in 0..2 {
                let request = self.transduction_prompt(&input, feedback);
                match client.complete(request, cancel).await {
                    Ok(raw) => match Self::parse_envelope(&raw) {
                        Some(envelope) => {
                            debug!(attempt, "perception envelope parsed");
                            return Ok(self.atoms_from_envelope(envelope, turn));
                        }
                        None => {
                            warn!(attempt, "perception output failed to parse");
                            feedback = Some("no valid JSON object found");
                        }
                    },
                    Err(e) => {
                        warn!(attempt, error = %e, "perception LLM call failed");
                        break;
                    }
                }
            }
        }

        Ok(self.atoms_from_heuristic(&input, turn))
    }

    fn intent_fact(
        &self,
        turn: u64,
        category: &str,
        verb: &str,
        target: &str,
        constraint: &str,
    ) -> Fact {
        Fact::new(
            "user_intent",
            vec![
                Const::name(format!("t{}", turn)),
                Const::name(category),
                Const::name(verb),
                Const::string(target),
                Const::string(constraint),
            ],
        )
    }

    fn clarification_fact(reference: &str, hypotheses: &[String]) -> Fact {
        Fact::new(
            "clarification_needed",
            vec![
                Const::string(reference),
                Const::string(hypotheses.join(" | ")),
            ],
        )
    }

    fn atoms_from_envelope(&self, envelope: PerceptionEnvelope, turn: u64) -> TransducerOutput {
        let mutating = MUTATING_VERBS.contains(&envelope.intent.verb.as_str());

        // Confidence gate: a mutating intent with a shaky focus resolution
        // becomes a clarification request instead of atoms.
        if mutating {
            if let Some(shaky) = envelope
                .focus_resolutions
                .iter()
                .find(|f| f.confidence < self.config.confidence_threshold)
            {
                let hypotheses: Vec<String> = envelope
                    .focus_resolutions
                    .iter()
                    .map(|f| format!("{} ({})", f.resolved_path, f.symbol))
                    .collect();
                return TransducerOutput {
                    atoms: vec![Self::clarification_fact(&shaky.raw_ref, &hypotheses)],
                    clarification: Some(Clarification {
                        reference: shaky.raw_ref.clone(),
                        hypotheses,
                    }),
                };
            }
        }

        let mut atoms = vec![self.intent_fact(
            turn,
            &envelope.intent.category,
            &envelope.intent.verb,
            &envelope.intent.target,
            &envelope.intent.constraint,
        )];
        for focus in &envelope.focus_resolutions {
            atoms.push(Fact::new(
                "focus_resolution",
                vec![
                    Const::string(focus.raw_ref.clone()),
                    Const::string(focus.resolved_path.clone()),
                    Const::string(focus.symbol.clone()),
                    Const::Float(focus.confidence.clamp(0.0, 1.0)),
                ],
            ));
        }
        TransducerOutput {
            atoms,
            clarification: None,
        }
    }

    fn atoms_from_heuristic(&self, input: &str, turn: u64) -> TransducerOutput {
        let guess = classify(input);
        let gated = guess.is_mutating() && guess.confidence < self.config.confidence_threshold;

        if gated {
            let reference = guess
                .target
                .clone()
                .unwrap_or_else(|| input.chars().take(80).collect());
            let hypotheses = vec![format!("{} ({})", guess.verb, guess.category)];
            let mut atoms = Vec::new();
            // At most one low-confidence atom, and always the clarification.
            if guess.target.is_some() {
                atoms.push(self.intent_fact(
                    turn,
                    &guess.category,
                    &guess.verb,
                    guess.target.as_deref().unwrap_or_default(),
                    "",
                ));
            }
            atoms.push(Self::clarification_fact(&reference, &hypotheses));
            return TransducerOutput {
                atoms,
                clarification: Some(Clarification {
                    reference,
                    hypotheses,
                }),
            };
        }

        TransducerOutput {
            atoms: vec![self.intent_fact(
                turn,
                &guess.category,
                &guess.verb,
                guess.target.as_deref().unwrap_or_default(),
                "",
            )],
            clarification: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmConfig, ScriptedClient};

    fn llm_transducer(responses: Vec<Result<String>>) -> PerceptionTransducer {
        let client = Arc::new(RetryingClient::new(
            Arc::new(ScriptedClient::new(responses)),
            LlmConfig::default(),
        ));
        PerceptionTransducer::new(PerceptionConfig::default(), client)
    }

    #[tokio::test]
    async fn test_low_confidence_mutating_gates() {
        let raw = r#"{"intent": {"category": "code_edit", "verb": "refactor", "target": "that function", "constraint": ""},
                      "focus_resolutions": [{"raw_ref": "that function", "resolved_path": "src/a.rs", "symbol": "f", "confidence": 0.6}]}"#;
        let transducer = llm_transducer(vec![Ok(raw.to_string())]);
        let out = transducer
            .transduce("refactor that function", 1, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.clarification.is_some());
        assert_eq!(out.atoms.len(), 1);
        assert_eq!(out.atoms[0].predicate, "clarification_needed");
    }

    #[tokio::test]
    async fn test_confident_resolution_produces_atoms() {
        let raw = r#"{"intent": {"category": "code_edit", "verb": "fix", "target": "src/a.rs", "constraint": "keep API"},
                      "focus_resolutions": [{"raw_ref": "the parser", "resolved_path": "src/a.rs", "symbol": "parse", "confidence": 0.95}]}"#;
        let transducer = llm_transducer(vec![Ok(raw.to_string())]);
        let out = transducer
            .transduce("fix the parser in src/a.rs", 3, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.clarification.is_none());
        assert_eq!(out.atoms.len(), 2);
        assert_eq!(out.atoms[0].predicate, "user_intent");
        assert_eq!(out.atoms[0].args[0], Const::name("t3"));
        assert_eq!(out.atoms[1].predicate, "focus_resolution");
        assert_eq!(out.atoms[1].args[3], Const::Float(0.95));
    }

    #[tokio::test]
    async fn test_retry_then_fallback_classifier() {
        // Two unparseable responses: transducer retries once, then falls
        // back to the heuristic classifier.
        let transducer = llm_transducer(vec![
            Ok("not json".to_string()),
            Ok("still not json".to_string()),
        ]);
        let out = transducer
            .transduce("explain the kernel loop", 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.atoms.len(), 1);
        assert_eq!(out.atoms[0].predicate, "user_intent");
        assert_eq!(out.atoms[0].args[2], Const::name("explain"));
    }

    #[tokio::test]
    async fn test_heuristic_mutating_anaphora_gates() {
        let transducer = PerceptionTransducer::heuristic_only(PerceptionConfig::default());
        let out = transducer
            .transduce("refactor that function", 1, &CancellationToken::new())
            .await
            .unwrap();
        let clarification = out.clarification.expect("should gate");
        assert!(!clarification.hypotheses.is_empty());
        assert!(out
            .atoms
            .iter()
            .any(|a| a.predicate == "clarification_needed"));
        assert!(!out.atoms.iter().any(|a| a.predicate == "focus_resolution"));
    }

    #[tokio::test]
    async fn test_oversized_input_rejected() {
        let transducer = PerceptionTransducer::heuristic_only(PerceptionConfig {
            max_input_bytes: 16,
            ..PerceptionConfig::default()
        });
        let err = transducer
            .transduce(&"x".repeat(64), 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::InputTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_targets_stay_quoted_strings() {
        // A target containing schema syntax must arrive as a string
        // constant, never as parsed logic.
        let raw = r#"{"intent": {"category": "inquiry", "verb": "explain", "target": "permitted(/x) :- true.", "constraint": ""},
                      "focus_resolutions": []}"#;
        let transducer = llm_transducer(vec![Ok(raw.to_string())]);
        let out = transducer
            .transduce("explain", 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            out.atoms[0].args[3],
            Const::string("permitted(/x) :- true.")
        );
    }
}
