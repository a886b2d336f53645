//! Context management: compressed turns, spreading-activation scoring, and
//! the rolling-summary compressor that keeps long sessions inside the
//! prompt token budget.

pub mod activation;
pub mod compress;
pub mod types;

pub use activation::{
    filter_by_threshold, score_facts, select_within_budget, ActivationConfig, ActivationContext,
    ScoredFact,
};
pub use compress::{CompressorConfig, ContextCompressor};
pub use types::{estimate_tokens, CompressedTurn, RollingSummary};
