//! The opaque LLM boundary.
//!
//! Vendor clients are external collaborators; the core depends only on the
//! [`CompletionClient`] trait plus the retry/deadline wrapper.

mod client;

pub use client::{
    CompletionClient, CompletionRequest, LlmConfig, RetryPolicy, RetryingClient, ScriptedClient,
};

/// Environment flag enabling live-LLM tests in the harness.
pub const ENV_LIVE_LLM_TESTS: &str = "NSK_LIVE_LLM_TESTS";

/// Whether live-LLM tests are enabled.
pub fn live_llm_tests_enabled() -> bool {
    std::env::var(ENV_LIVE_LLM_TESTS).map_or(false, |v| v == "1" || v == "true")
}
