//! # nsk-core
//!
//! A logic-first neuro-symbolic agent kernel for code-modification tasks.
//! A deterministic stratified-Datalog engine owns every state transition,
//! policy decision, and tool-dispatch route; LLMs are pure transducers
//! that turn natural language into logic atoms (perception) and logic
//! atoms back into natural language (articulation).
//!
//! ## Core Components
//!
//! - **datalog**: typed facts, declared predicates, stratified semi-naive
//!   evaluation with a derived-fact gas limit
//! - **kernel**: the transactional Assert/Retract/Query/Evaluate surface
//! - **vstore**: side-effectful resources as first-class predicates, with
//!   permission capsules and the constitutional gate
//! - **shard**: sub-agent kernels with isolated state and capped permissions
//! - **perception** / **articulation**: the two LLM boundaries
//! - **context**: spreading-activation scoring and turn compression
//! - **session**: the per-turn loop and snapshot persistence
//!
//! ## Example
//!
//! ```rust,ignore
//! use nsk_core::{Kernel, KernelConfig};
//!
//! let kernel = Kernel::new(KernelConfig::default());
//! kernel.load_schema("Decl edge(A.Type<name>, B.Type<name>).\n\
//!                     Decl path(A.Type<name>, B.Type<name>).\n\
//!                     path(X, Y) :- edge(X, Y).").await?;
//! kernel.assert_with_origin(fact, Origin::User { turn: 1 }).await?;
//! let paths = kernel.query("path", &vec![]).await?;
//! ```

pub mod articulation;
pub mod context;
pub mod datalog;
pub mod error;
pub mod kernel;
pub mod llm;
pub mod perception;
pub mod session;
pub mod shard;
pub mod vstore;

// Re-exports for convenience
pub use articulation::{
    apply_control_packet, parse_response, ControlPacket, ParseCaps, ParseMethod, ParsedResponse,
    PiggybackEnvelope, PromptAssembler, PromptContext, SanitizeReport, ENV_JIT_PROMPTS,
};
pub use context::{
    estimate_tokens, filter_by_threshold, score_facts, select_within_budget, ActivationConfig,
    ActivationContext, CompressedTurn, CompressorConfig, ContextCompressor, RollingSummary,
    ScoredFact,
};
pub use datalog::{
    evaluate, is_forbidden_learned_head, parse_program, parse_statement, Atom, Const, EvalStats,
    Fact, FactMeta, FactStore, Idb, Origin, Pattern, PredicateDecl, Rule, Schema, Statement,
    StoreStats, Term, TypeTag, FORBIDDEN_LEARNED_HEADS,
};
pub use error::{Error, Result};
pub use kernel::{AuditEvent, AuditKind, AuditLog, Kernel, KernelConfig};
pub use llm::{
    live_llm_tests_enabled, CompletionClient, CompletionRequest, LlmConfig, RetryPolicy,
    RetryingClient, ScriptedClient, ENV_LIVE_LLM_TESTS,
};
pub use perception::{
    classify, sanitize_input, Clarification, IntentGuess, PerceptionConfig, PerceptionTransducer,
    TransducerOutput, MAX_INPUT_BYTES,
};
pub use session::{
    HotFact, Session, SessionConfig, SessionSnapshot, SessionStore, TurnReport, BASELINE_SCHEMA,
};
pub use shard::{
    ShardConfig, ShardOutcome, ShardScheduler, ShardSpec, ShardStatus, ShardType,
};
pub use vstore::{
    ActionOutcome, ActionRequest, Binding, CacheStats, ConstitutionalGate, PermissionCapsule,
    PolicySource, VirtualFactStore, VirtualHandler, VirtualQuery, VirtualStoreConfig,
    POLICY_PREDICATES,
};
