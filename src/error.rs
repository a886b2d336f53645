//! Error types for nsk-core.

use thiserror::Error;

/// Result type alias using nsk-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during kernel operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== Validation (permanent) ====================
    /// Predicate used before declaration
    #[error("undeclared predicate: {0}")]
    UndeclaredPredicate(String),

    /// Atom arity does not match the declared signature
    #[error("arity mismatch for {predicate}: expected {expected}, got {actual}")]
    ArityMismatch {
        predicate: String,
        expected: usize,
        actual: usize,
    },

    /// Argument type does not match the declared signature
    #[error("type mismatch for {predicate} argument {position}: expected {expected}, got {actual}")]
    TypeMismatch {
        predicate: String,
        position: usize,
        expected: String,
        actual: String,
    },

    /// Rule set contains a cycle through negation
    #[error("unstratifiable negation through predicate {0}")]
    UnstratifiableNegation(String),

    /// Head variable not bound by any positive body literal
    #[error("unsafe head variable {variable} in rule for {predicate}")]
    UnsafeHeadVariable { predicate: String, variable: String },

    /// Runtime rule derives a forbidden-learned-head predicate
    #[error("forbidden learned head: {0}")]
    ForbiddenLearnedHead(String),

    /// Schema text or atom syntax could not be parsed
    #[error("parse failure at line {line}: {message}")]
    ParseFailure { line: usize, message: String },

    // ==================== Resource exhaustion ====================
    /// Derived-fact gas limit exceeded during evaluation
    #[error("gas exceeded: {derived} derived facts over limit {limit}")]
    GasExceeded { derived: usize, limit: usize },

    /// User input exceeds the configured maximum
    #[error("input too large: {size} bytes over limit {limit}")]
    InputTooLarge { size: usize, limit: usize },

    /// Prompt token budget exhausted
    #[error("token budget exceeded: {used} over budget {budget}")]
    TokenBudgetExceeded { used: usize, budget: usize },

    /// All shard concurrency slots are occupied
    #[error("concurrency slots full: {max} shards already running")]
    ConcurrencySlotsFull { max: usize },

    // ==================== External / transient ====================
    /// LLM completion failed
    #[error("LLM call failed: {0}")]
    LlmCallFailed(String),

    /// Network-level failure in a driver
    #[error("network error: {0}")]
    NetworkError(String),

    /// Filesystem failure in a driver
    #[error("filesystem error at {path}: {message}")]
    FileSystemError { path: String, message: String },

    /// Virtual-predicate handler exceeded its deadline
    #[error("handler timed out after {duration_ms}ms: {predicate}")]
    HandlerTimeout { predicate: String, duration_ms: u64 },

    // ==================== Safety / policy ====================
    /// Constitutional gate refused a write-class action
    #[error("action not permitted: {0}")]
    NotPermitted(String),

    /// Ambiguous intent requires user clarification
    #[error("clarification required: {0}")]
    ClarificationRequired(String),

    /// Handler invoked without the bindings it requires
    #[error("insufficient bindings for {predicate}: position {position} must be bound")]
    InsufficientBindings { predicate: String, position: usize },

    // ==================== Internal ====================
    /// Evaluator invariant violation caught and converted
    #[error("internal evaluator error: {0}")]
    InternalEvaluator(String),

    /// Cache contents disagree with the underlying resource
    #[error("cache inconsistent: {0}")]
    CacheInconsistent(String),

    /// Session persistence failure
    #[error("session storage error: {0}")]
    SessionStorage(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a type mismatch error.
    pub fn type_mismatch(
        predicate: impl Into<String>,
        position: usize,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            predicate: predicate.into(),
            position,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an arity mismatch error.
    pub fn arity_mismatch(predicate: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ArityMismatch {
            predicate: predicate.into(),
            expected,
            actual,
        }
    }

    /// Create a parse failure error.
    pub fn parse_failure(line: usize, message: impl Into<String>) -> Self {
        Self::ParseFailure {
            line,
            message: message.into(),
        }
    }

    /// Create a filesystem error.
    pub fn filesystem(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FileSystemError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a handler timeout error.
    pub fn handler_timeout(predicate: impl Into<String>, duration_ms: u64) -> Self {
        Self::HandlerTimeout {
            predicate: predicate.into(),
            duration_ms,
        }
    }

    /// Whether the operation may be retried with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::LlmCallFailed(_)
                | Self::NetworkError(_)
                | Self::FileSystemError { .. }
                | Self::HandlerTimeout { .. }
        )
    }

    /// Whether the failure is permanent (validation class; never retried).
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::UndeclaredPredicate(_)
                | Self::ArityMismatch { .. }
                | Self::TypeMismatch { .. }
                | Self::UnstratifiableNegation(_)
                | Self::UnsafeHeadVariable { .. }
                | Self::ForbiddenLearnedHead(_)
                | Self::ParseFailure { .. }
        )
    }

    /// Whether the failure is a safety/policy refusal surfaced to the user.
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::NotPermitted(_) | Self::ClarificationRequired(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::UndeclaredPredicate("p".into()).is_permanent());
        assert!(Error::LlmCallFailed("rate limit".into()).is_retriable());
        assert!(Error::NotPermitted("/write_file".into()).is_policy());
        assert!(!Error::GasExceeded {
            derived: 10,
            limit: 5
        }
        .is_permanent());
    }

    #[test]
    fn test_display() {
        let err = Error::arity_mismatch("edge", 2, 3);
        assert_eq!(
            err.to_string(),
            "arity mismatch for edge: expected 2, got 3"
        );
    }
}
