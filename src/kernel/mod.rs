//! The kernel: transactional fact-store surface over the logic engine.
//!
//! A kernel owns one schema and one fact store behind a single
//! reader-writer lock. Asserts, retracts, and queries are safe under
//! concurrent access; evaluation runs bottom-up to fixpoint under a
//! derived-fact gas limit. Queries against registered virtual predicates
//! route through the process-wide virtual fact store and inject the
//! handler's results before answering.

pub mod audit;

pub use audit::{AuditEvent, AuditKind, AuditLog};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::datalog::{
    evaluate, parse_program, parse_statement, EvalStats, Fact, FactMeta, FactStore, Origin,
    Pattern, Schema, Statement, StoreStats,
};
use crate::error::{Error, Result};
use crate::vstore::{PolicySource, VirtualFactStore, VirtualQuery, POLICY_PREDICATES};

/// Kernel tuning knobs.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Derived-fact gas limit per evaluation
    pub gas_limit: usize,
    /// Run evaluation after every mutation (turn loops batch and disable)
    pub auto_evaluate: bool,
    /// Audit ring capacity
    pub audit_capacity: usize,
    /// Time-windowed predicates and their TTLs
    pub ttl_predicates: HashMap<String, Duration>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let mut ttl_predicates = HashMap::new();
        ttl_predicates.insert("execution_result".to_string(), Duration::minutes(15));
        ttl_predicates.insert("shard_context_refreshed".to_string(), Duration::minutes(15));
        Self {
            gas_limit: 500_000,
            auto_evaluate: true,
            audit_capacity: 1024,
            ttl_predicates,
        }
    }
}

struct Inner {
    schema: Schema,
    store: FactStore,
    audit: AuditLog,
}

/// A single kernel instance (root or shard).
pub struct Kernel {
    id: Uuid,
    config: KernelConfig,
    auto_evaluate: AtomicBool,
    inner: RwLock<Inner>,
    vstore: Option<Arc<VirtualFactStore>>,
}

impl Kernel {
    /// Create a kernel with no virtual predicates.
    pub fn new(config: KernelConfig) -> Self {
        let auto = config.auto_evaluate;
        Self {
            id: Uuid::new_v4(),
            auto_evaluate: AtomicBool::new(auto),
            inner: RwLock::new(Inner {
                schema: Schema::new(),
                store: FactStore::new(),
                audit: AuditLog::new(config.audit_capacity),
            }),
            vstore: None,
            config,
        }
    }

    /// Create a kernel whose queries route virtual predicates through the
    /// shared store.
    pub fn with_virtual_store(config: KernelConfig, vstore: Arc<VirtualFactStore>) -> Self {
        let mut kernel = Self::new(config);
        kernel.vstore = Some(vstore);
        kernel
    }

    /// Kernel identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Toggle evaluation-after-mutation (batching).
    pub fn set_auto_evaluate(&self, on: bool) {
        self.auto_evaluate.store(on, Ordering::SeqCst);
    }

    fn auto_eval(&self) -> bool {
        self.auto_evaluate.load(Ordering::SeqCst)
    }

    /// Load declarations, trusted rules, and boot facts from schema text.
    ///
    /// Declarations and rules accumulate across loads; facts are cleared on
    /// every load.
    pub async fn load_schema(&self, text: &str) -> Result<EvalStats> {
        let statements = parse_program(text)?;
        let mut inner = self.inner.write().await;
        inner.store.clear();

        let mut rules = Vec::new();
        let mut facts = Vec::new();
        for stmt in statements {
            match stmt {
                Statement::Decl(d) => inner.schema.declare(d)?,
                Statement::Rule(r) => rules.push(r),
                Statement::Fact(f) => facts.push(f),
            }
        }
        inner.schema.add_rules(rules, true)?;
        for fact in facts {
            inner.schema.validate_fact(&fact)?;
            let generation = inner.store.generation();
            inner.store.insert(fact, FactMeta::new(Origin::Boot, generation));
        }
        inner
            .audit
            .push(AuditEvent::new(AuditKind::SchemaLoad, "schema loaded"));

        if self.auto_eval() {
            self.evaluate_locked(&mut inner)
        } else {
            Ok(EvalStats::default())
        }
    }

    /// Apply one control-channel statement (a fact or an untrusted rule).
    pub async fn apply_control_statement(&self, text: &str, turn: u64) -> Result<()> {
        match parse_statement(text)? {
            Statement::Fact(fact) => {
                self.assert_with_origin(fact, Origin::Control { turn }).await?;
                Ok(())
            }
            Statement::Rule(rule) => {
                let head = rule.head.predicate.clone();
                let mut inner = self.inner.write().await;
                match inner.schema.add_rule(rule, false) {
                    Ok(()) => {
                        inner.audit.push(
                            AuditEvent::new(AuditKind::Assert, "control rule added")
                                .with_predicate(head)
                                .with_origin(Origin::Control { turn }),
                        );
                        Ok(())
                    }
                    Err(e) => {
                        inner.audit.push(
                            AuditEvent::new(AuditKind::RuleRejected, e.to_string())
                                .with_predicate(head)
                                .with_origin(Origin::Control { turn }),
                        );
                        Err(e)
                    }
                }
            }
            Statement::Decl(decl) => {
                let mut inner = self.inner.write().await;
                inner.schema.declare(decl)
            }
        }
    }

    /// Assert one fact. Returns `true` when the fact was novel.
    pub async fn assert_with_origin(&self, fact: Fact, origin: Origin) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if let Err(e) = inner.schema.validate_fact(&fact) {
            inner.audit.push(
                AuditEvent::new(AuditKind::FactRejected, e.to_string())
                    .with_predicate(fact.predicate.clone())
                    .with_origin(origin.clone()),
            );
            return Err(e);
        }

        let generation = inner.store.generation();
        let mut meta = FactMeta::new(origin.clone(), generation);
        if let Some(ttl) = self.config.ttl_predicates.get(&fact.predicate) {
            meta = meta.with_ttl(*ttl);
        }
        let predicate = fact.predicate.clone();
        let rollback = fact.clone();
        let novel = inner.store.insert(fact, meta);
        if novel {
            inner.audit.push(
                AuditEvent::new(AuditKind::Assert, "fact asserted")
                    .with_predicate(predicate.clone())
                    .with_origin(origin),
            );
        }
        self.note_policy_mutation(&predicate);

        if novel && self.auto_eval() {
            if let Err(e) = self.evaluate_locked(&mut inner) {
                // Keep the store identical to its pre-assert state.
                inner.store.remove_matching(
                    &rollback.predicate,
                    &rollback.args.iter().cloned().map(Some).collect(),
                );
                return Err(e);
            }
        }
        Ok(novel)
    }

    /// Assert a batch atomically: all facts validate and survive the gas
    /// check, or none are inserted. Returns the number of novel facts.
    pub async fn assert_batch(&self, facts: Vec<Fact>, origin: Origin) -> Result<usize> {
        let mut inner = self.inner.write().await;
        for fact in &facts {
            if let Err(e) = inner.schema.validate_fact(fact) {
                inner.audit.push(
                    AuditEvent::new(AuditKind::FactRejected, e.to_string())
                        .with_predicate(fact.predicate.clone())
                        .with_origin(origin.clone()),
                );
                return Err(e);
            }
        }

        let generation = inner.store.generation();
        let mut inserted = Vec::new();
        for fact in facts {
            let mut meta = FactMeta::new(origin.clone(), generation);
            if let Some(ttl) = self.config.ttl_predicates.get(&fact.predicate) {
                meta = meta.with_ttl(*ttl);
            }
            let copy = fact.clone();
            if inner.store.insert(fact, meta) {
                self.note_policy_mutation(&copy.predicate);
                inserted.push(copy);
            }
        }

        if !inserted.is_empty() && self.auto_eval() {
            if let Err(e) = self.evaluate_locked(&mut inner) {
                for fact in &inserted {
                    inner.store.remove_matching(
                        &fact.predicate,
                        &fact.args.iter().cloned().map(Some).collect(),
                    );
                }
                return Err(e);
            }
        }
        inner.audit.push(AuditEvent::new(
            AuditKind::Assert,
            format!("batch of {} facts", inserted.len()),
        ));
        Ok(inserted.len())
    }

    /// Retract EDB facts matching the pattern. Never fails; retracting a
    /// fact that exists only in the IDB is a no-op with a warning.
    pub async fn retract(&self, predicate: &str, pattern: &Pattern) -> usize {
        let mut inner = self.inner.write().await;
        let removed = inner.store.remove_matching(predicate, pattern);
        if removed == 0 {
            let idb_matches = !inner.store.query(predicate, pattern).is_empty();
            if idb_matches {
                warn!(
                    predicate,
                    "retract matched only derivable facts; EDB unchanged"
                );
            }
        } else {
            inner.audit.push(
                AuditEvent::new(AuditKind::Retract, format!("{} facts removed", removed))
                    .with_predicate(predicate),
            );
        }
        self.note_policy_mutation(predicate);

        if removed > 0 && self.auto_eval() {
            if let Err(e) = self.evaluate_locked(&mut inner) {
                warn!(error = %e, "post-retract evaluation failed; IDB left from prior fixpoint");
            }
        }
        removed
    }

    /// Retract-then-assert for single-valued state keyed by the fact's
    /// first `key_arity` arguments (heartbeats, current-state predicates).
    /// Atomic: the retract and the assert happen under one writer lock.
    pub async fn replace_keyed(
        &self,
        fact: Fact,
        key_arity: usize,
        origin: Origin,
    ) -> Result<()> {
        let mut pattern: Pattern = fact.args.iter().cloned().map(Some).collect();
        for slot in pattern.iter_mut().skip(key_arity) {
            *slot = None;
        }

        let mut inner = self.inner.write().await;
        inner.schema.validate_fact(&fact)?;
        inner.store.remove_matching(&fact.predicate, &pattern);
        let generation = inner.store.generation();
        let predicate = fact.predicate.clone();
        inner.store.insert(fact, FactMeta::new(origin, generation));
        self.note_policy_mutation(&predicate);
        if self.auto_eval() {
            self.evaluate_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Query EDB ∪ IDB after the last completed evaluation. Virtual
    /// predicates trigger their handler first and inject results.
    pub async fn query(&self, predicate: &str, pattern: &Pattern) -> Result<Vec<Fact>> {
        self.query_with_cancel(predicate, pattern, &CancellationToken::new())
            .await
    }

    /// [`Kernel::query`] with caller-controlled cancellation.
    pub async fn query_with_cancel(
        &self,
        predicate: &str,
        pattern: &Pattern,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fact>> {
        let vstore = self
            .vstore
            .as_ref()
            .filter(|v| v.is_virtual(predicate))
            .cloned();

        if let Some(vstore) = vstore {
            let (arity, generation) = {
                let inner = self.inner.read().await;
                let decl = inner
                    .schema
                    .decl(predicate)
                    .ok_or_else(|| Error::UndeclaredPredicate(predicate.to_string()))?;
                (decl.arity(), inner.store.generation())
            };
            let vq = VirtualQuery::from_pattern(predicate, pattern, arity);
            let facts = vstore.intercept(&vq, generation, self, cancel).await?;
            if !facts.is_empty() {
                let mut inner = self.inner.write().await;
                let generation = inner.store.generation();
                for fact in facts {
                    inner.schema.validate_fact(&fact)?;
                    inner
                        .store
                        .insert(fact, FactMeta::new(Origin::Virtual, generation));
                }
            }
        }

        let inner = self.inner.read().await;
        if !inner.schema.is_declared(predicate) {
            return Err(Error::UndeclaredPredicate(predicate.to_string()));
        }
        Ok(inner.store.query(predicate, pattern))
    }

    /// Run stratified evaluation to fixpoint. On `GasExceeded` the store is
    /// untouched relative to just before this call.
    pub async fn evaluate(&self) -> Result<EvalStats> {
        let mut inner = self.inner.write().await;
        self.evaluate_locked(&mut inner)
    }

    fn evaluate_locked(&self, inner: &mut Inner) -> Result<EvalStats> {
        // Evaluator panics must never take the session down.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            evaluate(&inner.schema, &inner.store, self.config.gas_limit)
        }))
        .unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "evaluator panicked".to_string());
            Err(Error::InternalEvaluator(message))
        });
        match result {
            Ok((idb, stats)) => {
                inner.store.set_idb(idb);
                inner.audit.push(AuditEvent::new(
                    AuditKind::Evaluate,
                    format!("{} derived in {} ms", stats.derived, stats.duration_ms),
                ));
                debug!(derived = stats.derived, gas = stats.gas_used, "evaluation complete");
                Ok(stats)
            }
            Err(e) => {
                inner
                    .audit
                    .push(AuditEvent::new(AuditKind::EvaluateFailed, e.to_string()));
                Err(e)
            }
        }
    }

    /// Sweep TTL-expired facts. Returns the removed count.
    pub async fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        inner.store.sweep_expired(Utc::now())
    }

    /// Advance the store's generation counter.
    pub async fn bump_generation(&self) -> u64 {
        let mut inner = self.inner.write().await;
        inner.store.bump_generation()
    }

    /// Retract facts of `predicate` from generations before `newer_than`.
    pub async fn retract_generations_before(&self, predicate: &str, newer_than: u64) -> usize {
        let mut inner = self.inner.write().await;
        inner.store.retract_generations_before(predicate, newer_than)
    }

    /// Store counters.
    pub async fn stats(&self) -> StoreStats {
        self.inner.read().await.store.stats()
    }

    /// Snapshot of the EDB with metadata, for persistence.
    pub async fn edb_snapshot(&self) -> Vec<(Fact, FactMeta)> {
        let inner = self.inner.read().await;
        inner
            .store
            .edb_iter()
            .map(|(f, m)| (f, m.clone()))
            .collect()
    }

    /// Retained audit events.
    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.inner.read().await.audit.events().cloned().collect()
    }

    /// Append an audit event from a collaborating subsystem.
    pub async fn push_audit(&self, event: AuditEvent) {
        self.inner.write().await.audit.push(event);
    }

    /// Whether the schema declares this predicate.
    pub async fn is_declared(&self, predicate: &str) -> bool {
        self.inner.read().await.schema.is_declared(predicate)
    }

    fn note_policy_mutation(&self, predicate: &str) {
        if POLICY_PREDICATES.contains(&predicate) {
            if let Some(vstore) = &self.vstore {
                if let Err(e) = vstore.invalidate_permissions() {
                    warn!(predicate, error = %e, "permission cache invalidation failed");
                }
            }
        }
    }
}

#[async_trait]
impl PolicySource for Kernel {
    async fn is_permitted(&self, action: &str) -> bool {
        let inner = self.inner.read().await;
        if !inner.schema.is_declared("permitted") {
            return false;
        }
        let pattern: Pattern = vec![Some(crate::datalog::Const::name(action))];
        !inner.store.query("permitted", &pattern).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::Const;

    const GRAPH: &str = "Decl edge(A.Type<name>, B.Type<name>).\n\
         Decl path(A.Type<name>, B.Type<name>).\n\
         path(X, Y) :- edge(X, Y).\n\
         path(X, Y) :- edge(X, Z), path(Z, Y).";

    fn edge(a: &str, b: &str) -> Fact {
        Fact::new("edge", vec![Const::name(a), Const::name(b)])
    }

    #[tokio::test]
    async fn test_assert_query_evaluate() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.load_schema(GRAPH).await.unwrap();
        kernel
            .assert_with_origin(edge("a", "b"), Origin::User { turn: 1 })
            .await
            .unwrap();
        kernel
            .assert_with_origin(edge("b", "c"), Origin::User { turn: 1 })
            .await
            .unwrap();

        let paths = kernel.query("path", &vec![]).await.unwrap();
        assert_eq!(paths.len(), 3);
    }

    #[tokio::test]
    async fn test_undeclared_predicate_errors() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.load_schema(GRAPH).await.unwrap();
        let err = kernel.query("missing", &vec![]).await.unwrap_err();
        assert!(matches!(err, Error::UndeclaredPredicate(_)));

        // Declared but empty: an empty result, not an error.
        let empty = kernel.query("edge", &vec![]).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_assert_dedup_is_idempotent() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.load_schema(GRAPH).await.unwrap();
        assert!(kernel
            .assert_with_origin(edge("a", "b"), Origin::User { turn: 1 })
            .await
            .unwrap());
        assert!(!kernel
            .assert_with_origin(edge("a", "b"), Origin::User { turn: 1 })
            .await
            .unwrap());
        assert_eq!(kernel.stats().await.edb_count, 1);
    }

    #[tokio::test]
    async fn test_retract_idb_only_is_noop() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.load_schema(GRAPH).await.unwrap();
        kernel
            .assert_with_origin(edge("a", "b"), Origin::User { turn: 1 })
            .await
            .unwrap();

        // path(a,b) is derivable only.
        let removed = kernel.retract("path", &vec![]).await;
        assert_eq!(removed, 0);
        assert_eq!(kernel.query("path", &vec![]).await.unwrap().len(), 1);

        // Retracting the edge removes the derivation on re-eval.
        let removed = kernel.retract("edge", &vec![]).await;
        assert_eq!(removed, 1);
        assert!(kernel.query("path", &vec![]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_atomicity_on_validation() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.load_schema(GRAPH).await.unwrap();
        let bad = Fact::new("edge", vec![Const::name("a")]);
        let err = kernel
            .assert_batch(vec![edge("a", "b"), bad], Origin::User { turn: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArityMismatch { .. }));
        assert_eq!(kernel.stats().await.edb_count, 0);
    }

    #[tokio::test]
    async fn test_gas_overflow_preserves_store() {
        let config = KernelConfig {
            gas_limit: 2,
            ..KernelConfig::default()
        };
        let kernel = Kernel::new(config);
        kernel.load_schema(GRAPH).await.unwrap();
        kernel.set_auto_evaluate(false);
        for f in [edge("a", "b"), edge("b", "c"), edge("c", "d")] {
            kernel.assert_with_origin(f, Origin::User { turn: 1 }).await.unwrap();
        }
        let before = kernel.stats().await;
        let err = kernel.evaluate().await.unwrap_err();
        assert!(matches!(err, Error::GasExceeded { .. }));
        assert_eq!(kernel.stats().await, before);
        // Unrelated queries behave as if the failed evaluation never ran.
        assert_eq!(kernel.query("edge", &vec![]).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_replace_keyed_single_value() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel
            .load_schema("Decl shard_heartbeat(S.Type<name>, T.Type<number>).")
            .await
            .unwrap();
        for t in 0..5 {
            kernel
                .replace_keyed(
                    Fact::new("shard_heartbeat", vec![Const::name("s1"), Const::Number(t)]),
                    1,
                    Origin::System,
                )
                .await
                .unwrap();
        }
        let beats = kernel.query("shard_heartbeat", &vec![]).await.unwrap();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].args[1], Const::Number(4));
    }

    #[tokio::test]
    async fn test_control_rule_forbidden_head_rejected() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel
            .load_schema(
                "Decl permitted(A.Type<name>).\nDecl wanted(A.Type<name>).",
            )
            .await
            .unwrap();
        let err = kernel
            .apply_control_statement("permitted(X) :- wanted(X).", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ForbiddenLearnedHead(_)));
        let audits = kernel.audit_events().await;
        assert!(audits
            .iter()
            .any(|e| e.kind == AuditKind::RuleRejected));
    }
}
