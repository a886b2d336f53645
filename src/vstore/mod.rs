//! The virtual fact store.
//!
//! Presents side-effectful external resources (filesystem, git, shell,
//! HTTP, MCP tools) as ordinary predicates. Queries against a virtual
//! predicate are reified into handler invocations with permission checks,
//! result caching, and cancellation; write-class handlers additionally pass
//! the constitutional gate on every call.

pub mod cache;
pub mod capsule;
pub mod drivers;
pub mod gate;
pub mod handler;

pub use cache::{CacheKey, CacheStats, VirtualCache};
pub use capsule::PermissionCapsule;
pub use gate::{ConstitutionalGate, PolicySource, POLICY_PREDICATES};
pub use handler::{Binding, VirtualHandler, VirtualQuery};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::datalog::{Const, Fact};
use crate::error::{Error, Result};

/// Per-store configuration.
#[derive(Debug, Clone)]
pub struct VirtualStoreConfig {
    /// Default handler deadline in milliseconds
    pub default_timeout_ms: u64,
    /// Per-predicate deadline overrides
    pub timeouts_ms: HashMap<String, u64>,
}

impl Default for VirtualStoreConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            timeouts_ms: HashMap::new(),
        }
    }
}

/// A derived `next_action` consumed exactly once by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Correlation id carried into the `execution_result` fact
    pub id: String,
    /// Target predicate (the `/verb` of the derivation, without the slash)
    pub verb: String,
    /// Bound arguments, leading positions of the handler's signature
    pub args: Vec<Const>,
}

/// Outcome of one dispatched action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    /// `/ok`, `/refused`, `/timeout`, or `/error`
    pub status: Const,
    /// Tuples produced by the handler (empty on refusal/error)
    pub tuples: Vec<Vec<Const>>,
    /// Detail for the surface channel on non-success
    pub detail: Option<String>,
}

impl ActionOutcome {
    fn status_of(err: &Error) -> Const {
        match err {
            Error::NotPermitted(_) => Const::name("refused"),
            Error::HandlerTimeout { .. } => Const::name("timeout"),
            _ => Const::name("error"),
        }
    }
}

/// The process-wide virtual fact store.
///
/// Handlers are registered at construction time and resolved to indices;
/// the store itself is immutable afterwards and shared by every kernel in
/// the process.
pub struct VirtualFactStore {
    handlers: Vec<Arc<dyn VirtualHandler>>,
    by_predicate: HashMap<String, usize>,
    cache: VirtualCache,
    gate: ConstitutionalGate,
    config: VirtualStoreConfig,
}

impl VirtualFactStore {
    /// Create an empty store.
    pub fn new(config: VirtualStoreConfig) -> Self {
        Self {
            handlers: Vec::new(),
            by_predicate: HashMap::new(),
            cache: VirtualCache::new(),
            gate: ConstitutionalGate::new(),
            config,
        }
    }

    /// Register a handler. Each predicate has exactly one handler.
    pub fn register(&mut self, handler: Arc<dyn VirtualHandler>) -> Result<()> {
        let predicate = handler.predicate().to_string();
        if self.by_predicate.contains_key(&predicate) {
            return Err(Error::Config(format!(
                "virtual predicate {} registered twice",
                predicate
            )));
        }
        self.by_predicate.insert(predicate, self.handlers.len());
        self.handlers.push(handler);
        Ok(())
    }

    /// Whether a predicate is served by a handler.
    pub fn is_virtual(&self, predicate: &str) -> bool {
        self.by_predicate.contains_key(predicate)
    }

    /// Registered virtual predicate names.
    pub fn predicates(&self) -> impl Iterator<Item = &str> {
        self.by_predicate.keys().map(String::as_str)
    }

    fn resolve(&self, predicate: &str) -> Result<&Arc<dyn VirtualHandler>> {
        self.by_predicate
            .get(predicate)
            .map(|&i| &self.handlers[i])
            .ok_or_else(|| Error::Internal(format!("no handler for predicate {}", predicate)))
    }

    fn timeout_for(&self, predicate: &str) -> Duration {
        let ms = self
            .config
            .timeouts_ms
            .get(predicate)
            .copied()
            .unwrap_or(self.config.default_timeout_ms);
        Duration::from_millis(ms)
    }

    async fn invoke_with_deadline(
        &self,
        handler: &Arc<dyn VirtualHandler>,
        query: &VirtualQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Const>>> {
        let deadline = self.timeout_for(&query.predicate);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Internal(format!(
                "handler {} cancelled", query.predicate
            ))),
            result = tokio::time::timeout(deadline, handler.invoke(query, cancel)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::handler_timeout(
                        &query.predicate,
                        deadline.as_millis() as u64,
                    )),
                }
            }
        }
    }

    /// Resolve a virtual query into facts.
    ///
    /// `generation` is the caller's store generation tag and scopes cache
    /// entries. `InsufficientBindings` from the handler yields an empty
    /// result, matching the evaluator's no-facts-in-this-call contract.
    pub async fn intercept(
        &self,
        query: &VirtualQuery,
        generation: u64,
        policy: &dyn PolicySource,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fact>> {
        let handler = self.resolve(&query.predicate)?;

        if handler.is_write() {
            self.gate
                .check(&format!("/{}", query.predicate), policy)
                .await?;
        }

        let cache_slot = handler
            .cache_resource(query)
            .map(|resource| (CacheKey::generate(query, generation), resource));
        if let Some((key, _)) = &cache_slot {
            if let Some(tuples) = self.cache.get(key)? {
                debug!(predicate = %query.predicate, %key, "virtual cache hit");
                return Ok(self.to_facts(query, tuples));
            }
        }

        let tuples = match self.invoke_with_deadline(handler, query, cancel).await {
            Ok(tuples) => tuples,
            Err(Error::InsufficientBindings {
                predicate,
                position,
            }) => {
                debug!(%predicate, position, "insufficient bindings, yielding no facts");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        if let Some((key, resource)) = cache_slot {
            self.cache.put(key, resource, tuples.clone())?;
        }
        Ok(self.to_facts(query, tuples))
    }

    fn to_facts(&self, query: &VirtualQuery, tuples: Vec<Vec<Const>>) -> Vec<Fact> {
        tuples
            .into_iter()
            .filter(|tuple| {
                let ok = query.accepts(tuple);
                if !ok {
                    warn!(
                        predicate = %query.predicate,
                        "handler tuple disagrees with bound positions, dropped"
                    );
                }
                ok
            })
            .map(|args| Fact::new(query.predicate.clone(), args))
            .collect()
    }

    /// Dispatch a derived `next_action` to its write-class handler.
    ///
    /// The gate check is mandatory and happens here, at the handler
    /// boundary, regardless of what rules produced the action. Every
    /// outcome is an `ActionOutcome`; refusals and failures never escape
    /// as errors so the turn can record an `execution_result` either way.
    pub async fn execute_action(
        &self,
        request: &ActionRequest,
        policy: &dyn PolicySource,
        cancel: &CancellationToken,
    ) -> ActionOutcome {
        let handler = match self.resolve(&request.verb) {
            Ok(h) => h,
            Err(e) => {
                return ActionOutcome {
                    status: Const::name("error"),
                    tuples: Vec::new(),
                    detail: Some(e.to_string()),
                }
            }
        };

        if let Err(e) = self
            .gate
            .check(&format!("/{}", request.verb), policy)
            .await
        {
            return ActionOutcome {
                status: ActionOutcome::status_of(&e),
                tuples: Vec::new(),
                detail: Some(e.to_string()),
            };
        }

        let mut bindings: Vec<Binding> = request.args.iter().cloned().map(Binding::Bound).collect();
        while bindings.len() < handler.arity() {
            bindings.push(Binding::Free);
        }
        let query = VirtualQuery {
            predicate: request.verb.clone(),
            bindings,
        };

        match self.invoke_with_deadline(handler, &query, cancel).await {
            Ok(tuples) => {
                if let Some(prefix) = handler.invalidates(&query) {
                    match self.cache.invalidate_prefix(&prefix) {
                        Ok(dropped) if dropped > 0 => {
                            debug!(prefix, dropped, "write action invalidated cache entries");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(prefix, error = %e, "cache invalidation failed after write");
                        }
                    }
                }
                ActionOutcome {
                    status: Const::name("ok"),
                    tuples,
                    detail: None,
                }
            }
            Err(e) => ActionOutcome {
                status: ActionOutcome::status_of(&e),
                tuples: Vec::new(),
                detail: Some(e.to_string()),
            },
        }
    }

    /// Invalidate every cached gate verdict. Called on any assert/retract
    /// of `permitted`, `safe_action`, or `admin_override`.
    pub fn invalidate_permissions(&self) -> Result<()> {
        self.gate.invalidate()
    }

    /// Invalidate cached results under a resource prefix.
    pub fn invalidate_resource(&self, prefix: &str) -> Result<usize> {
        self.cache.invalidate_prefix(prefix)
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats()
    }
}
