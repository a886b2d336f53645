//! Virtual-predicate handler interface.
//!
//! A virtual predicate looks like any other predicate to rules, but its
//! facts are produced on demand by an external handler. Handlers are
//! first-class capability objects: each carries its permission capsule and
//! its binding-pattern contract, and is registered once at construction
//! time (no dynamic string dispatch on the hot path).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::datalog::{Const, Pattern};
use crate::error::{Error, Result};
use crate::vstore::capsule::PermissionCapsule;

/// One argument position of a virtual query: free, or bound to a constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// The handler must produce values for this position
    Free,
    /// The caller supplied this constant
    Bound(Const),
}

/// A structured query handed to a handler: predicate name plus one binding
/// per argument position.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualQuery {
    /// Predicate being queried
    pub predicate: String,
    /// Binding per argument position, in order
    pub bindings: Vec<Binding>,
}

impl VirtualQuery {
    /// Build a query from a kernel match pattern.
    pub fn from_pattern(predicate: impl Into<String>, pattern: &Pattern, arity: usize) -> Self {
        let mut bindings = Vec::with_capacity(arity);
        for i in 0..arity {
            match pattern.get(i) {
                Some(Some(c)) => bindings.push(Binding::Bound(c.clone())),
                _ => bindings.push(Binding::Free),
            }
        }
        Self {
            predicate: predicate.into(),
            bindings,
        }
    }

    /// The constant bound at `position`, if any.
    pub fn bound(&self, position: usize) -> Option<&Const> {
        match self.bindings.get(position) {
            Some(Binding::Bound(c)) => Some(c),
            _ => None,
        }
    }

    /// The constant bound at `position`, or `InsufficientBindings`.
    pub fn require(&self, position: usize) -> Result<&Const> {
        self.bound(position).ok_or(Error::InsufficientBindings {
            predicate: self.predicate.clone(),
            position,
        })
    }

    /// Bound positions as `(position, constant)` pairs.
    pub fn bound_args(&self) -> Vec<(usize, &Const)> {
        self.bindings
            .iter()
            .enumerate()
            .filter_map(|(i, b)| match b {
                Binding::Bound(c) => Some((i, c)),
                Binding::Free => None,
            })
            .collect()
    }

    /// Whether a produced tuple agrees with every bound position.
    pub fn accepts(&self, tuple: &[Const]) -> bool {
        if tuple.len() != self.bindings.len() {
            return false;
        }
        self.bindings.iter().zip(tuple).all(|(b, c)| match b {
            Binding::Free => true,
            Binding::Bound(expected) => expected == c,
        })
    }
}

/// A handler producing facts for one virtual predicate.
#[async_trait]
pub trait VirtualHandler: Send + Sync {
    /// The predicate this handler serves.
    fn predicate(&self) -> &str;

    /// Declared arity of the predicate.
    fn arity(&self) -> usize;

    /// The OS resources this handler may touch.
    fn capsule(&self) -> &PermissionCapsule;

    /// Whether this predicate performs side effects. Write-class handlers
    /// pass the constitutional gate before every invocation.
    fn is_write(&self) -> bool {
        false
    }

    /// Resource key for caching the result of this query, e.g.
    /// `fs:/repo/src/main.rs` or `git:log`. `None` disables caching.
    fn cache_resource(&self, _query: &VirtualQuery) -> Option<String> {
        None
    }

    /// Resource prefix whose cached entries a successful write through this
    /// handler invalidates. `None` for read-only handlers.
    fn invalidates(&self, _query: &VirtualQuery) -> Option<String> {
        None
    }

    /// Produce one tuple per satisfying value. Every returned tuple must
    /// agree with the query's bound positions.
    async fn invoke(
        &self,
        query: &VirtualQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Const>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pattern() {
        let pattern = vec![Some(Const::name("a")), None];
        let q = VirtualQuery::from_pattern("file_content", &pattern, 2);
        assert_eq!(q.bound(0), Some(&Const::name("a")));
        assert_eq!(q.bound(1), None);
        assert!(q.require(1).is_err());
    }

    #[test]
    fn test_empty_pattern_all_free() {
        let q = VirtualQuery::from_pattern("p", &vec![], 3);
        assert_eq!(q.bindings.len(), 3);
        assert!(q.bindings.iter().all(|b| matches!(b, Binding::Free)));
    }

    #[test]
    fn test_accepts() {
        let pattern = vec![Some(Const::string("x")), None];
        let q = VirtualQuery::from_pattern("p", &pattern, 2);
        assert!(q.accepts(&[Const::string("x"), Const::Number(1)]));
        assert!(!q.accepts(&[Const::string("y"), Const::Number(1)]));
        assert!(!q.accepts(&[Const::string("x")]));
    }
}
