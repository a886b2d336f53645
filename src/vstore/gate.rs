//! The constitutional gate.
//!
//! Before any write-class virtual predicate runs, the gate asks the owning
//! kernel whether `permitted(Action)` is derivable. The check happens at
//! the handler boundary and cannot be bypassed by user-land rules or
//! LLM-proposed updates. Verdicts are cached behind one mutex; any assert
//! or retract touching a policy predicate invalidates the whole cache.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Predicates whose mutation invalidates cached gate verdicts.
pub const POLICY_PREDICATES: &[&str] = &["permitted", "safe_action", "admin_override"];

/// Read-only view of the kernel's policy state.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Whether `permitted(/action)` is derivable right now.
    async fn is_permitted(&self, action: &str) -> bool;
}

/// The gate plus its verdict cache.
#[derive(Debug, Default)]
pub struct ConstitutionalGate {
    verdicts: Mutex<HashMap<String, bool>>,
}

impl ConstitutionalGate {
    /// Create a gate with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_verdicts(&self) -> Result<MutexGuard<'_, HashMap<String, bool>>> {
        self.verdicts
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock gate cache: {}", e)))
    }

    /// Check that `action` is permitted, consulting the cache first.
    pub async fn check(&self, action: &str, policy: &dyn PolicySource) -> Result<()> {
        let cached = self.lock_verdicts()?.get(action).copied();
        let allowed = match cached {
            Some(v) => v,
            None => {
                let v = policy.is_permitted(action).await;
                self.lock_verdicts()?.insert(action.to_string(), v);
                v
            }
        };
        if allowed {
            debug!(action, "gate: permitted");
            Ok(())
        } else {
            warn!(action, "gate: refused");
            Err(Error::NotPermitted(action.to_string()))
        }
    }

    /// Drop every cached verdict. Called on any assert/retract of a
    /// policy predicate.
    pub fn invalidate(&self) -> Result<()> {
        self.lock_verdicts()?.clear();
        Ok(())
    }

    /// Number of cached verdicts, for diagnostics.
    pub fn cached_verdicts(&self) -> Result<usize> {
        Ok(self.lock_verdicts()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPolicy {
        allowed: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PolicySource for CountingPolicy {
        async fn is_permitted(&self, _action: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.allowed
        }
    }

    #[tokio::test]
    async fn test_refusal_and_caching() {
        let gate = ConstitutionalGate::new();
        let policy = CountingPolicy {
            allowed: false,
            calls: AtomicUsize::new(0),
        };

        let err = gate.check("/write_file", &policy).await.unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));
        // Second check is served from cache.
        assert!(gate.check("/write_file", &policy).await.is_err());
        assert_eq!(policy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidation_forces_requery() {
        let gate = ConstitutionalGate::new();
        let policy = CountingPolicy {
            allowed: true,
            calls: AtomicUsize::new(0),
        };

        assert!(gate.check("/exec_cmd", &policy).await.is_ok());
        gate.invalidate().unwrap();
        assert!(gate.check("/exec_cmd", &policy).await.is_ok());
        assert_eq!(policy.calls.load(Ordering::SeqCst), 2);
    }
}
