//! Result caching for virtual-predicate queries.
//!
//! Entries are keyed by `(predicate, bound-argument-tuple, generation-tag)`
//! and carry the resource key their handler declared, so a write action
//! touching a resource subtree invalidates exactly the entries under it.
//! The cache is shared by every kernel in the process behind one mutex with
//! short critical sections.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::datalog::Const;
use crate::error::{Error, Result};
use crate::vstore::handler::VirtualQuery;

/// Cache key for one virtual query at one store generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Generate a key from the query's bound positions and the caller's
    /// generation tag.
    pub fn generate(query: &VirtualQuery, generation: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(query.predicate.as_bytes());
        hasher.update(b"\n");
        for (pos, c) in query.bound_args() {
            hasher.update(format!("{}={}\n", pos, c).as_bytes());
        }
        hasher.update(format!("gen:{}", generation).as_bytes());
        let hash = hasher.finalize();
        CacheKey(format!("{:x}", hash))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16])
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    tuples: Vec<Vec<Const>>,
    resource: String,
    created_at: DateTime<Utc>,
    hit_count: u64,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookup hits
    pub hits: u64,
    /// Lookup misses
    pub misses: u64,
    /// Entries invalidated by resource writes
    pub invalidated: u64,
    /// Live entries
    pub entry_count: usize,
}

impl CacheStats {
    /// Fraction of lookups served from cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
    invalidated: u64,
}

/// The shared virtual-result cache.
#[derive(Debug, Default)]
pub struct VirtualCache {
    state: Mutex<CacheState>,
}

impl VirtualCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock virtual cache: {}", e)))
    }

    /// Look up a query result.
    pub fn get(&self, key: &CacheKey) -> Result<Option<Vec<Vec<Const>>>> {
        let mut state = self.lock_state()?;
        let found = match state.entries.get_mut(key) {
            Some(entry) => {
                entry.hit_count += 1;
                let tuples = entry.tuples.clone();
                state.hits += 1;
                Some(tuples)
            }
            None => {
                state.misses += 1;
                None
            }
        };
        Ok(found)
    }

    /// Store a query result under its resource key.
    pub fn put(
        &self,
        key: CacheKey,
        resource: impl Into<String>,
        tuples: Vec<Vec<Const>>,
    ) -> Result<()> {
        let mut state = self.lock_state()?;
        state.entries.insert(
            key,
            CacheEntry {
                tuples,
                resource: resource.into(),
                created_at: Utc::now(),
                hit_count: 0,
            },
        );
        Ok(())
    }

    /// Drop every entry whose resource key starts with `prefix`. Returns
    /// the number of dropped entries.
    pub fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        let mut state = self.lock_state()?;
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.resource.starts_with(prefix));
        let dropped = before - state.entries.len();
        state.invalidated += dropped as u64;
        Ok(dropped)
    }

    /// Drop everything.
    pub fn clear(&self) -> Result<()> {
        self.lock_state()?.entries.clear();
        Ok(())
    }

    /// Counters.
    pub fn stats(&self) -> Result<CacheStats> {
        let state = self.lock_state()?;
        Ok(CacheStats {
            hits: state.hits,
            misses: state.misses,
            invalidated: state.invalidated,
            entry_count: state.entries.len(),
        })
    }

    /// Age of the oldest entry, for diagnostics.
    pub fn oldest_entry_age(&self) -> Result<Option<chrono::Duration>> {
        let state = self.lock_state()?;
        Ok(state
            .entries
            .values()
            .map(|e| Utc::now() - e.created_at)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::Pattern;

    fn query(pred: &str, bound: &str) -> VirtualQuery {
        let pattern: Pattern = vec![Some(Const::string(bound)), None];
        VirtualQuery::from_pattern(pred, &pattern, 2)
    }

    #[test]
    fn test_key_varies_with_bindings_and_generation() {
        let q1 = query("file_content", "/a");
        let q2 = query("file_content", "/b");
        assert_ne!(CacheKey::generate(&q1, 0), CacheKey::generate(&q2, 0));
        assert_ne!(CacheKey::generate(&q1, 0), CacheKey::generate(&q1, 1));
        assert_eq!(CacheKey::generate(&q1, 0), CacheKey::generate(&q1, 0));
    }

    #[test]
    fn test_hit_miss_and_prefix_invalidation() {
        let cache = VirtualCache::new();
        let q = query("file_content", "/repo/src/main.rs");
        let key = CacheKey::generate(&q, 0);

        assert!(cache.get(&key).unwrap().is_none());
        cache
            .put(
                key.clone(),
                "fs:/repo/src/main.rs",
                vec![vec![
                    Const::string("/repo/src/main.rs"),
                    Const::string("fn main() {}"),
                ]],
            )
            .unwrap();
        assert!(cache.get(&key).unwrap().is_some());

        // A write outside the subtree leaves the entry alone.
        assert_eq!(cache.invalidate_prefix("fs:/repo/tests").unwrap(), 0);
        assert!(cache.get(&key).unwrap().is_some());

        // A write to the subtree drops it.
        assert_eq!(cache.invalidate_prefix("fs:/repo/src").unwrap(), 1);
        assert!(cache.get(&key).unwrap().is_none());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.invalidated, 1);
    }
}
