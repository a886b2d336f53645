//! The extensional/intensional fact store.
//!
//! The EDB holds directly asserted facts together with per-fact metadata
//! (origin tag, assertion time, generation, optional TTL). The IDB is the
//! derived relation produced by the most recent completed evaluation and is
//! replaced wholesale by the evaluation driver.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::datalog::term::{Const, Fact};

/// Where a fact came from, for auditing and trust decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Origin {
    /// Loaded from a trusted boot-time schema file
    Boot,
    /// Produced by the perception transducer from user input
    User { turn: u64 },
    /// Asserted through the piggyback control channel
    Control { turn: u64 },
    /// Result of a dispatched tool action
    Tool { turn: u64 },
    /// Injected by a virtual-predicate handler
    Virtual,
    /// Merged from a completed shard
    Shard { id: String },
    /// Kernel-internal bookkeeping (heartbeats, queue depth)
    System,
}

impl Origin {
    /// Whether facts from this origin are trusted for policy purposes.
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Boot | Self::System)
    }
}

/// Metadata attached to each EDB fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactMeta {
    /// Origin tag
    pub origin: Origin,
    /// When the fact was asserted
    pub asserted_at: DateTime<Utc>,
    /// Generation counter at assertion time
    pub generation: u64,
    /// Optional expiry for time-windowed predicates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl FactMeta {
    /// Metadata for a fact asserted now with the given origin.
    pub fn new(origin: Origin, generation: u64) -> Self {
        Self {
            origin,
            asserted_at: Utc::now(),
            generation,
            expires_at: None,
        }
    }

    /// Attach a TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.asserted_at + ttl);
        self
    }
}

/// A match pattern: one optional constant per argument position. `None`
/// positions are wildcards; an empty pattern matches every fact.
pub type Pattern = Vec<Option<Const>>;

fn pattern_matches(args: &[Const], pattern: &Pattern) -> bool {
    if pattern.is_empty() {
        return true;
    }
    if pattern.len() != args.len() {
        return false;
    }
    pattern
        .iter()
        .zip(args)
        .all(|(p, a)| p.as_ref().map_or(true, |c| c == a))
}

/// The derived relation: predicate to argument tuples.
pub type Idb = HashMap<String, HashSet<Vec<Const>>>;

/// Counters describing the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Directly asserted facts
    pub edb_count: usize,
    /// Derived facts from the last completed evaluation
    pub idb_count: usize,
    /// Current generation counter
    pub generation: u64,
}

/// The kernel's fact store.
#[derive(Debug, Clone, Default)]
pub struct FactStore {
    edb: HashMap<String, HashMap<Vec<Const>, FactMeta>>,
    idb: Idb,
    generation: u64,
}

impl FactStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fact into the EDB. Returns `false` when an identical fact
    /// was already present (the existing metadata is kept).
    pub fn insert(&mut self, fact: Fact, meta: FactMeta) -> bool {
        let slot = self.edb.entry(fact.predicate).or_default();
        match slot.entry(fact.args) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(meta);
                true
            }
        }
    }

    /// Whether the EDB holds this exact fact.
    pub fn contains_edb(&self, fact: &Fact) -> bool {
        self.edb
            .get(&fact.predicate)
            .is_some_and(|m| m.contains_key(&fact.args))
    }

    /// Whether the fact is visible in EDB or IDB.
    pub fn contains(&self, fact: &Fact) -> bool {
        self.contains_edb(fact)
            || self
                .idb
                .get(&fact.predicate)
                .is_some_and(|s| s.contains(&fact.args))
    }

    /// Whether the args tuple exists only in the IDB (derivable, not
    /// directly asserted).
    pub fn is_idb_only(&self, fact: &Fact) -> bool {
        !self.contains_edb(fact)
            && self
                .idb
                .get(&fact.predicate)
                .is_some_and(|s| s.contains(&fact.args))
    }

    /// Remove EDB facts matching the pattern. Returns the removed count.
    pub fn remove_matching(&mut self, predicate: &str, pattern: &Pattern) -> usize {
        let Some(slot) = self.edb.get_mut(predicate) else {
            return 0;
        };
        let before = slot.len();
        slot.retain(|args, _| !pattern_matches(args, pattern));
        let removed = before - slot.len();
        if slot.is_empty() {
            self.edb.remove(predicate);
        }
        removed
    }

    /// Query EDB ∪ IDB for facts matching the pattern.
    pub fn query(&self, predicate: &str, pattern: &Pattern) -> Vec<Fact> {
        let mut seen: HashSet<&Vec<Const>> = HashSet::new();
        let mut out = Vec::new();
        if let Some(slot) = self.edb.get(predicate) {
            for args in slot.keys() {
                if pattern_matches(args, pattern) && seen.insert(args) {
                    out.push(Fact {
                        predicate: predicate.to_string(),
                        args: args.clone(),
                    });
                }
            }
        }
        if let Some(slot) = self.idb.get(predicate) {
            for args in slot {
                if pattern_matches(args, pattern) && seen.insert(args) {
                    out.push(Fact {
                        predicate: predicate.to_string(),
                        args: args.clone(),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.args.cmp(&b.args));
        out
    }

    /// EDB argument tuples for one predicate.
    pub fn edb_tuples(&self, predicate: &str) -> impl Iterator<Item = &Vec<Const>> {
        self.edb.get(predicate).into_iter().flat_map(|m| m.keys())
    }

    /// Iterate the whole EDB with metadata.
    pub fn edb_iter(&self) -> impl Iterator<Item = (Fact, &FactMeta)> {
        self.edb.iter().flat_map(|(pred, m)| {
            m.iter().map(move |(args, meta)| {
                (
                    Fact {
                        predicate: pred.clone(),
                        args: args.clone(),
                    },
                    meta,
                )
            })
        })
    }

    /// Metadata for an EDB fact.
    pub fn meta(&self, fact: &Fact) -> Option<&FactMeta> {
        self.edb.get(&fact.predicate)?.get(&fact.args)
    }

    /// Replace the IDB after a completed evaluation. EDB duplicates are
    /// stripped so the union stays canonical.
    pub fn set_idb(&mut self, mut idb: Idb) {
        for (pred, tuples) in idb.iter_mut() {
            if let Some(edb) = self.edb.get(pred) {
                tuples.retain(|args| !edb.contains_key(args));
            }
        }
        idb.retain(|_, tuples| !tuples.is_empty());
        self.idb = idb;
    }

    /// Clear the IDB (schema reload, rollback).
    pub fn clear_idb(&mut self) {
        self.idb.clear();
    }

    /// Drop all facts.
    pub fn clear(&mut self) {
        self.edb.clear();
        self.idb.clear();
    }

    /// Current generation counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Advance and return the generation counter.
    pub fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Retract every EDB fact of `predicate` stamped with a generation
    /// strictly older than `newer_than`.
    pub fn retract_generations_before(&mut self, predicate: &str, newer_than: u64) -> usize {
        let Some(slot) = self.edb.get_mut(predicate) else {
            return 0;
        };
        let before = slot.len();
        slot.retain(|_, meta| meta.generation >= newer_than);
        let removed = before - slot.len();
        if slot.is_empty() {
            self.edb.remove(predicate);
        }
        removed
    }

    /// Remove expired facts. Returns the removed count.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.edb.retain(|_, slot| {
            let before = slot.len();
            slot.retain(|_, meta| meta.expires_at.map_or(true, |t| t > now));
            removed += before - slot.len();
            !slot.is_empty()
        });
        removed
    }

    /// Store counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            edb_count: self.edb.values().map(|m| m.len()).sum(),
            idb_count: self.idb.values().map(|s| s.len()).sum(),
            generation: self.generation,
        }
    }

    /// Total fact count across EDB and IDB.
    pub fn len(&self) -> usize {
        let s = self.stats();
        s.edb_count + s.idb_count
    }

    /// Whether the store holds no facts at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(pred: &str, names: &[&str]) -> Fact {
        Fact::new(pred, names.iter().map(Const::name).collect())
    }

    fn meta() -> FactMeta {
        FactMeta::new(Origin::System, 0)
    }

    #[test]
    fn test_insert_dedup() {
        let mut store = FactStore::new();
        assert!(store.insert(fact("edge", &["a", "b"]), meta()));
        assert!(!store.insert(fact("edge", &["a", "b"]), meta()));
        assert_eq!(store.stats().edb_count, 1);
    }

    #[test]
    fn test_query_pattern() {
        let mut store = FactStore::new();
        store.insert(fact("edge", &["a", "b"]), meta());
        store.insert(fact("edge", &["a", "c"]), meta());
        store.insert(fact("edge", &["b", "c"]), meta());

        let all = store.query("edge", &vec![]);
        assert_eq!(all.len(), 3);

        let from_a = store.query("edge", &vec![Some(Const::name("a")), None]);
        assert_eq!(from_a.len(), 2);
    }

    #[test]
    fn test_remove_matching() {
        let mut store = FactStore::new();
        store.insert(fact("edge", &["a", "b"]), meta());
        store.insert(fact("edge", &["a", "c"]), meta());
        let removed = store.remove_matching("edge", &vec![Some(Const::name("a")), None]);
        assert_eq!(removed, 2);
        assert!(store.query("edge", &vec![]).is_empty());
    }

    #[test]
    fn test_idb_union_and_dedup() {
        let mut store = FactStore::new();
        store.insert(fact("edge", &["a", "b"]), meta());
        let mut idb = Idb::new();
        idb.entry("edge".into())
            .or_default()
            .insert(vec![Const::name("a"), Const::name("b")]);
        idb.entry("path".into())
            .or_default()
            .insert(vec![Const::name("a"), Const::name("b")]);
        store.set_idb(idb);
        // edge(a,b) exists in both; the union stays a set.
        assert_eq!(store.query("edge", &vec![]).len(), 1);
        assert_eq!(store.stats().idb_count, 1);
        assert!(store.is_idb_only(&fact("path", &["a", "b"])));
    }

    #[test]
    fn test_generation_retraction() {
        let mut store = FactStore::new();
        store.insert(fact("hb", &["s1"]), FactMeta::new(Origin::System, 1));
        store.insert(fact("hb", &["s2"]), FactMeta::new(Origin::System, 2));
        let removed = store.retract_generations_before("hb", 2);
        assert_eq!(removed, 1);
        assert_eq!(store.query("hb", &vec![]).len(), 1);
    }

    #[test]
    fn test_ttl_sweep() {
        let mut store = FactStore::new();
        store.insert(
            fact("execution_result", &["r1"]),
            FactMeta::new(Origin::System, 0).with_ttl(Duration::seconds(-1)),
        );
        store.insert(
            fact("execution_result", &["r2"]),
            FactMeta::new(Origin::System, 0).with_ttl(Duration::hours(1)),
        );
        let removed = store.sweep_expired(Utc::now());
        assert_eq!(removed, 1);
        assert_eq!(store.query("execution_result", &vec![]).len(), 1);
    }
}
