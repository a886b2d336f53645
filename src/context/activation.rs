//! Spreading-activation scoring.
//!
//! A fact's priority is the sum of nine independent components: predicate
//! base priority, recency, intent relevance, dependency proximity (forward
//! and reverse hops over shared constants), campaign context, session
//! membership, issue context, historical feedback, and back-reference.
//! Selection always applies the threshold first, then fills the token
//! budget in score-descending order.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::context::types::estimate_tokens;
use crate::datalog::{Const, Fact, FactMeta, Origin};

/// Component caps and weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Per-predicate base priority, capped at 100
    pub predicate_priorities: HashMap<String, f64>,
    /// Base priority for undeclared predicates
    pub default_priority: f64,
    /// Recency decays by this much per turn of age
    pub recency_step: f64,
    /// Recency starts here for the current turn
    pub recency_max: f64,
    /// Dependency-hop component cap
    pub dependency_cap: f64,
    /// Campaign component cap
    pub campaign_cap: f64,
    /// Session-membership bonus
    pub session_bonus: f64,
    /// Issue-context bonus
    pub issue_bonus: f64,
    /// Back-reference bonus
    pub back_reference_bonus: f64,
    /// Facts scoring below this are never selected
    pub threshold: f64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        let mut predicate_priorities = HashMap::new();
        predicate_priorities.insert("user_intent".to_string(), 90.0);
        predicate_priorities.insert("focus_resolution".to_string(), 80.0);
        predicate_priorities.insert("execution_result".to_string(), 70.0);
        predicate_priorities.insert("clarification_needed".to_string(), 85.0);
        predicate_priorities.insert("delegate_task_result".to_string(), 65.0);
        predicate_priorities.insert("diagnostic".to_string(), 60.0);
        Self {
            predicate_priorities,
            default_priority: 30.0,
            recency_step: 5.0,
            recency_max: 30.0,
            dependency_cap: 40.0,
            campaign_cap: 60.0,
            session_bonus: 15.0,
            issue_bonus: 10.0,
            back_reference_bonus: 10.0,
            threshold: 35.0,
        }
    }
}

/// Per-turn signals the scorer reads.
#[derive(Debug, Clone, Default)]
pub struct ActivationContext {
    /// Current turn number
    pub current_turn: u64,
    /// The intent's target string
    pub intent_target: Option<String>,
    /// Paths/symbols currently in focus
    pub focused: Vec<String>,
    /// The intent verb, for verb-specific boosts
    pub verb: Option<String>,
    /// Active campaign tags
    pub campaign_tags: Vec<String>,
    /// Issue references in play (`#123`)
    pub issue_refs: Vec<String>,
    /// Historical per-predicate feedback adjustments
    pub feedback: HashMap<String, f64>,
    /// Turns the user explicitly referenced
    pub referenced_turns: Vec<u64>,
}

/// A fact with its activation score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredFact {
    /// The fact
    pub fact: Fact,
    /// Total activation
    pub score: f64,
}

fn arg_strings(fact: &Fact) -> impl Iterator<Item = &str> {
    fact.args.iter().filter_map(|c| match c {
        Const::Str(s) => Some(s.as_str()),
        Const::Name(n) => Some(n.as_str()),
        _ => None,
    })
}

fn origin_turn(meta: &FactMeta) -> Option<u64> {
    match &meta.origin {
        Origin::User { turn } | Origin::Control { turn } | Origin::Tool { turn } => Some(*turn),
        _ => None,
    }
}

/// Verb-specific predicate boosts: a mutating turn cares more about file
/// and diagnostic state, an inquiry about prior findings.
fn verb_boost(verb: &str, predicate: &str) -> f64 {
    match (verb, predicate) {
        ("write" | "refactor" | "fix", "file_content" | "diagnostic") => 10.0,
        ("commit", "git_log") => 10.0,
        ("explain" | "review", "delegate_task_result" | "execution_result") => 10.0,
        _ => 0.0,
    }
}

/// Dependency proximity over shared constants: seeds are the facts whose
/// arguments mention the focus; hop 1 shares a constant with a seed, hop 2
/// shares one with a hop-1 fact. Both directions count, capped.
fn dependency_scores(
    facts: &[(Fact, FactMeta)],
    seeds: &HashSet<usize>,
    cap: f64,
) -> HashMap<usize, f64> {
    // Constant -> fact indices sharing it.
    let mut by_const: HashMap<&Const, Vec<usize>> = HashMap::new();
    for (i, (fact, _)) in facts.iter().enumerate() {
        for c in &fact.args {
            by_const.entry(c).or_default().push(i);
        }
    }

    let mut hops: HashMap<usize, u32> = seeds.iter().map(|&i| (i, 0)).collect();
    let mut queue: VecDeque<usize> = seeds.iter().copied().collect();
    while let Some(i) = queue.pop_front() {
        let hop = hops[&i];
        if hop >= 2 {
            continue;
        }
        for c in &facts[i].0.args {
            for &j in by_const.get(c).into_iter().flatten() {
                if !hops.contains_key(&j) {
                    hops.insert(j, hop + 1);
                    queue.push_back(j);
                }
            }
        }
    }

    hops.into_iter()
        .map(|(i, hop)| {
            let score = match hop {
                0 => cap,
                1 => cap - 15.0,
                _ => cap - 30.0,
            };
            (i, score.max(0.0))
        })
        .collect()
}

/// Score every fact.
pub fn score_facts(
    facts: &[(Fact, FactMeta)],
    config: &ActivationConfig,
    ctx: &ActivationContext,
) -> Vec<ScoredFact> {
    // Seed set for dependency spreading: facts mentioning the focus.
    let seeds: HashSet<usize> = facts
        .iter()
        .enumerate()
        .filter(|(_, (fact, _))| {
            arg_strings(fact).any(|s| {
                ctx.focused.iter().any(|f| s.contains(f.as_str()))
                    || ctx
                        .intent_target
                        .as_deref()
                        .is_some_and(|t| !t.is_empty() && s.contains(t))
            })
        })
        .map(|(i, _)| i)
        .collect();
    let dependency = dependency_scores(facts, &seeds, config.dependency_cap);

    facts
        .iter()
        .enumerate()
        .map(|(i, (fact, meta))| {
            // 1. base predicate priority
            let base = config
                .predicate_priorities
                .get(&fact.predicate)
                .copied()
                .unwrap_or(config.default_priority)
                .min(100.0);

            // 2. recency step decay
            let age = origin_turn(meta)
                .map(|t| ctx.current_turn.saturating_sub(t))
                .unwrap_or(ctx.current_turn);
            let recency = (config.recency_max - config.recency_step * age as f64).max(0.0);

            // 3. relevance: intent target and focused paths
            let mut relevance = 0.0;
            if let Some(target) = ctx.intent_target.as_deref() {
                if !target.is_empty() && arg_strings(fact).any(|s| s.contains(target)) {
                    relevance += 25.0;
                }
            }
            if arg_strings(fact)
                .any(|s| ctx.focused.iter().any(|f| s.contains(f.as_str())))
            {
                relevance += 20.0;
            }
            if let Some(verb) = ctx.verb.as_deref() {
                relevance += verb_boost(verb, &fact.predicate);
            }

            // 4. dependency hops (forward and reverse, capped)
            let dependency = dependency.get(&i).copied().unwrap_or(0.0);

            // 5. campaign context (capped)
            let campaign_hits = ctx
                .campaign_tags
                .iter()
                .filter(|tag| arg_strings(fact).any(|s| s.contains(tag.as_str())))
                .count();
            let campaign = (campaign_hits as f64 * 20.0).min(config.campaign_cap);

            // 6. session membership
            let session = if meta.origin.is_trusted() {
                0.0
            } else {
                config.session_bonus
            };

            // 7. issue context
            let issue = if ctx
                .issue_refs
                .iter()
                .any(|r| arg_strings(fact).any(|s| s.contains(r.as_str())))
            {
                config.issue_bonus
            } else {
                0.0
            };

            // 8. historical feedback
            let feedback = ctx.feedback.get(&fact.predicate).copied().unwrap_or(0.0);

            // 9. back-reference to explicitly mentioned turns
            let back_reference = if origin_turn(meta)
                .is_some_and(|t| ctx.referenced_turns.contains(&t))
            {
                config.back_reference_bonus
            } else {
                0.0
            };

            ScoredFact {
                fact: fact.clone(),
                score: base
                    + recency
                    + relevance
                    + dependency
                    + campaign
                    + session
                    + issue
                    + feedback
                    + back_reference,
            }
        })
        .collect()
}

/// Drop facts below the activation threshold.
pub fn filter_by_threshold(scored: Vec<ScoredFact>, threshold: f64) -> Vec<ScoredFact> {
    scored.into_iter().filter(|s| s.score >= threshold).collect()
}

/// Select the highest-scoring facts that fit the token budget. The
/// threshold applies first, always.
pub fn select_within_budget(
    scored: Vec<ScoredFact>,
    threshold: f64,
    token_budget: usize,
) -> Vec<ScoredFact> {
    let mut kept = filter_by_threshold(scored, threshold);
    kept.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.fact.predicate.cmp(&b.fact.predicate))
            .then_with(|| a.fact.args.cmp(&b.fact.args))
    });

    let mut out = Vec::new();
    let mut used = 0usize;
    for s in kept {
        let cost = estimate_tokens(&s.fact.to_string());
        if used + cost > token_budget {
            continue;
        }
        used += cost;
        out.push(s);
    }
    out
}
