//! Stratified bottom-up evaluation.
//!
//! Semi-naive: each iteration joins the previous iteration's delta against
//! the full visible relation, halting when the delta is empty. Strata run in
//! topological order, so a negated (or aggregated) body literal only ever
//! reads fully-evaluated lower strata. A gas counter bounds the number of
//! derived facts; on overflow the scratch IDB is discarded and the caller's
//! store is untouched.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::datalog::schema::{AggFunc, Literal, Pipeline, Rule, Schema};
use crate::datalog::store::{FactStore, Idb};
use crate::datalog::term::{Atom, Const, Fact, Term};
use crate::error::{Error, Result};

/// Statistics from one evaluation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalStats {
    /// Number of strata evaluated
    pub strata: usize,
    /// Total fixpoint iterations across strata
    pub iterations: usize,
    /// Derived facts in the resulting IDB
    pub derived: usize,
    /// Gas consumed (one unit per novel derived fact)
    pub gas_used: usize,
    /// Wall-clock duration
    pub duration_ms: u64,
}

type Env = HashMap<String, Const>;
type Relation = HashMap<String, HashSet<Vec<Const>>>;

/// Evaluate the schema's rules over the store's EDB to fixpoint.
///
/// Returns the derived IDB; the store itself is never mutated here, which
/// is what makes gas overflow trivially restorable.
pub fn evaluate(schema: &Schema, store: &FactStore, gas_limit: usize) -> Result<(Idb, EvalStats)> {
    let started = Instant::now();
    let mut stats = EvalStats::default();

    // Visible relation: EDB plus everything derived so far.
    let mut visible: Relation = HashMap::new();
    for (fact, _) in store.edb_iter() {
        visible.entry(fact.predicate).or_default().insert(fact.args);
    }
    let mut derived: Idb = HashMap::new();
    let mut gas = 0usize;

    let rules = schema.rules();
    for stratum in schema.strata() {
        stats.strata += 1;
        let stratum_rules: Vec<&Rule> = stratum.iter().map(|&i| &rules[i]).collect();

        // Aggregation rules see only lower strata, so one pass suffices.
        let mut delta: Relation = HashMap::new();
        for rule in stratum_rules.iter().filter(|r| r.pipeline.is_some()) {
            let envs = eval_body(rule, &visible, None)?;
            for args in apply_pipeline(rule, envs)? {
                emit(
                    schema, rule, args, &mut visible, &mut derived, &mut delta, &mut gas,
                    gas_limit,
                )?;
            }
        }

        // First pass for plain rules runs against the full relation.
        for rule in stratum_rules.iter().filter(|r| r.pipeline.is_none()) {
            for env in eval_body(rule, &visible, None)? {
                let args = project_head(rule, &env)?;
                emit(
                    schema, rule, args, &mut visible, &mut derived, &mut delta, &mut gas,
                    gas_limit,
                )?;
            }
        }

        // Semi-naive iterations: every derivation must touch the delta.
        while !delta.is_empty() {
            stats.iterations += 1;
            let mut next_delta: Relation = HashMap::new();
            for rule in stratum_rules.iter().filter(|r| r.pipeline.is_none()) {
                let n_pos = rule.positive_atoms().count();
                for delta_pos in 0..n_pos {
                    for env in eval_body(rule, &visible, Some((&delta, delta_pos)))? {
                        let args = project_head(rule, &env)?;
                        emit(
                            schema,
                            rule,
                            args,
                            &mut visible,
                            &mut derived,
                            &mut next_delta,
                            &mut gas,
                            gas_limit,
                        )?;
                    }
                }
            }
            delta = next_delta;
        }
    }

    stats.derived = derived.values().map(|s| s.len()).sum();
    stats.gas_used = gas;
    stats.duration_ms = started.elapsed().as_millis() as u64;
    Ok((derived, stats))
}

/// Insert one derived tuple, enforcing the declaration and the gas limit.
#[allow(clippy::too_many_arguments)]
fn emit(
    schema: &Schema,
    rule: &Rule,
    args: Vec<Const>,
    visible: &mut Relation,
    derived: &mut Idb,
    delta: &mut Relation,
    gas: &mut usize,
    gas_limit: usize,
) -> Result<()> {
    let pred = &rule.head.predicate;
    if visible
        .get(pred)
        .is_some_and(|s| s.contains(&args))
    {
        return Ok(());
    }
    let fact = Fact {
        predicate: pred.clone(),
        args,
    };
    schema.validate_fact(&fact)?;
    *gas += 1;
    if *gas > gas_limit {
        return Err(Error::GasExceeded {
            derived: *gas,
            limit: gas_limit,
        });
    }
    visible
        .entry(pred.clone())
        .or_default()
        .insert(fact.args.clone());
    delta
        .entry(pred.clone())
        .or_default()
        .insert(fact.args.clone());
    derived.entry(pred.clone()).or_default().insert(fact.args);
    Ok(())
}

/// Evaluate a rule body to the set of satisfying environments.
///
/// When `delta` is given, the positive atom at the given index is matched
/// against the delta relation instead of the full one (semi-naive).
fn eval_body(
    rule: &Rule,
    visible: &Relation,
    delta: Option<(&Relation, usize)>,
) -> Result<Vec<Env>> {
    let empty: HashSet<Vec<Const>> = HashSet::new();
    let mut envs: Vec<Env> = vec![Env::new()];
    let mut pos_index = 0usize;
    for lit in &rule.body {
        if envs.is_empty() {
            return Ok(envs);
        }
        match lit {
            Literal::Pos(atom) => {
                let relation = match delta {
                    Some((d, dp)) if dp == pos_index => d,
                    _ => visible,
                };
                let tuples = relation.get(&atom.predicate).unwrap_or(&empty);
                let mut next = Vec::new();
                for args in tuples {
                    for env in &envs {
                        if let Some(extended) = unify(atom, args, env) {
                            next.push(extended);
                        }
                    }
                }
                envs = next;
                pos_index += 1;
            }
            Literal::Neg(atom) => {
                envs.retain(|env| {
                    let ground: Option<Vec<Const>> = atom
                        .args
                        .iter()
                        .map(|t| match t {
                            Term::Const(c) => Some(c.clone()),
                            Term::Var(v) => env.get(v).cloned(),
                        })
                        .collect();
                    match ground {
                        Some(args) => !visible
                            .get(&atom.predicate)
                            .is_some_and(|s| s.contains(&args)),
                        // Safety validation makes this unreachable.
                        None => false,
                    }
                });
            }
            Literal::Compare { op, lhs, rhs } => {
                envs.retain(|env| {
                    let l = resolve(lhs, env);
                    let r = resolve(rhs, env);
                    match (l, r) {
                        (Some(l), Some(r)) => op.eval(&l, &r),
                        _ => false,
                    }
                });
            }
            Literal::Let { var, func, args } => {
                let mut next = Vec::new();
                for env in envs {
                    let ground: Option<Vec<Const>> =
                        args.iter().map(|t| resolve(t, &env)).collect();
                    if let Some(ground) = ground {
                        if let Some(value) = func.eval(&ground) {
                            let mut env = env;
                            env.insert(var.clone(), value);
                            next.push(env);
                        }
                    }
                }
                envs = next;
            }
        }
    }
    Ok(envs)
}

fn resolve(term: &Term, env: &Env) -> Option<Const> {
    match term {
        Term::Const(c) => Some(c.clone()),
        Term::Var(v) => env.get(v).cloned(),
    }
}

fn unify(atom: &Atom, args: &[Const], env: &Env) -> Option<Env> {
    if atom.args.len() != args.len() {
        return None;
    }
    let mut out = env.clone();
    for (term, value) in atom.args.iter().zip(args) {
        match term {
            Term::Const(c) => {
                if c != value {
                    return None;
                }
            }
            Term::Var(v) => match out.get(v) {
                Some(bound) if bound != value => return None,
                Some(_) => {}
                None => {
                    out.insert(v.clone(), value.clone());
                }
            },
        }
    }
    Some(out)
}

fn project_head(rule: &Rule, env: &Env) -> Result<Vec<Const>> {
    rule.head
        .args
        .iter()
        .map(|t| {
            resolve(t, env).ok_or_else(|| {
                Error::InternalEvaluator(format!(
                    "unbound head variable in rule for {}",
                    rule.head.predicate
                ))
            })
        })
        .collect()
}

/// Group the body's environments and compute aggregation outputs, then
/// project the head. Groups are sorted before folding so float sums are
/// order-independent across runs.
fn apply_pipeline(rule: &Rule, envs: Vec<Env>) -> Result<Vec<Vec<Const>>> {
    let pipeline = rule
        .pipeline
        .as_ref()
        .expect("apply_pipeline called without pipeline");

    let mut groups: HashMap<Vec<Const>, Vec<&Env>> = HashMap::new();
    for env in &envs {
        let key: Option<Vec<Const>> = pipeline
            .group_by
            .iter()
            .map(|v| env.get(v).cloned())
            .collect();
        if let Some(key) = key {
            groups.entry(key).or_default().push(env);
        }
    }

    let mut out = Vec::new();
    for (key, members) in groups {
        let mut group_env: Env = pipeline
            .group_by
            .iter()
            .cloned()
            .zip(key.iter().cloned())
            .collect();
        for spec in &pipeline.lets {
            let value = aggregate(pipeline, spec, &members)?;
            group_env.insert(spec.var.clone(), value);
        }
        let args = rule
            .head
            .args
            .iter()
            .map(|t| {
                resolve(t, &group_env).ok_or_else(|| {
                    Error::InternalEvaluator(format!(
                        "head variable not produced by pipeline in rule for {}",
                        rule.head.predicate
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        out.push(args);
    }
    Ok(out)
}

fn aggregate(
    pipeline: &Pipeline,
    spec: &crate::datalog::schema::AggSpec,
    members: &[&Env],
) -> Result<Const> {
    let mut inputs: Vec<Const> = match &spec.input {
        Some(var) => members
            .iter()
            .filter_map(|env| env.get(var).cloned())
            .collect(),
        None => Vec::new(),
    };
    inputs.sort();

    let value = match spec.func {
        AggFunc::Count => {
            if spec.input.is_some() {
                let mut distinct: HashSet<&Const> = HashSet::new();
                let count = inputs.iter().filter(|c| distinct.insert(c)).count();
                Const::Number(count as i64)
            } else {
                // Count over the group: distinct non-key bindings.
                let mut distinct: HashSet<Vec<(&String, &Const)>> = HashSet::new();
                for env in members {
                    let mut row: Vec<(&String, &Const)> = env
                        .iter()
                        .filter(|(k, _)| !pipeline.group_by.contains(*k))
                        .collect();
                    row.sort_by(|a, b| a.0.cmp(b.0));
                    distinct.insert(row);
                }
                Const::Number(distinct.len() as i64)
            }
        }
        AggFunc::Sum => {
            if inputs.iter().any(|c| matches!(c, Const::Float(_))) {
                let mut total = 0.0f64;
                for c in &inputs {
                    total += c.as_float().ok_or_else(|| {
                        Error::InternalEvaluator("fn:Sum over non-numeric input".into())
                    })?;
                }
                Const::Float(total).canonicalize()
            } else {
                let mut total = 0i64;
                for c in &inputs {
                    let n = c.as_number().ok_or_else(|| {
                        Error::InternalEvaluator("fn:Sum over non-numeric input".into())
                    })?;
                    total = total.checked_add(n).ok_or_else(|| {
                        Error::InternalEvaluator("fn:Sum overflow".into())
                    })?;
                }
                Const::Number(total)
            }
        }
        AggFunc::Max => inputs
            .last()
            .cloned()
            .ok_or_else(|| Error::InternalEvaluator("fn:Max over empty group".into()))?,
        AggFunc::Min => inputs
            .first()
            .cloned()
            .ok_or_else(|| Error::InternalEvaluator("fn:Min over empty group".into()))?,
    };
    Ok(value)
}
