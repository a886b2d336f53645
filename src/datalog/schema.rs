//! Predicate declarations, rules, and the schema validator.
//!
//! Every predicate is declared before use with a typed signature. Rules are
//! Horn clauses with optional negation and an optional aggregation pipeline;
//! the validator rejects undeclared body predicates, arity mismatches,
//! unsafe head variables, cycles through negation, and runtime rules whose
//! head is in the forbidden-learned-head set.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::datalog::term::{Atom, Const, Fact, Term, TypeTag};
use crate::error::{Error, Result};

/// Heads that may only be derived by rules from trusted boot-time schemas.
pub const FORBIDDEN_LEARNED_HEADS: &[&str] =
    &["permitted", "safe_action", "admin_override", "pending_action"];

/// Whether a predicate head is policy-bearing and closed to learned rules.
pub fn is_forbidden_learned_head(predicate: &str) -> bool {
    FORBIDDEN_LEARNED_HEADS.contains(&predicate)
}

/// A single declared parameter: variable name plus type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclParam {
    /// Declaration variable (documentation only)
    pub var: String,
    /// Required argument type
    pub tag: TypeTag,
}

/// A typed predicate declaration: `Decl p(X.Type<name>, N.Type<number>).`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateDecl {
    /// Predicate symbol (lowercase)
    pub name: String,
    /// Typed parameters
    pub params: Vec<DeclParam>,
}

impl PredicateDecl {
    /// Create a declaration.
    pub fn new(name: impl Into<String>, params: Vec<(impl Into<String>, TypeTag)>) -> Self {
        Self {
            name: name.into(),
            params: params
                .into_iter()
                .map(|(var, tag)| DeclParam {
                    var: var.into(),
                    tag,
                })
                .collect(),
        }
    }

    /// Declared arity.
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Comparison operators usable in rule bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    /// Evaluate against ground constants. Numbers and floats cross-compare;
    /// all other comparisons require identical type tags.
    pub fn eval(&self, lhs: &Const, rhs: &Const) -> bool {
        use std::cmp::Ordering;
        let ord = match (lhs, rhs) {
            (Const::Number(_), Const::Float(_)) | (Const::Float(_), Const::Number(_)) => {
                let (a, b) = (lhs.as_float(), rhs.as_float());
                match (a, b) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                }
            }
            _ if lhs.type_tag() == rhs.type_tag() => Some(lhs.cmp(rhs)),
            _ => None,
        };
        match (self, ord) {
            (Self::Eq, Some(Ordering::Equal)) => true,
            (Self::Ne, Some(o)) => o != Ordering::Equal,
            (Self::Lt, Some(Ordering::Less)) => true,
            (Self::Le, Some(Ordering::Less) | Some(Ordering::Equal)) => true,
            (Self::Gt, Some(Ordering::Greater)) => true,
            (Self::Ge, Some(Ordering::Greater) | Some(Ordering::Equal)) => true,
            (Self::Ne, None) => true,
            _ => false,
        }
    }
}

/// Arithmetic/string transforms usable in `let` body bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    Plus,
    Minus,
    Mult,
    Div,
    Concat,
}

impl Transform {
    /// Function name as written in schema text (`fn:plus` etc.).
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "plus" => Some(Self::Plus),
            "minus" => Some(Self::Minus),
            "mult" => Some(Self::Mult),
            "div" => Some(Self::Div),
            "concat" => Some(Self::Concat),
            _ => None,
        }
    }

    /// Evaluate on ground arguments. Returns `None` when the transform is
    /// undefined for the inputs (wrong types, division by zero); the
    /// enclosing rule then simply yields no fact for that binding.
    pub fn eval(&self, args: &[Const]) -> Option<Const> {
        match self {
            Self::Concat => {
                let mut out = String::new();
                for a in args {
                    out.push_str(a.as_str()?);
                }
                Some(Const::Str(out))
            }
            _ => {
                if args.len() != 2 {
                    return None;
                }
                let any_float = args.iter().any(|a| matches!(a, Const::Float(_)));
                if any_float {
                    let (a, b) = (args[0].as_float()?, args[1].as_float()?);
                    let v = match self {
                        Self::Plus => a + b,
                        Self::Minus => a - b,
                        Self::Mult => a * b,
                        Self::Div => {
                            if b == 0.0 {
                                return None;
                            }
                            a / b
                        }
                        Self::Concat => unreachable!(),
                    };
                    if v.is_nan() {
                        return None;
                    }
                    Some(Const::Float(v).canonicalize())
                } else {
                    let (a, b) = (args[0].as_number()?, args[1].as_number()?);
                    let v = match self {
                        Self::Plus => a.checked_add(b)?,
                        Self::Minus => a.checked_sub(b)?,
                        Self::Mult => a.checked_mul(b)?,
                        Self::Div => {
                            if b == 0 {
                                return None;
                            }
                            a.checked_div(b)?
                        }
                        Self::Concat => unreachable!(),
                    };
                    Some(Const::Number(v))
                }
            }
        }
    }
}

/// Aggregation functions usable in pipeline `let` bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    Sum,
    Count,
    Max,
    Min,
}

impl AggFunc {
    /// Function name as written in schema text (`fn:Sum` etc.).
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Sum" => Some(Self::Sum),
            "Count" => Some(Self::Count),
            "Max" => Some(Self::Max),
            "Min" => Some(Self::Min),
            _ => None,
        }
    }
}

/// One `let T = fn:Sum(X)` binding in an aggregation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggSpec {
    /// Output variable bound by the aggregation
    pub var: String,
    /// Aggregation function
    pub func: AggFunc,
    /// Input variable (`None` only for Count over whole groups)
    pub input: Option<String>,
}

/// Aggregation pipeline: `|> do fn:group_by(K1, K2), let T = fn:Sum(X).`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Grouping variables
    pub group_by: Vec<String>,
    /// Aggregation outputs
    pub lets: Vec<AggSpec>,
}

/// A body literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    /// Positive atom
    Pos(Atom),
    /// Negated atom (`!p(...)`)
    Neg(Atom),
    /// Infix comparison (`X < Y`)
    Compare {
        op: CompareOp,
        lhs: Term,
        rhs: Term,
    },
    /// Transform binding (`let Z = fn:plus(X, Y)`)
    Let {
        var: String,
        func: Transform,
        args: Vec<Term>,
    },
}

/// A Horn clause `head :- body.` with optional aggregation pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Head atom
    pub head: Atom,
    /// Body literals, in source order
    pub body: Vec<Literal>,
    /// Optional aggregation pipeline
    pub pipeline: Option<Pipeline>,
}

impl Rule {
    /// Positive body atoms.
    pub fn positive_atoms(&self) -> impl Iterator<Item = &Atom> {
        self.body.iter().filter_map(|l| match l {
            Literal::Pos(a) => Some(a),
            _ => None,
        })
    }

    /// Negated body atoms.
    pub fn negated_atoms(&self) -> impl Iterator<Item = &Atom> {
        self.body.iter().filter_map(|l| match l {
            Literal::Neg(a) => Some(a),
            _ => None,
        })
    }
}

fn is_lower_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The compiled schema: declarations plus the stratified rule set.
///
/// Rules carry a trusted flag: boot-time schema rules are trusted, rules
/// asserted later through the control channel are not and may not derive
/// forbidden heads.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    decls: HashMap<String, PredicateDecl>,
    rules: Vec<Rule>,
    trusted: Vec<bool>,
    /// Rule indices grouped by stratum, bottom-up.
    strata: Vec<Vec<usize>>,
    pred_stratum: HashMap<String, usize>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate declaration. Re-declaration must be identical.
    pub fn declare(&mut self, decl: PredicateDecl) -> Result<()> {
        if !is_lower_ident(&decl.name) {
            return Err(Error::parse_failure(
                0,
                format!("predicate names must be lowercase identifiers: {}", decl.name),
            ));
        }
        if let Some(existing) = self.decls.get(&decl.name) {
            if existing != &decl {
                return Err(Error::Config(format!(
                    "conflicting re-declaration of {}",
                    decl.name
                )));
            }
            return Ok(());
        }
        self.decls.insert(decl.name.clone(), decl);
        Ok(())
    }

    /// Look up a declaration.
    pub fn decl(&self, name: &str) -> Option<&PredicateDecl> {
        self.decls.get(name)
    }

    /// Whether a predicate has been declared.
    pub fn is_declared(&self, name: &str) -> bool {
        self.decls.contains_key(name)
    }

    /// All rules, in insertion order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rule indices grouped by stratum, bottom-up.
    pub fn strata(&self) -> &[Vec<usize>] {
        &self.strata
    }

    /// The stratum a derived predicate belongs to (0 for pure EDB).
    pub fn predicate_stratum(&self, name: &str) -> usize {
        self.pred_stratum.get(name).copied().unwrap_or(0)
    }

    /// Add a batch of rules atomically: either all validate and the schema
    /// restratifies, or the schema is unchanged. Rules already present are
    /// skipped, so re-loading a schema accumulates idempotently.
    pub fn add_rules(&mut self, rules: Vec<Rule>, trusted: bool) -> Result<()> {
        let rules: Vec<Rule> = rules
            .into_iter()
            .filter(|r| !self.rules.contains(r))
            .collect();
        for rule in &rules {
            self.check_rule(rule, trusted)?;
        }
        let saved_rules = self.rules.clone();
        let saved_trusted = self.trusted.clone();
        for rule in rules {
            self.rules.push(rule);
            self.trusted.push(trusted);
        }
        if let Err(e) = self.restratify() {
            self.rules = saved_rules;
            self.trusted = saved_trusted;
            // strata untouched by a failed restratify
            return Err(e);
        }
        Ok(())
    }

    /// Add a single rule. Convenience over [`Schema::add_rules`].
    pub fn add_rule(&mut self, rule: Rule, trusted: bool) -> Result<()> {
        self.add_rules(vec![rule], trusted)
    }

    /// Whether the rule at `idx` came from a trusted boot schema.
    pub fn rule_trusted(&self, idx: usize) -> bool {
        self.trusted.get(idx).copied().unwrap_or(false)
    }

    /// Validate a ground fact against its declaration.
    pub fn validate_fact(&self, fact: &Fact) -> Result<()> {
        let decl = self
            .decls
            .get(&fact.predicate)
            .ok_or_else(|| Error::UndeclaredPredicate(fact.predicate.clone()))?;
        if fact.arity() != decl.arity() {
            return Err(Error::arity_mismatch(
                &fact.predicate,
                decl.arity(),
                fact.arity(),
            ));
        }
        for (i, (arg, param)) in fact.args.iter().zip(&decl.params).enumerate() {
            if arg.is_nan() {
                return Err(Error::type_mismatch(&fact.predicate, i, "float", "NaN"));
            }
            if arg.type_tag() != param.tag {
                return Err(Error::type_mismatch(
                    &fact.predicate,
                    i,
                    param.tag.to_string(),
                    arg.type_tag().to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Structural validation of one rule: declarations, arity, argument
    /// types at declared positions, head safety, forbidden heads.
    fn check_rule(&self, rule: &Rule, trusted: bool) -> Result<()> {
        if !trusted && is_forbidden_learned_head(&rule.head.predicate) {
            return Err(Error::ForbiddenLearnedHead(rule.head.predicate.clone()));
        }

        let head_decl = self
            .decls
            .get(&rule.head.predicate)
            .ok_or_else(|| Error::UndeclaredPredicate(rule.head.predicate.clone()))?;
        if rule.head.args.len() != head_decl.arity() {
            return Err(Error::arity_mismatch(
                &rule.head.predicate,
                head_decl.arity(),
                rule.head.args.len(),
            ));
        }

        let mut var_types: HashMap<String, TypeTag> = HashMap::new();
        for atom in rule.positive_atoms().chain(rule.negated_atoms()) {
            let decl = self
                .decls
                .get(&atom.predicate)
                .ok_or_else(|| Error::UndeclaredPredicate(atom.predicate.clone()))?;
            if atom.args.len() != decl.arity() {
                return Err(Error::arity_mismatch(
                    &atom.predicate,
                    decl.arity(),
                    atom.args.len(),
                ));
            }
            for (i, (term, param)) in atom.args.iter().zip(&decl.params).enumerate() {
                match term {
                    Term::Const(c) => {
                        if c.type_tag() != param.tag {
                            return Err(Error::type_mismatch(
                                &atom.predicate,
                                i,
                                param.tag.to_string(),
                                c.type_tag().to_string(),
                            ));
                        }
                    }
                    Term::Var(v) => {
                        if let Some(prev) = var_types.insert(v.clone(), param.tag) {
                            if prev != param.tag {
                                return Err(Error::type_mismatch(
                                    &atom.predicate,
                                    i,
                                    prev.to_string(),
                                    param.tag.to_string(),
                                ));
                            }
                        }
                    }
                }
            }
        }

        // Safety: positive bindings cover everything downstream.
        let mut bound: HashSet<&str> = HashSet::new();
        for atom in rule.positive_atoms() {
            bound.extend(atom.variables());
        }
        for lit in &rule.body {
            if let Literal::Let { var, args, .. } = lit {
                for t in args {
                    if let Some(v) = t.as_var() {
                        if !bound.contains(v) {
                            return Err(Error::UnsafeHeadVariable {
                                predicate: rule.head.predicate.clone(),
                                variable: v.to_string(),
                            });
                        }
                    }
                }
                bound.insert(var.as_str());
            }
        }
        for lit in &rule.body {
            let unbound = match lit {
                Literal::Neg(a) => a.variables().into_iter().find(|v| !bound.contains(v)),
                Literal::Compare { lhs, rhs, .. } => [lhs, rhs]
                    .into_iter()
                    .filter_map(|t| t.as_var())
                    .find(|v| !bound.contains(v)),
                _ => None,
            };
            if let Some(v) = unbound {
                return Err(Error::UnsafeHeadVariable {
                    predicate: rule.head.predicate.clone(),
                    variable: v.to_string(),
                });
            }
        }

        let head_bound: HashSet<&str> = match &rule.pipeline {
            Some(p) => {
                for spec in &p.lets {
                    if let Some(input) = &spec.input {
                        if !bound.contains(input.as_str()) {
                            return Err(Error::UnsafeHeadVariable {
                                predicate: rule.head.predicate.clone(),
                                variable: input.clone(),
                            });
                        }
                    }
                }
                for g in &p.group_by {
                    if !bound.contains(g.as_str()) {
                        return Err(Error::UnsafeHeadVariable {
                            predicate: rule.head.predicate.clone(),
                            variable: g.clone(),
                        });
                    }
                }
                p.group_by
                    .iter()
                    .map(String::as_str)
                    .chain(p.lets.iter().map(|s| s.var.as_str()))
                    .collect()
            }
            None => bound,
        };
        for v in rule.head.variables() {
            if !head_bound.contains(v) {
                return Err(Error::UnsafeHeadVariable {
                    predicate: rule.head.predicate.clone(),
                    variable: v.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Recompute strata. Fails with `UnstratifiableNegation` when a negation
    /// (or aggregation) edge lies on a predicate-dependency cycle.
    fn restratify(&mut self) -> Result<()> {
        // Edges head -> body-predicate; negative when the body literal is
        // negated or the rule aggregates (the body must be fully
        // materialized before the head).
        let mut preds: HashSet<&str> = HashSet::new();
        let mut pos_edges: HashMap<&str, HashSet<&str>> = HashMap::new();
        let mut neg_edges: HashMap<&str, HashSet<&str>> = HashMap::new();
        for rule in &self.rules {
            let head = rule.head.predicate.as_str();
            preds.insert(head);
            let aggregates = rule.pipeline.is_some();
            for atom in rule.positive_atoms() {
                preds.insert(atom.predicate.as_str());
                if aggregates {
                    neg_edges
                        .entry(head)
                        .or_default()
                        .insert(atom.predicate.as_str());
                } else {
                    pos_edges
                        .entry(head)
                        .or_default()
                        .insert(atom.predicate.as_str());
                }
            }
            for atom in rule.negated_atoms() {
                preds.insert(atom.predicate.as_str());
                neg_edges
                    .entry(head)
                    .or_default()
                    .insert(atom.predicate.as_str());
            }
        }

        // Stratum fixpoint: stratum(h) >= stratum(b) for positive deps,
        // stratum(h) >= stratum(b) + 1 for negative deps. Divergence past
        // |preds| rounds means a negation edge sits on a cycle.
        let mut stratum: HashMap<&str, usize> = preds.iter().map(|p| (*p, 0)).collect();
        let max_rounds = preds.len() + 1;
        for round in 0..=max_rounds {
            let mut changed = false;
            for rule in &self.rules {
                let head = rule.head.predicate.as_str();
                let mut needed = 0usize;
                for dep in pos_edges.get(head).into_iter().flatten() {
                    needed = needed.max(stratum[dep]);
                }
                for dep in neg_edges.get(head).into_iter().flatten() {
                    needed = needed.max(stratum[dep] + 1);
                }
                if stratum[head] < needed {
                    stratum.insert(head, needed);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            if round == max_rounds {
                let offender = stratum
                    .iter()
                    .max_by_key(|(_, s)| **s)
                    .map(|(p, _)| p.to_string())
                    .unwrap_or_default();
                return Err(Error::UnstratifiableNegation(offender));
            }
        }

        let pred_stratum: HashMap<String, usize> = stratum
            .iter()
            .map(|(p, s)| (p.to_string(), *s))
            .collect();
        let n_strata = pred_stratum.values().copied().max().map_or(0, |m| m + 1);
        let mut strata: Vec<Vec<usize>> = vec![Vec::new(); n_strata];
        for (idx, rule) in self.rules.iter().enumerate() {
            let s = pred_stratum[&rule.head.predicate];
            strata[s].push(idx);
        }
        self.pred_stratum = pred_stratum;
        self.strata = strata;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl2(name: &str) -> PredicateDecl {
        PredicateDecl::new(name, vec![("X", TypeTag::Name), ("Y", TypeTag::Name)])
    }

    fn decl1(name: &str) -> PredicateDecl {
        PredicateDecl::new(name, vec![("X", TypeTag::Name)])
    }

    fn atom(pred: &str, vars: &[&str]) -> Atom {
        Atom::new(
            pred,
            vars.iter().map(|v| Term::Var(v.to_string())).collect(),
        )
    }

    #[test]
    fn test_declare_rejects_uppercase() {
        let mut schema = Schema::new();
        let err = schema
            .declare(PredicateDecl::new("Edge", vec![("X", TypeTag::Name)]))
            .unwrap_err();
        assert!(matches!(err, Error::ParseFailure { .. }));
    }

    #[test]
    fn test_undeclared_body_predicate_rejected() {
        let mut schema = Schema::new();
        schema.declare(decl2("path")).unwrap();
        let rule = Rule {
            head: atom("path", &["X", "Y"]),
            body: vec![Literal::Pos(atom("edge", &["X", "Y"]))],
            pipeline: None,
        };
        let err = schema.add_rule(rule, true).unwrap_err();
        assert!(matches!(err, Error::UndeclaredPredicate(p) if p == "edge"));
    }

    #[test]
    fn test_unsafe_head_variable_rejected() {
        let mut schema = Schema::new();
        schema.declare(decl2("p")).unwrap();
        schema.declare(decl1("q")).unwrap();
        let rule = Rule {
            head: atom("p", &["X", "Y"]),
            body: vec![Literal::Pos(atom("q", &["X"]))],
            pipeline: None,
        };
        let err = schema.add_rule(rule, true).unwrap_err();
        assert!(matches!(err, Error::UnsafeHeadVariable { variable, .. } if variable == "Y"));
    }

    #[test]
    fn test_negation_only_on_bound_vars() {
        let mut schema = Schema::new();
        schema.declare(decl1("p")).unwrap();
        schema.declare(decl1("q")).unwrap();
        schema.declare(decl1("r")).unwrap();
        let rule = Rule {
            head: atom("p", &["X"]),
            body: vec![
                Literal::Pos(atom("q", &["X"])),
                Literal::Neg(atom("r", &["Z"])),
            ],
            pipeline: None,
        };
        assert!(schema.add_rule(rule, true).is_err());
    }

    #[test]
    fn test_negation_cycle_rejected() {
        let mut schema = Schema::new();
        schema.declare(decl1("a")).unwrap();
        schema.declare(decl1("b")).unwrap();
        let rules = vec![
            Rule {
                head: atom("a", &["X"]),
                body: vec![Literal::Pos(atom("b", &["X"])), Literal::Neg(atom("b", &["X"]))],
                pipeline: None,
            },
            Rule {
                head: atom("b", &["X"]),
                body: vec![Literal::Pos(atom("a", &["X"]))],
                pipeline: None,
            },
        ];
        let err = schema.add_rules(rules, true).unwrap_err();
        assert!(matches!(err, Error::UnstratifiableNegation(_)));
    }

    #[test]
    fn test_failed_batch_leaves_schema_unchanged() {
        let mut schema = Schema::new();
        schema.declare(decl1("a")).unwrap();
        schema.declare(decl1("b")).unwrap();
        let ok_rule = Rule {
            head: atom("a", &["X"]),
            body: vec![Literal::Pos(atom("b", &["X"]))],
            pipeline: None,
        };
        let bad_rule = Rule {
            head: atom("b", &["X"]),
            body: vec![Literal::Pos(atom("a", &["X"])), Literal::Neg(atom("a", &["X"]))],
            pipeline: None,
        };
        assert!(schema
            .add_rules(vec![ok_rule, bad_rule], true)
            .is_err());
        assert!(schema.rules().is_empty());
    }

    #[test]
    fn test_forbidden_head_rejected_for_untrusted() {
        let mut schema = Schema::new();
        schema.declare(decl1("permitted")).unwrap();
        schema.declare(decl1("requested")).unwrap();
        let rule = Rule {
            head: atom("permitted", &["X"]),
            body: vec![Literal::Pos(atom("requested", &["X"]))],
            pipeline: None,
        };
        let err = schema.add_rule(rule.clone(), false).unwrap_err();
        assert!(matches!(err, Error::ForbiddenLearnedHead(_)));
        // Trusted boot rules may derive policy heads.
        assert!(schema.add_rule(rule, true).is_ok());
    }

    #[test]
    fn test_strata_order_negation() {
        let mut schema = Schema::new();
        schema.declare(decl1("user")).unwrap();
        schema.declare(decl1("admin")).unwrap();
        schema.declare(decl1("regular")).unwrap();
        schema
            .add_rule(
                Rule {
                    head: atom("regular", &["U"]),
                    body: vec![
                        Literal::Pos(atom("user", &["U"])),
                        Literal::Neg(atom("admin", &["U"])),
                    ],
                    pipeline: None,
                },
                true,
            )
            .unwrap();
        assert_eq!(schema.predicate_stratum("regular"), 1);
        assert_eq!(schema.predicate_stratum("admin"), 0);
    }

    #[test]
    fn test_validate_fact_types() {
        let mut schema = Schema::new();
        schema
            .declare(PredicateDecl::new(
                "score",
                vec![("X", TypeTag::Name), ("N", TypeTag::Number)],
            ))
            .unwrap();
        let ok = Fact::new("score", vec![Const::name("a"), Const::Number(3)]);
        assert!(schema.validate_fact(&ok).is_ok());

        let wrong_type = Fact::new("score", vec![Const::string("a"), Const::Number(3)]);
        assert!(matches!(
            schema.validate_fact(&wrong_type),
            Err(Error::TypeMismatch { position: 0, .. })
        ));

        let wrong_arity = Fact::new("score", vec![Const::name("a")]);
        assert!(matches!(
            schema.validate_fact(&wrong_arity),
            Err(Error::ArityMismatch { .. })
        ));

        let undeclared = Fact::new("missing", vec![Const::name("a")]);
        assert!(matches!(
            schema.validate_fact(&undeclared),
            Err(Error::UndeclaredPredicate(_))
        ));
    }

    #[test]
    fn test_compare_eval() {
        assert!(CompareOp::Lt.eval(&Const::Number(1), &Const::Number(2)));
        assert!(CompareOp::Lt.eval(&Const::Number(1), &Const::Float(1.5)));
        assert!(!CompareOp::Eq.eval(&Const::name("a"), &Const::string("a")));
        assert!(CompareOp::Ne.eval(&Const::name("a"), &Const::string("a")));
    }

    #[test]
    fn test_transform_eval() {
        assert_eq!(
            Transform::Plus.eval(&[Const::Number(2), Const::Number(3)]),
            Some(Const::Number(5))
        );
        assert_eq!(
            Transform::Div.eval(&[Const::Number(1), Const::Number(0)]),
            None
        );
        assert_eq!(
            Transform::Concat.eval(&[Const::string("a"), Const::string("b")]),
            Some(Const::string("ab"))
        );
        assert_eq!(
            Transform::Mult.eval(&[Const::Float(0.5), Const::Number(4)]),
            Some(Const::Float(2.0))
        );
    }
}
