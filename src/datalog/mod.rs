//! The logic engine: typed facts, declared predicates, stratified rules,
//! and bottom-up evaluation with a derived-fact gas limit.

pub mod eval;
pub mod parser;
pub mod schema;
pub mod store;
pub mod term;

pub use eval::{evaluate, EvalStats};
pub use parser::{parse_program, parse_statement, Statement};
pub use schema::{
    is_forbidden_learned_head, AggFunc, AggSpec, CompareOp, DeclParam, Literal, Pipeline,
    PredicateDecl, Rule, Schema, Transform, FORBIDDEN_LEARNED_HEADS,
};
pub use store::{FactMeta, FactStore, Idb, Origin, Pattern, StoreStats};
pub use term::{Atom, Const, Fact, Term, TypeTag};
