//! Property-based checks over the engine's universal invariants.

use proptest::prelude::*;

use nsk_core::datalog::{
    evaluate, parse_program, FactMeta, FactStore, Origin, Schema, Statement,
};
use nsk_core::{parse_response, Const, Error, Fact, ParseCaps};

fn load(text: &str) -> (Schema, FactStore) {
    let mut schema = Schema::new();
    let mut store = FactStore::new();
    let mut rules = Vec::new();
    for stmt in parse_program(text).unwrap() {
        match stmt {
            Statement::Decl(d) => schema.declare(d).unwrap(),
            Statement::Rule(r) => rules.push(r),
            Statement::Fact(f) => {
                store.insert(f, FactMeta::new(Origin::Boot, 0));
            }
        }
    }
    schema.add_rules(rules, true).unwrap();
    (schema, store)
}

const GRAPH_SCHEMA: &str = "\
    Decl edge(A.Type<name>, B.Type<name>).\n\
    Decl path(A.Type<name>, B.Type<name>).\n\
    path(X, Y) :- edge(X, Y).\n\
    path(X, Y) :- edge(X, Z), path(Z, Y).";

fn arb_const() -> impl Strategy<Value = Const> {
    prop_oneof![
        "[a-z][a-z0-9_]{0,8}".prop_map(Const::Name),
        ".{0,16}".prop_map(Const::Str),
        any::<i64>().prop_map(Const::Number),
        (-1.0e9f64..1.0e9).prop_map(Const::Float),
        any::<bool>().prop_map(Const::Bool),
        proptest::collection::vec(any::<u8>(), 0..16).prop_map(Const::Bytes),
        any::<i64>().prop_map(Const::Time),
        any::<i64>().prop_map(Const::Duration),
    ]
}

fn arb_edges() -> impl Strategy<Value = Vec<(u8, u8)>> {
    proptest::collection::vec((0u8..12, 0u8..12), 0..24)
}

fn edge_fact(a: u8, b: u8) -> Fact {
    Fact::new(
        "edge",
        vec![Const::name(format!("n{}", a)), Const::name(format!("n{}", b))],
    )
}

proptest! {
    /// Asserting a fact twice leaves the same store as asserting once.
    #[test]
    fn assert_is_idempotent(args in proptest::collection::vec(arb_const(), 1..5)) {
        let mut once = FactStore::new();
        let mut twice = FactStore::new();
        let fact = Fact::new("p", args);

        once.insert(fact.clone(), FactMeta::new(Origin::System, 0));
        twice.insert(fact.clone(), FactMeta::new(Origin::System, 0));
        twice.insert(fact.clone(), FactMeta::new(Origin::System, 0));

        prop_assert_eq!(once.stats(), twice.stats());
        prop_assert_eq!(once.query("p", &vec![]), twice.query("p", &vec![]));
    }

    /// Evaluation is deterministic under fact-insertion order.
    #[test]
    fn evaluation_order_independent(edges in arb_edges()) {
        let (schema, mut forward) = load(GRAPH_SCHEMA);
        let (_, mut backward) = load(GRAPH_SCHEMA);
        for &(a, b) in &edges {
            forward.insert(edge_fact(a, b), FactMeta::new(Origin::System, 0));
        }
        for &(a, b) in edges.iter().rev() {
            backward.insert(edge_fact(a, b), FactMeta::new(Origin::System, 0));
        }

        let (idb_f, _) = evaluate(&schema, &forward, 1_000_000).unwrap();
        let (idb_b, _) = evaluate(&schema, &backward, 1_000_000).unwrap();
        prop_assert_eq!(idb_f, idb_b);
    }

    /// A gas-aborted evaluation derives nothing and a follow-up run with
    /// enough gas sees the intact EDB.
    #[test]
    fn gas_abort_is_harmless(edges in arb_edges()) {
        let (schema, mut store) = load(GRAPH_SCHEMA);
        for &(a, b) in &edges {
            store.insert(edge_fact(a, b), FactMeta::new(Origin::System, 0));
        }
        let stats_before = store.stats();

        let tight = evaluate(&schema, &store, 0);
        match tight {
            Err(Error::GasExceeded { .. }) | Ok(_) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
        prop_assert_eq!(store.stats(), stats_before);

        // A later evaluation with room succeeds against the intact EDB.
        let (idb, _) = evaluate(&schema, &store, 1_000_000).unwrap();
        let derived: usize = idb.values().map(|s| s.len()).sum();
        prop_assert!(store.stats().edb_count > 0 || derived == 0);
    }

    /// Every negation cycle is rejected at load time.
    #[test]
    fn negation_cycles_rejected(n in 2usize..6) {
        let mut text = String::new();
        for i in 0..n {
            text.push_str(&format!("Decl p{}(X.Type<name>).\n", i));
        }
        // p0 :- p1, p1 :- p2, ..., p(n-1) :- p0 with one negated edge.
        for i in 0..n {
            let next = (i + 1) % n;
            if i == 0 {
                text.push_str(&format!("p{}(X) :- p{}(X), !p{}(X).\n", i, next, next));
            } else {
                text.push_str(&format!("p{}(X) :- p{}(X).\n", i, next));
            }
        }

        let mut schema = Schema::new();
        let mut rules = Vec::new();
        for stmt in parse_program(&text).unwrap() {
            match stmt {
                Statement::Decl(d) => schema.declare(d).unwrap(),
                Statement::Rule(r) => rules.push(r),
                Statement::Fact(_) => {}
            }
        }
        let err = schema.add_rules(rules, true).unwrap_err();
        prop_assert!(matches!(err, Error::UnstratifiableNegation(_)));
        prop_assert!(schema.rules().is_empty());
    }

    /// Runtime rules deriving forbidden heads never load.
    #[test]
    fn forbidden_heads_rejected(head in prop_oneof![
        Just("permitted"),
        Just("safe_action"),
        Just("admin_override"),
        Just("pending_action"),
    ]) {
        let mut schema = Schema::new();
        for stmt in parse_program(
            "Decl permitted(A.Type<name>).\nDecl safe_action(A.Type<name>).\n\
             Decl admin_override(A.Type<name>).\nDecl pending_action(A.Type<name>).\n\
             Decl wanted(A.Type<name>).",
        )
        .unwrap()
        {
            if let Statement::Decl(d) = stmt {
                schema.declare(d).unwrap();
            }
        }
        let text = format!("{}(X) :- wanted(X).", head);
        let rule = match nsk_core::parse_statement(&text).unwrap() {
            Statement::Rule(r) => r,
            other => panic!("expected rule, got {:?}", other),
        };
        let err = schema.add_rule(rule.clone(), false).unwrap_err();
        prop_assert!(matches!(err, Error::ForbiddenLearnedHead(_)));
        // The same rule from a trusted boot schema loads fine.
        prop_assert!(schema.add_rule(rule, true).is_ok());
    }

    /// Constants round-trip through the typed snapshot encoding.
    #[test]
    fn typed_round_trip(args in proptest::collection::vec(arb_const(), 1..6)) {
        let fact = Fact::new("snap", args);
        let json = serde_json::to_string(&fact).unwrap();
        let back: Fact = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(fact, back);
    }

    /// A genuine envelope following any decoy text is always selected.
    #[test]
    fn decoy_resistance(noise in "[^{}]{0,64}", decoy_surface in "[a-z ]{1,16}") {
        let raw = format!(
            "{}{{\"control_packet\": {{}}, \"surface_response\": \"{}\"}}{}\
             {{\"control_packet\": {{}}, \"surface_response\": \"genuine\"}}",
            noise, decoy_surface, noise
        );
        let parsed = parse_response(&raw, &ParseCaps::default());
        prop_assert_eq!(parsed.envelope.surface_response.as_str(), "genuine");
    }
}
