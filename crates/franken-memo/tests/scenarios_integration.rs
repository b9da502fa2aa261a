//! End-to-end memoization scenarios driven through `Runtime`.
//!
//! Covers: capture of a single parameter across differing uncaptured
//! arguments, object/number discrimination, zero-capture reuse in a loop,
//! three-level nesting, self and mutual recursion of memoized
//! declarations, and load-time rejection of bare mutable captures.

#![forbid(unsafe_code)]

use frankenengine_memo::analyzer::AnalysisError;
use frankenengine_memo::ast::{
    BinaryOp, Block, Expression as E, FunctionFlavor, FunctionNode as F, Program, Statement as S,
};
use frankenengine_memo::events::COMPONENT_CACHE;
use frankenengine_memo::{MemoConfig, MemoError, Runtime, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn run(body: Vec<S>) -> Runtime {
    let mut runtime = Runtime::load(Program::new(body), MemoConfig::deterministic()).unwrap();
    runtime.run().unwrap();
    runtime
}

fn num(n: i64) -> Value {
    Value::Number(n)
}

/// `function <outer>(<params>) { memo function inner() { return <ret> }; return inner }`
fn outer_returning_inner(outer: &str, params: &[&str], ret: E) -> S {
    S::Function(F::declaration(outer).params(params).body(vec![
        S::Function(F::declaration("inner").memoized().body(vec![S::ret(ret)])),
        S::ret(E::ident("inner")),
    ]))
}

// ---------------------------------------------------------------------------
// S1: only `a` is captured
// ---------------------------------------------------------------------------

#[test]
fn s1_uncaptured_arguments_do_not_affect_identity() {
    let mut rt = run(vec![outer_returning_inner("outer", &["a", "b", "c"], E::ident("a"))]);

    let site = rt.site_named("inner").unwrap();
    assert_eq!(rt.capture_spec(site).unwrap().names(), vec!["a"]);

    let object = rt.alloc_object(vec![]);
    let array = rt.alloc_array(vec![]);
    let first = rt.call_global("outer", vec![num(1), "x".into(), object]).unwrap();
    let second = rt.call_global("outer", vec![num(1), "y".into(), array]).unwrap();
    assert_eq!(first, second);
    assert_eq!(rt.call(&first, Value::Undefined, vec![]).unwrap(), num(1));
}

#[test]
fn s1_different_captured_value_gives_a_new_instance() {
    let mut rt = run(vec![outer_returning_inner("outer", &["a", "b", "c"], E::ident("a"))]);
    let one = rt.call_global("outer", vec![num(1)]).unwrap();
    let two = rt.call_global("outer", vec![num(2)]).unwrap();
    assert_ne!(one, two);
    assert_eq!(rt.call(&two, Value::Undefined, vec![]).unwrap(), num(2));
}

// ---------------------------------------------------------------------------
// S2: object identity and number value both discriminate
// ---------------------------------------------------------------------------

fn s2_program(extra: Vec<S>) -> Vec<S> {
    let mut body = vec![outer_returning_inner(
        "parent",
        &["obj", "num"],
        E::array(vec![E::ident("obj"), E::ident("num")]),
    )];
    body.extend(extra);
    body
}

#[test]
fn s2_same_object_same_number_reuses_instance() {
    let mut rt = run(s2_program(vec![]));
    let same = rt.alloc_object(vec![("k", num(1))]);
    let a = rt.call_global("parent", vec![same.clone(), num(42)]).unwrap();
    let b = rt.call_global("parent", vec![same, num(42)]).unwrap();
    assert_eq!(a, b);
}

#[test]
fn s2_fresh_literal_objects_give_distinct_instances() {
    let literal_call = || {
        E::call(
            E::ident("parent"),
            vec![E::object(vec![("k", E::num(1))]), E::num(42)],
        )
    };
    let rt = run(s2_program(vec![
        S::let_("first", literal_call()),
        S::let_("second", literal_call()),
    ]));
    assert_ne!(rt.global("first"), rt.global("second"));
}

#[test]
fn s2_different_number_gives_distinct_instances() {
    let mut rt = run(s2_program(vec![]));
    let same = rt.alloc_object(vec![]);
    let a = rt.call_global("parent", vec![same.clone(), num(42)]).unwrap();
    let b = rt.call_global("parent", vec![same, num(43)]).unwrap();
    assert_ne!(a, b);
    let site = rt.site_named("inner").unwrap();
    assert_eq!(rt.cache_entries(site).unwrap(), 2);
}

#[test]
fn s2_instance_returns_its_captured_values() {
    let mut rt = run(s2_program(vec![]));
    let same = rt.alloc_object(vec![]);
    let inner = rt.call_global("parent", vec![same.clone(), num(42)]).unwrap();
    let pair = rt.call(&inner, Value::Undefined, vec![]).unwrap();
    assert_eq!(rt.property(&pair, "0").unwrap(), same);
    assert_eq!(rt.property(&pair, "1").unwrap(), num(42));
}

// ---------------------------------------------------------------------------
// S3: zero captures inside a loop
// ---------------------------------------------------------------------------

#[test]
fn s3_zero_capture_definition_is_reused_across_iterations() {
    let loop_body = Block::new(vec![
        S::const_(
            "f",
            E::function(F::arrow().memoized().body(vec![S::ret(E::num(1))])),
        ),
        S::If {
            test: E::binary(BinaryOp::StrictEq, E::ident("first"), E::undefined()),
            consequent: Block::new(vec![S::expr(E::assign("first", E::ident("f")))]),
            alternate: None,
        },
        S::If {
            test: E::binary(BinaryOp::StrictNe, E::ident("f"), E::ident("first")),
            consequent: Block::new(vec![S::expr(E::assign("same", E::bool(false)))]),
            alternate: None,
        },
        S::expr(E::assign(
            "i",
            E::binary(BinaryOp::Add, E::ident("i"), E::num(1)),
        )),
    ]);
    let rt = run(vec![
        S::let_("first", E::undefined()),
        S::let_("same", E::bool(true)),
        S::let_("i", E::num(0)),
        S::While {
            test: E::binary(BinaryOp::Lt, E::ident("i"), E::num(1000)),
            body: loop_body,
        },
    ]);

    assert_eq!(rt.global("i"), Some(num(1000)));
    assert_eq!(rt.global("same"), Some(Value::Bool(true)));
    assert!(rt.global("first").unwrap().is_object());

    let stats = rt.registry().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 999);
    assert_eq!(rt.registry().len(), 1);
    let hits = rt
        .events()
        .matching(COMPONENT_CACHE, "reach")
        .filter(|event| event.outcome == "hit")
        .count();
    assert_eq!(hits, 999);
}

// ---------------------------------------------------------------------------
// S4: three memoized levels
// ---------------------------------------------------------------------------

fn s4_program() -> Vec<S> {
    let child = F::declaration("child")
        .memoized()
        .params(&["z"])
        .body(vec![S::ret(E::binary(
            BinaryOp::Add,
            E::binary(BinaryOp::Add, E::ident("x"), E::ident("y")),
            E::ident("z"),
        ))]);
    let parent = F::declaration("parent")
        .memoized()
        .params(&["y"])
        .body(vec![S::Function(child), S::ret(E::ident("child"))]);
    let grandparent = F::declaration("grandparent")
        .memoized()
        .params(&["x"])
        .body(vec![S::Function(parent), S::ret(E::ident("parent"))]);
    vec![S::Function(grandparent)]
}

#[test]
fn s4_each_level_is_memoized_independently() {
    let mut rt = run(s4_program());

    let p1 = rt.call_global("grandparent", vec![num(1)]).unwrap();
    let p1_again = rt.call_global("grandparent", vec![num(1)]).unwrap();
    assert_eq!(p1, p1_again);

    let c = rt.call(&p1, Value::Undefined, vec![num(2)]).unwrap();
    let c_again = rt.call(&p1, Value::Undefined, vec![num(2)]).unwrap();
    assert_eq!(c, c_again);
    assert_eq!(rt.call(&c, Value::Undefined, vec![num(3)]).unwrap(), num(6));

    let p5 = rt.call_global("grandparent", vec![num(5)]).unwrap();
    assert_ne!(p1, p5);
    let c5 = rt.call(&p5, Value::Undefined, vec![num(2)]).unwrap();
    assert_ne!(c, c5);
    assert_eq!(rt.call(&c5, Value::Undefined, vec![num(3)]).unwrap(), num(10));
}

#[test]
fn s4_specs_are_computed_per_level() {
    let rt = run(s4_program());
    let spec = |name: &str| {
        let site = rt.site_named(name).unwrap();
        rt.capture_spec(site)
            .unwrap()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
    };
    assert!(spec("grandparent").is_empty());
    assert_eq!(spec("parent"), vec!["x"]);
    assert_eq!(spec("child"), vec!["x", "y"]);
    // One cache per reached site.
    assert_eq!(rt.registry().len(), 1);
}

#[test]
fn s4_cached_instance_holds_a_flat_capture_table() {
    let mut rt = run(s4_program());
    let parent = rt.call_global("grandparent", vec![num(1)]).unwrap();
    let child = rt.call(&parent, Value::Undefined, vec![num(2)]).unwrap();
    assert_eq!(rt.captured(&child, "x"), Some(num(1)));
    assert_eq!(rt.captured(&child, "y"), Some(num(2)));
    assert_eq!(rt.captured(&child, "z"), None);
}

// ---------------------------------------------------------------------------
// Recursion through captured bindings
// ---------------------------------------------------------------------------

/// `if (n < 1) return <base>`
fn base_case(base: E) -> S {
    S::If {
        test: E::binary(BinaryOp::Lt, E::ident("n"), E::num(1)),
        consequent: Block::new(vec![S::ret(base)]),
        alternate: None,
    }
}

fn n_minus_one() -> E {
    E::binary(BinaryOp::Sub, E::ident("n"), E::num(1))
}

#[test]
fn memoized_declaration_recurses_through_its_own_name() {
    let sum = F::declaration("sum").memoized().params(&["n"]).body(vec![
        base_case(E::num(0)),
        S::ret(E::binary(
            BinaryOp::Add,
            E::ident("n"),
            E::call(E::ident("sum"), vec![n_minus_one()]),
        )),
    ]);
    let mut rt = run(vec![S::Function(
        F::declaration("outer").body(vec![S::Function(sum), S::ret(E::ident("sum"))]),
    )]);

    let first = rt.call_global("outer", vec![]).unwrap();
    assert_eq!(rt.call(&first, Value::Undefined, vec![num(4)]).unwrap(), num(10));
    let second = rt.call_global("outer", vec![]).unwrap();
    assert_eq!(first, second);
    assert_eq!(rt.call(&second, Value::Undefined, vec![num(3)]).unwrap(), num(6));
}

#[test]
fn sibling_memoized_declarations_recurse_mutually() {
    let is_even = F::declaration("is_even").memoized().params(&["n"]).body(vec![
        base_case(E::bool(true)),
        S::ret(E::call(E::ident("is_odd"), vec![n_minus_one()])),
    ]);
    let is_odd = F::declaration("is_odd").memoized().params(&["n"]).body(vec![
        base_case(E::bool(false)),
        S::ret(E::call(E::ident("is_even"), vec![n_minus_one()])),
    ]);
    let parity = F::declaration("parity")
        .memoized()
        .body(vec![S::Function(is_even), S::Function(is_odd), S::ret(E::ident("is_even"))]);
    let mut rt = run(vec![S::Function(parity)]);

    let even = rt.call_global("parity", vec![]).unwrap();
    assert_eq!(rt.call(&even, Value::Undefined, vec![num(4)]).unwrap(), Value::Bool(true));
    assert_eq!(rt.call(&even, Value::Undefined, vec![num(3)]).unwrap(), Value::Bool(false));
    assert_eq!(rt.call_global("parity", vec![]).unwrap(), even);
}

#[test]
fn nested_memoized_arrow_sees_a_binding_initialized_after_its_parent() {
    let inner = F::arrow().memoized().body(vec![S::ret(E::ident("make"))]);
    let make = F::arrow().memoized().body(vec![S::ret(E::function(inner))]);
    let rt = run(vec![
        S::const_("make", E::function(make)),
        S::let_("inner", E::call(E::ident("make"), vec![])),
        S::let_("again", E::call(E::ident("make"), vec![])),
        S::let_(
            "same",
            E::binary(BinaryOp::StrictEq, E::call(E::ident("inner"), vec![]), E::ident("make")),
        ),
    ]);
    assert_eq!(rt.global("same"), Some(Value::Bool(true)));
    assert_eq!(rt.global("inner"), rt.global("again"));
}

// ---------------------------------------------------------------------------
// S5: bare mutable capture fails at load
// ---------------------------------------------------------------------------

fn s5_program(cell: bool) -> Vec<S> {
    let declare = if cell {
        S::let_cell("count", E::num(0))
    } else {
        S::let_("count", E::num(0))
    };
    vec![
        S::let_("invoked", E::bool(false)),
        S::Function(F::declaration("outer").body(vec![
            S::expr(E::assign("invoked", E::bool(true))),
            declare,
            S::expr(E::assign(
                "count",
                E::binary(BinaryOp::Add, E::ident("count"), E::num(1)),
            )),
            S::Function(
                F::declaration("inner")
                    .memoized()
                    .body(vec![S::ret(E::ident("count"))]),
            ),
            S::ret(E::ident("inner")),
        ])),
        S::expr(E::call(E::ident("outer"), vec![])),
    ]
}

#[test]
fn s5_mutable_capture_is_rejected_before_evaluation() {
    let err = Runtime::load(Program::new(s5_program(false)), MemoConfig::deterministic())
        .unwrap_err();
    assert_eq!(err.stable_code(), "FE-MEMO-0301");
    let MemoError::Analysis(report) = &err else {
        panic!("expected an analysis error, got {err:?}");
    };
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(
        &report.errors[0],
        AnalysisError::MutableCapture { name, .. } if name == "count"
    ));
}

#[test]
fn s5_cell_storage_makes_the_same_program_valid() {
    let mut rt = run(s5_program(true));
    assert_eq!(rt.global("invoked"), Some(Value::Bool(true)));
    let first = rt.call_global("outer", vec![]).unwrap();
    assert_eq!(rt.call(&first, Value::Undefined, vec![]).unwrap(), num(1));
    // Every call of `outer` allocates a fresh cell, so a fresh key.
    let second = rt.call_global("outer", vec![]).unwrap();
    assert_ne!(first, second);
}

// ---------------------------------------------------------------------------
// Opaque suspending bodies
// ---------------------------------------------------------------------------

#[test]
fn memoized_generator_is_cached_and_returns_suspended_objects() {
    let mut rt = run(vec![S::Function(F::declaration("outer").params(&["seed"]).body(vec![
        S::ret(E::function(
            F::expression(Some("gen"))
                .memoized()
                .flavor(FunctionFlavor::Generator)
                .body(vec![S::ret(E::ident("seed"))]),
        )),
    ]))]);
    let a = rt.call_global("outer", vec![num(3)]).unwrap();
    let b = rt.call_global("outer", vec![num(3)]).unwrap();
    assert_eq!(a, b);
    let suspended = rt.call(&a, Value::Undefined, vec![]).unwrap();
    let id = suspended.as_object().unwrap();
    assert_eq!(rt.heap().kind(id).unwrap().name(), "suspended");
}
