// ABOUTME: Coverage instrumentation and late-binding decorator tests

use celgate::activation::{MapActivation, OverrideActivation};
use celgate::functions::{FunctionImpl, Overload};
use celgate::{CelType, Env, ProgramOptions, Value};
use std::sync::Arc;

fn setup() -> Env {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut env = Env::new();
    env.declare_variable("x", CelType::Int);
    env
}

fn tracked(env: &Env, text: &str) -> celgate::Program {
    let checked = env.compile(text).expect("compile failed");
    env.plan(
        &checked,
        ProgramOptions {
            track_coverage: true,
            ..ProgramOptions::default()
        },
    )
    .expect("plan failed")
}

#[test]
fn test_missing_branch_reported_until_both_sides_seen() {
    let env = setup();
    let program = tracked(&env, "x > 0 ? 'pos' : 'neg'");

    let act = MapActivation::new().bind("x", 5i64);
    program.eval(&act);
    let report = program.coverage_report().expect("tracking enabled");
    // the condition only ever produced true
    assert!(!report.missing_branches().is_empty());

    let act = MapActivation::new().bind("x", -5i64);
    program.eval(&act);
    let report = program.coverage_report().expect("tracking enabled");
    assert!(
        report.missing_branches().is_empty(),
        "both branches seen, still missing: {:?}",
        report.missing_branches()
    );
}

#[test]
fn test_unvisited_branch_nodes_listed() {
    let env = setup();
    let program = tracked(&env, "x > 0 ? 'pos' : 'neg'");
    let act = MapActivation::new().bind("x", 5i64);
    program.eval(&act);
    let report = program.coverage_report().expect("tracking enabled");
    // the false branch literal was never traversed
    assert!(!report.unvisited().is_empty());
}

#[test]
fn test_ternary_inherits_branch_values() {
    let env = setup();
    let program = tracked(&env, "x > 0 ? 'pos' : 'neg'");
    let act = MapActivation::new().bind("x", 5i64);
    program.eval(&act);
    let report = program.coverage_report().expect("tracking enabled");

    let root_id = program.checked_ast().ast.expr.id;
    let values = report.values(root_id);
    assert!(values.iter().any(|v| v.equal(&Value::string("pos")).is_true()));
}

#[test]
fn test_eval_with_details_exposes_observed_state() {
    let env = setup();
    let program = tracked(&env, "x + 1 == 2");
    let act = MapActivation::new().bind("x", 1i64);
    let (value, details) = program.eval_with_details(&act);
    assert!(value.is_true());
    assert!(!details.observed.is_empty());
}

#[test]
fn test_coverage_accumulates_across_evaluations() {
    let env = setup();
    let program = tracked(&env, "x == 1");
    for i in 0..3 {
        let act = MapActivation::new().bind("x", i as i64);
        program.eval(&act);
    }
    let report = program.coverage_report().expect("tracking enabled");
    let root_id = program.checked_ast().ast.expr.id;
    // true and false both observed at the root
    assert_eq!(report.values(root_id).len(), 2);
}

fn greeter_env() -> Env {
    let mut env = Env::new();
    env.register_function(
        "greet",
        vec![
            Overload::global("greet_string", vec![CelType::String], CelType::String).with_impl(
                |args| match &args[0] {
                    Value::String(s) => Value::string(format!("hello {}", s)),
                    other => Value::no_such_overload("greet", std::slice::from_ref(other)),
                },
            ),
        ],
    );
    env.declare_variable("who", CelType::String);
    env
}

#[test]
fn test_late_binding_overrides_per_activation() {
    let env = greeter_env();
    let checked = env.compile("greet(who)").unwrap();
    let program = env
        .plan(
            &checked,
            ProgramOptions {
                late_bind: true,
                ..ProgramOptions::default()
            },
        )
        .unwrap();

    let base = MapActivation::new().bind("who", "world");
    match program.eval(&base) {
        Value::String(s) => assert_eq!(&*s, "hello world"),
        other => panic!("unexpected {}", other),
    }

    // an activation-supplied overload wins for that evaluation only
    let shout: FunctionImpl = Arc::new(|args: &[Value]| match &args[0] {
        Value::String(s) => Value::string(format!("HELLO {}", s.to_uppercase())),
        other => Value::no_such_overload("greet", std::slice::from_ref(other)),
    });
    let overridden = OverrideActivation::new(MapActivation::new().bind("who", "world"))
        .with_override("greet_string", shout);
    match program.eval(&overridden) {
        Value::String(s) => assert_eq!(&*s, "HELLO WORLD"),
        other => panic!("unexpected {}", other),
    }

    // the planned program itself was never mutated
    let base = MapActivation::new().bind("who", "world");
    match program.eval(&base) {
        Value::String(s) => assert_eq!(&*s, "hello world"),
        other => panic!("unexpected {}", other),
    }
}
