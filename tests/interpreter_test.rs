// ABOUTME: End-to-end tests for the parse, check, plan, evaluate pipeline

use celgate::activation::{InterruptibleActivation, MapActivation};
use celgate::provider::{
    DescriptorPool, EnumDescriptor, FieldDescriptor, FieldType, FileDescriptor, MessageDescriptor,
    TypeRegistry,
};
use celgate::value::{CelMap, MapKey};
use celgate::{CelType, Env, ProgramOptions, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn setup() -> Env {
    let _ = env_logger::builder().is_test(true).try_init();
    Env::new()
}

fn eval(env: &Env, text: &str, act: &MapActivation) -> Value {
    eval_opts(env, text, act, ProgramOptions::default())
}

fn eval_opts(env: &Env, text: &str, act: &MapActivation, opts: ProgramOptions) -> Value {
    let checked = env.compile(text).expect("compile failed");
    let program = env.plan(&checked, opts).expect("plan failed");
    program.eval(act)
}

fn string_map(entries: &[(&str, Value)]) -> Value {
    let mut m = CelMap::new();
    for (k, v) in entries {
        m.insert(MapKey::String(Arc::from(*k)), v.clone());
    }
    Value::map(m)
}

#[test]
fn test_namespace_resolution_prefers_longest_prefix() {
    let mut env = setup();
    env.set_container("acme.ns");
    env.declare_variable("acme.a.b", CelType::Int);
    env.declare_variable("acme.ns.a.b", CelType::String);
    env.declare_variable("a", CelType::map_of(CelType::String, CelType::Dyn));

    let act = MapActivation::new()
        .bind("acme.a.b", 1i64)
        .bind("acme.ns.a.b", "found")
        .bind_value(
            "a",
            string_map(&[("b", Value::list(vec![Value::Int(2), Value::Int(42)]))]),
        );
    match eval(&env, "a.b", &act) {
        Value::String(s) => assert_eq!(&*s, "found"),
        other => panic!("unexpected {}", other),
    }
}

#[test]
fn test_conditional_attribute_resolution() {
    let mut env = setup();
    env.declare_variable("a", CelType::map_of(CelType::Int, CelType::list_of(CelType::Int)));
    env.declare_variable("b", CelType::list_of(CelType::Int));
    env.declare_variable("c", CelType::list_of(CelType::Int));

    let mut a = CelMap::new();
    a.insert(
        MapKey::Int(-1),
        Value::list(vec![Value::Int(2), Value::Int(42)]),
    );
    let act = MapActivation::new()
        .bind_value("a", Value::map(a))
        .bind_value("b", Value::list(vec![Value::Int(0), Value::Int(1)]))
        .bind_value("c", Value::list(vec![Value::Int(1), Value::Int(0)]));

    match eval(&env, "a[-1][(false ? b : c)[0]]", &act) {
        Value::Int(n) => assert_eq!(n, 42),
        other => panic!("unexpected {}", other),
    }
}

#[test]
fn test_cross_type_membership() {
    let env = setup();
    let act = MapActivation::new();
    assert!(eval(&env, "3 in [1.0, 2.0, 3.0]", &act).is_true());
    assert!(eval(&env, "3u in [1.0, 2.0, 3.0]", &act).is_true());
    assert!(!eval(&env, "4 in [1.0, 2.0, 3.0]", &act).is_true());
    assert!(!eval(&env, "'3' in [1.0, 2.0, 3.0]", &act).is_true());
}

#[test]
fn test_concat_list_equality() {
    let env = setup();
    let act = MapActivation::new();
    assert!(eval(&env, "[1.0, 2.0] + [3.0] == [1.0, 2.0, 3.0]", &act).is_true());
}

#[test]
fn test_comprehension_short_circuit_matches_exhaustive() {
    let env = setup();
    let act = MapActivation::new();
    for text in ["[1, 2, 3].exists(x, x > 100)", "[1, 2, 3].exists(x, x > 1)"] {
        let fast = eval(&env, text, &act);
        let slow = eval_opts(
            &env,
            text,
            &act,
            ProgramOptions {
                exhaustive: true,
                ..ProgramOptions::default()
            },
        );
        assert!(
            fast.equal(&slow).is_true(),
            "{} diverged: {} vs {}",
            text,
            fast,
            slow
        );
    }
    assert!(!eval(&env, "[1, 2, 3].exists(x, x > 100)", &act).is_true());
    assert!(eval(&env, "[1, 2, 3].exists(x, x > 1)", &act).is_true());
}

#[test]
fn test_macro_suite() {
    let env = setup();
    let act = MapActivation::new();
    assert!(eval(&env, "[1, 2, 3].all(x, x > 0)", &act).is_true());
    assert!(!eval(&env, "[1, 2, 3].all(x, x > 1)", &act).is_true());
    assert!(eval(&env, "[1, 2, 3].exists_one(x, x == 2)", &act).is_true());
    assert!(!eval(&env, "[1, 2, 2].exists_one(x, x == 2)", &act).is_true());
    assert!(eval(&env, "[1, 2, 3].filter(x, x % 2 == 1) == [1, 3]", &act).is_true());
    assert!(eval(&env, "[1, 2, 3].map(x, x * 2) == [2, 4, 6]", &act).is_true());
    assert!(eval(&env, "[1, 2, 3].map(x, x > 1, x * 10) == [20, 30]", &act).is_true());
    assert!(eval(&env, "cel.bind(v, 6, v * v) == 36", &act).is_true());
    assert!(eval(&env, "{'a': 1}.exists(k, k == 'a')", &act).is_true());
}

#[test]
fn test_error_absorption_in_logic() {
    let env = setup();
    let act = MapActivation::new();
    assert!(eval(&env, "(1 / 0 == 0) || true", &act).is_true());
    assert!(matches!(
        eval(&env, "false && (1 / 0 == 0)", &act),
        Value::Bool(false)
    ));
    // without an absorbing side the error surfaces
    assert!(eval(&env, "true && (1 / 0 == 0)", &act).is_error());
    assert!(eval(&env, "1 / 0", &act).is_error());
}

#[test]
fn test_short_circuit_hides_errors_exhaustive_surfaces_values_equal() {
    let mut env = setup();
    env.declare_variable("x", CelType::Int);
    let act = MapActivation::new().bind("x", 0i64);
    // exhaustive and short-circuit agree whenever no pruned branch
    // errors
    for text in ["x == 0 || x > 1", "x != 0 && 10 / 2 == 5", "x == 0 ? 'a' : 'b'"] {
        let fast = eval(&env, text, &act);
        let slow = eval_opts(
            &env,
            text,
            &act,
            ProgramOptions {
                exhaustive: true,
                ..ProgramOptions::default()
            },
        );
        assert!(fast.equal(&slow).is_true(), "{} diverged", text);
    }
    // absorbing keeps the outcome even exhaustively
    let slow = eval_opts(
        &env,
        "x == 0 || 1 / x == 1",
        &act,
        ProgramOptions {
            exhaustive: true,
            ..ProgramOptions::default()
        },
    );
    assert!(slow.is_true());
}

#[test]
fn test_unknowns_flow_and_absorb() {
    let mut env = setup();
    env.declare_variable("secret", CelType::Int);
    env.declare_variable("public", CelType::Int);
    let checked = env.compile("secret == 1 && public == 1").unwrap();
    let program = env.plan(&checked, ProgramOptions::default()).unwrap();

    let act = env.partial_vars(
        HashMap::from([("public".to_string(), Value::Int(1))]),
        vec!["secret".to_string()],
    );
    assert!(program.eval(&act).is_unknown());

    // a definite false on the known side absorbs the unknown
    let act = env.partial_vars(
        HashMap::from([("public".to_string(), Value::Int(2))]),
        vec!["secret".to_string()],
    );
    assert!(matches!(program.eval(&act), Value::Bool(false)));
}

#[test]
fn test_negative_index_rejected_uniformly() {
    let mut env = setup();
    env.declare_variable("items", CelType::list_of(CelType::Int));
    let act = MapActivation::new().bind_value(
        "items",
        Value::list(vec![Value::Int(1), Value::Int(2)]),
    );
    assert!(eval(&env, "items[-1]", &act).is_error());
    assert!(eval(&env, "items[2]", &act).is_error());
    assert!(matches!(eval(&env, "items[1]", &act), Value::Int(2)));
}

#[test]
fn test_timestamps_and_durations() {
    let env = setup();
    let act = MapActivation::new();
    assert!(matches!(
        eval(&env, "timestamp('2024-03-15T23:30:00Z').getHours('+02:00')", &act),
        Value::Int(1)
    ));
    assert!(matches!(
        eval(&env, "timestamp('2024-03-15T23:30:00Z').getFullYear()", &act),
        Value::Int(2024)
    ));
    assert!(matches!(
        eval(&env, "duration('90m').getMinutes()", &act),
        Value::Int(90)
    ));
    assert!(eval(
        &env,
        "timestamp('2024-01-01T00:00:00Z') + duration('1h') == timestamp('2024-01-01T01:00:00Z')",
        &act
    )
    .is_true());
    assert!(eval(
        &env,
        "timestamp('2024-01-02T00:00:00Z') - timestamp('2024-01-01T00:00:00Z') == duration('24h')",
        &act
    )
    .is_true());
    assert!(eval(&env, "timestamp('not a time')", &act).is_error());
}

#[test]
fn test_conversions_and_overflow() {
    let env = setup();
    let act = MapActivation::new();
    assert!(eval(&env, "uint(42) == 42u", &act).is_true());
    assert!(eval(&env, "uint(-1)", &act).is_error());
    assert!(eval(&env, "int('12') == 12", &act).is_true());
    assert!(eval(&env, "9223372036854775807 + 1", &act).is_error());
    assert!(eval(&env, "0u - 1u", &act).is_error());
    assert!(eval(&env, "double('0.5') == 0.5", &act).is_true());
    assert!(eval(&env, "string(b'abc') == 'abc'", &act).is_true());
    assert!(eval(&env, "type(1) == int", &act).is_true());
    assert!(eval(&env, "type('a') == string", &act).is_true());
}

#[test]
fn test_string_functions() {
    let env = setup();
    let act = MapActivation::new();
    assert!(eval(&env, "'hello'.contains('ell')", &act).is_true());
    assert!(eval(&env, "'hello'.startsWith('he')", &act).is_true());
    assert!(eval(&env, "'hello'.endsWith('lo')", &act).is_true());
    assert!(eval(&env, "'ab12'.matches('^[a-z]+[0-9]+$')", &act).is_true());
    assert!(eval(&env, "size('héllo') == 5", &act).is_true());
}

fn widget_env() -> Env {
    let mut pool = DescriptorPool::new();
    pool.add(FileDescriptor {
        name: "widget.proto".to_string(),
        package: "acme".to_string(),
        messages: vec![MessageDescriptor::new(
            "Widget",
            vec![
                FieldDescriptor::scalar("name", FieldType::String),
                FieldDescriptor::scalar("weight", FieldType::Int32),
                FieldDescriptor::repeated("tags", FieldType::String),
            ],
        )
        .with_nested(
            vec![],
            vec![EnumDescriptor::new("State", vec![("UNKNOWN", 0), ("ACTIVE", 1)])],
        )],
        enums: vec![],
        dependencies: vec![],
    });
    let mut registry = TypeRegistry::new();
    registry.register_file(&pool, "widget.proto").expect("register");

    let mut env = Env::new();
    env.set_container("acme");
    env.set_provider(Arc::new(registry));
    env
}

#[test]
fn test_struct_construction_and_field_access() {
    let env = widget_env();
    let act = MapActivation::new();
    assert!(matches!(
        eval(&env, "Widget{name: 'w', weight: 10}.weight", &act),
        Value::Int(10)
    ));
    // unset fields read as defaults, presence tests see through that
    assert!(matches!(
        eval(&env, "Widget{name: 'w'}.weight", &act),
        Value::Int(0)
    ));
    assert!(!eval(&env, "has(Widget{name: 'w'}.weight)", &act).is_true());
    assert!(eval(&env, "has(Widget{name: 'w'}.name)", &act).is_true());
    assert!(matches!(
        eval(&env, "Widget{tags: ['a', 'b']}.tags.size()", &act),
        Value::Int(2)
    ));
}

#[test]
fn test_enum_constants_resolve_through_container() {
    let env = widget_env();
    let act = MapActivation::new();
    assert!(eval(&env, "Widget.State.ACTIVE == 1", &act).is_true());
    assert!(eval(&env, "acme.Widget.State.UNKNOWN == 0", &act).is_true());
}

#[test]
fn test_has_macro_on_maps() {
    let mut env = setup();
    env.declare_variable("m", CelType::map_of(CelType::String, CelType::Int));
    let act = MapActivation::new().bind_value("m", string_map(&[("a", Value::Int(1))]));
    assert!(eval(&env, "has(m.a)", &act).is_true());
    assert!(!eval(&env, "has(m.b)", &act).is_true());
}

#[test]
fn test_determinism_across_repeated_evaluations() {
    let mut env = setup();
    env.declare_variable("xs", CelType::list_of(CelType::Int));
    let checked = env
        .compile("xs.filter(x, x % 2 == 0).map(x, x * x) == [4, 16]")
        .unwrap();
    let program = env.plan(&checked, ProgramOptions::default()).unwrap();
    let act = MapActivation::new().bind_value(
        "xs",
        Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]),
    );
    let first = program.eval(&act);
    for _ in 0..10 {
        assert!(program.eval(&act).equal(&first).is_true());
    }
}

#[test]
fn test_interruption_stops_comprehension() {
    let mut env = setup();
    env.declare_variable("xs", CelType::list_of(CelType::Int));
    let checked = env.compile("xs.all(x, x >= 0)").unwrap();
    let program = env.plan(&checked, ProgramOptions::default()).unwrap();

    let base = MapActivation::new().bind_value(
        "xs",
        Value::list((0..100).map(Value::Int).collect()),
    );
    let (act, flag) = InterruptibleActivation::new(base);
    flag.store(true, Ordering::Relaxed);
    let out = program.eval(&act);
    match out {
        Value::Error(e) => assert_eq!(e.kind, celgate::ErrorKind::Interrupted),
        other => panic!("unexpected {}", other),
    }
}

#[test]
fn test_fold_step_limit_enforced() {
    let mut env = setup();
    env.declare_variable("xs", CelType::list_of(CelType::Int));
    let checked = env.compile("xs.map(x, x)").unwrap();
    let program = env
        .plan(
            &checked,
            ProgramOptions {
                max_fold_iterations: Some(5),
                ..ProgramOptions::default()
            },
        )
        .unwrap();
    let act = MapActivation::new().bind_value(
        "xs",
        Value::list((0..10).map(Value::Int).collect()),
    );
    assert!(program.eval(&act).is_error());
}

#[test]
fn test_macro_round_trip_preserves_checked_form() {
    let mut env = setup();
    env.declare_variable("items", CelType::list_of(CelType::Int));
    env.declare_variable("m", CelType::map_of(CelType::String, CelType::Int));
    let act = MapActivation::new()
        .bind_value("items", Value::list(vec![Value::Int(1), Value::Int(2)]))
        .bind_value("m", string_map(&[("a", Value::Int(1))]));

    for text in [
        "items.all(x, x > 0)",
        "has(m.a) ? m.a : 0",
        "items.map(x, x * 2).exists(y, y == 4)",
        "cel.bind(v, items[0], v + v)",
    ] {
        let ast = celgate::parser::parse(&celgate::Source::new(text)).expect("parse");
        let printed = celgate::unparser::unparse(&ast);
        let reparsed = celgate::parser::parse(&celgate::Source::new(&printed)).expect("reparse");

        let a = celgate::checker::check(&env, &ast).expect("check original");
        let b = celgate::checker::check(&env, &reparsed).expect("check reparsed");
        assert_eq!(a.result_type(), b.result_type(), "type drift for {}", text);

        let pa = env.plan(&a, ProgramOptions::default()).unwrap();
        let pb = env.plan(&b, ProgramOptions::default()).unwrap();
        assert!(
            pa.eval(&act).equal(&pb.eval(&act)).is_true(),
            "value drift for {}",
            text
        );
    }
}
