// ABOUTME: Test-suite schema and the expected-output matcher for test runners

use crate::activation::{Activation, MapActivation};
use crate::env::Env;
use crate::error::CelError;
use crate::provider::json_to_value;
use crate::value::Value;
use serde::Deserialize;
use std::collections::HashMap;

/// A declarative test suite over one compiled expression or policy.
/// The host front-end (YAML or otherwise) deserializes into these
/// structures; the runner itself lives outside the core.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestSuite {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sections: Vec<TestSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestSection {
    pub name: String,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestCase {
    pub name: String,
    /// Variable bindings by name; mutually exclusive with
    /// `input_context`.
    #[serde(default)]
    pub input: HashMap<String, TestInput>,
    #[serde(default)]
    pub input_context: Option<InputContext>,
    pub output: TestOutput,
}

/// One input binding: either a literal JSON value or an expression
/// evaluated against the empty activation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestInput {
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub expr: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputContext {
    pub context_expr: String,
}

/// The expected outcome: exactly one of a literal value, an expression,
/// an error-substring set, or an unknown id set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestOutput {
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub error_set: Option<Vec<String>>,
    #[serde(default)]
    pub unknown_set: Option<Vec<u64>>,
}

/// Build the activation a test case describes. Expression inputs are
/// compiled and evaluated hermetically.
pub fn activation_for(env: &Env, case: &TestCase) -> Result<MapActivation, CelError> {
    if case.input_context.is_some() && !case.input.is_empty() {
        return Err(CelError::config(format!(
            "test '{}' sets both input and input_context",
            case.name
        )));
    }
    let mut act = MapActivation::new();
    for (name, input) in &case.input {
        let value = match (&input.value, &input.expr) {
            (Some(v), None) => json_to_value(v),
            (None, Some(text)) => eval_hermetic(env, text)?,
            _ => {
                return Err(CelError::config(format!(
                    "input '{}' of test '{}' must set exactly one of value or expr",
                    name, case.name
                )))
            }
        };
        act = act.bind_value(name, value);
    }
    if let Some(ctx) = &case.input_context {
        // The context expression evaluates to a map of bindings.
        match eval_hermetic(env, &ctx.context_expr)? {
            Value::Map(m) => {
                for (k, v) in m.entries() {
                    if let crate::value::MapKey::String(name) = k {
                        act = act.bind_value(name.to_string(), v.clone());
                    }
                }
            }
            other => {
                return Err(CelError::config(format!(
                    "context_expr of test '{}' must produce a map, got {}",
                    case.name,
                    other.kind_name()
                )))
            }
        }
    }
    Ok(act)
}

fn eval_hermetic(env: &Env, text: &str) -> Result<Value, CelError> {
    let checked = env.compile(text)?;
    let program = env.plan(&checked, crate::env::ProgramOptions::default())?;
    Ok(program.eval(&crate::activation::EmptyActivation))
}

/// Whether an actual result satisfies the expected output. The matcher
/// (not the engine) unwraps a present optional before comparing, so a
/// plain expected value matches `optional.of` of itself.
pub fn matches_output(env: &Env, actual: &Value, expected: &TestOutput) -> Result<bool, CelError> {
    if let Some(errors) = &expected.error_set {
        return Ok(match actual {
            Value::Error(e) => {
                let shown = e.to_string();
                errors.iter().any(|want| shown.contains(want.as_str()))
            }
            _ => false,
        });
    }
    if let Some(ids) = &expected.unknown_set {
        return Ok(match actual {
            Value::Unknown(u) => ids.iter().all(|id| u.ids.contains(id)),
            _ => false,
        });
    }
    let want = match (&expected.value, &expected.expr) {
        (Some(v), None) => json_to_value(v),
        (None, Some(text)) => eval_hermetic(env, text)?,
        _ => {
            return Err(CelError::config(
                "expected output must set exactly one of value, expr, error_set, unknown_set",
            ))
        }
    };
    let got = match actual {
        Value::Optional(o) => match o.as_ref() {
            Some(inner) => inner.clone(),
            None => return Ok(false),
        },
        other => other.clone(),
    };
    Ok(got.equal(&want).is_true())
}

/// Run one case against a planned program, returning a human-readable
/// failure description on mismatch.
pub fn run_case(
    env: &Env,
    program: &crate::env::Program,
    case: &TestCase,
) -> Result<(), String> {
    let act = activation_for(env, case).map_err(|e| format!("{}: {}", case.name, e))?;
    let actual = program.eval(&act as &dyn Activation);
    match matches_output(env, &actual, &case.output) {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!("{}: got {}", case.name, actual)),
        Err(e) => Err(format!("{}: {}", case.name, e)),
    }
}
