// ABOUTME: Policy compiler: composes a rule tree of matches and variables into one expression

use crate::ast::{operators, Ast, CheckedAst, Expr, ExprKind, IdGen, SourceInfo};
use crate::checker;
use crate::env::Env;
use crate::error::{CelError, Diagnostic, DiagnosticSet};
use crate::parser;
use crate::source::Source;
use crate::types::CelType;
use crate::value::Value;
use log::debug;
use serde::Deserialize;

// ============================================================================
// Normalized policy source
// ============================================================================

/// A policy in its normalized form: a named, ordered rule tree. The
/// textual file format (YAML or otherwise) is the host's concern; any
/// serde front-end can produce these structures.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySource {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub imports: Vec<ImportSource>,
    pub rule: RuleSource,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportSource {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleSource {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variables: Vec<VariableSource>,
    #[serde(default, rename = "match")]
    pub matches: Vec<MatchSource>,
}

/// An ordered local binding, referenced in expressions as
/// `variables.<name>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableSource {
    pub name: String,
    pub expression: String,
}

/// One match arm: an optional condition (default true) and exactly one
/// of an output expression or a nested rule.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchSource {
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub rule: Option<Box<RuleSource>>,
}

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Upper bound on the number of variables plus rule outputs in one
    /// policy; exceeding it is a compile error.
    pub nested_expression_limit: usize,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            nested_expression_limit: 100,
        }
    }
}

/// The result of policy compilation: a single checked expression with
/// first-match semantics, plus the policy identity for diagnostics.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub name: String,
    pub ast: CheckedAst,
}

/// Compile a policy into one expression. Matches compose into a ternary
/// chain evaluated first-match; local variables become a single
/// `cel.@block` with indexed, lazily-bound locals.
pub fn compile(env: &Env, policy: &PolicySource) -> Result<CompiledPolicy, CelError> {
    compile_with_options(env, policy, &CompilerOptions::default())
}

pub fn compile_with_options(
    env: &Env,
    policy: &PolicySource,
    options: &CompilerOptions,
) -> Result<CompiledPolicy, CelError> {
    let mut compiler = Compiler {
        env: env.clone(),
        policy_name: policy.name.clone(),
        options,
        diags: DiagnosticSet::new(),
        gen: IdGen::new(),
        info: SourceInfo::default(),
        var_names: Vec::new(),
        variables: Vec::new(),
        expression_count: 0,
    };
    for import in &policy.imports {
        if let Err(e) = compiler.env.add_abbreviation(&import.name) {
            compiler.fail(format!("bad import '{}': {}", import.name, e));
        }
    }

    // Variables first, in declaration (pre-)order across the whole rule
    // tree, so later expressions see earlier bindings and never the
    // reverse. A variable is addressable as `variables.<name>` and,
    // when the name does not collide with a declared input, by its bare
    // name.
    compiler.collect_names(&policy.rule);
    compiler.collect_variables(&policy.rule);
    let body = compiler.compile_rule(&policy.rule);

    if compiler.expression_count > options.nested_expression_limit {
        compiler.fail(format!(
            "policy has {} nested expressions, limit is {}",
            compiler.expression_count, options.nested_expression_limit
        ));
    }
    if !compiler.diags.is_empty() {
        return Err(CelError::Policy(compiler.diags));
    }

    let body = match body {
        Some(step) => step.expr,
        None => {
            let mut diags = DiagnosticSet::new();
            diags.push(Diagnostic::error("policy has no matches", 0, 0));
            return Err(CelError::Policy(diags));
        }
    };
    debug!(
        "composed policy '{}' with {} variables",
        policy.name,
        compiler.variables.len()
    );
    let expr = compiler.wrap_in_block(body);
    let ast = Ast {
        expr,
        source_info: compiler.info,
    };
    let checked = checker::check(&compiler.env, &ast).map_err(|e| match e {
        CelError::Check(d) => CelError::Policy(d),
        other => other,
    })?;
    Ok(CompiledPolicy {
        name: policy.name.clone(),
        ast: checked,
    })
}

// ============================================================================
// Compiler
// ============================================================================

/// One composed sub-expression and whether it produces `optional<T>`.
struct Step {
    expr: Expr,
    optional: bool,
}

struct CompiledVariable {
    name: String,
    bare: bool,
    expr: Expr,
}

struct Compiler<'o> {
    env: Env,
    policy_name: String,
    options: &'o CompilerOptions,
    diags: DiagnosticSet,
    gen: IdGen,
    info: SourceInfo,
    /// Every variable name in the rule tree, in declaration order, with
    /// whether the bare name is free for it.
    var_names: Vec<(String, bool)>,
    variables: Vec<CompiledVariable>,
    expression_count: usize,
}

impl Compiler<'_> {
    fn fail(&mut self, message: String) {
        let message = if self.policy_name.is_empty() {
            message
        } else {
            format!("{}: {}", self.policy_name, message)
        };
        self.diags.push(Diagnostic::error(message, 0, 0));
    }

    /// Parse, order-check, and type-check one embedded expression;
    /// returns the renumbered expression and its checked type.
    fn compile_expression(&mut self, text: &str, context: &str) -> Option<(Expr, CelType)> {
        let source = Source::with_description(text, context);
        let ast = match parser::parse(&source) {
            Ok(ast) => ast,
            Err(e) => {
                self.fail(format!("{}: {}", context, e));
                return None;
            }
        };
        for referenced in variable_references(&ast.expr, &self.var_names) {
            if !self.variables.iter().any(|v| v.name == referenced) {
                self.fail(format!(
                    "{}: variable '{}' referenced before its declaration",
                    context, referenced
                ));
            }
        }
        let ty = match checker::check(&self.env, &ast) {
            Ok(checked) => checked.result_type(),
            Err(e) => {
                self.fail(format!("{}: {}", context, e));
                return None;
            }
        };
        Some((self.absorb(ast), ty))
    }

    /// Renumber a parsed sub-expression into the composed id space and
    /// merge its source info.
    fn absorb(&mut self, mut ast: Ast) -> Expr {
        let offset = self.gen.next_id();
        ast.offset_ids(offset);
        let Ast { expr, source_info } = ast;
        let mut max = expr.max_id();
        for (id, original) in source_info.macro_calls {
            max = max.max(original.max_id());
            self.info.macro_calls.insert(id, original);
        }
        for (id, pos) in source_info.positions {
            self.info.positions.insert(id, pos);
        }
        self.gen = IdGen::starting_after(max.max(offset));
        expr
    }

    fn call(&mut self, function: &str, args: Vec<Expr>) -> Expr {
        Expr::call(self.gen.next_id(), function, args)
    }

    fn member(&mut self, target: Expr, function: &str, args: Vec<Expr>) -> Expr {
        Expr::member_call(self.gen.next_id(), target, function, args)
    }

    fn optional_none(&mut self) -> Expr {
        self.call("optional.none", vec![])
    }

    fn optional_of(&mut self, e: Expr) -> Expr {
        self.call("optional.of", vec![e])
    }

    fn is_optional_none(e: &Expr) -> bool {
        matches!(&e.kind, ExprKind::Call { target: None, function, args } if function == "optional.none" && args.is_empty())
    }

    fn collect_names(&mut self, rule: &RuleSource) {
        for variable in &rule.variables {
            let bare = self.env.variable(&variable.name).is_none();
            self.var_names.push((variable.name.clone(), bare));
        }
        for m in &rule.matches {
            if let Some(nested) = &m.rule {
                self.collect_names(nested);
            }
        }
    }

    fn collect_variables(&mut self, rule: &RuleSource) {
        for variable in &rule.variables {
            self.compile_variable(rule, variable);
        }
        for m in &rule.matches {
            if let Some(nested) = &m.rule {
                self.collect_variables(nested);
            }
        }
    }

    fn compile_rule(&mut self, rule: &RuleSource) -> Option<Step> {
        let mut fallback: Option<Step> = None;
        for (index, m) in rule.matches.iter().enumerate().rev() {
            let context = if rule.id.is_empty() {
                format!("match #{}", index + 1)
            } else {
                format!("rule '{}' match #{}", rule.id, index + 1)
            };

            let condition = match &m.condition {
                Some(text) if !text.trim().is_empty() => {
                    match self.compile_expression(text, &context) {
                        Some((expr, ty)) => {
                            if !matches!(ty, CelType::Bool | CelType::Dyn | CelType::Error) {
                                self.fail(format!(
                                    "{}: condition must be bool, found '{}'",
                                    context, ty
                                ));
                            }
                            match &expr.kind {
                                ExprKind::Literal(Value::Bool(true)) => None,
                                _ => Some(expr),
                            }
                        }
                        None => continue,
                    }
                }
                _ => None,
            };

            let step = match (&m.output, &m.rule) {
                (Some(output), None) => {
                    self.expression_count += 1;
                    match self.compile_expression(output, &context) {
                        Some((expr, ty)) => Step {
                            optional: ty.is_optional(),
                            expr,
                        },
                        None => continue,
                    }
                }
                (None, Some(nested)) => match self.compile_rule(nested) {
                    Some(step) => step,
                    None => {
                        self.fail(format!("{}: nested rule has no matches", context));
                        continue;
                    }
                },
                _ => {
                    self.fail(format!(
                        "{}: must set exactly one of 'output' or 'rule'",
                        context
                    ));
                    continue;
                }
            };

            match condition {
                None => {
                    fallback = Some(match (step.optional, fallback) {
                        // An unconditional, non-optional match prunes
                        // everything after it.
                        (false, Some(_)) => {
                            self.fail(format!(
                                "{}: later matches are unreachable past this unconditional match",
                                context
                            ));
                            step
                        }
                        (false, None) | (true, None) => step,
                        // An unconditional optional step may still be
                        // none; chain into the remainder.
                        (true, Some(next)) => {
                            if next.optional {
                                if Self::is_optional_none(&next.expr) {
                                    step
                                } else {
                                    Step {
                                        expr: self.member(step.expr, "or", vec![next.expr]),
                                        optional: true,
                                    }
                                }
                            } else {
                                Step {
                                    expr: self.member(step.expr, "orValue", vec![next.expr]),
                                    optional: false,
                                }
                            }
                        }
                    });
                }
                Some(cond) => {
                    let next = match fallback {
                        Some(f) => f,
                        None => Step {
                            expr: self.optional_none(),
                            optional: true,
                        },
                    };
                    fallback = Some(self.combine(cond, step, next));
                }
            }
        }
        fallback
    }

    /// Combine a conditional step with the already-composed remainder,
    /// preserving optionality end to end.
    fn combine(&mut self, cond: Expr, step: Step, next: Step) -> Step {
        match (step.optional, next.optional) {
            (false, false) => Step {
                expr: self.ternary(cond, step.expr, next.expr),
                optional: false,
            },
            (false, true) => {
                let wrapped = self.optional_of(step.expr);
                Step {
                    expr: self.ternary(cond, wrapped, next.expr),
                    optional: true,
                }
            }
            (true, false) => {
                let wrapped = self.optional_of(next.expr);
                Step {
                    expr: self.ternary(cond, step.expr, wrapped),
                    optional: true,
                }
            }
            (true, true) => Step {
                expr: self.ternary(cond, step.expr, next.expr),
                optional: true,
            },
        }
    }

    fn ternary(&mut self, cond: Expr, truthy: Expr, falsy: Expr) -> Expr {
        self.call(operators::CONDITIONAL, vec![cond, truthy, falsy])
    }

    fn compile_variable(&mut self, rule: &RuleSource, variable: &VariableSource) {
        let context = if rule.id.is_empty() {
            format!("variable '{}'", variable.name)
        } else {
            format!("rule '{}' variable '{}'", rule.id, variable.name)
        };
        if self.variables.iter().any(|v| v.name == variable.name) {
            self.fail(format!("{}: shadows an earlier variable", context));
            return;
        }
        self.expression_count += 1;
        let bare = self
            .var_names
            .iter()
            .find(|(n, _)| n == &variable.name)
            .map(|(_, b)| *b)
            .unwrap_or(false);
        if let Some((expr, ty)) = self.compile_expression(&variable.expression, &context) {
            self.env
                .declare_variable(&format!("variables.{}", variable.name), ty.clone());
            if bare {
                self.env.declare_variable(&variable.name, ty);
            }
            self.variables.push(CompiledVariable {
                name: variable.name.clone(),
                bare,
                expr,
            });
        }
    }

    /// Emit the single `cel.@block([v0, ..., vN], body)` call, with
    /// `variables.<name>` references rewritten to indexed locals.
    fn wrap_in_block(&mut self, body: Expr) -> Expr {
        if self.variables.is_empty() {
            return body;
        }
        let names: Vec<(String, bool)> = self
            .variables
            .iter()
            .map(|v| (v.name.clone(), v.bare))
            .collect();
        let mut inits: Vec<Expr> = Vec::new();
        let variables = std::mem::take(&mut self.variables);
        for v in variables {
            inits.push(self.rewrite_variable_refs(v.expr, &names));
        }
        let body = self.rewrite_variable_refs(body, &names);
        let init_list = Expr::new(
            self.gen.next_id(),
            ExprKind::List {
                elements: inits,
                optional_indices: vec![],
            },
        );
        self.call(operators::BLOCK, vec![init_list, body])
    }

    fn rewrite_variable_refs(&mut self, expr: Expr, names: &[(String, bool)]) -> Expr {
        let mut expr = expr;
        for (i, (name, bare)) in names.iter().enumerate() {
            let full = format!("variables.{}", name);
            let mut make = || Expr::ident(self.gen.next_id(), format!("@index{}", i));
            expr = crate::optimizer::substitute(expr, &full, &mut make);
            if *bare {
                let mut make = || Expr::ident(self.gen.next_id(), format!("@index{}", i));
                expr = crate::optimizer::substitute(expr, name, &mut make);
            }
        }
        expr
    }
}

/// The policy variables referenced by an expression, through either the
/// `variables.<name>` chain or a free bare name.
fn variable_references(e: &Expr, var_names: &[(String, bool)]) -> Vec<String> {
    let mut out = Vec::new();
    collect_variable_refs(e, var_names, &mut out);
    out
}

fn collect_variable_refs(e: &Expr, var_names: &[(String, bool)], out: &mut Vec<String>) {
    match &e.kind {
        ExprKind::Select {
            operand,
            field,
            test_only: false,
        } if matches!(&operand.kind, ExprKind::Ident(n) if n == "variables") => {
            out.push(field.clone());
        }
        ExprKind::Ident(name) => {
            if var_names.iter().any(|(n, bare)| *bare && n == name) {
                out.push(name.clone());
            }
        }
        _ => {}
    }
    for child in e.children() {
        collect_variable_refs(child, var_names, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::MapActivation;
    use crate::env::ProgramOptions;
    use crate::value::{CelMap, MapKey};

    fn env() -> Env {
        let mut env = Env::new();
        env.declare_variable("spec", CelType::map_of(CelType::String, CelType::Dyn));
        env.declare_variable("resource", CelType::map_of(CelType::String, CelType::Dyn));
        env
    }

    fn labels_map(labels: &[&str]) -> Value {
        let mut inner = CelMap::new();
        inner.insert(
            MapKey::String("labels".into()),
            Value::list(labels.iter().map(|l| Value::string(l)).collect()),
        );
        Value::map(inner)
    }

    fn first_match_policy() -> PolicySource {
        PolicySource {
            name: "labels".to_string(),
            rule: RuleSource {
                variables: vec![VariableSource {
                    name: "want".to_string(),
                    expression: "spec.labels".to_string(),
                }],
                matches: vec![
                    MatchSource {
                        condition: Some(
                            "variables.want.exists(l, !(l in resource.labels))".to_string(),
                        ),
                        output: Some("'missing'".to_string()),
                        rule: None,
                    },
                    MatchSource {
                        condition: None,
                        output: Some("'ok'".to_string()),
                        rule: None,
                    },
                ],
                ..RuleSource::default()
            },
            ..PolicySource::default()
        }
    }

    #[test]
    fn test_first_match_composition() {
        let env = env();
        let compiled = compile(&env, &first_match_policy()).unwrap();
        let program = env.plan(&compiled.ast, ProgramOptions::default()).unwrap();

        let act = MapActivation::new()
            .bind_value("spec", labels_map(&["x"]))
            .bind_value("resource", labels_map(&["x"]));
        match program.eval(&act) {
            Value::String(s) => assert_eq!(&*s, "ok"),
            other => panic!("unexpected {}", other),
        }

        let act = MapActivation::new()
            .bind_value("spec", labels_map(&["x", "y"]))
            .bind_value("resource", labels_map(&["x"]));
        match program.eval(&act) {
            Value::String(s) => assert_eq!(&*s, "missing"),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_all_conditional_yields_optional_none() {
        let env = env();
        let policy = PolicySource {
            rule: RuleSource {
                matches: vec![MatchSource {
                    condition: Some("size(resource.labels) > 100".to_string()),
                    output: Some("'huge'".to_string()),
                    rule: None,
                }],
                ..RuleSource::default()
            },
            ..PolicySource::default()
        };
        let compiled = compile(&env, &policy).unwrap();
        let program = env.plan(&compiled.ast, ProgramOptions::default()).unwrap();
        let act = MapActivation::new().bind_value("resource", labels_map(&["x"]));
        match program.eval(&act) {
            Value::Optional(o) => assert!(o.is_none()),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_forward_variable_reference_diagnosed() {
        let env = env();
        let policy = PolicySource {
            rule: RuleSource {
                variables: vec![
                    VariableSource {
                        name: "a".to_string(),
                        expression: "variables.b + 1".to_string(),
                    },
                    VariableSource {
                        name: "b".to_string(),
                        expression: "1".to_string(),
                    },
                ],
                matches: vec![MatchSource {
                    condition: None,
                    output: Some("variables.a".to_string()),
                    rule: None,
                }],
                ..RuleSource::default()
            },
            ..PolicySource::default()
        };
        let err = compile(&env, &policy).unwrap_err();
        let shown = format!("{}", err);
        assert!(shown.contains("before its declaration"), "got: {}", shown);
    }

    #[test]
    fn test_duplicate_variable_diagnosed() {
        let env = env();
        let policy = PolicySource {
            rule: RuleSource {
                variables: vec![
                    VariableSource {
                        name: "v".to_string(),
                        expression: "1".to_string(),
                    },
                    VariableSource {
                        name: "v".to_string(),
                        expression: "2".to_string(),
                    },
                ],
                matches: vec![MatchSource {
                    condition: None,
                    output: Some("variables.v".to_string()),
                    rule: None,
                }],
                ..RuleSource::default()
            },
            ..PolicySource::default()
        };
        assert!(compile(&env, &policy).is_err());
    }

    #[test]
    fn test_unreachable_match_diagnosed() {
        let env = env();
        let policy = PolicySource {
            rule: RuleSource {
                matches: vec![
                    MatchSource {
                        condition: None,
                        output: Some("'always'".to_string()),
                        rule: None,
                    },
                    MatchSource {
                        condition: Some("true == false".to_string()),
                        output: Some("'never'".to_string()),
                        rule: None,
                    },
                ],
                ..RuleSource::default()
            },
            ..PolicySource::default()
        };
        let err = compile(&env, &policy).unwrap_err();
        assert!(format!("{}", err).contains("unreachable"));
    }

    #[test]
    fn test_nested_expression_limit() {
        let env = env();
        let options = CompilerOptions {
            nested_expression_limit: 1,
        };
        let err = compile_with_options(&env, &first_match_policy(), &options).unwrap_err();
        assert!(format!("{}", err).contains("limit"));
    }

    #[test]
    fn test_nested_rule_composes() {
        let env = env();
        let policy = PolicySource {
            rule: RuleSource {
                matches: vec![
                    MatchSource {
                        condition: Some("'env' in resource.labels".to_string()),
                        output: None,
                        rule: Some(Box::new(RuleSource {
                            id: "inner".to_string(),
                            matches: vec![
                                MatchSource {
                                    condition: Some("'prod' in resource.labels".to_string()),
                                    output: Some("'prod-env'".to_string()),
                                    rule: None,
                                },
                                MatchSource {
                                    condition: None,
                                    output: Some("'other-env'".to_string()),
                                    rule: None,
                                },
                            ],
                            ..RuleSource::default()
                        })),
                    },
                    MatchSource {
                        condition: None,
                        output: Some("'no-env'".to_string()),
                        rule: None,
                    },
                ],
                ..RuleSource::default()
            },
            ..PolicySource::default()
        };
        let compiled = compile(&env, &policy).unwrap();
        let program = env.plan(&compiled.ast, ProgramOptions::default()).unwrap();

        let act = MapActivation::new().bind_value("resource", labels_map(&["env", "prod"]));
        match program.eval(&act) {
            Value::String(s) => assert_eq!(&*s, "prod-env"),
            other => panic!("unexpected {}", other),
        }

        let act = MapActivation::new().bind_value("resource", labels_map(&["x"]));
        match program.eval(&act) {
            Value::String(s) => assert_eq!(&*s, "no-env"),
            other => panic!("unexpected {}", other),
        }
    }
}
