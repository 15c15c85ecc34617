// ABOUTME: Static AST optimizer: constant folding, literal build-out, inlining with aliasing

use crate::ast::{operators, Ast, CheckedAst, Expr, ExprId, ExprKind, IdGen};
use crate::checker;
use crate::env::Env;
use crate::error::CelError;
use crate::interp;
use crate::value::{CelMap, MapKey, Value};
use log::debug;

/// A named expression to substitute for references to `name`. When the
/// program references the name more than once, the substitution is
/// wrapped in a `cel.bind` so the replacement evaluates once; `alias`
/// overrides the generated binding name. `nullable` enables the
/// presence-test simplifications for wrapper-typed replacements.
#[derive(Debug, Clone)]
pub struct InlineVariable {
    pub name: String,
    pub alias: Option<String>,
    pub nullable: bool,
    pub replacement: Ast,
}

impl InlineVariable {
    pub fn new(name: &str, replacement: Ast) -> Self {
        InlineVariable {
            name: name.to_string(),
            alias: None,
            nullable: false,
            replacement,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Replace references to each inline variable with its expression,
/// introducing `cel.bind` aliases for repeated references, then fold
/// constants and recheck. Folding may collapse the program to a single
/// literal.
pub fn inline_variables(
    env: &Env,
    checked: &CheckedAst,
    vars: Vec<InlineVariable>,
) -> Result<CheckedAst, CelError> {
    let mut ast = checked.ast.clone();
    let mut gen = IdGen::starting_after(ast_max_id(&ast));

    for (i, var) in vars.into_iter().enumerate() {
        apply_inline(&mut ast, &mut gen, &var, i);
    }
    let ast = fold_ast(env, ast);
    checker::check(env, &ast)
}

/// Constant-fold a checked AST without inlining.
pub fn fold_constants(env: &Env, checked: &CheckedAst) -> Result<CheckedAst, CelError> {
    let ast = fold_ast(env, checked.ast.clone());
    checker::check(env, &ast)
}

fn ast_max_id(ast: &Ast) -> ExprId {
    let mut max = ast.expr.max_id();
    for original in ast.source_info.macro_calls.values() {
        max = max.max(original.max_id());
    }
    max
}

/// The dotted name of a pure identifier chain.
fn chain_name(e: &Expr) -> Option<String> {
    match &e.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        ExprKind::Select {
            operand,
            field,
            test_only: false,
        } => chain_name(operand).map(|q| format!("{}.{}", q, field)),
        _ => None,
    }
}

fn matches_name(e: &Expr, name: &str) -> bool {
    chain_name(e).as_deref() == Some(name)
}

fn count_references(e: &Expr, name: &str) -> usize {
    if matches_name(e, name) {
        return 1;
    }
    // A presence test over the name also references it.
    if let ExprKind::Select {
        operand,
        field,
        test_only: true,
    } = &e.kind
    {
        let full = chain_name(operand).map(|c| format!("{}.{}", c, field));
        if full.as_deref() == Some(name) {
            return 1;
        }
    }
    e.children()
        .into_iter()
        .map(|c| count_references(c, name))
        .sum::<usize>()
}

fn apply_inline(ast: &mut Ast, gen: &mut IdGen, var: &InlineVariable, index: usize) {
    let count = count_references(&ast.expr, &var.name);
    if count == 0 {
        return;
    }
    debug!("inlining '{}' ({} references)", var.name, count);

    let expr = std::mem::replace(&mut ast.expr, Expr::literal(0, Value::Null));
    let info = &mut ast.source_info;

    if count == 1 && !var.nullable {
        let mut make = || clone_renumbered(&var.replacement, gen, info);
        ast.expr = substitute(expr, &var.name, &mut make);
        return;
    }

    let alias = var
        .alias
        .clone()
        .unwrap_or_else(|| format!("@inlined{}", index));

    // Presence tests over a nullable replacement become null checks
    // against the alias; every remaining reference then reads the
    // alias.
    let expr = if var.nullable {
        rewrite_presence_tests(expr, &var.name, &alias, gen)
    } else {
        expr
    };
    let mut make = || Expr::ident(gen.next_id(), alias.clone());
    let body = substitute(expr, &var.name, &mut make);

    // Bind the replacement once: a fold over an empty synthetic range
    // exposing the alias as the accumulator.
    let replacement = clone_renumbered(&var.replacement, gen, &mut ast.source_info);
    let comp = crate::ast::ComprehensionExpr {
        iter_var: "#unused".to_string(),
        iter_range: Expr::new(
            gen.next_id(),
            ExprKind::List {
                elements: vec![],
                optional_indices: vec![],
            },
        ),
        accu_var: alias.clone(),
        accu_init: replacement.clone(),
        loop_condition: Expr::literal(gen.next_id(), Value::Bool(false)),
        loop_step: Expr::ident(gen.next_id(), alias.clone()),
        result: body,
    };
    let bind_id = gen.next_id();
    let original = Expr::member_call(
        gen.next_id(),
        Expr::ident(gen.next_id(), "cel"),
        "bind",
        vec![
            Expr::ident(gen.next_id(), alias),
            replacement,
            comp.result.clone(),
        ],
    );
    ast.source_info.macro_calls.insert(bind_id, original);
    ast.expr = Expr::new(bind_id, ExprKind::Comprehension(Box::new(comp)));
}

/// Replace every reference to `name` with a freshly built expression.
pub(crate) fn substitute(e: Expr, name: &str, make: &mut dyn FnMut() -> Expr) -> Expr {
    if matches_name(&e, name) {
        return make();
    }
    let Expr { id, kind } = e;
    let kind = match kind {
        ExprKind::Select {
            operand,
            field,
            test_only,
        } => ExprKind::Select {
            operand: Box::new(substitute(*operand, name, make)),
            field,
            test_only,
        },
        ExprKind::Call {
            target,
            function,
            args,
        } => ExprKind::Call {
            target: target.map(|t| Box::new(substitute(*t, name, make))),
            function,
            args: args
                .into_iter()
                .map(|a| substitute(a, name, make))
                .collect(),
        },
        ExprKind::List {
            elements,
            optional_indices,
        } => ExprKind::List {
            elements: elements
                .into_iter()
                .map(|a| substitute(a, name, make))
                .collect(),
            optional_indices,
        },
        ExprKind::Map { entries } => ExprKind::Map {
            entries: entries
                .into_iter()
                .map(|mut en| {
                    en.key = substitute(en.key, name, make);
                    en.value = substitute(en.value, name, make);
                    en
                })
                .collect(),
        },
        ExprKind::Struct { type_name, fields } => ExprKind::Struct {
            type_name,
            fields: fields
                .into_iter()
                .map(|mut f| {
                    f.value = substitute(f.value, name, make);
                    f
                })
                .collect(),
        },
        ExprKind::Comprehension(mut c) => {
            c.iter_range = substitute(c.iter_range, name, make);
            c.accu_init = substitute(c.accu_init, name, make);
            c.loop_condition = substitute(c.loop_condition, name, make);
            c.loop_step = substitute(c.loop_step, name, make);
            c.result = substitute(c.result, name, make);
            ExprKind::Comprehension(c)
        }
        other => other,
    };
    Expr { id, kind }
}

/// Clone a replacement AST with fresh node ids, merging its macro-call
/// metadata into the program's source info so unparse still prints
/// macro forms.
fn clone_renumbered(replacement: &Ast, gen: &mut IdGen, info: &mut crate::ast::SourceInfo) -> Expr {
    let mut copy = replacement.clone();
    let offset = gen.next_id();
    copy.offset_ids(offset);
    let mut max = copy.expr.max_id();
    for (id, original) in copy.source_info.macro_calls {
        max = max.max(original.max_id());
        info.macro_calls.insert(id, original);
    }
    *gen = IdGen::starting_after(max.max(offset));
    copy.expr
}

/// Nullable simplifications: a presence test over the inlined value
/// becomes a null check against the alias, so `has(x)` reads as
/// `alias != null` and `has(x) ? x : d` settles into a bind over
/// `(alias != null) ? alias : d`. Runs before the general substitution,
/// while presence tests still carry the original select shape.
fn rewrite_presence_tests(e: Expr, target: &str, alias: &str, gen: &mut IdGen) -> Expr {
    let Expr { id, kind } = e;
    let kind = match kind {
        ExprKind::Select {
            operand,
            field,
            test_only,
        } => {
            let full = chain_name(&operand).map(|c| format!("{}.{}", c, field));
            if test_only && full.as_deref() == Some(target) {
                return Expr::call(
                    id,
                    operators::NOT_EQUALS,
                    vec![
                        Expr::ident(gen.next_id(), alias),
                        Expr::literal(gen.next_id(), Value::Null),
                    ],
                );
            }
            ExprKind::Select {
                operand: Box::new(rewrite_presence_tests(*operand, target, alias, gen)),
                field,
                test_only,
            }
        }
        ExprKind::Call {
            target: call_target,
            function,
            args,
        } => ExprKind::Call {
            target: call_target.map(|t| Box::new(rewrite_presence_tests(*t, target, alias, gen))),
            function,
            args: args
                .into_iter()
                .map(|a| rewrite_presence_tests(a, target, alias, gen))
                .collect(),
        },
        ExprKind::List {
            elements,
            optional_indices,
        } => ExprKind::List {
            elements: elements
                .into_iter()
                .map(|a| rewrite_presence_tests(a, target, alias, gen))
                .collect(),
            optional_indices,
        },
        ExprKind::Map { entries } => ExprKind::Map {
            entries: entries
                .into_iter()
                .map(|mut en| {
                    en.key = rewrite_presence_tests(en.key, target, alias, gen);
                    en.value = rewrite_presence_tests(en.value, target, alias, gen);
                    en
                })
                .collect(),
        },
        ExprKind::Struct { type_name, fields } => ExprKind::Struct {
            type_name,
            fields: fields
                .into_iter()
                .map(|mut f| {
                    f.value = rewrite_presence_tests(f.value, target, alias, gen);
                    f
                })
                .collect(),
        },
        ExprKind::Comprehension(mut c) => {
            c.iter_range = rewrite_presence_tests(c.iter_range, target, alias, gen);
            c.accu_init = rewrite_presence_tests(c.accu_init, target, alias, gen);
            c.loop_condition = rewrite_presence_tests(c.loop_condition, target, alias, gen);
            c.loop_step = rewrite_presence_tests(c.loop_step, target, alias, gen);
            c.result = rewrite_presence_tests(c.result, target, alias, gen);
            ExprKind::Comprehension(c)
        }
        other => other,
    };
    Expr { id, kind }
}

// ============================================================================
// Constant folding
// ============================================================================

fn fold_ast(env: &Env, mut ast: Ast) -> Ast {
    let expr = std::mem::replace(&mut ast.expr, Expr::literal(0, Value::Null));
    ast.expr = fold_expr(env, expr);
    // Drop macro metadata for nodes folded out of the tree.
    let mut live: std::collections::HashSet<ExprId> = std::collections::HashSet::new();
    ast.expr.visit(&mut |e| {
        live.insert(e.id);
    });
    ast.source_info.macro_calls.retain(|id, _| live.contains(id));
    ast
}

fn literal_value(e: &Expr) -> Option<&Value> {
    match &e.kind {
        ExprKind::Literal(v) => Some(v),
        _ => None,
    }
}

fn fold_expr(env: &Env, e: Expr) -> Expr {
    let Expr { id, kind } = e;
    match kind {
        ExprKind::Call {
            target,
            function,
            args,
        } => {
            let target = target.map(|t| Box::new(fold_expr(env, *t)));
            let args: Vec<Expr> = args.into_iter().map(|a| fold_expr(env, a)).collect();
            if let Some(v) = fold_call(env, target.as_deref(), &function, &args) {
                debug!("folded '{}' at node {} to a literal", function, id);
                return Expr::literal(id, v);
            }
            Expr::new(
                id,
                ExprKind::Call {
                    target,
                    function,
                    args,
                },
            )
        }
        ExprKind::List {
            elements,
            optional_indices,
        } => {
            let elements: Vec<Expr> = elements.into_iter().map(|a| fold_expr(env, a)).collect();
            if optional_indices.is_empty() {
                if let Some(values) = elements
                    .iter()
                    .map(|el| literal_value(el).cloned())
                    .collect::<Option<Vec<Value>>>()
                {
                    return Expr::literal(id, Value::list(values));
                }
            }
            Expr::new(
                id,
                ExprKind::List {
                    elements,
                    optional_indices,
                },
            )
        }
        ExprKind::Map { entries } => {
            let entries: Vec<crate::ast::MapEntryExpr> = entries
                .into_iter()
                .map(|mut en| {
                    en.key = fold_expr(env, en.key);
                    en.value = fold_expr(env, en.value);
                    en
                })
                .collect();
            let foldable = entries.iter().all(|en| {
                !en.optional
                    && literal_value(&en.key).is_some()
                    && literal_value(&en.value).is_some()
            });
            if foldable {
                let mut m = CelMap::new();
                let mut ok = true;
                for en in &entries {
                    let key = literal_value(&en.key).cloned().unwrap_or(Value::Null);
                    let value = literal_value(&en.value).cloned().unwrap_or(Value::Null);
                    match MapKey::for_insert(&key) {
                        Ok(k) => {
                            if !m.insert(k, value) {
                                ok = false;
                                break;
                            }
                        }
                        Err(_) => {
                            ok = false;
                            break;
                        }
                    }
                }
                if ok {
                    return Expr::literal(id, Value::map(m));
                }
            }
            Expr::new(id, ExprKind::Map { entries })
        }
        ExprKind::Select {
            operand,
            field,
            test_only,
        } => Expr::new(
            id,
            ExprKind::Select {
                operand: Box::new(fold_expr(env, *operand)),
                field,
                test_only,
            },
        ),
        ExprKind::Struct { type_name, fields } => Expr::new(
            id,
            ExprKind::Struct {
                type_name,
                fields: fields
                    .into_iter()
                    .map(|mut f| {
                        f.value = fold_expr(env, f.value);
                        f
                    })
                    .collect(),
            },
        ),
        ExprKind::Comprehension(mut c) => {
            c.iter_range = fold_expr(env, c.iter_range);
            c.accu_init = fold_expr(env, c.accu_init);
            c.loop_condition = fold_expr(env, c.loop_condition);
            c.loop_step = fold_expr(env, c.loop_step);
            c.result = fold_expr(env, c.result);
            Expr::new(id, ExprKind::Comprehension(c))
        }
        other => Expr::new(id, other),
    }
}

/// Evaluate a call whose operands are all literals. Logical operators
/// fold with their absorbing semantics; everything else goes through
/// runtime dispatch. Calls that would produce errors are left in place.
fn fold_call(env: &Env, target: Option<&Expr>, function: &str, args: &[Expr]) -> Option<Value> {
    match function {
        operators::LOGICAL_AND | operators::LOGICAL_OR => {
            let absorbing = function == operators::LOGICAL_OR;
            let lits: Vec<Option<&Value>> = args.iter().map(literal_value).collect();
            if lits
                .iter()
                .any(|v| matches!(v, Some(Value::Bool(b)) if *b == absorbing))
            {
                return Some(Value::Bool(absorbing));
            }
            if let [Some(Value::Bool(a)), Some(Value::Bool(b))] = lits[..] {
                return Some(Value::Bool(if absorbing { *a || *b } else { *a && *b }));
            }
            None
        }
        operators::CONDITIONAL => match args.first().and_then(literal_value) {
            Some(Value::Bool(true)) => literal_value(&args[1]).cloned(),
            Some(Value::Bool(false)) => literal_value(&args[2]).cloned(),
            _ => None,
        },
        operators::BLOCK => None,
        _ => {
            let mut vals = Vec::new();
            if let Some(t) = target {
                vals.push(literal_value(t)?.clone());
            }
            for a in args {
                vals.push(literal_value(a)?.clone());
            }
            let overloads = env.function(function)?;
            let out = interp::dispatch(function, overloads, &vals, false);
            if out.is_error() || out.is_unknown() {
                None
            } else {
                Some(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::MapActivation;
    use crate::env::ProgramOptions;
    use crate::parser::parse;
    use crate::source::Source;
    use crate::types::CelType;
    use crate::unparser::unparse;

    fn env() -> Env {
        let mut env = Env::new();
        env.declare_variable("x", CelType::Int);
        env.declare_variable("req", CelType::map_of(CelType::String, CelType::Dyn));
        env
    }

    fn parse_ast(text: &str) -> Ast {
        parse(&Source::new(text)).expect("parse failed")
    }

    #[test]
    fn test_fold_collapses_constant_program() {
        let env = env();
        let checked = env.compile("1 + 2 * 3 == 7").unwrap();
        let folded = fold_constants(&env, &checked).unwrap();
        assert!(matches!(
            folded.ast.expr.kind,
            ExprKind::Literal(Value::Bool(true))
        ));
    }

    #[test]
    fn test_fold_preserves_dynamic_parts() {
        let env = env();
        let checked = env.compile("x + (2 * 3)").unwrap();
        let folded = fold_constants(&env, &checked).unwrap();
        match &folded.ast.expr.kind {
            ExprKind::Call { args, .. } => {
                assert!(matches!(&args[1].kind, ExprKind::Literal(Value::Int(6))));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fold_respects_absorbing_logic() {
        let env = env();
        // the error-producing side must not block folding when the
        // other side absorbs
        let checked = env.compile("false && (1 / 0 == 0)").unwrap();
        let folded = fold_constants(&env, &checked).unwrap();
        assert!(matches!(
            folded.ast.expr.kind,
            ExprKind::Literal(Value::Bool(false))
        ));

        // errors themselves never fold
        let checked = env.compile("1 / 0").unwrap();
        let folded = fold_constants(&env, &checked).unwrap();
        assert!(matches!(folded.ast.expr.kind, ExprKind::Call { .. }));
    }

    #[test]
    fn test_inline_single_reference_substitutes() {
        let env = env();
        let checked = env.compile("x + 1").unwrap();
        let vars = vec![InlineVariable::new("x", parse_ast("2 * 3"))];
        let inlined = inline_variables(&env, &checked, vars).unwrap();
        // after substitution, folding collapses everything
        assert!(matches!(
            inlined.ast.expr.kind,
            ExprKind::Literal(Value::Int(7))
        ));
    }

    #[test]
    fn test_inline_repeated_reference_introduces_bind() {
        let env = env();
        let checked = env.compile("x + x").unwrap();
        // a replacement referenced twice must evaluate once, via bind
        let vars = vec![InlineVariable::new("x", parse_ast("int(req[\"n\"])"))];
        let inlined = inline_variables(&env, &checked, vars).unwrap();
        assert!(matches!(
            inlined.ast.expr.kind,
            ExprKind::Comprehension(_)
        ));
        let text = unparse(&inlined.ast);
        assert!(text.contains("cel.bind("), "expected bind in '{}'", text);

        let program = env.plan(&inlined, ProgramOptions::default()).unwrap();
        let mut m = crate::value::CelMap::new();
        m.insert(MapKey::String("n".into()), Value::Int(21));
        let act = MapActivation::new().bind_value("req", Value::map(m));
        assert!(matches!(program.eval(&act), Value::Int(42)));
    }

    #[test]
    fn test_inlining_preserves_meaning() {
        let env = env();
        let checked = env.compile("x * 2").unwrap();
        let vars = vec![InlineVariable::new("x", parse_ast("3 + 4"))];
        let inlined = inline_variables(&env, &checked, vars).unwrap();

        let direct = env.compile("(3 + 4) * 2").unwrap();
        let p1 = env.plan(&inlined, ProgramOptions::default()).unwrap();
        let p2 = env.plan(&direct, ProgramOptions::default()).unwrap();
        let act = MapActivation::new();
        assert!(p1.eval(&act).equal(&p2.eval(&act)).is_true());
    }

    #[test]
    fn test_nullable_presence_rewrite() {
        let mut env = Env::new();
        env.declare_variable("w", CelType::Dyn);
        env.declare_variable("m", CelType::map_of(CelType::String, CelType::Dyn));
        let checked = env.compile("has(w.field) ? 1 : 0").unwrap();
        // inline w.field as a nullable wrapper read
        let vars =
            vec![InlineVariable::new("w.field", parse_ast("m[\"field\"]")).nullable()];
        let inlined = inline_variables(&env, &checked, vars).unwrap();
        let text = unparse(&inlined.ast);
        assert!(text.contains("!= null"), "expected null check in '{}'", text);
    }
}
