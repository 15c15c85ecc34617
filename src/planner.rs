// ABOUTME: Planner: lowers a checked AST into an interpretable tree with decorators

use crate::ast::{operators, CheckedAst, Expr, ExprKind};
use crate::attributes::{Attr, Qualifier};
use crate::coverage::CoverageTracker;
use crate::decorators;
use crate::env::{Env, Program, ProgramOptions};
use crate::error::CelError;
use crate::interp::{FieldInterp, FoldInterp, Interp, MapEntryInterp};
use crate::types::CelType;
use crate::value::Value;
use log::debug;
use std::sync::Arc;

/// Lower a checked AST into an executable program. Decorators are
/// applied bottom-up per node in a fixed order: optimization and regex
/// pre-compilation first, then exhaustive-mode replacement, then
/// late-bind wrapping, with the observer outermost so it sees final
/// node shapes.
pub fn plan(env: &Env, checked: &CheckedAst, options: ProgramOptions) -> Result<Program, CelError> {
    let tracker = if options.track_coverage {
        Some(Arc::new(CoverageTracker::new()))
    } else {
        None
    };
    let mut planner = Planner {
        env,
        checked,
        options: &options,
        tracker: tracker.clone(),
    };
    let root = planner.plan_expr(&checked.ast.expr)?;
    debug!(
        "planned program: root={:?} optimize={} exhaustive={} late_bind={}",
        root, options.optimize, options.exhaustive, options.late_bind
    );
    Ok(Program {
        root,
        checked: Arc::new(checked.clone()),
        tracker,
    })
}

struct Planner<'a> {
    env: &'a Env,
    checked: &'a CheckedAst,
    options: &'a ProgramOptions,
    tracker: Option<Arc<CoverageTracker>>,
}

impl Planner<'_> {
    fn decorate(&self, node: Interp) -> Interp {
        let mut node = node;
        if self.options.optimize {
            node = decorators::optimize(node);
            node = decorators::compile_regex(node);
        }
        if self.options.exhaustive {
            node = decorators::exhaustive(node);
        }
        if self.options.late_bind {
            node = decorators::late_bind(node);
        }
        if let Some(tracker) = &self.tracker {
            node = decorators::observe(node, tracker.clone());
        }
        node
    }

    fn plan_expr(&mut self, e: &Expr) -> Result<Interp, CelError> {
        let node = match &e.kind {
            ExprKind::Literal(v) => Interp::Const {
                id: e.id,
                value: v.clone(),
            },
            ExprKind::Ident(name) => self.plan_ident(e, name)?,
            ExprKind::Select {
                operand,
                field,
                test_only,
            } => {
                if *test_only {
                    Interp::TestOnly {
                        id: e.id,
                        operand: Box::new(self.plan_expr(operand)?),
                        field: field.clone(),
                    }
                } else if self.checked.references.contains_key(&e.id) {
                    // The whole dotted chain resolved as one name.
                    self.plan_ident(e, field)?
                } else {
                    let qual = Qualifier::field(e.id, field);
                    self.plan_access(e, operand, qual)?
                }
            }
            ExprKind::Call {
                target,
                function,
                args,
            } => self.plan_call(e, target.as_deref(), function, args)?,
            ExprKind::List {
                elements,
                optional_indices,
            } => {
                let mut elems = Vec::with_capacity(elements.len());
                for el in elements {
                    elems.push(self.plan_expr(el)?);
                }
                Interp::MakeList {
                    id: e.id,
                    elems,
                    optional_indices: optional_indices.clone(),
                    max_size: self.options.max_collection_size,
                }
            }
            ExprKind::Map { entries } => {
                let mut planned = Vec::with_capacity(entries.len());
                for entry in entries {
                    planned.push(MapEntryInterp {
                        key: self.plan_expr(&entry.key)?,
                        value: self.plan_expr(&entry.value)?,
                        optional: entry.optional,
                    });
                }
                Interp::MakeMap {
                    id: e.id,
                    entries: planned,
                    max_size: self.options.max_collection_size,
                }
            }
            ExprKind::Struct { type_name, fields } => {
                let resolved = self
                    .checked
                    .references
                    .get(&e.id)
                    .map(|r| r.name.clone())
                    .unwrap_or_else(|| type_name.clone());
                let mut planned = Vec::with_capacity(fields.len());
                for f in fields {
                    planned.push(FieldInterp {
                        name: f.field.clone(),
                        value: self.plan_expr(&f.value)?,
                        optional: f.optional,
                    });
                }
                Interp::MakeStruct {
                    id: e.id,
                    type_name: resolved,
                    fields: planned,
                    provider: self.env.provider().clone(),
                }
            }
            ExprKind::Comprehension(c) => Interp::Fold(Box::new(FoldInterp {
                id: e.id,
                iter_var: c.iter_var.clone(),
                accu_var: c.accu_var.clone(),
                range: self.plan_expr(&c.iter_range)?,
                init: self.plan_expr(&c.accu_init)?,
                cond: self.plan_expr(&c.loop_condition)?,
                step: self.plan_expr(&c.loop_step)?,
                result: self.plan_expr(&c.result)?,
                exhaustive: false,
                max_iters: self.options.max_fold_iterations,
            })),
        };
        Ok(self.decorate(node))
    }

    /// Plan an identifier (or a dotted chain the checker resolved as a
    /// single name): enum constants and type names become constants,
    /// declared variables become absolute attributes, and anything left
    /// becomes a one-of attribute over the container candidates.
    fn plan_ident(&mut self, e: &Expr, syntactic: &str) -> Result<Interp, CelError> {
        if let Some(r) = self.checked.references.get(&e.id) {
            if let Some(v) = &r.value {
                return Ok(Interp::Const {
                    id: e.id,
                    value: v.clone(),
                });
            }
            if self.env.variable(&r.name).is_none() {
                if let Some(CelType::Type(inner)) = self.checked.types.get(&e.id) {
                    return Ok(Interp::Const {
                        id: e.id,
                        value: Value::Type((**inner).clone()),
                    });
                }
            }
            return Ok(Interp::Attr(Attr::absolute(e.id, vec![r.name.clone()])));
        }
        Ok(Interp::Attr(Attr::maybe(
            e.id,
            self.env.candidate_names(syntactic),
        )))
    }

    /// Plan a field or index access by extending the operand's
    /// attribute chain where possible, falling back to a relative
    /// attribute over the computed operand.
    fn plan_access(&mut self, e: &Expr, operand: &Expr, qual: Qualifier) -> Result<Interp, CelError> {
        let planned = self.plan_expr(operand)?;
        let mut attr = self.to_attr(e, planned);
        attr.add_qualifier(qual);
        Ok(Interp::Attr(attr))
    }

    fn to_attr(&self, e: &Expr, operand: Interp) -> Attr {
        match operand {
            Interp::Attr(a) => a,
            // A ternary operand becomes a conditional attribute so the
            // qualifier chain applies to whichever branch is selected.
            Interp::Ternary {
                id,
                cond,
                truthy,
                falsy,
                exhaustive: false,
            } if self.tracker.is_none() && !self.options.exhaustive => Attr::Conditional {
                id,
                cond,
                truthy: Box::new(self.interp_to_attr(id, *truthy)),
                falsy: Box::new(self.interp_to_attr(id, *falsy)),
            },
            other => Attr::relative(e.id, other),
        }
    }

    fn interp_to_attr(&self, id: crate::ast::ExprId, node: Interp) -> Attr {
        match node {
            Interp::Attr(a) => a,
            other => Attr::relative(id, other),
        }
    }

    fn plan_call(
        &mut self,
        e: &Expr,
        target: Option<&Expr>,
        function: &str,
        args: &[Expr],
    ) -> Result<Interp, CelError> {
        match function {
            operators::LOGICAL_AND if args.len() == 2 => {
                return Ok(Interp::And {
                    id: e.id,
                    lhs: Box::new(self.plan_expr(&args[0])?),
                    rhs: Box::new(self.plan_expr(&args[1])?),
                    exhaustive: false,
                });
            }
            operators::LOGICAL_OR if args.len() == 2 => {
                return Ok(Interp::Or {
                    id: e.id,
                    lhs: Box::new(self.plan_expr(&args[0])?),
                    rhs: Box::new(self.plan_expr(&args[1])?),
                    exhaustive: false,
                });
            }
            operators::CONDITIONAL if args.len() == 3 => {
                return Ok(Interp::Ternary {
                    id: e.id,
                    cond: Box::new(self.plan_expr(&args[0])?),
                    truthy: Box::new(self.plan_expr(&args[1])?),
                    falsy: Box::new(self.plan_expr(&args[2])?),
                    exhaustive: false,
                });
            }
            operators::BLOCK if args.len() == 2 => {
                let inits = match &args[0].kind {
                    ExprKind::List { elements, .. } => {
                        let mut planned = Vec::with_capacity(elements.len());
                        for el in elements {
                            planned.push(self.plan_expr(el)?);
                        }
                        planned
                    }
                    _ => {
                        return Err(CelError::plan(
                            "cel.@block requires a literal list of initializers",
                        ))
                    }
                };
                return Ok(Interp::Block {
                    id: e.id,
                    inits: Arc::new(inits),
                    body: Box::new(self.plan_expr(&args[1])?),
                });
            }
            operators::INDEX if args.len() == 2 => {
                let qual = match &args[1].kind {
                    ExprKind::Literal(v) => Qualifier::Const {
                        id: args[1].id,
                        value: v.clone(),
                    },
                    _ => Qualifier::Dynamic {
                        id: args[1].id,
                        node: Box::new(self.plan_expr(&args[1])?),
                    },
                };
                return self.plan_access(e, &args[0], qual);
            }
            _ => {}
        }

        let reference = self.checked.references.get(&e.id);
        let resolved = reference
            .map(|r| r.name.clone())
            .unwrap_or_else(|| function.to_string());
        // A dotted resolved name means the member call was a namespaced
        // global (`optional.of`); the syntactic target is not an
        // argument then.
        let rewritten = resolved != function;

        let mut planned_args = Vec::new();
        if let Some(t) = target {
            if !rewritten {
                planned_args.push(self.plan_expr(t)?);
            }
        }
        for a in args {
            planned_args.push(self.plan_expr(a)?);
        }

        let all = self
            .env
            .function(&resolved)
            .ok_or_else(|| CelError::plan(format!("no runtime function '{}'", resolved)))?;
        let wanted_ids: Vec<String> = reference
            .map(|r| r.overload_ids.clone())
            .unwrap_or_default();
        let overloads: Vec<_> = if wanted_ids.is_empty() {
            all.clone()
        } else {
            let selected: Vec<_> = all
                .iter()
                .filter(|o| wanted_ids.contains(&o.id))
                .cloned()
                .collect();
            if selected.is_empty() {
                all.clone()
            } else {
                selected
            }
        };
        let non_strict = overloads.iter().any(|o| o.non_strict);

        Ok(Interp::Call {
            id: e.id,
            function: resolved,
            overloads,
            args: planned_args,
            non_strict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{EmptyActivation, MapActivation};
    use crate::env::Env;

    fn program(env: &Env, text: &str) -> Program {
        let checked = env.compile(text).expect("compile failed");
        env.plan(&checked, ProgramOptions::default()).expect("plan failed")
    }

    #[test]
    fn test_plan_and_eval_arithmetic() {
        let env = Env::new();
        let p = program(&env, "1 + 2 * 3");
        assert!(matches!(p.eval(&EmptyActivation), Value::Int(7)));
    }

    #[test]
    fn test_plan_variables() {
        let mut env = Env::new();
        env.declare_variable("x", CelType::Int);
        let p = program(&env, "x * x");
        let act = MapActivation::new().bind("x", 6i64);
        assert!(matches!(p.eval(&act), Value::Int(36)));
    }

    #[test]
    fn test_constant_folding_produces_const_root() {
        let env = Env::new();
        let p = program(&env, "(1 + 2) in [3, 4]");
        // The whole expression folds: either to a const or an in-set
        // test over a constant; both evaluate without an activation.
        assert!(matches!(p.eval(&EmptyActivation), Value::Bool(true)));
    }

    #[test]
    fn test_index_via_attribute_chain() {
        let mut env = Env::new();
        env.declare_variable("rows", CelType::list_of(CelType::list_of(CelType::Int)));
        let p = program(&env, "rows[1][0]");
        let act = MapActivation::new().bind_value(
            "rows",
            Value::list(vec![
                Value::list(vec![Value::Int(1)]),
                Value::list(vec![Value::Int(9)]),
            ]),
        );
        assert!(matches!(p.eval(&act), Value::Int(9)));
    }

    #[test]
    fn test_member_function_call() {
        let mut env = Env::new();
        env.declare_variable("s", CelType::String);
        let p = program(&env, "s.startsWith('ab')");
        let act = MapActivation::new().bind("s", "abc");
        assert!(matches!(p.eval(&act), Value::Bool(true)));
    }
}
