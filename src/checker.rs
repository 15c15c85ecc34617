// ABOUTME: Type checker: assigns a type to every node, resolves identifiers and overloads

use crate::ast::{operators, Ast, CheckedAst, Expr, ExprId, ExprKind, Reference};
use crate::env::Env;
use crate::error::{CelError, Diagnostic, DiagnosticSet};
use crate::functions::Overload;
use crate::types::CelType;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Check an AST against an environment: every node receives a type,
/// every identifier resolves to a declared variable, enum constant, or
/// type, and every call selects its candidate overloads. Ill-typed
/// programs are rejected with diagnostics.
pub fn check(env: &Env, ast: &Ast) -> Result<CheckedAst, CelError> {
    let mut checker = Checker {
        env,
        positions: &ast.source_info.positions,
        types: HashMap::new(),
        references: HashMap::new(),
        diags: DiagnosticSet::new(),
        scopes: Vec::new(),
    };
    checker.check_expr(&ast.expr);
    if !checker.diags.is_empty() {
        return Err(CelError::Check(checker.diags));
    }
    Ok(CheckedAst {
        ast: ast.clone(),
        types: checker.types,
        references: checker.references,
    })
}

/// Built-in type names resolvable as identifiers, e.g. `type(x) == int`.
fn builtin_type(name: &str) -> Option<CelType> {
    match name {
        "bool" => Some(CelType::Bool),
        "int" => Some(CelType::Int),
        "uint" => Some(CelType::Uint),
        "double" => Some(CelType::Double),
        "string" => Some(CelType::String),
        "bytes" => Some(CelType::Bytes),
        "list" => Some(CelType::list_of(CelType::Dyn)),
        "map" => Some(CelType::map_of(CelType::Dyn, CelType::Dyn)),
        "null_type" => Some(CelType::Null),
        "type" => Some(CelType::type_of(CelType::Dyn)),
        "dyn" => Some(CelType::Dyn),
        "google.protobuf.Duration" => Some(CelType::Duration),
        "google.protobuf.Timestamp" => Some(CelType::Timestamp),
        _ => None,
    }
}

fn is_bool_like(t: &CelType) -> bool {
    matches!(
        t,
        CelType::Bool | CelType::Dyn | CelType::Error | CelType::TypeParam(_)
    )
}

/// Unify a declared parameter type with an inferred argument type,
/// binding free type parameters along the way.
fn is_assignable(sub: &mut HashMap<String, CelType>, param: &CelType, arg: &CelType) -> bool {
    match (param, arg) {
        (CelType::TypeParam(name), _) => match sub.get(name.as_ref()).cloned() {
            Some(bound) => {
                if &bound == arg || arg.is_dyn() || bound.is_dyn() {
                    if &bound != arg {
                        sub.insert(name.to_string(), CelType::Dyn);
                    }
                    true
                } else {
                    false
                }
            }
            None => {
                sub.insert(name.to_string(), arg.clone());
                true
            }
        },
        (CelType::Dyn, _) => true,
        (_, CelType::Dyn) => true,
        (_, CelType::Error) => true,
        (_, CelType::TypeParam(_)) => true,
        (CelType::List(p), CelType::List(a)) => is_assignable(sub, p, a),
        (CelType::Map(pk, pv), CelType::Map(ak, av)) => {
            is_assignable(sub, pk, ak) && is_assignable(sub, pv, av)
        }
        (CelType::Optional(p), CelType::Optional(a)) => is_assignable(sub, p, a),
        (CelType::Type(p), CelType::Type(a)) => is_assignable(sub, p, a),
        _ => param == arg,
    }
}

fn substitute(t: &CelType, sub: &HashMap<String, CelType>) -> CelType {
    match t {
        CelType::TypeParam(name) => sub.get(name.as_ref()).cloned().unwrap_or(CelType::Dyn),
        CelType::List(e) => CelType::list_of(substitute(e, sub)),
        CelType::Map(k, v) => CelType::map_of(substitute(k, sub), substitute(v, sub)),
        CelType::Optional(e) => CelType::optional_of(substitute(e, sub)),
        CelType::Type(e) => CelType::type_of(substitute(e, sub)),
        other => other.clone(),
    }
}

/// The dotted name of a pure identifier chain, or None once anything
/// other than idents and selects appears.
fn qualified_name(e: &Expr) -> Option<String> {
    match &e.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        ExprKind::Select {
            operand,
            field,
            test_only: false,
        } => qualified_name(operand).map(|q| format!("{}.{}", q, field)),
        _ => None,
    }
}

struct Checker<'a> {
    env: &'a Env,
    positions: &'a HashMap<ExprId, u32>,
    types: HashMap<ExprId, CelType>,
    references: HashMap<ExprId, Reference>,
    diags: DiagnosticSet,
    scopes: Vec<(String, CelType)>,
}

impl Checker<'_> {
    fn pos(&self, id: ExprId) -> u32 {
        self.positions.get(&id).copied().unwrap_or(0)
    }

    fn error(&mut self, id: ExprId, message: impl Into<String>) {
        let at = self.pos(id);
        self.diags.push(Diagnostic::error(message, at, at + 1));
    }

    fn assign(&mut self, id: ExprId, t: CelType) -> CelType {
        self.types.insert(id, t.clone());
        t
    }

    fn scope_lookup(&self, name: &str) -> Option<CelType> {
        self.scopes
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
    }

    fn check_expr(&mut self, e: &Expr) -> CelType {
        let t = match &e.kind {
            ExprKind::Literal(v) => v.type_of(),
            ExprKind::Ident(name) => self.check_ident(e.id, name),
            ExprKind::Select {
                operand,
                field,
                test_only,
            } => self.check_select(e, operand, field, *test_only),
            ExprKind::Call {
                target,
                function,
                args,
            } => self.check_call(e, target.as_deref(), function, args),
            ExprKind::List {
                elements,
                optional_indices,
            } => self.check_list(e.id, elements, optional_indices),
            ExprKind::Map { entries } => self.check_map(e.id, entries),
            ExprKind::Struct { type_name, fields } => self.check_struct(e.id, type_name, fields),
            ExprKind::Comprehension(c) => self.check_comprehension(c),
        };
        self.assign(e.id, t)
    }

    fn check_ident(&mut self, id: ExprId, name: &str) -> CelType {
        if let Some(t) = self.scope_lookup(name) {
            self.references.insert(
                id,
                Reference {
                    name: name.to_string(),
                    ..Reference::default()
                },
            );
            return t;
        }
        if let Some(t) = self.resolve_qualified(id, name) {
            return t;
        }
        self.error(id, format!("undeclared reference to '{}'", name));
        CelType::Error
    }

    /// Resolve a (possibly dotted) name through the container search
    /// path: declared variables first, then enum constants, then type
    /// names.
    fn resolve_qualified(&mut self, id: ExprId, name: &str) -> Option<CelType> {
        for candidate in self.env.candidate_names(name) {
            if let Some(t) = self.env.variable(&candidate) {
                self.references.insert(
                    id,
                    Reference {
                        name: candidate,
                        ..Reference::default()
                    },
                );
                return Some(t.clone());
            }
            if let Some(v) = self.env.provider().resolve_enum(&candidate) {
                self.references.insert(
                    id,
                    Reference {
                        name: candidate,
                        value: Some(Value::Int(v)),
                        ..Reference::default()
                    },
                );
                return Some(CelType::Int);
            }
            let named = builtin_type(&candidate)
                .or_else(|| self.env.provider().resolve_type(&candidate));
            if let Some(t) = named {
                self.references.insert(
                    id,
                    Reference {
                        name: candidate,
                        ..Reference::default()
                    },
                );
                return Some(CelType::type_of(t));
            }
        }
        None
    }

    fn check_select(
        &mut self,
        e: &Expr,
        operand: &Expr,
        field: &str,
        test_only: bool,
    ) -> CelType {
        // A dotted identifier chain may be a namespaced variable, enum
        // constant, or type; namespace resolution wins over field
        // access.
        if !test_only {
            if let Some(q) = qualified_name(e) {
                if let Some(t) = self.resolve_qualified(e.id, &q) {
                    // The operand chain is not evaluated in this case,
                    // but every node still needs a type.
                    self.type_operand_chain(operand);
                    return t;
                }
            }
        }
        let operand_t = self.check_expr(operand);
        let field_t = match &operand_t {
            CelType::Dyn | CelType::TypeParam(_) => CelType::Dyn,
            CelType::Error => CelType::Error,
            CelType::Map(_, v) => (**v).clone(),
            CelType::Object(name) => {
                match self.env.provider().field_type(name, field) {
                    Some(t) => t,
                    None => {
                        self.error(e.id, format!("undefined field '{}' on {}", field, name));
                        CelType::Error
                    }
                }
            }
            other => {
                self.error(
                    e.id,
                    format!("type '{}' does not support field selection", other),
                );
                CelType::Error
            }
        };
        if test_only {
            CelType::Bool
        } else {
            field_t
        }
    }

    fn type_operand_chain(&mut self, e: &Expr) {
        self.types.insert(e.id, CelType::Dyn);
        if let ExprKind::Select { operand, .. } = &e.kind {
            self.type_operand_chain(operand);
        }
    }

    fn check_call(
        &mut self,
        e: &Expr,
        target: Option<&Expr>,
        function: &str,
        args: &[Expr],
    ) -> CelType {
        // Structural operators first.
        match function {
            operators::LOGICAL_AND | operators::LOGICAL_OR => {
                for arg in args {
                    let t = self.check_expr(arg);
                    if !is_bool_like(&t) {
                        self.error(arg.id, format!("expected bool operand, found '{}'", t));
                    }
                }
                return CelType::Bool;
            }
            operators::CONDITIONAL if args.len() == 3 => {
                let cond_t = self.check_expr(&args[0]);
                if !is_bool_like(&cond_t) {
                    self.error(args[0].id, format!("expected bool condition, found '{}'", cond_t));
                }
                let t = self.check_expr(&args[1]);
                let f = self.check_expr(&args[2]);
                return t.join(&f);
            }
            operators::BLOCK => {
                return self.check_block(e, args);
            }
            _ => {}
        }

        // A member call on a pure identifier chain may be a namespaced
        // global function, e.g. `optional.of(x)`.
        let mut resolved_name = function.to_string();
        let mut target = target;
        if let Some(t) = target {
            if let Some(q) = qualified_name(t) {
                let dotted = format!("{}.{}", q, function);
                if self.env.function(&dotted).is_some() {
                    self.type_operand_chain(t);
                    resolved_name = dotted;
                    target = None;
                }
            }
        }

        let mut arg_types = Vec::new();
        if let Some(t) = target {
            arg_types.push(self.check_expr(t));
        }
        for arg in args {
            arg_types.push(self.check_expr(arg));
        }

        let member_style = target.is_some();
        let overloads = match self.env.function(&resolved_name) {
            Some(ovs) => ovs.clone(),
            None => {
                self.error(e.id, format!("undeclared function '{}'", resolved_name));
                return CelType::Error;
            }
        };

        self.select_overloads(e.id, &resolved_name, &overloads, &arg_types, member_style)
    }

    fn select_overloads(
        &mut self,
        id: ExprId,
        function: &str,
        overloads: &[Arc<Overload>],
        arg_types: &[CelType],
        member_style: bool,
    ) -> CelType {
        let mut matched: Vec<(&Arc<Overload>, CelType)> = Vec::new();
        for ov in overloads {
            if ov.member_style != member_style || ov.params.len() != arg_types.len() {
                continue;
            }
            let mut sub: HashMap<String, CelType> = HashMap::new();
            let ok = ov
                .params
                .iter()
                .zip(arg_types.iter())
                .all(|(p, a)| is_assignable(&mut sub, p, a));
            if ok {
                matched.push((ov, substitute(&ov.result, &sub)));
            }
        }
        if matched.is_empty() {
            if arg_types.iter().any(|t| matches!(t, CelType::Error)) {
                return CelType::Error;
            }
            let shown: Vec<String> = arg_types.iter().map(|t| t.to_string()).collect();
            self.error(
                id,
                format!(
                    "found no matching overload for '{}' applied to ({})",
                    function,
                    shown.join(", ")
                ),
            );
            return CelType::Error;
        }
        if matched.len() > 1 {
            let concrete = arg_types
                .iter()
                .all(|t| !t.is_dyn() && !t.has_type_params() && !matches!(t, CelType::Error));
            let mut results = matched.iter().map(|(_, r)| r.clone());
            let first = results.next().unwrap_or(CelType::Dyn);
            let joined = results.fold(first, |acc, r| acc.join(&r));
            if concrete && joined.is_dyn() {
                self.error(id, format!("ambiguous overloads for '{}'", function));
            }
            self.references.insert(
                id,
                Reference {
                    name: function.to_string(),
                    overload_ids: matched.iter().map(|(o, _)| o.id.clone()).collect(),
                    value: None,
                },
            );
            return joined;
        }
        let (ov, result) = &matched[0];
        self.references.insert(
            id,
            Reference {
                name: function.to_string(),
                overload_ids: vec![ov.id.clone()],
                value: None,
            },
        );
        result.clone()
    }

    /// `cel.@block([init0, init1, ...], body)`: each init may reference
    /// earlier indexed locals; the body sees all of them.
    fn check_block(&mut self, e: &Expr, args: &[Expr]) -> CelType {
        if args.len() != 2 {
            self.error(e.id, "cel.@block expects an init list and a body");
            return CelType::Error;
        }
        let inits = match &args[0].kind {
            ExprKind::List { elements, .. } => elements,
            _ => {
                self.error(args[0].id, "cel.@block inits must be a list literal");
                return CelType::Error;
            }
        };
        let depth = self.scopes.len();
        for (i, init) in inits.iter().enumerate() {
            let t = self.check_expr(init);
            self.scopes.push((format!("@index{}", i), t));
        }
        self.types.insert(args[0].id, CelType::list_of(CelType::Dyn));
        let body_t = self.check_expr(&args[1]);
        self.scopes.truncate(depth);
        body_t
    }

    fn check_list(
        &mut self,
        _id: ExprId,
        elements: &[Expr],
        optional_indices: &[usize],
    ) -> CelType {
        let mut elem_t: Option<CelType> = None;
        for (i, el) in elements.iter().enumerate() {
            let mut t = self.check_expr(el);
            if optional_indices.contains(&i) {
                match t {
                    CelType::Optional(inner) => t = *inner,
                    CelType::Dyn | CelType::Error => {}
                    other => {
                        self.error(
                            el.id,
                            format!("optional list entry must be optional, found '{}'", other),
                        );
                        t = CelType::Error;
                    }
                }
            }
            elem_t = Some(match elem_t {
                Some(prev) => prev.join(&t),
                None => t,
            });
        }
        CelType::list_of(elem_t.unwrap_or(CelType::Dyn))
    }

    fn check_map(&mut self, _id: ExprId, entries: &[crate::ast::MapEntryExpr]) -> CelType {
        let mut key_t: Option<CelType> = None;
        let mut val_t: Option<CelType> = None;
        for entry in entries {
            let kt = self.check_expr(&entry.key);
            if !kt.is_valid_map_key() && !matches!(kt, CelType::Error | CelType::TypeParam(_)) {
                self.error(entry.key.id, format!("'{}' is not a valid map key type", kt));
            }
            let mut vt = self.check_expr(&entry.value);
            if entry.optional {
                match vt {
                    CelType::Optional(inner) => vt = *inner,
                    CelType::Dyn | CelType::Error => {}
                    other => {
                        self.error(
                            entry.value.id,
                            format!("optional map entry must be optional, found '{}'", other),
                        );
                        vt = CelType::Error;
                    }
                }
            }
            key_t = Some(match key_t {
                Some(prev) => prev.join(&kt),
                None => kt,
            });
            val_t = Some(match val_t {
                Some(prev) => prev.join(&vt),
                None => vt,
            });
        }
        CelType::map_of(key_t.unwrap_or(CelType::Dyn), val_t.unwrap_or(CelType::Dyn))
    }

    fn check_struct(
        &mut self,
        id: ExprId,
        type_name: &str,
        fields: &[crate::ast::StructFieldExpr],
    ) -> CelType {
        let mut resolved: Option<String> = None;
        for candidate in self.env.candidate_names(type_name) {
            if self.env.provider().resolve_type(&candidate).is_some() {
                resolved = Some(candidate);
                break;
            }
        }
        let resolved = match resolved {
            Some(r) => r,
            None => {
                self.error(id, format!("undeclared type '{}'", type_name));
                for f in fields {
                    self.check_expr(&f.value);
                }
                return CelType::Error;
            }
        };
        self.references.insert(
            id,
            Reference {
                name: resolved.clone(),
                ..Reference::default()
            },
        );
        for f in fields {
            let vt = self.check_expr(&f.value);
            match self.env.provider().field_type(&resolved, &f.field) {
                Some(declared) => {
                    let expected = if f.optional {
                        CelType::optional_of(declared)
                    } else {
                        declared
                    };
                    let mut sub = HashMap::new();
                    if !is_assignable(&mut sub, &expected, &vt) {
                        self.error(
                            f.id,
                            format!(
                                "cannot assign '{}' to field '{}' of type '{}'",
                                vt, f.field, expected
                            ),
                        );
                    }
                }
                None => {
                    self.error(f.id, format!("undefined field '{}' on {}", f.field, resolved));
                }
            }
        }
        CelType::object(&resolved)
    }

    fn check_comprehension(&mut self, c: &crate::ast::ComprehensionExpr) -> CelType {
        let range_t = self.check_expr(&c.iter_range);
        let iter_t = match &range_t {
            CelType::List(e) => (**e).clone(),
            CelType::Map(k, _) => (**k).clone(),
            CelType::Dyn | CelType::TypeParam(_) => CelType::Dyn,
            CelType::Error => CelType::Error,
            other => {
                self.error(
                    c.iter_range.id,
                    format!("expression of type '{}' cannot be the range of a comprehension", other),
                );
                CelType::Error
            }
        };
        let accu_t = self.check_expr(&c.accu_init);

        let depth = self.scopes.len();
        self.scopes.push((c.accu_var.clone(), accu_t.clone()));
        self.scopes.push((c.iter_var.clone(), iter_t));

        let cond_t = self.check_expr(&c.loop_condition);
        if !is_bool_like(&cond_t) {
            self.error(
                c.loop_condition.id,
                format!("comprehension condition must be bool, found '{}'", cond_t),
            );
        }
        let step_t = self.check_expr(&c.loop_step);

        // The accumulator's settled type is the join of init and step.
        self.scopes.truncate(depth);
        self.scopes.push((c.accu_var.clone(), accu_t.join(&step_t)));
        let result_t = self.check_expr(&c.result);
        self.scopes.truncate(depth);
        result_t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::source::Source;

    fn env() -> Env {
        let mut env = Env::new();
        env.declare_variable("x", CelType::Int);
        env.declare_variable("name", CelType::String);
        env.declare_variable("items", CelType::list_of(CelType::Int));
        env.declare_variable("attrs", CelType::map_of(CelType::String, CelType::Dyn));
        env
    }

    fn check_text(env: &Env, text: &str) -> Result<CheckedAst, CelError> {
        let ast = parse(&Source::new(text)).expect("parse failed");
        check(env, &ast)
    }

    #[test]
    fn test_literals_and_operators() {
        let env = env();
        let checked = check_text(&env, "x + 2").unwrap();
        assert_eq!(checked.result_type(), CelType::Int);

        let checked = check_text(&env, "x < 3 && name == 'a'").unwrap();
        assert_eq!(checked.result_type(), CelType::Bool);

        let checked = check_text(&env, "x > 1 ? 'big' : 'small'").unwrap();
        assert_eq!(checked.result_type(), CelType::String);
    }

    #[test]
    fn test_ternary_branch_join() {
        let env = env();
        let checked = check_text(&env, "x > 1 ? 1 : 'one'").unwrap();
        assert_eq!(checked.result_type(), CelType::Dyn);
    }

    #[test]
    fn test_undeclared_identifier() {
        let env = env();
        let err = check_text(&env, "missing + 1").unwrap_err();
        assert!(matches!(err, CelError::Check(_)));
    }

    #[test]
    fn test_overload_mismatch() {
        let env = env();
        assert!(check_text(&env, "x + name").is_err());
        assert!(check_text(&env, "1 < 'a'").is_err());
        assert!(check_text(&env, "!x").is_err());
    }

    #[test]
    fn test_cross_numeric_comparison_checks() {
        let env = env();
        assert!(check_text(&env, "x < 1.5").is_ok());
        assert!(check_text(&env, "2u >= x").is_ok());
    }

    #[test]
    fn test_list_and_index() {
        let env = env();
        let checked = check_text(&env, "items[0] + 1").unwrap();
        assert_eq!(checked.result_type(), CelType::Int);

        let checked = check_text(&env, "[1, 2, 3]").unwrap();
        assert_eq!(checked.result_type(), CelType::list_of(CelType::Int));

        let checked = check_text(&env, "[1, 'a']").unwrap();
        assert_eq!(checked.result_type(), CelType::list_of(CelType::Dyn));
    }

    #[test]
    fn test_map_key_type_enforced() {
        let env = env();
        assert!(check_text(&env, "{1.5: 'x'}").is_err());
        assert!(check_text(&env, "{'a': 1}").is_ok());
    }

    #[test]
    fn test_comprehension_types() {
        let env = env();
        let checked = check_text(&env, "items.all(i, i > 0)").unwrap();
        assert_eq!(checked.result_type(), CelType::Bool);

        let checked = check_text(&env, "items.map(i, i * 2)").unwrap();
        assert_eq!(checked.result_type(), CelType::list_of(CelType::Int));

        // the iteration variable is typed from the range
        assert!(check_text(&env, "items.all(i, i.field)").is_err());
    }

    #[test]
    fn test_bind_macro_checks() {
        let env = env();
        let checked = check_text(&env, "cel.bind(v, x + 1, v * v)").unwrap();
        assert_eq!(checked.result_type(), CelType::Int);
    }

    #[test]
    fn test_in_operator() {
        let env = env();
        let checked = check_text(&env, "x in items").unwrap();
        assert_eq!(checked.result_type(), CelType::Bool);
        assert!(check_text(&env, "x in 3").is_err());
    }

    #[test]
    fn test_type_idents() {
        let env = env();
        let checked = check_text(&env, "type(x) == int").unwrap();
        assert_eq!(checked.result_type(), CelType::Bool);
    }

    #[test]
    fn test_optional_functions() {
        let env = env();
        let checked = check_text(&env, "optional.of(x).orValue(0)").unwrap();
        assert_eq!(checked.result_type(), CelType::Int);

        let checked = check_text(&env, "optional.none().or(optional.of('a'))").unwrap();
        assert!(matches!(checked.result_type(), CelType::Optional(_)));
    }

    #[test]
    fn test_namespaced_variable_resolution() {
        let mut env = Env::new();
        env.set_container("acme.ns");
        env.declare_variable("acme.ns.a.b", CelType::String);
        env.declare_variable("a", CelType::map_of(CelType::String, CelType::Int));

        // namespace resolution wins over field selection
        let checked = check_text(&env, "a.b").unwrap();
        assert_eq!(checked.result_type(), CelType::String);
    }

    #[test]
    fn test_select_on_map_and_message() {
        let env = env();
        let checked = check_text(&env, "attrs.anything").unwrap();
        assert_eq!(checked.result_type(), CelType::Dyn);

        assert!(check_text(&env, "x.field").is_err());
    }
}
