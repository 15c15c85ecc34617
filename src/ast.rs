// ABOUTME: Abstract syntax tree: expression nodes, source info, id bookkeeping

use crate::types::CelType;
use crate::value::Value;
use std::collections::HashMap;

pub type ExprId = u64;

/// Internal function names for the built-in operators. Operators parse
/// to ordinary call nodes under these names; the planner and unparser
/// recognize them specially.
pub mod operators {
    pub const LOGICAL_AND: &str = "_&&_";
    pub const LOGICAL_OR: &str = "_||_";
    pub const LOGICAL_NOT: &str = "!_";
    pub const NEGATE: &str = "-_";
    pub const EQUALS: &str = "_==_";
    pub const NOT_EQUALS: &str = "_!=_";
    pub const LESS: &str = "_<_";
    pub const LESS_EQUALS: &str = "_<=_";
    pub const GREATER: &str = "_>_";
    pub const GREATER_EQUALS: &str = "_>=_";
    pub const ADD: &str = "_+_";
    pub const SUBTRACT: &str = "_-_";
    pub const MULTIPLY: &str = "_*_";
    pub const DIVIDE: &str = "_/_";
    pub const MODULO: &str = "_%_";
    pub const INDEX: &str = "_[_]_";
    pub const CONDITIONAL: &str = "_?_:_";
    pub const IN: &str = "@in";
    pub const NOT_STRICTLY_FALSE: &str = "@not_strictly_false";
    pub const BLOCK: &str = "cel.@block";

    /// Accumulator variable name used by the comprehension macros.
    pub const ACCU_VAR: &str = "__result__";

    /// Display symbol and precedence for a binary operator name, used by
    /// the unparser. Higher binds tighter.
    pub fn binary_symbol(function: &str) -> Option<(&'static str, u8)> {
        match function {
            LOGICAL_OR => Some(("||", 1)),
            LOGICAL_AND => Some(("&&", 2)),
            EQUALS => Some(("==", 3)),
            NOT_EQUALS => Some(("!=", 3)),
            LESS => Some(("<", 3)),
            LESS_EQUALS => Some(("<=", 3)),
            GREATER => Some((">", 3)),
            GREATER_EQUALS => Some((">=", 3)),
            IN => Some(("in", 3)),
            ADD => Some(("+", 4)),
            SUBTRACT => Some(("-", 4)),
            MULTIPLY => Some(("*", 5)),
            DIVIDE => Some(("/", 5)),
            MODULO => Some(("%", 5)),
            _ => None,
        }
    }
}

/// One expression node. Every node carries a unique positive identifier
/// drawn from a monotonically increasing counter; identifiers are never
/// reused within one AST.
#[derive(Debug, Clone)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Value),
    Ident(String),
    Select {
        operand: Box<Expr>,
        field: String,
        /// Set for the expansion of `has(expr.field)`: the select tests
        /// presence instead of producing the field value.
        test_only: bool,
    },
    Call {
        /// Receiver for member-style calls, absent for global calls.
        target: Option<Box<Expr>>,
        function: String,
        args: Vec<Expr>,
    },
    List {
        elements: Vec<Expr>,
        /// Indices of elements written with the optional marker `?`.
        optional_indices: Vec<usize>,
    },
    Map {
        entries: Vec<MapEntryExpr>,
    },
    Struct {
        type_name: String,
        fields: Vec<StructFieldExpr>,
    },
    Comprehension(Box<ComprehensionExpr>),
}

#[derive(Debug, Clone)]
pub struct MapEntryExpr {
    pub id: ExprId,
    pub key: Expr,
    pub value: Expr,
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub struct StructFieldExpr {
    pub id: ExprId,
    pub field: String,
    pub value: Expr,
    pub optional: bool,
}

/// A bounded fold over an iterable: the expansion target of the `all`,
/// `exists`, `exists_one`, `filter`, `map`, and `cel.bind` macros.
#[derive(Debug, Clone)]
pub struct ComprehensionExpr {
    pub iter_var: String,
    pub iter_range: Expr,
    pub accu_var: String,
    pub accu_init: Expr,
    pub loop_condition: Expr,
    pub loop_step: Expr,
    pub result: Expr,
}

impl Expr {
    pub fn new(id: ExprId, kind: ExprKind) -> Expr {
        Expr { id, kind }
    }

    pub fn literal(id: ExprId, v: Value) -> Expr {
        Expr::new(id, ExprKind::Literal(v))
    }

    pub fn ident(id: ExprId, name: impl Into<String>) -> Expr {
        Expr::new(id, ExprKind::Ident(name.into()))
    }

    pub fn call(id: ExprId, function: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::new(
            id,
            ExprKind::Call {
                target: None,
                function: function.into(),
                args,
            },
        )
    }

    pub fn member_call(
        id: ExprId,
        target: Expr,
        function: impl Into<String>,
        args: Vec<Expr>,
    ) -> Expr {
        Expr::new(
            id,
            ExprKind::Call {
                target: Some(Box::new(target)),
                function: function.into(),
                args,
            },
        )
    }

    pub fn select(id: ExprId, operand: Expr, field: impl Into<String>) -> Expr {
        Expr::new(
            id,
            ExprKind::Select {
                operand: Box::new(operand),
                field: field.into(),
                test_only: false,
            },
        )
    }

    /// Direct child expressions, in evaluation-relevant order.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Ident(_) => Vec::new(),
            ExprKind::Select { operand, .. } => vec![operand],
            ExprKind::Call { target, args, .. } => {
                let mut out: Vec<&Expr> = Vec::new();
                if let Some(t) = target {
                    out.push(t);
                }
                out.extend(args.iter());
                out
            }
            ExprKind::List { elements, .. } => elements.iter().collect(),
            ExprKind::Map { entries } => {
                let mut out = Vec::new();
                for e in entries {
                    out.push(&e.key);
                    out.push(&e.value);
                }
                out
            }
            ExprKind::Struct { fields, .. } => fields.iter().map(|f| &f.value).collect(),
            ExprKind::Comprehension(c) => vec![
                &c.iter_range,
                &c.accu_init,
                &c.loop_condition,
                &c.loop_step,
                &c.result,
            ],
        }
    }

    /// Pre-order traversal over this node and all descendants.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Largest id in the subtree, for id-generator handoff.
    pub fn max_id(&self) -> ExprId {
        let mut max = 0;
        self.visit(&mut |e| {
            if e.id > max {
                max = e.id;
            }
        });
        max
    }
}

/// Side table produced by the parser: byte offset per node, and the
/// original pre-expansion call per macro expansion, keyed by the id of
/// the node the macro expanded into.
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    pub positions: HashMap<ExprId, u32>,
    pub macro_calls: HashMap<ExprId, Expr>,
}

/// Monotone id generator. Ids start at 1; 0 never names a node.
#[derive(Debug, Clone, Default)]
pub struct IdGen {
    next: ExprId,
}

impl IdGen {
    pub fn new() -> Self {
        IdGen { next: 0 }
    }

    /// Start above an existing AST's ids, for composition.
    pub fn starting_after(max_id: ExprId) -> Self {
        IdGen { next: max_id }
    }

    pub fn next_id(&mut self) -> ExprId {
        self.next += 1;
        self.next
    }
}

/// A parsed expression plus its source side-table.
#[derive(Debug, Clone)]
pub struct Ast {
    pub expr: Expr,
    pub source_info: SourceInfo,
}

impl Ast {
    /// Shift every node id in the AST (including source-info keys and
    /// macro-call subtrees) by a fixed offset. Used when stitching
    /// independently parsed expressions into one tree.
    pub fn offset_ids(&mut self, offset: u64) {
        if offset == 0 {
            return;
        }
        offset_expr(&mut self.expr, offset);
        let positions = std::mem::take(&mut self.source_info.positions);
        self.source_info.positions = positions.into_iter().map(|(k, v)| (k + offset, v)).collect();
        let macros = std::mem::take(&mut self.source_info.macro_calls);
        self.source_info.macro_calls = macros
            .into_iter()
            .map(|(k, mut e)| {
                offset_expr(&mut e, offset);
                (k + offset, e)
            })
            .collect();
    }
}

fn offset_expr(expr: &mut Expr, offset: u64) {
    expr.id += offset;
    match &mut expr.kind {
        ExprKind::Literal(_) | ExprKind::Ident(_) => {}
        ExprKind::Select { operand, .. } => offset_expr(operand, offset),
        ExprKind::Call { target, args, .. } => {
            if let Some(t) = target {
                offset_expr(t, offset);
            }
            for a in args {
                offset_expr(a, offset);
            }
        }
        ExprKind::List { elements, .. } => {
            for e in elements {
                offset_expr(e, offset);
            }
        }
        ExprKind::Map { entries } => {
            for e in entries {
                e.id += offset;
                offset_expr(&mut e.key, offset);
                offset_expr(&mut e.value, offset);
            }
        }
        ExprKind::Struct { fields, .. } => {
            for f in fields {
                f.id += offset;
                offset_expr(&mut f.value, offset);
            }
        }
        ExprKind::Comprehension(c) => {
            offset_expr(&mut c.iter_range, offset);
            offset_expr(&mut c.accu_init, offset);
            offset_expr(&mut c.loop_condition, offset);
            offset_expr(&mut c.loop_step, offset);
            offset_expr(&mut c.result, offset);
        }
    }
}

/// A resolved reference: the declared name an identifier resolved to,
/// the candidate overload ids for a call, or the constant value of an
/// enum reference.
#[derive(Debug, Clone, Default)]
pub struct Reference {
    pub name: String,
    pub overload_ids: Vec<String>,
    pub value: Option<Value>,
}

/// Output of the checker: the AST plus a type for every node and a
/// reference for every resolved identifier and call.
#[derive(Debug, Clone)]
pub struct CheckedAst {
    pub ast: Ast,
    pub types: HashMap<ExprId, CelType>,
    pub references: HashMap<ExprId, Reference>,
}

impl CheckedAst {
    pub fn result_type(&self) -> CelType {
        self.types
            .get(&self.ast.expr.id)
            .cloned()
            .unwrap_or(CelType::Dyn)
    }
}
