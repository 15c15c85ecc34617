// ABOUTME: Expression parser: nom lexing, precedence climbing, parse-time macro expansion

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, hex_digit1, one_of},
    combinator::{opt, recognize},
    IResult, Parser as NomParser,
};

use crate::ast::{
    operators, Ast, ComprehensionExpr, Expr, ExprId, ExprKind, IdGen, MapEntryExpr, SourceInfo,
    StructFieldExpr,
};
use crate::error::{CelError, Diagnostic, DiagnosticSet};
use crate::source::Source;
use crate::value::Value;

/// Words reserved by the language that may not appear as identifiers.
const RESERVED: &[&str] = &[
    "as", "break", "const", "continue", "else", "for", "function", "if", "import", "in", "let",
    "loop", "package", "namespace", "return", "var", "void", "while",
];

const MAX_RECURSION_DEPTH: u32 = 200;

/// Parse an expression source into an AST with stable node identifiers
/// and a source-offset table. Macro calls are expanded in place and the
/// original call retained in the side table. Failures come back as
/// syntax diagnostics; parsing never panics.
pub fn parse(source: &Source) -> Result<Ast, CelError> {
    let mut p = Parser {
        len: source.content().len(),
        ids: IdGen::new(),
        info: SourceInfo::default(),
        depth: 0,
    };
    let input = source.content();
    match p.parse_expr(input) {
        Ok((rest, expr)) => {
            let rest = skip_ws(rest);
            if !rest.is_empty() {
                let at = p.pos(rest);
                return Err(syntax_error(Diagnostic::error(
                    format!("unexpected trailing input: '{}'", truncate(rest)),
                    at,
                    at + rest.len() as u32,
                )));
            }
            Ok(Ast {
                expr,
                source_info: p.info,
            })
        }
        Err(d) => Err(syntax_error(d)),
    }
}

fn syntax_error(d: Diagnostic) -> CelError {
    let mut set = DiagnosticSet::new();
    set.push(d);
    CelError::Syntax(set)
}

fn truncate(s: &str) -> &str {
    let end = s.char_indices().nth(20).map(|(i, _)| i).unwrap_or(s.len());
    &s[..end]
}

// ============================================================================
// Lexical layer (nom)
// ============================================================================

/// Skip whitespace and `//` line comments.
fn skip_ws(input: &str) -> &str {
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start();
        if let Some(comment) = trimmed.strip_prefix("//") {
            rest = match comment.find('\n') {
                Some(i) => &comment[i + 1..],
                None => "",
            };
        } else {
            return trimmed;
        }
    }
}

/// An identifier: letter or underscore, then letters, digits, underscores.
fn ident_token(input: &str) -> IResult<&str, &str> {
    recognize((
        one_of("abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_"),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

/// Lexes one numeric literal: decimal or hex integer (optionally
/// uint-suffixed), or a double with fraction and/or exponent.
fn number_token(input: &str) -> IResult<&str, &str> {
    alt((
        recognize((opt(char('-')), tag("0x"), hex_digit1, opt(one_of("uU")))),
        recognize((
            opt(char('-')),
            alt((
                recognize((digit1, char('.'), digit1, opt(exponent))),
                recognize((digit1, exponent)),
                recognize((char('.'), digit1, opt(exponent))),
                recognize(digit1),
            )),
            opt(one_of("uU")),
        )),
    ))
    .parse(input)
}

fn exponent(input: &str) -> IResult<&str, &str> {
    recognize((one_of("eE"), opt(one_of("+-")), digit1)).parse(input)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    len: usize,
    ids: IdGen,
    info: SourceInfo,
    depth: u32,
}

type PResult<'a, T> = Result<(&'a str, T), Diagnostic>;

impl Parser {
    fn pos(&self, rest: &str) -> u32 {
        (self.len - rest.len()) as u32
    }

    /// Mint an id for a node starting at `rest` and record its offset.
    fn node(&mut self, rest: &str) -> ExprId {
        let id = self.ids.next_id();
        self.info.positions.insert(id, self.pos(rest));
        id
    }

    fn err(&self, rest: &str, message: impl Into<String>) -> Diagnostic {
        let at = self.pos(rest);
        Diagnostic::error(message, at, at + 1)
    }

    fn expect<'a>(&self, input: &'a str, token: &str) -> PResult<'a, ()> {
        let input = skip_ws(input);
        match input.strip_prefix(token) {
            Some(rest) => Ok((rest, ())),
            None => Err(self.err(input, format!("expected '{}'", token))),
        }
    }

    fn enter(&mut self, input: &str) -> Result<(), Diagnostic> {
        self.depth += 1;
        if self.depth > MAX_RECURSION_DEPTH {
            return Err(self.err(input, "expression nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // --------------------------------------------------------------
    // Precedence levels
    // --------------------------------------------------------------

    /// Expr = ConditionalOr ['?' ConditionalOr ':' Expr]
    fn parse_expr<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        self.enter(input)?;
        let result = self.parse_expr_inner(input);
        self.leave();
        result
    }

    fn parse_expr_inner<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        let (rest, cond) = self.parse_or(input)?;
        let after = skip_ws(rest);
        if let Some(after_q) = after.strip_prefix('?') {
            let id = self.node(after);
            let (rest, truthy) = self.parse_or(after_q)?;
            let (rest, _) = self.expect(rest, ":")?;
            let (rest, falsy) = self.parse_expr(rest)?;
            return Ok((
                rest,
                Expr::call(id, operators::CONDITIONAL, vec![cond, truthy, falsy]),
            ));
        }
        Ok((rest, cond))
    }

    fn parse_or<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        let (mut rest, mut lhs) = self.parse_and(input)?;
        loop {
            let after = skip_ws(rest);
            if let Some(after_op) = after.strip_prefix("||") {
                let id = self.node(after);
                let (r, rhs) = self.parse_and(after_op)?;
                lhs = Expr::call(id, operators::LOGICAL_OR, vec![lhs, rhs]);
                rest = r;
            } else {
                return Ok((rest, lhs));
            }
        }
    }

    fn parse_and<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        let (mut rest, mut lhs) = self.parse_relation(input)?;
        loop {
            let after = skip_ws(rest);
            if let Some(after_op) = after.strip_prefix("&&") {
                let id = self.node(after);
                let (r, rhs) = self.parse_relation(after_op)?;
                lhs = Expr::call(id, operators::LOGICAL_AND, vec![lhs, rhs]);
                rest = r;
            } else {
                return Ok((rest, lhs));
            }
        }
    }

    fn parse_relation<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        let (mut rest, mut lhs) = self.parse_addition(input)?;
        loop {
            let after = skip_ws(rest);
            let (op, width) = if after.starts_with("<=") {
                (operators::LESS_EQUALS, 2)
            } else if after.starts_with(">=") {
                (operators::GREATER_EQUALS, 2)
            } else if after.starts_with("==") {
                (operators::EQUALS, 2)
            } else if after.starts_with("!=") {
                (operators::NOT_EQUALS, 2)
            } else if after.starts_with('<') {
                (operators::LESS, 1)
            } else if after.starts_with('>') {
                (operators::GREATER, 1)
            } else if is_keyword_at(after, "in") {
                (operators::IN, 2)
            } else {
                return Ok((rest, lhs));
            };
            let id = self.node(after);
            let (r, rhs) = self.parse_addition(&after[width..])?;
            lhs = Expr::call(id, op, vec![lhs, rhs]);
            rest = r;
        }
    }

    fn parse_addition<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        let (mut rest, mut lhs) = self.parse_multiplication(input)?;
        loop {
            let after = skip_ws(rest);
            let op = if after.starts_with('+') {
                operators::ADD
            } else if after.starts_with('-') {
                operators::SUBTRACT
            } else {
                return Ok((rest, lhs));
            };
            let id = self.node(after);
            let (r, rhs) = self.parse_multiplication(&after[1..])?;
            lhs = Expr::call(id, op, vec![lhs, rhs]);
            rest = r;
        }
    }

    fn parse_multiplication<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        let (mut rest, mut lhs) = self.parse_unary(input)?;
        loop {
            let after = skip_ws(rest);
            let op = if after.starts_with('*') {
                operators::MULTIPLY
            } else if after.starts_with('/') && !after.starts_with("//") {
                operators::DIVIDE
            } else if after.starts_with('%') {
                operators::MODULO
            } else {
                return Ok((rest, lhs));
            };
            let id = self.node(after);
            let (r, rhs) = self.parse_unary(&after[1..])?;
            lhs = Expr::call(id, op, vec![lhs, rhs]);
            rest = r;
        }
    }

    fn parse_unary<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        self.enter(input)?;
        let result = self.parse_unary_inner(input);
        self.leave();
        result
    }

    fn parse_unary_inner<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        let input = skip_ws(input);
        if let Some(rest) = input.strip_prefix('!') {
            if !rest.starts_with('=') {
                let id = self.node(input);
                let (rest, arg) = self.parse_unary(rest)?;
                return Ok((rest, Expr::call(id, operators::LOGICAL_NOT, vec![arg])));
            }
        }
        if let Some(rest) = input.strip_prefix('-') {
            // A minus glued to a digit is a signed literal; anything else
            // is arithmetic negation.
            if rest.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
                return self.parse_member(input);
            }
            let id = self.node(input);
            let (rest, arg) = self.parse_unary(rest)?;
            return Ok((rest, Expr::call(id, operators::NEGATE, vec![arg])));
        }
        self.parse_member(input)
    }

    // --------------------------------------------------------------
    // Member chains: selects, member calls, indexing, struct literals
    // --------------------------------------------------------------

    fn parse_member<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        let (mut rest, (mut expr, mut chain)) = self.parse_primary(input)?;
        loop {
            let after = skip_ws(rest);
            if after.starts_with('.') && !after[1..].starts_with(|c: char| c.is_ascii_digit()) {
                let after_dot = skip_ws(&after[1..]);
                let (r, name) = match ident_token(after_dot) {
                    Ok((r, name)) => (r, name),
                    Err(_) => return Err(self.err(after_dot, "expected field or method name")),
                };
                let peeked = skip_ws(r);
                if peeked.starts_with('(') {
                    let (r2, args) = self.parse_call_args(peeked)?;
                    let call_start = after;
                    expr = self.expand_member_call(call_start, expr, name, args)?;
                    chain = None;
                    rest = r2;
                } else {
                    let qualified = chain.take().map(|c| format!("{}.{}", c, name));
                    let struct_peek = skip_ws(r);
                    if struct_peek.starts_with('{') && qualified.is_some() {
                        let (r2, e) = self.parse_struct(struct_peek, qualified.unwrap())?;
                        expr = e;
                        chain = None;
                        rest = r2;
                    } else {
                        let id = self.node(after);
                        expr = Expr::select(id, expr, name);
                        chain = qualified;
                        rest = r;
                    }
                }
            } else if after.starts_with('[') {
                let id = self.node(after);
                let (r, index) = self.parse_expr(&after[1..])?;
                let (r, _) = self.expect(r, "]")?;
                expr = Expr::call(id, operators::INDEX, vec![expr, index]);
                chain = None;
                rest = r;
            } else {
                return Ok((rest, expr));
            }
        }
    }

    fn parse_primary<'a>(&mut self, input: &'a str) -> PResult<'a, (Expr, Option<String>)> {
        let input = skip_ws(input);
        if input.is_empty() {
            return Err(self.err(input, "unexpected end of expression"));
        }

        // Parenthesized expression.
        if let Some(rest) = input.strip_prefix('(') {
            let (rest, expr) = self.parse_expr(rest)?;
            let (rest, _) = self.expect(rest, ")")?;
            return Ok((rest, (expr, None)));
        }

        // List literal.
        if input.starts_with('[') {
            let (rest, expr) = self.parse_list(input)?;
            return Ok((rest, (expr, None)));
        }

        // Map literal.
        if input.starts_with('{') {
            let (rest, expr) = self.parse_map(input)?;
            return Ok((rest, (expr, None)));
        }

        // Rooted (leading-dot) identifier, or a leading-dot float.
        if let Some(rest) = input.strip_prefix('.') {
            if rest.starts_with(|c: char| c.is_ascii_digit()) {
                return self.parse_number(input).map(|(r, e)| (r, (e, None)));
            }
            let after_dot = skip_ws(rest);
            let (r, name) = match ident_token(after_dot) {
                Ok(ok) => ok,
                Err(_) => return Err(self.err(after_dot, "expected identifier after '.'")),
            };
            let rooted = format!(".{}", name);
            return self.finish_ident(input, r, rooted);
        }

        // Number, string, or bytes literal.
        if input.starts_with(|c: char| c.is_ascii_digit()) || input.starts_with('-') {
            return self.parse_number(input).map(|(r, e)| (r, (e, None)));
        }
        if let Some(result) = self.try_parse_string(input)? {
            return Ok((result.0, (result.1, None)));
        }

        // Identifier, keyword literal, global call, or struct literal.
        if let Ok((rest, name)) = ident_token(input) {
            match name {
                "true" => {
                    let id = self.node(input);
                    return Ok((rest, (Expr::literal(id, Value::Bool(true)), None)));
                }
                "false" => {
                    let id = self.node(input);
                    return Ok((rest, (Expr::literal(id, Value::Bool(false)), None)));
                }
                "null" => {
                    let id = self.node(input);
                    return Ok((rest, (Expr::literal(id, Value::Null), None)));
                }
                _ if RESERVED.contains(&name) => {
                    return Err(self.err(input, format!("reserved word '{}'", name)));
                }
                _ => return self.finish_ident(input, rest, name.to_string()),
            }
        }

        Err(self.err(input, format!("unexpected character '{}'", &input[..1])))
    }

    /// An identifier has been lexed; decide among global call, struct
    /// literal, and a plain reference.
    fn finish_ident<'a>(
        &mut self,
        start: &'a str,
        rest: &'a str,
        name: String,
    ) -> PResult<'a, (Expr, Option<String>)> {
        let after = skip_ws(rest);
        if after.starts_with('(') {
            let (rest, args) = self.parse_call_args(after)?;
            let expr = self.expand_global_call(start, &name, args)?;
            return Ok((rest, (expr, None)));
        }
        if after.starts_with('{') {
            let (rest, expr) = self.parse_struct(after, name)?;
            return Ok((rest, (expr, None)));
        }
        let id = self.node(start);
        Ok((rest, (Expr::ident(id, name.clone()), Some(name))))
    }

    fn parse_call_args<'a>(&mut self, input: &'a str) -> PResult<'a, Vec<Expr>> {
        // input starts at '('
        let mut rest = &input[1..];
        let mut args = Vec::new();
        loop {
            let after = skip_ws(rest);
            if let Some(r) = after.strip_prefix(')') {
                return Ok((r, args));
            }
            if !args.is_empty() {
                let (r, _) = self.expect(after, ",")?;
                rest = r;
            }
            let (r, arg) = self.parse_expr(rest)?;
            args.push(arg);
            rest = r;
        }
    }

    fn parse_list<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        // input starts at '['
        let id = self.node(input);
        let mut rest = &input[1..];
        let mut elements = Vec::new();
        let mut optional_indices = Vec::new();
        loop {
            let after = skip_ws(rest);
            if let Some(r) = after.strip_prefix(']') {
                return Ok((
                    r,
                    Expr::new(
                        id,
                        ExprKind::List {
                            elements,
                            optional_indices,
                        },
                    ),
                ));
            }
            if !elements.is_empty() {
                let (r, _) = self.expect(after, ",")?;
                let after_comma = skip_ws(r);
                // Trailing comma before the closing bracket.
                if let Some(r2) = after_comma.strip_prefix(']') {
                    return Ok((
                        r2,
                        Expr::new(
                            id,
                            ExprKind::List {
                                elements,
                                optional_indices,
                            },
                        ),
                    ));
                }
                rest = r;
            }
            let after = skip_ws(rest);
            let (r, elem) = if let Some(r) = after.strip_prefix('?') {
                optional_indices.push(elements.len());
                self.parse_expr(r)?
            } else {
                self.parse_expr(after)?
            };
            elements.push(elem);
            rest = r;
        }
    }

    fn parse_map<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        // input starts at '{'
        let id = self.node(input);
        let mut rest = &input[1..];
        let mut entries = Vec::new();
        loop {
            let after = skip_ws(rest);
            if let Some(r) = after.strip_prefix('}') {
                return Ok((r, Expr::new(id, ExprKind::Map { entries })));
            }
            if !entries.is_empty() {
                let (r, _) = self.expect(after, ",")?;
                let after_comma = skip_ws(r);
                if let Some(r2) = after_comma.strip_prefix('}') {
                    return Ok((r2, Expr::new(id, ExprKind::Map { entries })));
                }
                rest = r;
            }
            let after = skip_ws(rest);
            let entry_id = self.ids.next_id();
            self.info.positions.insert(entry_id, self.pos(after));
            let (r, optional, key) = if let Some(r) = after.strip_prefix('?') {
                let (r, key) = self.parse_expr(r)?;
                (r, true, key)
            } else {
                let (r, key) = self.parse_expr(after)?;
                (r, false, key)
            };
            let (r, _) = self.expect(r, ":")?;
            let (r, value) = self.parse_expr(r)?;
            entries.push(MapEntryExpr {
                id: entry_id,
                key,
                value,
                optional,
            });
            rest = r;
        }
    }

    fn parse_struct<'a>(&mut self, input: &'a str, type_name: String) -> PResult<'a, Expr> {
        // input starts at '{'
        let id = self.node(input);
        let mut rest = &input[1..];
        let mut fields: Vec<StructFieldExpr> = Vec::new();
        loop {
            let after = skip_ws(rest);
            if let Some(r) = after.strip_prefix('}') {
                return Ok((r, Expr::new(id, ExprKind::Struct { type_name, fields })));
            }
            if !fields.is_empty() {
                let (r, _) = self.expect(after, ",")?;
                let after_comma = skip_ws(r);
                if let Some(r2) = after_comma.strip_prefix('}') {
                    return Ok((r2, Expr::new(id, ExprKind::Struct { type_name, fields })));
                }
                rest = r;
            }
            let after = skip_ws(rest);
            let field_id = self.ids.next_id();
            self.info.positions.insert(field_id, self.pos(after));
            let (after, optional) = match after.strip_prefix('?') {
                Some(r) => (skip_ws(r), true),
                None => (after, false),
            };
            let (r, field) = match ident_token(after) {
                Ok(ok) => ok,
                Err(_) => return Err(self.err(after, "expected field name")),
            };
            let (r, _) = self.expect(r, ":")?;
            let (r, value) = self.parse_expr(r)?;
            fields.push(StructFieldExpr {
                id: field_id,
                field: field.to_string(),
                value,
                optional,
            });
            rest = r;
        }
    }

    // --------------------------------------------------------------
    // Literals
    // --------------------------------------------------------------

    fn parse_number<'a>(&mut self, input: &'a str) -> PResult<'a, Expr> {
        let (rest, token) = match number_token(input) {
            Ok(ok) => ok,
            Err(_) => return Err(self.err(input, "malformed numeric literal")),
        };
        let id = self.node(input);
        let negative = token.starts_with('-');
        let body = token.trim_start_matches('-');
        let unsigned = body.ends_with(['u', 'U']);
        let body = body.trim_end_matches(['u', 'U']);

        let value = if let Some(hex) = body.strip_prefix("0x") {
            let raw = u64::from_str_radix(hex, 16)
                .map_err(|_| self.err(input, "integer literal out of range"))?;
            self.integer_value(input, raw, negative, unsigned)?
        } else if body.contains('.') || body.contains(['e', 'E']) {
            if unsigned {
                return Err(self.err(input, "'u' suffix on a non-integer literal"));
            }
            let d: f64 = token
                .parse()
                .map_err(|_| self.err(input, "malformed numeric literal"))?;
            Value::Double(d)
        } else {
            let raw: u64 = body
                .parse()
                .map_err(|_| self.err(input, "integer literal out of range"))?;
            self.integer_value(input, raw, negative, unsigned)?
        };
        Ok((rest, Expr::literal(id, value)))
    }

    fn integer_value(
        &self,
        input: &str,
        raw: u64,
        negative: bool,
        unsigned: bool,
    ) -> Result<Value, Diagnostic> {
        if unsigned {
            if negative {
                return Err(self.err(input, "negative uint literal"));
            }
            return Ok(Value::Uint(raw));
        }
        if negative {
            if raw > i64::MAX as u64 + 1 {
                return Err(self.err(input, "integer literal out of range"));
            }
            Ok(Value::Int((raw as i128 * -1) as i64))
        } else {
            if raw > i64::MAX as u64 {
                return Err(self.err(input, "integer literal out of range"));
            }
            Ok(Value::Int(raw as i64))
        }
    }

    /// Attempt to lex a string or bytes literal at the cursor. Returns
    /// Ok(None) when the input does not start one.
    fn try_parse_string<'a>(&mut self, input: &'a str) -> Result<Option<(&'a str, Expr)>, Diagnostic> {
        let mut raw = false;
        let mut bytes = false;
        let mut cursor = input;
        for _ in 0..2 {
            if (cursor.starts_with('r') || cursor.starts_with('R')) && !raw {
                if cursor[1..].starts_with(['"', '\'', 'b', 'B']) {
                    raw = true;
                    cursor = &cursor[1..];
                    continue;
                }
            }
            if (cursor.starts_with('b') || cursor.starts_with('B')) && !bytes {
                if cursor[1..].starts_with(['"', '\'', 'r', 'R']) {
                    bytes = true;
                    cursor = &cursor[1..];
                    continue;
                }
            }
            break;
        }
        if !cursor.starts_with(['"', '\'']) {
            return Ok(None);
        }
        let id = self.node(input);
        let (rest, content) = self.lex_quoted(cursor, raw)?;
        let value = if bytes {
            Value::bytes(content)
        } else {
            match String::from_utf8(content) {
                Ok(s) => Value::string(s),
                Err(_) => return Err(self.err(input, "string literal is not valid UTF-8")),
            }
        };
        Ok(Some((rest, Expr::literal(id, value))))
    }

    /// Lex a quoted literal body, handling single, triple-quoted (which
    /// preserve embedded newlines), and raw forms.
    fn lex_quoted<'a>(&self, input: &'a str, raw: bool) -> PResult<'a, Vec<u8>> {
        let quote = input.as_bytes()[0] as char;
        let triple = format!("{}{}{}", quote, quote, quote);
        let (body_start, terminator): (&str, &str) = if input.starts_with(triple.as_str()) {
            (&input[3..], triple.as_str())
        } else {
            (&input[1..], &input[..1])
        };
        let mut out = Vec::new();
        let mut rest = body_start;
        loop {
            if rest.is_empty() {
                return Err(self.err(rest, "unterminated string literal"));
            }
            if let Some(after) = rest.strip_prefix(terminator) {
                return Ok((after, out));
            }
            if !raw && rest.starts_with('\\') {
                let (r, mut decoded) = self.lex_escape(&rest[1..])?;
                out.append(&mut decoded);
                rest = r;
                continue;
            }
            if terminator.len() == 1 && rest.starts_with('\n') {
                return Err(self.err(rest, "newline in single-quoted string"));
            }
            let ch = rest.chars().next().unwrap();
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            rest = &rest[ch.len_utf8()..];
        }
    }

    fn lex_escape<'a>(&self, input: &'a str) -> PResult<'a, Vec<u8>> {
        let ch = match input.chars().next() {
            Some(c) => c,
            None => return Err(self.err(input, "unterminated escape sequence")),
        };
        let simple = |b: u8| Ok((&input[1..], vec![b]));
        match ch {
            'n' => simple(b'\n'),
            'r' => simple(b'\r'),
            't' => simple(b'\t'),
            'a' => simple(0x07),
            'b' => simple(0x08),
            'f' => simple(0x0c),
            'v' => simple(0x0b),
            '\\' => simple(b'\\'),
            '\'' => simple(b'\''),
            '"' => simple(b'"'),
            '`' => simple(b'`'),
            '?' => simple(b'?'),
            'x' | 'X' => self.lex_hex_escape(&input[1..], 2),
            'u' => self.lex_unicode_escape(&input[1..], 4),
            'U' => self.lex_unicode_escape(&input[1..], 8),
            '0'..='7' => {
                if input.len() < 3 || !input.is_char_boundary(3) {
                    return Err(self.err(input, "invalid octal escape"));
                }
                match u8::from_str_radix(&input[..3], 8) {
                    Ok(b) => Ok((&input[3..], vec![b])),
                    Err(_) => Err(self.err(input, "invalid octal escape")),
                }
            }
            _ => Err(self.err(input, format!("invalid escape sequence '\\{}'", ch))),
        }
    }

    fn lex_hex_escape<'a>(&self, input: &'a str, digits: usize) -> PResult<'a, Vec<u8>> {
        if input.len() < digits || !input.is_char_boundary(digits) {
            return Err(self.err(input, "invalid hex escape"));
        }
        match u8::from_str_radix(&input[..digits], 16) {
            Ok(b) => Ok((&input[digits..], vec![b])),
            Err(_) => Err(self.err(input, "invalid hex escape")),
        }
    }

    fn lex_unicode_escape<'a>(&self, input: &'a str, digits: usize) -> PResult<'a, Vec<u8>> {
        if input.len() < digits || !input.is_char_boundary(digits) {
            return Err(self.err(input, "invalid unicode escape"));
        }
        let code = u32::from_str_radix(&input[..digits], 16)
            .map_err(|_| self.err(input, "invalid unicode escape"))?;
        let ch = char::from_u32(code).ok_or_else(|| self.err(input, "invalid code point"))?;
        let mut buf = [0u8; 4];
        Ok((
            &input[digits..],
            ch.encode_utf8(&mut buf).as_bytes().to_vec(),
        ))
    }

    // --------------------------------------------------------------
    // Macro expansion
    // --------------------------------------------------------------

    fn expand_global_call<'a>(
        &mut self,
        start: &'a str,
        name: &str,
        args: Vec<Expr>,
    ) -> Result<Expr, Diagnostic> {
        if name == "has" {
            if args.len() != 1 {
                return Err(self.err(start, "has() requires exactly one argument"));
            }
            let arg = args.into_iter().next().unwrap();
            return match arg.kind {
                ExprKind::Select {
                    operand,
                    field,
                    test_only: false,
                } => {
                    let id = self.node(start);
                    let expanded = Expr::new(
                        id,
                        ExprKind::Select {
                            operand: operand.clone(),
                            field: field.clone(),
                            test_only: true,
                        },
                    );
                    let original = Expr::call(
                        self.ids.next_id(),
                        "has",
                        vec![Expr::new(
                            arg.id,
                            ExprKind::Select {
                                operand,
                                field,
                                test_only: false,
                            },
                        )],
                    );
                    self.info.macro_calls.insert(id, original);
                    Ok(expanded)
                }
                _ => Err(self.err(start, "has() argument must be a field selection")),
            };
        }
        let id = self.node(start);
        Ok(Expr::call(id, name, args))
    }

    fn expand_member_call<'a>(
        &mut self,
        start: &'a str,
        target: Expr,
        name: &str,
        args: Vec<Expr>,
    ) -> Result<Expr, Diagnostic> {
        match (name, args.len()) {
            ("all", 2) | ("exists", 2) | ("exists_one", 2) | ("filter", 2) | ("map", 2)
            | ("map", 3) => self.expand_comprehension(start, target, name, args),
            ("bind", 3) if matches!(&target.kind, ExprKind::Ident(n) if n == "cel") => {
                self.expand_bind(start, target, args)
            }
            _ => {
                let id = self.node(start);
                Ok(Expr::member_call(id, target, name, args))
            }
        }
    }

    fn iter_var_name(&self, start: &str, expr: &Expr) -> Result<String, Diagnostic> {
        match &expr.kind {
            ExprKind::Ident(name) => Ok(name.clone()),
            _ => Err(self.err(start, "comprehension variable must be a simple identifier")),
        }
    }

    fn expand_comprehension<'a>(
        &mut self,
        start: &'a str,
        target: Expr,
        name: &str,
        args: Vec<Expr>,
    ) -> Result<Expr, Diagnostic> {
        let original = Expr::member_call(self.ids.next_id(), target.clone(), name, args.clone());
        let iter_var = self.iter_var_name(start, &args[0])?;
        let accu = operators::ACCU_VAR;
        let pos = self.pos(start);
        let mint = |p: &mut Parser| {
            let id = p.ids.next_id();
            p.info.positions.insert(id, pos);
            id
        };

        let accu_ident = |p: &mut Parser| {
            let id = p.ids.next_id();
            p.info.positions.insert(id, pos);
            Expr::ident(id, accu)
        };

        let comp = match (name, args.len()) {
            ("all", 2) => {
                let pred = args[1].clone();
                let not_false_arg = accu_ident(self);
                let cond_id = mint(self);
                let step_lhs = accu_ident(self);
                let step_id = mint(self);
                ComprehensionExpr {
                    iter_var,
                    iter_range: target,
                    accu_var: accu.to_string(),
                    accu_init: Expr::literal(mint(self), Value::Bool(true)),
                    loop_condition: Expr::call(
                        cond_id,
                        operators::NOT_STRICTLY_FALSE,
                        vec![not_false_arg],
                    ),
                    loop_step: Expr::call(step_id, operators::LOGICAL_AND, vec![step_lhs, pred]),
                    result: accu_ident(self),
                }
            }
            ("exists", 2) => {
                let pred = args[1].clone();
                let not_arg = accu_ident(self);
                let not_id = mint(self);
                let cond_id = mint(self);
                let step_lhs = accu_ident(self);
                let step_id = mint(self);
                ComprehensionExpr {
                    iter_var,
                    iter_range: target,
                    accu_var: accu.to_string(),
                    accu_init: Expr::literal(mint(self), Value::Bool(false)),
                    loop_condition: Expr::call(
                        cond_id,
                        operators::NOT_STRICTLY_FALSE,
                        vec![Expr::call(not_id, operators::LOGICAL_NOT, vec![not_arg])],
                    ),
                    loop_step: Expr::call(step_id, operators::LOGICAL_OR, vec![step_lhs, pred]),
                    result: accu_ident(self),
                }
            }
            ("exists_one", 2) => {
                let pred = args[1].clone();
                let step_cond = pred;
                let add_lhs = accu_ident(self);
                let add_rhs = Expr::literal(mint(self), Value::Int(1));
                let add_id = mint(self);
                let keep = accu_ident(self);
                let step_id = mint(self);
                let result_lhs = accu_ident(self);
                let result_rhs = Expr::literal(mint(self), Value::Int(1));
                let result_id = mint(self);
                ComprehensionExpr {
                    iter_var,
                    iter_range: target,
                    accu_var: accu.to_string(),
                    accu_init: Expr::literal(mint(self), Value::Int(0)),
                    loop_condition: Expr::literal(mint(self), Value::Bool(true)),
                    loop_step: Expr::call(
                        step_id,
                        operators::CONDITIONAL,
                        vec![
                            step_cond,
                            Expr::call(add_id, operators::ADD, vec![add_lhs, add_rhs]),
                            keep,
                        ],
                    ),
                    result: Expr::call(
                        result_id,
                        operators::EQUALS,
                        vec![result_lhs, result_rhs],
                    ),
                }
            }
            ("filter", 2) => {
                let pred = args[1].clone();
                let elem_id = mint(self);
                let elem = Expr::ident(elem_id, args[0].ident_name());
                let single_id = mint(self);
                let single = Expr::new(
                    single_id,
                    ExprKind::List {
                        elements: vec![elem],
                        optional_indices: vec![],
                    },
                );
                let add_lhs = accu_ident(self);
                let add_id = mint(self);
                let keep = accu_ident(self);
                let step_id = mint(self);
                ComprehensionExpr {
                    iter_var,
                    iter_range: target,
                    accu_var: accu.to_string(),
                    accu_init: Expr::new(
                        mint(self),
                        ExprKind::List {
                            elements: vec![],
                            optional_indices: vec![],
                        },
                    ),
                    loop_condition: Expr::literal(mint(self), Value::Bool(true)),
                    loop_step: Expr::call(
                        step_id,
                        operators::CONDITIONAL,
                        vec![
                            pred,
                            Expr::call(add_id, operators::ADD, vec![add_lhs, single]),
                            keep,
                        ],
                    ),
                    result: accu_ident(self),
                }
            }
            ("map", 2) | ("map", 3) => {
                let (transform, filter) = if args.len() == 3 {
                    (args[2].clone(), Some(args[1].clone()))
                } else {
                    (args[1].clone(), None)
                };
                let single_id = mint(self);
                let single = Expr::new(
                    single_id,
                    ExprKind::List {
                        elements: vec![transform],
                        optional_indices: vec![],
                    },
                );
                let add_lhs = accu_ident(self);
                let add_id = mint(self);
                let add = Expr::call(add_id, operators::ADD, vec![add_lhs, single]);
                let step = match filter {
                    Some(pred) => {
                        let keep = accu_ident(self);
                        let step_id = mint(self);
                        Expr::call(step_id, operators::CONDITIONAL, vec![pred, add, keep])
                    }
                    None => add,
                };
                ComprehensionExpr {
                    iter_var,
                    iter_range: target,
                    accu_var: accu.to_string(),
                    accu_init: Expr::new(
                        mint(self),
                        ExprKind::List {
                            elements: vec![],
                            optional_indices: vec![],
                        },
                    ),
                    loop_condition: Expr::literal(mint(self), Value::Bool(true)),
                    loop_step: step,
                    result: accu_ident(self),
                }
            }
            _ => unreachable!("expand_comprehension called for non-macro"),
        };
        let id = self.node(start);
        self.info.macro_calls.insert(id, original);
        Ok(Expr::new(id, ExprKind::Comprehension(Box::new(comp))))
    }

    /// `cel.bind(name, init, body)` folds over an empty synthetic range,
    /// exposing `name` as the accumulator within `body`.
    fn expand_bind<'a>(
        &mut self,
        start: &'a str,
        target: Expr,
        args: Vec<Expr>,
    ) -> Result<Expr, Diagnostic> {
        let original = Expr::member_call(self.ids.next_id(), target, "bind", args.clone());
        let name = self.iter_var_name(start, &args[0])?;
        let pos = self.pos(start);
        let mint = |p: &mut Parser| {
            let id = p.ids.next_id();
            p.info.positions.insert(id, pos);
            id
        };
        let step_id = mint(self);
        let comp = ComprehensionExpr {
            iter_var: "#unused".to_string(),
            iter_range: Expr::new(
                mint(self),
                ExprKind::List {
                    elements: vec![],
                    optional_indices: vec![],
                },
            ),
            accu_var: name.clone(),
            accu_init: args[1].clone(),
            loop_condition: Expr::literal(mint(self), Value::Bool(false)),
            loop_step: Expr::ident(step_id, name),
            result: args[2].clone(),
        };
        let id = self.node(start);
        self.info.macro_calls.insert(id, original);
        Ok(Expr::new(id, ExprKind::Comprehension(Box::new(comp))))
    }
}

impl Expr {
    fn ident_name(&self) -> String {
        match &self.kind {
            ExprKind::Ident(n) => n.clone(),
            _ => String::new(),
        }
    }
}

/// True when `input` starts with the keyword followed by a non-identifier
/// character (so `in` does not swallow the front of `int(x)`).
fn is_keyword_at(input: &str, kw: &str) -> bool {
    input.starts_with(kw)
        && !input[kw.len()..].starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> Ast {
        parse(&Source::new(text)).expect("parse failed")
    }

    fn parse_err(text: &str) -> CelError {
        parse(&Source::new(text)).expect_err("expected parse failure")
    }

    #[test]
    fn test_parse_literals() {
        assert!(matches!(
            parse_ok("42").expr.kind,
            ExprKind::Literal(Value::Int(42))
        ));
        assert!(matches!(
            parse_ok("-7").expr.kind,
            ExprKind::Literal(Value::Int(-7))
        ));
        assert!(matches!(
            parse_ok("18u").expr.kind,
            ExprKind::Literal(Value::Uint(18))
        ));
        assert!(matches!(
            parse_ok("0x1f").expr.kind,
            ExprKind::Literal(Value::Int(31))
        ));
        assert!(
            matches!(parse_ok("2.5e2").expr.kind, ExprKind::Literal(Value::Double(d)) if d == 250.0)
        );
        assert!(matches!(
            parse_ok("true").expr.kind,
            ExprKind::Literal(Value::Bool(true))
        ));
        assert!(matches!(
            parse_ok("null").expr.kind,
            ExprKind::Literal(Value::Null)
        ));
    }

    #[test]
    fn test_parse_min_int() {
        assert!(matches!(
            parse_ok("-9223372036854775808").expr.kind,
            ExprKind::Literal(Value::Int(i64::MIN))
        ));
        assert!(parse(&Source::new("9223372036854775808")).is_err());
    }

    #[test]
    fn test_parse_strings() {
        match parse_ok(r#""hi\nthere""#).expr.kind {
            ExprKind::Literal(Value::String(s)) => assert_eq!(&*s, "hi\nthere"),
            other => panic!("unexpected {:?}", other),
        }
        // raw form disables escape processing
        match parse_ok(r#"r"a\nb""#).expr.kind {
            ExprKind::Literal(Value::String(s)) => assert_eq!(&*s, r"a\nb"),
            other => panic!("unexpected {:?}", other),
        }
        // triple-quoted preserves embedded newlines
        match parse_ok("\"\"\"a\nb\"\"\"").expr.kind {
            ExprKind::Literal(Value::String(s)) => assert_eq!(&*s, "a\nb"),
            other => panic!("unexpected {:?}", other),
        }
        match parse_ok(r#"b"\x00\xff""#).expr.kind {
            ExprKind::Literal(Value::Bytes(b)) => assert_eq!(&*b, &[0u8, 0xff]),
            other => panic!("unexpected {:?}", other),
        }
        match parse_ok(r#""é""#).expr.kind {
            ExprKind::Literal(Value::String(s)) => assert_eq!(&*s, "é"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let ast = parse_ok("1 + 2 * 3");
        match &ast.expr.kind {
            ExprKind::Call { function, args, .. } => {
                assert_eq!(function, operators::ADD);
                assert!(matches!(&args[0].kind, ExprKind::Literal(Value::Int(1))));
                match &args[1].kind {
                    ExprKind::Call { function, .. } => assert_eq!(function, operators::MULTIPLY),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ternary_and_logic() {
        let ast = parse_ok("a && b ? 1 : 2");
        match &ast.expr.kind {
            ExprKind::Call { function, args, .. } => {
                assert_eq!(function, operators::CONDITIONAL);
                assert_eq!(args.len(), 3);
                match &args[0].kind {
                    ExprKind::Call { function, .. } => {
                        assert_eq!(function, operators::LOGICAL_AND)
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_in_operator_does_not_eat_idents() {
        let ast = parse_ok("3 in [1, 2, 3]");
        match &ast.expr.kind {
            ExprKind::Call { function, .. } => assert_eq!(function, operators::IN),
            other => panic!("unexpected {:?}", other),
        }
        // 'int' must lex as an identifier, not the 'in' keyword
        let ast = parse_ok("int(x)");
        match &ast.expr.kind {
            ExprKind::Call { function, .. } => assert_eq!(function, "int"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_member_chain_and_index() {
        let ast = parse_ok("a.b[0].c");
        match &ast.expr.kind {
            ExprKind::Select { operand, field, .. } => {
                assert_eq!(field, "c");
                match &operand.kind {
                    ExprKind::Call { function, .. } => assert_eq!(function, operators::INDEX),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_struct_literal() {
        let ast = parse_ok("acme.Widget{name: 'x', ?weight: w}");
        match &ast.expr.kind {
            ExprKind::Struct { type_name, fields } => {
                assert_eq!(type_name, "acme.Widget");
                assert_eq!(fields.len(), 2);
                assert!(!fields[0].optional);
                assert!(fields[1].optional);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_list_with_optional_elements() {
        let ast = parse_ok("[1, ?x, 3]");
        match &ast.expr.kind {
            ExprKind::List {
                elements,
                optional_indices,
            } => {
                assert_eq!(elements.len(), 3);
                assert_eq!(optional_indices, &vec![1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_map_literal() {
        let ast = parse_ok("{'a': 1, ?'b': x}");
        match &ast.expr.kind {
            ExprKind::Map { entries } => {
                assert_eq!(entries.len(), 2);
                assert!(!entries[0].optional);
                assert!(entries[1].optional);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_has_macro() {
        let ast = parse_ok("has(m.f)");
        match &ast.expr.kind {
            ExprKind::Select {
                field, test_only, ..
            } => {
                assert_eq!(field, "f");
                assert!(test_only);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ast.source_info.macro_calls.len(), 1);
        assert!(parse(&Source::new("has(x)")).is_err());
    }

    #[test]
    fn test_all_macro_expansion() {
        let ast = parse_ok("[1, 2].all(x, x > 0)");
        match &ast.expr.kind {
            ExprKind::Comprehension(c) => {
                assert_eq!(c.iter_var, "x");
                assert_eq!(c.accu_var, operators::ACCU_VAR);
                assert!(matches!(
                    &c.accu_init.kind,
                    ExprKind::Literal(Value::Bool(true))
                ));
                match &c.loop_condition.kind {
                    ExprKind::Call { function, .. } => {
                        assert_eq!(function, operators::NOT_STRICTLY_FALSE)
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ast.source_info.macro_calls.len(), 1);
    }

    #[test]
    fn test_bind_macro_expansion() {
        let ast = parse_ok("cel.bind(v, 1 + 1, v * v)");
        match &ast.expr.kind {
            ExprKind::Comprehension(c) => {
                assert_eq!(c.accu_var, "v");
                assert!(matches!(
                    &c.loop_condition.kind,
                    ExprKind::Literal(Value::Bool(false))
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_node_ids_unique() {
        let ast = parse_ok("a.b + c[0] * f(x, y)");
        let mut ids = Vec::new();
        ast.expr.visit(&mut |e| ids.push(e.id));
        let mut deduped = ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len());
        assert!(ids.iter().all(|id| *id > 0));
    }

    #[test]
    fn test_reserved_words_rejected() {
        assert!(parse(&Source::new("while")).is_err());
        assert!(parse(&Source::new("a + return")).is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_err("(1 + 2"), CelError::Syntax(_)));
        assert!(matches!(parse_err("1 2"), CelError::Syntax(_)));
        assert!(matches!(parse_err("[1, 2"), CelError::Syntax(_)));
        assert!(matches!(parse_err("'unterminated"), CelError::Syntax(_)));
    }

    #[test]
    fn test_comments_skipped() {
        let ast = parse_ok("// leading comment\n1 + // inline\n2");
        match &ast.expr.kind {
            ExprKind::Call { function, .. } => assert_eq!(function, operators::ADD),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rooted_identifier() {
        let ast = parse_ok(".acme.flag");
        match &ast.expr.kind {
            ExprKind::Select { operand, field, .. } => {
                assert_eq!(field, "flag");
                assert!(matches!(&operand.kind, ExprKind::Ident(n) if n == ".acme"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_positions_recorded() {
        let ast = parse_ok("abc + 1");
        let root_pos = ast.source_info.positions.get(&ast.expr.id).copied();
        assert_eq!(root_pos, Some(4));
    }
}
