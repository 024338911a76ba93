//! Reference engine for a small, side-effect free strategy language.
//!
//! Scripts are top-level `def` blocks. Bodies may assign, branch with
//! `if`/`elif`/`else` and `return`. Expressions cover literals, arithmetic,
//! comparisons, boolean logic, conditional expressions, subscripts and calls
//! to other functions in the script or to the safe built-ins. There are no
//! loops, attribute access or imports, so the only way to run long is
//! recursion, which is depth-bounded and cancellable between statements.
//!
//! Lists, dicts and strings are shared behind `Arc`, so passing a value
//! around never copies it. Every operation that builds new sequence data
//! first charges it to the execution's allocation budget, and every level of
//! evaluation counts against a nesting budget sized from the worker stack.
//! Both fail with a resource error instead of reaching the allocator or the
//! guard page.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use threat_scanner::syntax::{bracket_contents, parse, split_depth_zero, Statement, Token, TokenKind};

use super::{CompiledUnit, EngineError, ExecutionContext, ScriptEngine, SAFE_BUILTINS};

const MAX_CALL_DEPTH: usize = 64;
const MAX_SEQUENCE_LEN: usize = 1_000_000;
/// Parser recursion plus operator chain length within one expression.
const MAX_NESTING: usize = 100;
const MAX_BLOCK_DEPTH: usize = 32;
/// Lists and dicts inside lists and dicts, inputs included.
const MAX_VALUE_DEPTH: usize = 128;
/// Worst-case stack one level of evaluation takes in an unoptimised build.
const EVAL_FRAME_BYTES: u64 = 16 * 1024;
const DEFAULT_EVAL_DEPTH: usize = 512;
const MIB: u64 = 1024 * 1024;
/// Bookkeeping charged per dict entry on top of the key bytes.
const DICT_ENTRY_BYTES: usize = 64;

#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionEngine;

impl ExpressionEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for ExpressionEngine {
    fn name(&self) -> &str {
        "expression"
    }

    fn compile(&self, code: &str) -> Result<CompiledUnit, EngineError> {
        Ok(CompiledUnit::new(compile_program(code)?))
    }

    fn invoke(
        &self,
        unit: &CompiledUnit,
        entry_point: &str,
        params: &BTreeMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value, EngineError> {
        let program = unit
            .downcast_ref::<Program>()
            .ok_or_else(|| EngineError::runtime("compiled unit belongs to another engine"))?;
        let function = program
            .functions
            .get(entry_point)
            .ok_or_else(|| EngineError::runtime(format!("entry point `{entry_point}` is not defined")))?;

        let mut args = Vec::with_capacity(function.params.len());
        for name in &function.params {
            let value = params
                .get(name)
                .ok_or_else(|| EngineError::runtime(format!("missing parameter `{name}`")))?;
            args.push(Val::from_json(value, 0)?);
        }

        let max_nesting = ctx.stack_bytes().map_or(DEFAULT_EVAL_DEPTH, |bytes| {
            usize::try_from(bytes / EVAL_FRAME_BYTES)
                .unwrap_or(usize::MAX)
                .clamp(32, 4096)
        });
        let mut interpreter = Interpreter {
            program,
            ctx,
            depth: 0,
            nesting: 0,
            max_nesting,
            meter: Meter::new(ctx.memory_budget()),
        };
        interpreter.call_function(function, args)?.to_json()
    }
}

// ---------------------------------------------------------------------------
// Values

#[derive(Debug, Clone, PartialEq)]
enum Val {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<Vec<Val>>),
    Dict(Arc<BTreeMap<String, Val>>),
}

const SLOT_BYTES: usize = std::mem::size_of::<Val>();

impl Val {
    fn from_json(value: &Value, depth: usize) -> Result<Val, EngineError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(too_deep_value());
        }
        Ok(match value {
            Value::Null => Val::None,
            Value::Bool(b) => Val::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Val::Int(i),
                None => Val::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Val::Str(s.as_str().into()),
            Value::Array(items) => Val::List(Arc::new(
                items
                    .iter()
                    .map(|item| Val::from_json(item, depth + 1))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(map) => Val::Dict(Arc::new(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Val::from_json(v, depth + 1)?)))
                    .collect::<Result<_, EngineError>>()?,
            )),
        })
    }

    /// Levels of list/dict nesting. Values never exceed [`MAX_VALUE_DEPTH`],
    /// so the walk is bounded.
    fn depth(&self) -> usize {
        match self {
            Val::List(items) => 1 + items.iter().map(Val::depth).max().unwrap_or(0),
            Val::Dict(map) => 1 + map.values().map(Val::depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Bytes this value allocated itself, not counting shared children.
    fn own_bytes(&self) -> usize {
        match self {
            Val::Str(s) => s.len(),
            Val::List(items) => items.len().saturating_mul(SLOT_BYTES),
            Val::Dict(map) => map
                .keys()
                .map(|k| k.len() + SLOT_BYTES + DICT_ENTRY_BYTES)
                .fold(0, usize::saturating_add),
            _ => 0,
        }
    }

    fn to_json(&self) -> Result<Value, EngineError> {
        Ok(match self {
            Val::None => Value::Null,
            Val::Bool(b) => Value::Bool(*b),
            Val::Int(i) => Value::Number((*i).into()),
            Val::Float(f) => Value::Number(
                Number::from_f64(*f)
                    .ok_or_else(|| EngineError::runtime("result is not a finite number"))?,
            ),
            Val::Str(s) => Value::String(s.to_string()),
            Val::List(items) => Value::Array(
                items
                    .iter()
                    .map(Val::to_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Val::Dict(map) => {
                let mut out = Map::new();
                for (k, v) in map.iter() {
                    out.insert(k.clone(), v.to_json()?);
                }
                Value::Object(out)
            }
        })
    }

    fn type_name(&self) -> &'static str {
        match self {
            Val::None => "None",
            Val::Bool(_) => "bool",
            Val::Int(_) => "int",
            Val::Float(_) => "float",
            Val::Str(_) => "str",
            Val::List(_) => "list",
            Val::Dict(_) => "dict",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Val::None => false,
            Val::Bool(b) => *b,
            Val::Int(i) => *i != 0,
            Val::Float(f) => *f != 0.0,
            Val::Str(s) => !s.is_empty(),
            Val::List(items) => !items.is_empty(),
            Val::Dict(map) => !map.is_empty(),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Val::Bool(b) => Some(f64::from(u8::from(*b))),
            Val::Int(i) => Some(*i as f64),
            Val::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Val::Bool(b) => Some(i64::from(*b)),
            Val::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn display(&self) -> String {
        match self {
            Val::Str(s) => s.to_string(),
            other => other.repr(),
        }
    }

    fn repr(&self) -> String {
        match self {
            Val::None => "None".to_string(),
            Val::Bool(true) => "True".to_string(),
            Val::Bool(false) => "False".to_string(),
            Val::Int(i) => i.to_string(),
            Val::Float(f) => format_float(*f),
            Val::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Val::List(items) => {
                let inner: Vec<String> = items.iter().map(Val::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Val::Dict(map) => {
                let mut out = String::from("{");
                for (idx, (k, v)) in map.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "'{}': {}", k, v.repr());
                }
                out.push('}');
                out
            }
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

// ---------------------------------------------------------------------------
// Syntax

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    fn from_token(text: &str) -> Option<BinOp> {
        Some(match text {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "//" => BinOp::FloorDiv,
            "%" => BinOp::Mod,
            "**" => BinOp::Pow,
            _ => return None,
        })
    }

    fn from_augmented(text: &str) -> Option<BinOp> {
        text.strip_suffix('=').and_then(BinOp::from_token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    In,
    NotIn,
}

#[derive(Debug, Clone)]
enum Expr {
    Const(Val),
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    IfElse(Box<Expr>, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Slice(Box<Expr>, Option<Box<Expr>>, Option<Box<Expr>>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone)]
enum StmtKind {
    Assign(String, Expr),
    AugAssign(String, BinOp, Expr),
    Return(Option<Expr>),
    If(Vec<(Expr, Vec<Stmt>)>, Vec<Stmt>),
    Expr(Expr),
    Pass,
}

#[derive(Debug, Clone)]
struct Stmt {
    line: usize,
    kind: StmtKind,
}

#[derive(Debug)]
struct Function {
    params: Vec<String>,
    body: Vec<Stmt>,
}

#[derive(Debug)]
struct Program {
    functions: HashMap<String, Function>,
}

fn compile_program(code: &str) -> Result<Program, EngineError> {
    let tree = parse(code);
    if let Some(issue) = tree.issues.first() {
        return Err(EngineError::compile(Some(issue.line()), "malformed source"));
    }

    let mut functions = HashMap::new();
    for stmt in &tree.statements {
        match stmt.keyword() {
            Some("def") => {
                let (name, function) = compile_function(stmt)?;
                if SAFE_BUILTINS.contains(&name.as_str()) {
                    return Err(EngineError::compile(
                        Some(stmt.line),
                        format!("`{name}` shadows a built-in"),
                    ));
                }
                if functions.insert(name.clone(), function).is_some() {
                    return Err(EngineError::compile(
                        Some(stmt.line),
                        format!("function `{name}` is defined twice"),
                    ));
                }
            }
            // Module docstrings.
            _ if stmt.tokens.len() == 1 && stmt.tokens[0].kind == TokenKind::Str => {}
            _ => {
                return Err(EngineError::compile(
                    Some(stmt.line),
                    "only function definitions are allowed at top level",
                ))
            }
        }
    }
    if functions.is_empty() {
        return Err(EngineError::compile(None, "script defines no functions"));
    }
    Ok(Program { functions })
}

fn compile_function(stmt: &Statement) -> Result<(String, Function), EngineError> {
    let line = Some(stmt.line);
    if stmt.tokens.first().is_some_and(|t| t.is_name("async")) {
        return Err(EngineError::compile(line, "async functions are not supported"));
    }
    let name = stmt
        .declared_name()
        .ok_or_else(|| EngineError::compile(line, "malformed function header"))?
        .to_string();
    if !stmt.tokens.get(2).is_some_and(|t| t.is_op("(")) || !stmt.tokens.last().is_some_and(|t| t.is_op(":")) {
        return Err(EngineError::compile(line, "malformed function header"));
    }

    let mut params = Vec::new();
    for segment in split_depth_zero(bracket_contents(&stmt.tokens, 2), ",") {
        match segment {
            [] => continue,
            [param] if param.kind == TokenKind::Name => params.push(param.text.clone()),
            [param, colon, ..] if param.kind == TokenKind::Name && colon.is_op(":") => {
                params.push(param.text.clone())
            }
            _ => {
                return Err(EngineError::compile(
                    line,
                    "parameters must be plain names without defaults",
                ))
            }
        }
    }

    let body = compile_block(&stmt.body, 1)?;
    Ok((name, Function { params, body }))
}

fn compile_block(statements: &[Statement], depth: usize) -> Result<Vec<Stmt>, EngineError> {
    if depth > MAX_BLOCK_DEPTH {
        let line = statements.first().map(|stmt| stmt.line);
        return Err(EngineError::compile(line, "blocks are nested too deeply"));
    }
    let mut out = Vec::new();
    let mut idx = 0;
    while idx < statements.len() {
        let stmt = &statements[idx];
        idx += 1;
        let line = stmt.line;
        let kind = match stmt.keyword() {
            Some("if") => {
                let mut branches = vec![(header_condition(stmt)?, compile_block(&stmt.body, depth + 1)?)];
                let mut otherwise = Vec::new();
                while let Some(next) = statements.get(idx) {
                    match next.keyword() {
                        Some("elif") => {
                            branches.push((header_condition(next)?, compile_block(&next.body, depth + 1)?));
                            idx += 1;
                        }
                        Some("else") => {
                            otherwise = compile_block(&next.body, depth + 1)?;
                            idx += 1;
                            break;
                        }
                        _ => break,
                    }
                }
                StmtKind::If(branches, otherwise)
            }
            Some("elif") | Some("else") => {
                return Err(EngineError::compile(Some(line), "`elif`/`else` without `if`"))
            }
            Some("return") => {
                let rest = &stmt.tokens[1..];
                if rest.is_empty() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(parse_expr(rest, line)?))
                }
            }
            Some("pass") if stmt.tokens.len() == 1 => StmtKind::Pass,
            Some(keyword) if stmt.is_compound() || is_unsupported_keyword(keyword) => {
                return Err(EngineError::compile(
                    Some(line),
                    format!("`{keyword}` statements are not supported"),
                ))
            }
            _ => compile_simple(stmt)?,
        };
        out.push(Stmt { line, kind });
    }
    Ok(out)
}

fn is_unsupported_keyword(keyword: &str) -> bool {
    matches!(
        keyword,
        "import" | "from" | "global" | "nonlocal" | "del" | "lambda" | "yield" | "raise" | "assert"
            | "break" | "continue" | "await" | "async"
    )
}

fn header_condition(stmt: &Statement) -> Result<Expr, EngineError> {
    let tokens = &stmt.tokens;
    if tokens.len() < 3 || !tokens[tokens.len() - 1].is_op(":") {
        return Err(EngineError::compile(Some(stmt.line), "malformed condition"));
    }
    parse_expr(&tokens[1..tokens.len() - 1], stmt.line)
}

fn compile_simple(stmt: &Statement) -> Result<StmtKind, EngineError> {
    let tokens = &stmt.tokens;
    let line = stmt.line;
    if let Some(op_idx) = tokens.iter().position(|t| t.kind == TokenKind::Op && t.text.len() >= 2 && t.text.ends_with('=') && BinOp::from_augmented(&t.text).is_some()) {
        let target = single_name(&tokens[..op_idx], line)?;
        let op = BinOp::from_augmented(&tokens[op_idx].text)
            .ok_or_else(|| EngineError::compile(Some(line), "unknown operator"))?;
        let value = parse_expr(&tokens[op_idx + 1..], line)?;
        return Ok(StmtKind::AugAssign(target, op, value));
    }
    let parts = split_depth_zero(tokens, "=");
    match parts.as_slice() {
        [expr] => Ok(StmtKind::Expr(parse_expr(expr, line)?)),
        [target, value] => Ok(StmtKind::Assign(
            single_name(target, line)?,
            parse_expr(value, line)?,
        )),
        _ => Err(EngineError::compile(Some(line), "chained assignment is not supported")),
    }
}

fn single_name(tokens: &[Token], line: usize) -> Result<String, EngineError> {
    match tokens {
        [name] if name.kind == TokenKind::Name && !is_reserved(&name.text) => Ok(name.text.clone()),
        _ => Err(EngineError::compile(
            Some(line),
            "assignment target must be a plain name",
        )),
    }
}

fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        "True" | "False" | "None" | "and" | "or" | "not" | "if" | "else" | "in" | "is" | "for"
            | "lambda"
    )
}

fn parse_expr(tokens: &[Token], line: usize) -> Result<Expr, EngineError> {
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        line,
        depth: 0,
    };
    let expr = parser.ternary()?;
    if let Some(extra) = parser.peek() {
        return Err(parser.error(format!("unexpected `{}`", extra.text)));
    }
    Ok(expr)
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: usize,
    /// Recursion depth plus operators chained so far; bounds the tree depth.
    depth: usize,
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn error(&self, message: impl Into<String>) -> EngineError {
        let line = self.peek().map(|t| t.line).unwrap_or(self.line);
        EngineError::compile(Some(line), message)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_op(op)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_name(&mut self, name: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_name(name)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), EngineError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{op}`")))
        }
    }

    fn deepen(&mut self) -> Result<(), EngineError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("expression is nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    /// Runs `parse` one level deeper.
    fn nested(&mut self, parse: fn(&mut Self) -> Result<Expr, EngineError>) -> Result<Expr, EngineError> {
        self.deepen()?;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn ternary(&mut self) -> Result<Expr, EngineError> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> Result<Expr, EngineError> {
        let then = self.or_expr()?;
        if !self.eat_name("if") {
            return Ok(then);
        }
        let cond = self.or_expr()?;
        if !self.eat_name("else") {
            return Err(self.error("conditional expression needs `else`"));
        }
        let otherwise = self.ternary()?;
        Ok(Expr::IfElse(Box::new(cond), Box::new(then), Box::new(otherwise)))
    }

    fn or_expr(&mut self) -> Result<Expr, EngineError> {
        let mark = self.depth;
        let mut left = self.and_expr()?;
        while self.eat_name("or") {
            self.deepen()?;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = mark;
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, EngineError> {
        let mark = self.depth;
        let mut left = self.not_expr()?;
        while self.eat_name("and") {
            self.deepen()?;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = mark;
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, EngineError> {
        if self.eat_name("not") {
            return Ok(Expr::Not(Box::new(self.nested(Self::not_expr)?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, EngineError> {
        let first = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(t) if t.is_op("<") => CmpOp::Lt,
                Some(t) if t.is_op("<=") => CmpOp::Le,
                Some(t) if t.is_op(">") => CmpOp::Gt,
                Some(t) if t.is_op(">=") => CmpOp::Ge,
                Some(t) if t.is_op("==") => CmpOp::Eq,
                Some(t) if t.is_op("!=") => CmpOp::Ne,
                Some(t) if t.is_name("in") => CmpOp::In,
                Some(t) if t.is_name("not") && self.tokens.get(self.pos + 1).is_some_and(|n| n.is_name("in")) => {
                    self.pos += 1;
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn arith(&mut self) -> Result<Expr, EngineError> {
        let mark = self.depth;
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(t) if t.is_op("+") => BinOp::Add,
                Some(t) if t.is_op("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.deepen()?;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = mark;
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, EngineError> {
        let mark = self.depth;
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(t) if t.is_op("*") => BinOp::Mul,
                Some(t) if t.is_op("/") => BinOp::Div,
                Some(t) if t.is_op("//") => BinOp::FloorDiv,
                Some(t) if t.is_op("%") => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            self.deepen()?;
            let right = self.factor()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = mark;
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, EngineError> {
        if self.eat_op("-") {
            return Ok(Expr::Neg(Box::new(self.nested(Self::factor)?)));
        }
        if self.eat_op("+") {
            return self.nested(Self::factor);
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, EngineError> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            let exponent = self.nested(Self::factor)?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, EngineError> {
        let mark = self.depth;
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("[") {
                self.deepen()?;
                let start = if self.peek().is_some_and(|t| t.is_op(":")) {
                    None
                } else {
                    Some(Box::new(self.ternary()?))
                };
                if self.eat_op(":") {
                    let end = if self.peek().is_some_and(|t| t.is_op("]")) {
                        None
                    } else {
                        Some(Box::new(self.ternary()?))
                    };
                    self.expect_op("]")?;
                    expr = Expr::Slice(Box::new(expr), start, end);
                } else {
                    self.expect_op("]")?;
                    let index = start.ok_or_else(|| self.error("empty subscript"))?;
                    expr = Expr::Index(Box::new(expr), index);
                }
            } else if self.peek().is_some_and(|t| t.is_op(".")) {
                return Err(self.error("attribute access is not supported"));
            } else if self.peek().is_some_and(|t| t.is_op("(")) {
                return Err(self.error("only named functions can be called"));
            } else {
                self.depth = mark;
                return Ok(expr);
            }
        }
    }

    fn atom(&mut self) -> Result<Expr, EngineError> {
        let token = self.peek().ok_or_else(|| self.error("unexpected end of expression"))?;
        self.pos += 1;
        match token.kind {
            TokenKind::Number => parse_number(&token.text)
                .map(Expr::Const)
                .ok_or_else(|| EngineError::compile(Some(token.line), format!("invalid number `{}`", token.text))),
            TokenKind::Str => {
                let mut text = unescape(&token.text);
                while let Some(next) = self.peek().filter(|t| t.kind == TokenKind::Str) {
                    text.push_str(&unescape(&next.text));
                    self.pos += 1;
                }
                Ok(Expr::Const(Val::Str(text.into())))
            }
            TokenKind::Name => match token.text.as_str() {
                "True" => Ok(Expr::Const(Val::Bool(true))),
                "False" => Ok(Expr::Const(Val::Bool(false))),
                "None" => Ok(Expr::Const(Val::None)),
                name if is_reserved(name) => {
                    Err(EngineError::compile(Some(token.line), format!("unexpected `{name}`")))
                }
                name => {
                    if self.eat_op("(") {
                        let args = self.sequence(")")?;
                        Ok(Expr::Call(name.to_string(), args))
                    } else {
                        Ok(Expr::Name(name.to_string()))
                    }
                }
            },
            TokenKind::Op => match token.text.as_str() {
                "(" => {
                    let inner = self.ternary()?;
                    self.expect_op(")")?;
                    Ok(inner)
                }
                "[" => Ok(Expr::List(self.sequence("]")?)),
                "{" => {
                    let mut pairs = Vec::new();
                    while !self.eat_op("}") {
                        let key = self.ternary()?;
                        self.expect_op(":")?;
                        let value = self.ternary()?;
                        pairs.push((key, value));
                        if !self.eat_op(",") {
                            self.expect_op("}")?;
                            break;
                        }
                    }
                    Ok(Expr::Dict(pairs))
                }
                other => Err(EngineError::compile(Some(token.line), format!("unexpected `{other}`"))),
            },
        }
    }

    /// Comma-separated expressions up to `close`, trailing comma allowed.
    fn sequence(&mut self, close: &str) -> Result<Vec<Expr>, EngineError> {
        let mut items = Vec::new();
        while !self.eat_op(close) {
            items.push(self.ternary()?);
            if !self.eat_op(",") {
                self.expect_op(close)?;
                break;
            }
        }
        Ok(items)
    }
}

fn parse_number(text: &str) -> Option<Val> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let lower = cleaned.to_ascii_lowercase();
    let radix = [("0x", 16), ("0o", 8), ("0b", 2)]
        .into_iter()
        .find_map(|(prefix, radix)| lower.strip_prefix(prefix).map(|digits| (digits, radix)));
    if let Some((digits, radix)) = radix {
        return i64::from_str_radix(digits, radix).ok().map(Val::Int);
    }
    if lower.contains(['.', 'e']) {
        return lower.parse::<f64>().ok().map(Val::Float);
    }
    match lower.parse::<i64>() {
        Ok(i) => Some(Val::Int(i)),
        Err(_) => lower.parse::<f64>().ok().map(Val::Float),
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\n') => {}
            Some(other @ ('\\' | '\'' | '"')) => out.push(other),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Evaluation

enum Flow {
    Normal,
    Return(Val),
}

/// Running total of sequence data an invocation has built.
struct Meter {
    used: usize,
    limit: Option<usize>,
}

impl Meter {
    fn new(budget: Option<u64>) -> Self {
        Self {
            used: 0,
            limit: budget.map(|bytes| usize::try_from(bytes).unwrap_or(usize::MAX)),
        }
    }

    fn charge(&mut self, bytes: usize) -> Result<(), EngineError> {
        let Some(limit) = self.limit else {
            return Ok(());
        };
        self.used = self.used.saturating_add(bytes);
        if self.used > limit {
            return Err(EngineError::resource(format!(
                "memory (allocation budget of {} MiB spent)",
                limit as u64 / MIB
            )));
        }
        Ok(())
    }
}

struct Interpreter<'a> {
    program: &'a Program,
    ctx: &'a ExecutionContext,
    /// User function calls in progress.
    depth: usize,
    /// Evaluation frames in progress, calls and blocks included.
    nesting: usize,
    max_nesting: usize,
    meter: Meter,
}

type Env = HashMap<String, Val>;

fn runtime(line: usize, message: impl std::fmt::Display) -> EngineError {
    EngineError::runtime(format!("line {line}: {message}"))
}

fn too_deep_value() -> EngineError {
    EngineError::resource(format!("stack (values nested more than {MAX_VALUE_DEPTH} levels)"))
}

impl<'a> Interpreter<'a> {
    fn enter(&mut self) -> Result<(), EngineError> {
        if self.nesting >= self.max_nesting {
            return Err(EngineError::resource("stack (evaluation nested too deeply)"));
        }
        self.nesting += 1;
        Ok(())
    }

    fn call_function(&mut self, function: &Function, args: Vec<Val>) -> Result<Val, EngineError> {
        self.ctx.check_cancelled()?;
        if self.depth >= MAX_CALL_DEPTH {
            return Err(EngineError::runtime("maximum call depth exceeded"));
        }
        self.depth += 1;
        let mut env: Env = function.params.iter().cloned().zip(args).collect();
        let flow = self.exec_block(&function.body, &mut env);
        self.depth -= 1;
        match flow? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Val::None),
        }
    }

    fn exec_block(&mut self, body: &[Stmt], env: &mut Env) -> Result<Flow, EngineError> {
        self.enter()?;
        let flow = self.exec_statements(body, env);
        self.nesting -= 1;
        flow
    }

    fn exec_statements(&mut self, body: &[Stmt], env: &mut Env) -> Result<Flow, EngineError> {
        for stmt in body {
            self.ctx.check_cancelled()?;
            match &stmt.kind {
                StmtKind::Assign(name, expr) => {
                    let value = self.eval(expr, env, stmt.line)?;
                    env.insert(name.clone(), value);
                }
                StmtKind::AugAssign(name, op, expr) => {
                    let current = env
                        .get(name)
                        .cloned()
                        .ok_or_else(|| runtime(stmt.line, format!("name `{name}` is not defined")))?;
                    let rhs = self.eval(expr, env, stmt.line)?;
                    let value = self.binary(*op, current, rhs, stmt.line)?;
                    env.insert(name.clone(), value);
                }
                StmtKind::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval(expr, env, stmt.line)?,
                        None => Val::None,
                    };
                    return Ok(Flow::Return(value));
                }
                StmtKind::If(branches, otherwise) => {
                    let mut taken = None;
                    for (cond, block) in branches {
                        if self.eval(cond, env, stmt.line)?.truthy() {
                            taken = Some(block);
                            break;
                        }
                    }
                    let block = taken.unwrap_or(otherwise);
                    if let Flow::Return(value) = self.exec_block(block, env)? {
                        return Ok(Flow::Return(value));
                    }
                }
                StmtKind::Expr(expr) => {
                    self.eval(expr, env, stmt.line)?;
                }
                StmtKind::Pass => {}
            }
        }
        Ok(Flow::Normal)
    }

    /// Charges what the operation will build, then runs it.
    fn binary(&mut self, op: BinOp, left: Val, right: Val, line: usize) -> Result<Val, EngineError> {
        self.meter.charge(projected_bytes(op, &left, &right))?;
        binary(op, left, right).map_err(|m| runtime(line, m))
    }

    fn eval(&mut self, expr: &Expr, env: &Env, line: usize) -> Result<Val, EngineError> {
        self.enter()?;
        let value = self.eval_expr(expr, env, line);
        self.nesting -= 1;
        value
    }

    fn eval_expr(&mut self, expr: &Expr, env: &Env, line: usize) -> Result<Val, EngineError> {
        Ok(match expr {
            Expr::Const(value) => value.clone(),
            Expr::Name(name) => env
                .get(name)
                .cloned()
                .ok_or_else(|| runtime(line, format!("name `{name}` is not defined")))?,
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, env, line)?);
                }
                let list = Val::List(Arc::new(out));
                self.admit(list)?
            }
            Expr::Dict(pairs) => {
                let mut out = BTreeMap::new();
                for (key, value) in pairs {
                    let key = match self.eval(key, env, line)? {
                        Val::Str(s) => s.to_string(),
                        other => {
                            return Err(runtime(
                                line,
                                format!("dict keys must be str, not {}", other.type_name()),
                            ))
                        }
                    };
                    out.insert(key, self.eval(value, env, line)?);
                }
                let dict = Val::Dict(Arc::new(out));
                self.admit(dict)?
            }
            Expr::Neg(inner) => match self.eval(inner, env, line)? {
                Val::Int(i) => Val::Int(
                    i.checked_neg()
                        .ok_or_else(|| runtime(line, "integer overflow"))?,
                ),
                Val::Bool(b) => Val::Int(-i64::from(b)),
                Val::Float(f) => Val::Float(-f),
                other => {
                    return Err(runtime(
                        line,
                        format!("bad operand type for unary -: {}", other.type_name()),
                    ))
                }
            },
            Expr::Not(inner) => Val::Bool(!self.eval(inner, env, line)?.truthy()),
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, env, line)?;
                let right = self.eval(right, env, line)?;
                self.binary(*op, left, right, line)?
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first, env, line)?;
                for (op, right) in rest {
                    let right = self.eval(right, env, line)?;
                    if !compare(*op, &left, &right).map_err(|m| runtime(line, m))? {
                        return Ok(Val::Bool(false));
                    }
                    left = right;
                }
                Val::Bool(true)
            }
            Expr::And(left, right) => {
                let left = self.eval(left, env, line)?;
                if !left.truthy() {
                    left
                } else {
                    self.eval(right, env, line)?
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left, env, line)?;
                if left.truthy() {
                    left
                } else {
                    self.eval(right, env, line)?
                }
            }
            Expr::IfElse(cond, then, otherwise) => {
                if self.eval(cond, env, line)?.truthy() {
                    self.eval(then, env, line)?
                } else {
                    self.eval(otherwise, env, line)?
                }
            }
            Expr::Index(target, index) => {
                let target = self.eval(target, env, line)?;
                let index = self.eval(index, env, line)?;
                subscript(&target, &index).map_err(|m| runtime(line, m))?
            }
            Expr::Slice(target, start, end) => {
                let target = self.eval(target, env, line)?;
                let start = match start {
                    Some(e) => Some(self.eval(e, env, line)?),
                    None => None,
                };
                let end = match end {
                    Some(e) => Some(self.eval(e, env, line)?),
                    None => None,
                };
                let part = slice(&target, start.as_ref(), end.as_ref()).map_err(|m| runtime(line, m))?;
                self.meter.charge(part.own_bytes())?;
                part
            }
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, env, line)?);
                }
                let program = self.program;
                if let Some(function) = program.functions.get(name) {
                    if function.params.len() != values.len() {
                        return Err(runtime(
                            line,
                            format!(
                                "`{name}` takes {} arguments, {} given",
                                function.params.len(),
                                values.len()
                            ),
                        ));
                    }
                    self.call_function(function, values)?
                } else if self.ctx.allows_builtin(name) {
                    let result = call_builtin(name, values).map_err(|m| runtime(line, m))?;
                    self.meter.charge(result.own_bytes())?;
                    result
                } else {
                    return Err(runtime(line, format!("`{name}` is not callable here")));
                }
            }
        })
    }

    /// Depth-checks and charges a freshly built list or dict.
    fn admit(&mut self, value: Val) -> Result<Val, EngineError> {
        if value.depth() > MAX_VALUE_DEPTH {
            return Err(too_deep_value());
        }
        self.meter.charge(value.own_bytes())?;
        Ok(value)
    }
}

/// Bytes a sequence `+` or `*` would build. Zero for numeric operations.
fn projected_bytes(op: BinOp, left: &Val, right: &Val) -> usize {
    let times = |n: &Val| usize::try_from(n.as_int().unwrap_or_default().max(0)).unwrap_or(usize::MAX);
    match (op, left, right) {
        (BinOp::Add, Val::Str(a), Val::Str(b)) => a.len().saturating_add(b.len()),
        (BinOp::Add, Val::List(a), Val::List(b)) => a.len().saturating_add(b.len()).saturating_mul(SLOT_BYTES),
        (BinOp::Mul, Val::Str(s), n) | (BinOp::Mul, n, Val::Str(s)) if n.as_int().is_some() => {
            s.len().saturating_mul(times(n))
        }
        (BinOp::Mul, Val::List(items), n) | (BinOp::Mul, n, Val::List(items)) if n.as_int().is_some() => {
            items.len().saturating_mul(SLOT_BYTES).saturating_mul(times(n))
        }
        _ => 0,
    }
}

fn check_len(len: usize) -> Result<(), String> {
    if len > MAX_SEQUENCE_LEN {
        Err(format!("sequence of {len} elements exceeds the sandbox limit"))
    } else {
        Ok(())
    }
}

fn finite(value: f64) -> Result<Val, String> {
    if value.is_finite() {
        Ok(Val::Float(value))
    } else {
        Err("numeric overflow".to_string())
    }
}

fn repeat_count(count: i64) -> Result<usize, String> {
    usize::try_from(count.max(0)).map_err(|_| "repeat count too large".to_string())
}

fn repeat(items: &[Val], count: i64) -> Result<Vec<Val>, String> {
    let count = repeat_count(count)?;
    check_len(items.len().saturating_mul(count))?;
    Ok(std::iter::repeat(items).take(count).flatten().cloned().collect())
}

fn binary(op: BinOp, left: Val, right: Val) -> Result<Val, String> {
    use Val::{Int, List, Str};
    let type_error = |l: &Val, r: &Val| {
        format!(
            "unsupported operand types for {:?}: {} and {}",
            op,
            l.type_name(),
            r.type_name()
        )
    };

    match (op, &left, &right) {
        (BinOp::Add, Str(a), Str(b)) => {
            check_len(a.chars().count() + b.chars().count())?;
            return Ok(Str(format!("{a}{b}").into()));
        }
        (BinOp::Add, List(a), List(b)) => {
            check_len(a.len() + b.len())?;
            return Ok(List(Arc::new(a.iter().chain(b.iter()).cloned().collect())));
        }
        (BinOp::Mul, Str(s), n) | (BinOp::Mul, n, Str(s)) if n.as_int().is_some() => {
            let count = repeat_count(n.as_int().unwrap_or_default())?;
            check_len(s.chars().count().saturating_mul(count))?;
            return Ok(Str(s.repeat(count).into()));
        }
        (BinOp::Mul, List(items), n) | (BinOp::Mul, n, List(items)) if n.as_int().is_some() => {
            let count = n.as_int().unwrap_or_default();
            return Ok(List(Arc::new(repeat(items, count)?)));
        }
        _ => {}
    }

    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        let overflow = || "integer overflow".to_string();
        return match op {
            BinOp::Add => a.checked_add(b).map(Int).ok_or_else(overflow),
            BinOp::Sub => a.checked_sub(b).map(Int).ok_or_else(overflow),
            BinOp::Mul => a.checked_mul(b).map(Int).ok_or_else(overflow),
            BinOp::Div => {
                if b == 0 {
                    Err("division by zero".to_string())
                } else {
                    finite(a as f64 / b as f64)
                }
            }
            BinOp::FloorDiv | BinOp::Mod if b == 0 => Err("integer division by zero".to_string()),
            BinOp::FloorDiv => {
                let q = a.checked_div(b).ok_or_else(overflow)?;
                Ok(Int(if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q }))
            }
            BinOp::Mod => {
                let r = a.checked_rem(b).ok_or_else(overflow)?;
                Ok(Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }))
            }
            BinOp::Pow => {
                if b < 0 {
                    finite((a as f64).powf(b as f64))
                } else {
                    let exp = u32::try_from(b).map_err(|_| overflow())?;
                    a.checked_pow(exp).map(Int).ok_or_else(overflow)
                }
            }
        };
    }

    let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
        return Err(type_error(&left, &right));
    };
    match op {
        BinOp::Add => finite(a + b),
        BinOp::Sub => finite(a - b),
        BinOp::Mul => finite(a * b),
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => Err("float division by zero".to_string()),
        BinOp::Div => finite(a / b),
        BinOp::FloorDiv => finite((a / b).floor()),
        BinOp::Mod => finite(a - b * (a / b).floor()),
        BinOp::Pow => finite(a.powf(b)),
    }
}

fn values_equal(left: &Val, right: &Val) -> bool {
    match (left, right) {
        (Val::List(a), Val::List(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Val::Dict(a), Val::Dict(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && values_equal(va, vb))
        }
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => left == right,
        },
    }
}

fn ordering(left: &Val, right: &Val) -> Result<Ordering, String> {
    match (left, right) {
        (Val::Str(a), Val::Str(b)) => Ok(a.cmp(b)),
        (Val::List(a), Val::List(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                match ordering(x, y)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| "cannot order NaN".to_string()),
            _ => Err(format!(
                "cannot order {} and {}",
                left.type_name(),
                right.type_name()
            )),
        },
    }
}

fn compare(op: CmpOp, left: &Val, right: &Val) -> Result<bool, String> {
    Ok(match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Lt => ordering(left, right)? == Ordering::Less,
        CmpOp::Le => ordering(left, right)? != Ordering::Greater,
        CmpOp::Gt => ordering(left, right)? == Ordering::Greater,
        CmpOp::Ge => ordering(left, right)? != Ordering::Less,
        CmpOp::In | CmpOp::NotIn => {
            let found = match right {
                Val::List(items) => items.iter().any(|item| values_equal(item, left)),
                Val::Dict(map) => match left {
                    Val::Str(key) => map.contains_key(&**key),
                    _ => false,
                },
                Val::Str(haystack) => match left {
                    Val::Str(needle) => haystack.contains(&**needle),
                    other => {
                        return Err(format!(
                            "'in <str>' requires str, not {}",
                            other.type_name()
                        ))
                    }
                },
                other => return Err(format!("{} is not a container", other.type_name())),
            };
            if op == CmpOp::In {
                found
            } else {
                !found
            }
        }
    })
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let idx = if index < 0 { index + len } else { index };
    (0..len).contains(&idx).then_some(idx as usize)
}

fn subscript(target: &Val, index: &Val) -> Result<Val, String> {
    match (target, index) {
        (Val::List(items), idx) if idx.as_int().is_some() => {
            let i = idx.as_int().unwrap_or_default();
            normalize_index(i, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| "list index out of range".to_string())
        }
        (Val::Str(s), idx) if idx.as_int().is_some() => {
            let i = idx.as_int().unwrap_or_default();
            normalize_index(i, s.chars().count())
                .and_then(|i| s.chars().nth(i))
                .map(|c| Val::Str(c.to_string().into()))
                .ok_or_else(|| "string index out of range".to_string())
        }
        (Val::Dict(map), Val::Str(key)) => map
            .get(&**key)
            .cloned()
            .ok_or_else(|| format!("key '{key}' not found")),
        _ => Err(format!(
            "{} indices must be valid, not {}",
            target.type_name(),
            index.type_name()
        )),
    }
}

fn slice_bounds(len: usize, start: Option<&Val>, end: Option<&Val>) -> Result<(usize, usize), String> {
    let clamp = |value: Option<&Val>, default: usize| -> Result<usize, String> {
        let Some(value) = value else {
            return Ok(default);
        };
        let raw = value
            .as_int()
            .ok_or_else(|| format!("slice indices must be int, not {}", value.type_name()))?;
        let len_i = i64::try_from(len).map_err(|_| "sequence too long".to_string())?;
        let adjusted = if raw < 0 { (raw + len_i).max(0) } else { raw.min(len_i) };
        Ok(adjusted as usize)
    };
    let start = clamp(start, 0)?;
    let end = clamp(end, len)?;
    Ok((start, end.max(start)))
}

fn slice(target: &Val, start: Option<&Val>, end: Option<&Val>) -> Result<Val, String> {
    match target {
        Val::List(items) => {
            let (s, e) = slice_bounds(items.len(), start, end)?;
            Ok(Val::List(Arc::new(items[s..e].to_vec())))
        }
        Val::Str(text) => {
            let (s, e) = slice_bounds(text.chars().count(), start, end)?;
            let part: String = text.chars().skip(s).take(e - s).collect();
            Ok(Val::Str(part.into()))
        }
        other => Err(format!("{} is not sliceable", other.type_name())),
    }
}

fn extremum(name: &str, args: Vec<Val>, want: Ordering) -> Result<Val, String> {
    let items = match args.as_slice() {
        [Val::List(items)] => items.to_vec(),
        _ => args,
    };
    let mut iter = items.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| format!("{name}() arg is an empty sequence"))?;
    for item in iter {
        if ordering(&item, &best)? == want {
            best = item;
        }
    }
    Ok(best)
}

fn call_builtin(name: &str, args: Vec<Val>) -> Result<Val, String> {
    let given = args.len();
    let arity = |expected: &str| format!("{name}() takes {expected} argument(s), {given} given");
    match name {
        "min" if given > 0 => return extremum(name, args, Ordering::Less),
        "max" if given > 0 => return extremum(name, args, Ordering::Greater),
        _ => {}
    }
    match (name, args.as_slice()) {
        ("abs", [Val::Int(i)]) => i.checked_abs().map(Val::Int).ok_or_else(|| "integer overflow".to_string()),
        ("abs", [v]) => v
            .as_number()
            .map(|f| Val::Float(f.abs()))
            .ok_or_else(|| format!("bad operand type for abs(): {}", v.type_name())),
        ("round", [Val::Int(i)]) => Ok(Val::Int(*i)),
        ("round", [v]) => {
            let f = v
                .as_number()
                .ok_or_else(|| format!("round() needs a number, not {}", v.type_name()))?;
            let rounded = f.round_ties_even();
            if rounded.is_finite() && rounded.abs() < 9.2e18 {
                Ok(Val::Int(rounded as i64))
            } else {
                Err("cannot round a non-finite or huge number to int".to_string())
            }
        }
        ("round", [v, digits]) => {
            let f = v
                .as_number()
                .ok_or_else(|| format!("round() needs a number, not {}", v.type_name()))?;
            let digits = digits
                .as_int()
                .ok_or_else(|| "round() digits must be int".to_string())?
                .clamp(-15, 15) as i32;
            let scale = 10f64.powi(digits);
            finite((f * scale).round_ties_even() / scale)
        }
        ("len", [Val::Str(s)]) => Ok(Val::Int(s.chars().count() as i64)),
        ("len", [Val::List(items)]) => Ok(Val::Int(items.len() as i64)),
        ("len", [Val::Dict(map)]) => Ok(Val::Int(map.len() as i64)),
        ("len", [v]) => Err(format!("object of type {} has no len()", v.type_name())),
        ("sum", [Val::List(items)]) => items
            .iter()
            .cloned()
            .try_fold(Val::Int(0), |acc, item| binary(BinOp::Add, acc, item)),
        ("sum", [Val::List(items), start]) => items
            .iter()
            .cloned()
            .try_fold(start.clone(), |acc, item| binary(BinOp::Add, acc, item)),
        ("float", []) => Ok(Val::Float(0.0)),
        ("float", [Val::Str(s)]) => s
            .trim()
            .parse::<f64>()
            .map(Val::Float)
            .map_err(|_| format!("could not convert string to float: '{s}'")),
        ("float", [v]) => v
            .as_number()
            .map(Val::Float)
            .ok_or_else(|| format!("float() argument must be a number, not {}", v.type_name())),
        ("int", []) => Ok(Val::Int(0)),
        ("int", [Val::Float(f)]) => {
            if f.is_finite() && f.abs() < 9.2e18 {
                Ok(Val::Int(f.trunc() as i64))
            } else {
                Err("cannot convert float to int".to_string())
            }
        }
        ("int", [Val::Str(s)]) => s
            .trim()
            .parse::<i64>()
            .map(Val::Int)
            .map_err(|_| format!("invalid literal for int(): '{s}'")),
        ("int", [v]) => v
            .as_int()
            .map(Val::Int)
            .ok_or_else(|| format!("int() argument must be a number, not {}", v.type_name())),
        ("str", []) => Ok(Val::Str("".into())),
        ("str", [v]) => Ok(Val::Str(v.display().into())),
        ("bool", []) => Ok(Val::Bool(false)),
        ("bool", [v]) => Ok(Val::Bool(v.truthy())),
        ("min" | "max", []) => Err(arity("at least 1")),
        ("sum", _) => Err(arity("1 or 2")),
        ("round", _) => Err(arity("1 or 2")),
        _ => Err(arity("a different number of")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ResourceLimits;
    use crate::request::ExecutionId;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn run(code: &str, entry: &str, params: Value) -> Result<Value, EngineError> {
        let ctx = ExecutionContext::new(ExecutionId::new(), CancellationToken::new());
        run_in(ctx, code, entry, params)
    }

    fn run_limited(code: &str, entry: &str, params: Value, limits: ResourceLimits) -> Result<Value, EngineError> {
        let ctx = ExecutionContext::new(ExecutionId::new(), CancellationToken::new()).with_limits(limits);
        run_in(ctx, code, entry, params)
    }

    fn run_in(ctx: ExecutionContext, code: &str, entry: &str, params: Value) -> Result<Value, EngineError> {
        let engine = ExpressionEngine::new();
        let unit = engine.compile(code)?;
        let params: BTreeMap<String, Value> = serde_json::from_value(params).unwrap();
        engine.invoke(&unit, entry, &params, &ctx)
    }

    #[test]
    fn doubles_input() {
        let code = "def f(x, p):\n    return x * 2\n";
        assert_eq!(run(code, "f", json!({"x": 21, "p": {}})).unwrap(), json!(42));
        assert_eq!(run(code, "f", json!({"x": 1.5, "p": null})).unwrap(), json!(3.0));
    }

    #[test]
    fn round_trips_json_values() {
        let code = "def echo(value):\n    return value\n";
        let payload = json!({"a": [1, 2.5, "s", null, true], "b": {"c": -7}});
        assert_eq!(run(code, "echo", json!({ "value": payload.clone() })).unwrap(), payload);
    }

    #[test]
    fn evaluates_strategy_logic() {
        let code = r#"
def signal(prices, p):
    fast = sum(prices[-p['fast']:]) / p['fast']
    slow = sum(prices[-p['slow']:]) / p['slow']
    if fast > slow * (1 + p['band']):
        return 'buy'
    elif fast < slow * (1 - p['band']):
        return 'sell'
    else:
        return 'hold'
"#;
        let params = json!({
            "prices": [10, 10, 10, 10, 12, 13],
            "p": {"fast": 2, "slow": 6, "band": 0.05}
        });
        assert_eq!(run(code, "signal", params).unwrap(), json!("buy"));
    }

    #[test]
    fn python_arithmetic_semantics() {
        let code = "def f(a, b):\n    return [a // b, a % b, a / b, -a // b, a ** 2, round(2.5), round(3.5)]\n";
        assert_eq!(
            run(code, "f", json!({"a": 7, "b": 2})).unwrap(),
            json!([3, 1, 3.5, -4, 49, 2, 4])
        );
    }

    #[test]
    fn builtins_and_helpers() {
        let code = "def size(equity, p):\n    return round(min(equity * p['risk'], p['cap']), 2)\n\ndef g(xs):\n    return [len(xs), max(xs), min(3, 1, 2), abs(-4), int('7'), float(1), str(2.0), bool(0)]\n";
        assert_eq!(
            run(code, "size", json!({"equity": 1000, "p": {"risk": 0.0125, "cap": 50}})).unwrap(),
            json!(12.5)
        );
        assert_eq!(
            run(code, "g", json!({"xs": [3, 9, 4]})).unwrap(),
            json!([3, 9, 1, 4, 7, 1.0, "2.0", false])
        );
    }

    #[test]
    fn user_functions_can_call_each_other() {
        let code = "def half(x):\n    return x / 2\n\ndef f(x):\n    y = half(x)\n    y += 1\n    return y\n";
        assert_eq!(run(code, "f", json!({"x": 8})).unwrap(), json!(5.0));
    }

    #[test]
    fn recursion_is_depth_bounded() {
        let code = "def f(n):\n    return f(n + 1)\n";
        let err = run(code, "f", json!({"n": 0})).unwrap_err();
        assert_eq!(err, EngineError::runtime("maximum call depth exceeded"));
    }

    #[test]
    fn rejects_unsupported_constructs() {
        for code in [
            "import os\ndef f():\n    return 1\n",
            "def f(x):\n    while True:\n        pass\n",
            "def f(x):\n    return x.__class__\n",
            "def f(x=1):\n    return x\n",
            "x = 1\n",
            "def f(x):\n    return [i for i in x]\n",
        ] {
            assert!(
                matches!(ExpressionEngine::new().compile(code), Err(EngineError::Compile { .. })),
                "{code:?} compiled"
            );
        }
    }

    #[test]
    fn compile_error_carries_line() {
        let err = ExpressionEngine::new()
            .compile("def f(x):\n    y = 1\n    for i in x:\n        pass\n")
            .unwrap_err();
        assert!(matches!(err, EngineError::Compile { line: Some(3), .. }));
    }

    #[test]
    fn missing_parameter_is_a_runtime_error() {
        let err = run("def f(x, p):\n    return x\n", "f", json!({"x": 1})).unwrap_err();
        assert_eq!(err, EngineError::runtime("missing parameter `p`"));
    }

    #[test]
    fn unknown_calls_are_rejected_at_runtime() {
        let err = run("def f(x):\n    return open(x)\n", "f", json!({"x": "/etc/passwd"})).unwrap_err();
        assert!(matches!(err, EngineError::Runtime { .. }));
    }

    #[test]
    fn huge_repetition_is_refused() {
        let err = run("def f(n):\n    return [0] * n\n", "f", json!({"n": 100_000_000})).unwrap_err();
        assert!(matches!(err, EngineError::Runtime { .. }));
    }

    #[test]
    fn repetition_clones_compound_items() {
        let code = "def f(x):\n    return [[x], 'a'] * 3 + ['ab' * 2]\n";
        assert_eq!(
            run(code, "f", json!({"x": 1})).unwrap(),
            json!([[1], "a", [1], "a", [1], "a", "abab"])
        );
    }

    #[test]
    fn deep_parenthesised_expression_fails_to_compile() {
        let code = format!("def f(x):\n    return {}x{}\n", "(".repeat(20_000), ")".repeat(20_000));
        let err = ExpressionEngine::new().compile(&code).unwrap_err();
        assert!(matches!(err, EngineError::Compile { line: Some(2), .. }), "{err:?}");

        let shallow = format!("def f(x):\n    return {}x{}\n", "(".repeat(30), ")".repeat(30));
        assert!(ExpressionEngine::new().compile(&shallow).is_ok());
    }

    #[test]
    fn long_operator_chains_and_unary_runs_are_bounded() {
        for body in [
            vec!["x"; 5_000].join(" + "),
            format!("{}x", "-".repeat(5_000)),
            format!("{}x", "not ".repeat(5_000)),
            format!("x{}", "[0]".repeat(5_000)),
        ] {
            let code = format!("def f(x):\n    return {body}\n");
            assert!(
                matches!(ExpressionEngine::new().compile(&code), Err(EngineError::Compile { .. })),
                "{} compiled",
                &body[..20]
            );
        }
        assert_eq!(
            run(&format!("def f(x):\n    return {}\n", vec!["x"; 50].join(" + ")), "f", json!({"x": 2})).unwrap(),
            json!(100)
        );
    }

    #[test]
    fn deeply_nested_blocks_fail_to_compile() {
        let mut code = String::from("def f(x):\n");
        for level in 1..=40 {
            code.push_str(&"    ".repeat(level));
            code.push_str("if x:\n");
        }
        code.push_str(&"    ".repeat(41));
        code.push_str("return 1\n");
        let err = ExpressionEngine::new().compile(&code).unwrap_err();
        assert!(matches!(err, EngineError::Compile { .. }), "{err:?}");
    }

    #[test]
    fn allocation_budget_stops_large_sequences() {
        let limits = ResourceLimits {
            memory_mb: 16,
            ..ResourceLimits::default()
        };
        let code = "def f(x):\n    a = [x] * 999999\n    b = a + a\n    return len(b)\n";
        let err = run_limited(code, "f", json!({"x": [1, 2, 3]}), limits).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { .. }), "{err:?}");

        let within = "def f(x):\n    a = [x] * 1000\n    return len(a + a)\n";
        assert_eq!(run_limited(within, "f", json!({"x": 1}), limits).unwrap(), json!(2000));
    }

    #[test]
    fn allocation_budget_is_cumulative() {
        let limits = ResourceLimits {
            memory_mb: 1,
            ..ResourceLimits::default()
        };
        let code = "def f(s):\n    a = s * 400000\n    b = s * 400000\n    c = s * 400000\n    return len(a + b + c)\n";
        let err = run_limited(code, "f", json!({"s": "x"}), limits).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { .. }), "{err:?}");
    }

    #[test]
    fn evaluation_depth_follows_stack_size() {
        let code = "def f(n):\n    if n > 60:\n        return n\n    return f(n + 1)\n";
        assert_eq!(run(code, "f", json!({"n": 0})).unwrap(), json!(61));

        let small_stack = ResourceLimits {
            stack_mb: 1,
            ..ResourceLimits::default()
        };
        let err = run_limited(code, "f", json!({"n": 0}), small_stack).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { .. }), "{err:?}");
    }

    #[test]
    fn deeply_nested_values_are_refused() {
        let mut input = json!(1);
        for _ in 0..200 {
            input = json!([input]);
        }
        let err = run("def echo(value):\n    return value\n", "echo", json!({ "value": input })).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { .. }), "{err:?}");

        let code = "def wrap(x, n):\n    if n == 0:\n        return x\n    return wrap([[[x]]], n - 1)\n";
        let err = run(code, "wrap", json!({"x": 1, "n": 60})).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { .. }), "{err:?}");
    }

    #[test]
    fn honours_cancellation() {
        let engine = ExpressionEngine::new();
        let unit = engine.compile("def f(x):\n    return x\n").unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = ExecutionContext::new(ExecutionId::new(), token);
        let params = BTreeMap::from([("x".to_string(), json!(1))]);
        assert_eq!(engine.invoke(&unit, "f", &params, &ctx), Err(EngineError::Cancelled));
    }
}
