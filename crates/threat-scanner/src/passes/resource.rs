//! Resource-shape pass: huge allocations, huge exponents, unbounded recursion,
//! and expressions nested deep enough to exhaust a parser's stack.

use crate::finding::{Severity, ThreatCategory, ThreatFinding};
use crate::passes::{fold_constant, free_calls};
use crate::syntax::{bracket_contents, split_depth_zero, walk, Statement, SyntaxTree, Token, TokenKind};

const ALLOCATING_CALLS: &[&str] = &["range", "bytearray", "bytes", "xrange"];

const EXPONENT_THRESHOLD: f64 = 10_000.0;

/// Bracket depth past which a statement is flagged.
const NESTING_THRESHOLD: usize = 50;

pub(crate) fn run(tree: &SyntaxTree, allocation_threshold: u64, out: &mut Vec<ThreatFinding>) {
    let threshold = allocation_threshold as f64;
    walk(&tree.statements, &mut |stmt| {
        check_allocating_calls(&stmt.tokens, threshold, out);
        check_sequence_repeat(&stmt.tokens, threshold, out);
        check_exponents(&stmt.tokens, out);
        check_nesting(&stmt.tokens, out);
        if stmt.keyword() == Some("def") {
            check_recursion(stmt, out);
        }
    });
}

/// Value of `tokens` when the whole slice is a constant expression.
fn whole_constant(tokens: &[Token]) -> Option<f64> {
    match fold_constant(tokens) {
        Some((value, consumed)) if consumed == tokens.len() => Some(value),
        _ => None,
    }
}

fn check_allocating_calls(tokens: &[Token], threshold: f64, out: &mut Vec<ThreatFinding>) {
    for idx in free_calls(tokens) {
        let name = tokens[idx].text.as_str();
        if !ALLOCATING_CALLS.contains(&name) {
            continue;
        }
        let args = bracket_contents(tokens, idx + 1);
        let size = split_depth_zero(args, ",")
            .into_iter()
            .filter_map(whole_constant)
            .fold(0.0_f64, f64::max);
        if size >= threshold {
            out.push(ThreatFinding::new(
                Severity::High,
                ThreatCategory::ResourceExhaustion,
                tokens[idx].line,
                format!("`{name}` sized at {size:.0} elements"),
                "Keep allocations proportional to the input data",
            ));
        }
    }
}

fn check_sequence_repeat(tokens: &[Token], threshold: f64, out: &mut Vec<ThreatFinding>) {
    for idx in 1..tokens.len() {
        if !tokens[idx].is_op("*") {
            continue;
        }
        let left = &tokens[idx - 1];
        let sequence_on_left = left.is_op("]") || left.kind == TokenKind::Str;
        let sequence_on_right = tokens
            .get(idx + 1)
            .is_some_and(|t| t.is_op("[") || t.kind == TokenKind::Str);

        let count = if sequence_on_left {
            fold_constant(&tokens[idx + 1..]).map(|(value, _)| value)
        } else if sequence_on_right && left.kind == TokenKind::Number {
            whole_constant(std::slice::from_ref(left))
        } else {
            None
        };
        if count.is_some_and(|n| n >= threshold) {
            out.push(ThreatFinding::new(
                Severity::High,
                ThreatCategory::ResourceExhaustion,
                tokens[idx].line,
                "sequence repeated to a very large size",
                "Keep allocations proportional to the input data",
            ));
        }
    }
}

fn check_exponents(tokens: &[Token], out: &mut Vec<ThreatFinding>) {
    for idx in 0..tokens.len() {
        if !tokens[idx].is_op("**") {
            continue;
        }
        let exponent = fold_constant(&tokens[idx + 1..]).map(|(value, _)| value);
        if exponent.is_some_and(|e| e >= EXPONENT_THRESHOLD) {
            out.push(ThreatFinding::new(
                Severity::Medium,
                ThreatCategory::ResourceExhaustion,
                tokens[idx].line,
                "very large exponent",
                "Bound exponents; big-integer powers can exhaust CPU and memory",
            ));
        }
    }
}

fn check_nesting(tokens: &[Token], out: &mut Vec<ThreatFinding>) {
    let mut depth = 0usize;
    let mut deepest = (0usize, 0usize);
    for token in tokens {
        match token.text.as_str() {
            "(" | "[" | "{" if token.kind == TokenKind::Op => {
                depth += 1;
                if depth > deepest.0 {
                    deepest = (depth, token.line);
                }
            }
            ")" | "]" | "}" if token.kind == TokenKind::Op => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    let (levels, line) = deepest;
    if levels > NESTING_THRESHOLD {
        out.push(ThreatFinding::new(
            Severity::High,
            ThreatCategory::ResourceExhaustion,
            line,
            format!("expression nested {levels} levels deep"),
            "Flatten the expression; deep nesting exhausts the parser stack",
        ));
    }
}

fn check_recursion(def: &Statement, out: &mut Vec<ThreatFinding>) {
    let Some(name) = def.declared_name() else {
        return;
    };
    let mut recursive_line = None;
    let mut has_condition = false;
    walk(&def.body, &mut |stmt| {
        if matches!(stmt.keyword(), Some("if") | Some("elif") | Some("while")) {
            has_condition = true;
        }
        if stmt.tokens.iter().any(|t| t.is_name("if")) {
            has_condition = true;
        }
        if recursive_line.is_none() {
            recursive_line = free_calls(&stmt.tokens)
                .find(|&idx| stmt.tokens[idx].text == name)
                .map(|idx| stmt.tokens[idx].line);
        }
    });
    let Some(line) = recursive_line else {
        return;
    };
    let (severity, description) = if has_condition {
        (Severity::Medium, format!("function `{name}` calls itself"))
    } else {
        (
            Severity::High,
            format!("function `{name}` calls itself with no conditional base case"),
        )
    };
    out.push(ThreatFinding::new(
        severity,
        ThreatCategory::ResourceExhaustion,
        line,
        description,
        "Prefer iteration; recursion depth is bounded by the sandbox stack",
    ));
}
