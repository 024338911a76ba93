//! Independent analysis passes. Each pass appends findings; none of them fail.

pub(crate) mod lexical;
pub(crate) mod naming;
pub(crate) mod obfuscation;
pub(crate) mod resource;
pub(crate) mod structural;

use crate::syntax::{Token, TokenKind};

/// Parentheses, unary minus and `**` nest no deeper than this when folding.
const MAX_FOLD_DEPTH: usize = 64;

/// Index of every token that is a plain call of a free function, i.e. `name(`
/// not preceded by `.` or `def`.
pub(crate) fn free_calls(tokens: &[Token]) -> impl Iterator<Item = usize> + '_ {
    (0..tokens.len()).filter(move |&idx| {
        let token = &tokens[idx];
        if token.kind != TokenKind::Name || !tokens.get(idx + 1).is_some_and(|t| t.is_op("(")) {
            return false;
        }
        match idx.checked_sub(1).map(|p| &tokens[p]) {
            Some(prev) => !prev.is_op(".") && !prev.is_name("def") && !prev.is_name("class"),
            None => true,
        }
    })
}

/// Parses a numeric literal the way the scripts write them (`1_000`, `0x10`, `1e6`).
pub(crate) fn number_value(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let lower = cleaned.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    if let Some(oct) = lower.strip_prefix("0o") {
        return i64::from_str_radix(oct, 8).ok().map(|v| v as f64);
    }
    if let Some(bin) = lower.strip_prefix("0b") {
        return i64::from_str_radix(bin, 2).ok().map(|v| v as f64);
    }
    lower.trim_end_matches(&['j', 'l'][..]).parse::<f64>().ok()
}

/// Folds a constant arithmetic prefix (`10 ** 9`, `2 * (10 ** 6)`, `1e6 + 1`).
///
/// Returns the value and how many tokens were consumed. Expressions nested
/// past [`MAX_FOLD_DEPTH`] do not fold.
pub(crate) fn fold_constant(tokens: &[Token]) -> Option<(f64, usize)> {
    let mut pos = 0;
    let value = fold_sum(tokens, &mut pos, 0)?;
    Some((value, pos))
}

fn fold_sum(tokens: &[Token], pos: &mut usize, depth: usize) -> Option<f64> {
    let mut value = fold_product(tokens, pos, depth)?;
    while let Some(op) = tokens.get(*pos).filter(|t| t.is_op("+") || t.is_op("-")) {
        let add = op.is_op("+");
        let checkpoint = *pos;
        *pos += 1;
        match fold_product(tokens, pos, depth) {
            Some(rhs) => value = if add { value + rhs } else { value - rhs },
            None => {
                *pos = checkpoint;
                break;
            }
        }
    }
    Some(value)
}

fn fold_product(tokens: &[Token], pos: &mut usize, depth: usize) -> Option<f64> {
    let mut value = fold_power(tokens, pos, depth)?;
    while tokens.get(*pos).is_some_and(|t| t.is_op("*")) {
        let checkpoint = *pos;
        *pos += 1;
        match fold_power(tokens, pos, depth) {
            Some(rhs) => value *= rhs,
            None => {
                *pos = checkpoint;
                break;
            }
        }
    }
    Some(value)
}

fn fold_power(tokens: &[Token], pos: &mut usize, depth: usize) -> Option<f64> {
    let base = fold_atom(tokens, pos, depth)?;
    if depth < MAX_FOLD_DEPTH && tokens.get(*pos).is_some_and(|t| t.is_op("**")) {
        let checkpoint = *pos;
        *pos += 1;
        match fold_power(tokens, pos, depth + 1) {
            Some(exp) => return Some(base.powf(exp)),
            None => *pos = checkpoint,
        }
    }
    Some(base)
}

fn fold_atom(tokens: &[Token], pos: &mut usize, depth: usize) -> Option<f64> {
    if depth >= MAX_FOLD_DEPTH {
        return None;
    }
    let token = tokens.get(*pos)?;
    match token.kind {
        TokenKind::Number => {
            let value = number_value(&token.text)?;
            *pos += 1;
            Some(value)
        }
        TokenKind::Op if token.is_op("(") => {
            let checkpoint = *pos;
            *pos += 1;
            let inner = fold_sum(tokens, pos, depth + 1);
            match (inner, tokens.get(*pos)) {
                (Some(value), Some(close)) if close.is_op(")") => {
                    *pos += 1;
                    Some(value)
                }
                _ => {
                    *pos = checkpoint;
                    None
                }
            }
        }
        TokenKind::Op if token.is_op("-") => {
            let checkpoint = *pos;
            *pos += 1;
            let value = fold_atom(tokens, pos, depth + 1).map(|v| -v);
            if value.is_none() {
                *pos = checkpoint;
            }
            value
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::tokenize;

    fn tokens(src: &str) -> Vec<Token> {
        tokenize(src).lines.remove(0).tokens
    }

    #[test]
    fn parses_literal_forms() {
        assert_eq!(number_value("1_000"), Some(1000.0));
        assert_eq!(number_value("0x10"), Some(16.0));
        assert_eq!(number_value("1e6"), Some(1_000_000.0));
        assert_eq!(number_value("abc"), None);
    }

    #[test]
    fn folds_power_and_product() {
        let toks = tokens("2 * 10 ** 9");
        let (value, consumed) = fold_constant(&toks).unwrap();
        assert_eq!(value, 2e9);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn stops_at_non_constant() {
        let toks = tokens("10 * n");
        let (value, consumed) = fold_constant(&toks).unwrap();
        assert_eq!(value, 10.0);
        assert_eq!(consumed, 1);
        assert!(fold_constant(&tokens("n * 10")).is_none());
    }

    #[test]
    fn deep_nesting_does_not_fold() {
        let deep = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(fold_constant(&tokens(&deep)).is_none());
        assert!(fold_constant(&tokens(&format!("{}1", "-".repeat(10_000)))).is_none());

        let towers = vec!["2"; 10_000].join(" ** ");
        let (_, consumed) = fold_constant(&tokens(&towers)).unwrap();
        assert!(consumed < 2 * MAX_FOLD_DEPTH + 2);

        let shallow = format!("{}7{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(fold_constant(&tokens(&shallow)).unwrap().0, 7.0);
        assert_eq!(fold_constant(&tokens("--3")).unwrap().0, 3.0);
    }

    #[test]
    fn detects_free_calls_only() {
        let toks = tokens("obj.eval(x) + eval(y)");
        let calls: Vec<usize> = free_calls(&toks).collect();
        assert_eq!(calls.len(), 1);
        assert!(toks[calls[0]].is_name("eval"));
    }
}
