//! Lightweight syntax model for strategy scripts.
//!
//! Strategy scripts are Python-flavoured. Static analysis only needs tokens
//! grouped into logical lines and an indentation tree, so nothing here ever
//! fails: malformed input yields a best-effort tree plus a list of issues.

/// Coarse token classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    Str,
    Op,
}

/// A single lexed token. For strings, `text` holds the raw body without quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
        }
    }

    pub fn is_name(&self, name: &str) -> bool {
        self.kind == TokenKind::Name && self.text == name
    }

    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }
}

/// Tokens of one logical line (physical lines joined inside brackets or by `\`).
#[derive(Debug, Clone)]
pub struct LogicalLine {
    pub line: usize,
    pub indent: usize,
    pub tokens: Vec<Token>,
}

/// Problems the lexer recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxIssue {
    UnterminatedString { line: usize },
    UnbalancedBracket { line: usize },
}

impl SyntaxIssue {
    pub fn line(&self) -> usize {
        match self {
            SyntaxIssue::UnterminatedString { line } | SyntaxIssue::UnbalancedBracket { line } => {
                *line
            }
        }
    }
}

/// Output of [`tokenize`].
#[derive(Debug, Clone, Default)]
pub struct Lexed {
    pub lines: Vec<LogicalLine>,
    pub issues: Vec<SyntaxIssue>,
}

const THREE_CHAR_OPS: &[&str] = &["**=", "//=", ">>=", "<<=", "..."];
const TWO_CHAR_OPS: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "->", ":=", "+=", "-=", "*=", "/=", "%=", "&=", "|=",
    "^=", "<<", ">>", "@=",
];
const STRING_PREFIXES: &[&str] = &["r", "b", "u", "f", "rb", "br", "fr", "rf"];

/// Splits source into logical lines of tokens.
pub fn tokenize(source: &str) -> Lexed {
    let chars: Vec<char> = source.chars().collect();
    let n = chars.len();
    let mut out = Lexed::default();

    let mut i = 0;
    let mut line = 1;
    let mut depth = 0usize;
    let mut at_line_start = true;
    let mut indent = 0;
    let mut current: Vec<Token> = Vec::new();
    let mut current_line = 1;

    let flush = |current: &mut Vec<Token>, out: &mut Lexed, indent: usize, line: usize| {
        if !current.is_empty() {
            out.lines.push(LogicalLine {
                line,
                indent,
                tokens: std::mem::take(current),
            });
        }
    };

    while i < n {
        if at_line_start {
            let mut width = 0;
            while i < n && (chars[i] == ' ' || chars[i] == '\t') {
                width += if chars[i] == '\t' { 8 - width % 8 } else { 1 };
                i += 1;
            }
            at_line_start = false;
            if depth == 0 && current.is_empty() {
                indent = width;
            }
            continue;
        }

        let c = chars[i];
        match c {
            '\n' => {
                i += 1;
                line += 1;
                at_line_start = true;
                if depth == 0 {
                    flush(&mut current, &mut out, indent, current_line);
                }
            }
            ' ' | '\t' | '\r' | '\x0c' => i += 1,
            '#' => {
                while i < n && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\\' if matches!(chars.get(i + 1), Some('\n')) => {
                i += 2;
                line += 1;
            }
            '\\' if matches!(chars.get(i + 1), Some('\r')) && matches!(chars.get(i + 2), Some('\n')) => {
                i += 3;
                line += 1;
            }
            '"' | '\'' => {
                let start_line = line;
                let (text, next, newlines, terminated) = lex_string(&chars, i);
                if !terminated {
                    out.issues.push(SyntaxIssue::UnterminatedString { line: start_line });
                }
                push_token(&mut current, &mut current_line, Token::new(TokenKind::Str, text, start_line));
                line += newlines;
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < n && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let lower = word.to_ascii_lowercase();
                if i < n && (chars[i] == '"' || chars[i] == '\'') && STRING_PREFIXES.contains(&lower.as_str()) {
                    let start_line = line;
                    let (text, next, newlines, terminated) = lex_string(&chars, i);
                    if !terminated {
                        out.issues.push(SyntaxIssue::UnterminatedString { line: start_line });
                    }
                    push_token(&mut current, &mut current_line, Token::new(TokenKind::Str, text, start_line));
                    line += newlines;
                    i = next;
                } else {
                    push_token(&mut current, &mut current_line, Token::new(TokenKind::Name, word, line));
                }
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                while i < n && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                push_token(&mut current, &mut current_line, Token::new(TokenKind::Number, text, line));
            }
            '(' | '[' | '{' => {
                depth += 1;
                push_token(&mut current, &mut current_line, Token::new(TokenKind::Op, c.to_string(), line));
                i += 1;
            }
            ')' | ']' | '}' => {
                if depth == 0 {
                    out.issues.push(SyntaxIssue::UnbalancedBracket { line });
                } else {
                    depth -= 1;
                }
                push_token(&mut current, &mut current_line, Token::new(TokenKind::Op, c.to_string(), line));
                i += 1;
            }
            _ => {
                let op = match_operator(&chars[i..]);
                i += op.chars().count();
                push_token(&mut current, &mut current_line, Token::new(TokenKind::Op, op, line));
            }
        }
    }
    flush(&mut current, &mut out, indent, current_line);
    out
}

fn push_token(current: &mut Vec<Token>, current_line: &mut usize, token: Token) {
    if current.is_empty() {
        *current_line = token.line;
    }
    current.push(token);
}

fn match_operator(rest: &[char]) -> String {
    for candidates in [THREE_CHAR_OPS, TWO_CHAR_OPS] {
        for op in candidates {
            let len = op.chars().count();
            if rest.len() >= len && rest[..len].iter().copied().eq(op.chars()) {
                return (*op).to_string();
            }
        }
    }
    rest[0].to_string()
}

/// Returns (body, next index, newlines consumed, terminated).
fn lex_string(chars: &[char], start: usize) -> (String, usize, usize, bool) {
    let n = chars.len();
    let quote = chars[start];
    let triple = start + 2 < n && chars[start + 1] == quote && chars[start + 2] == quote;
    let body_start = if triple { start + 3 } else { start + 1 };

    let mut j = body_start;
    let mut newlines = 0;
    while j < n {
        let c = chars[j];
        if c == '\\' {
            if chars.get(j + 1) == Some(&'\n') {
                newlines += 1;
            }
            j += 2;
            continue;
        }
        if c == '\n' {
            if !triple {
                let body: String = chars[body_start..j].iter().collect();
                return (body, j, newlines, false);
            }
            newlines += 1;
        }
        if c == quote {
            if !triple {
                let body: String = chars[body_start..j].iter().collect();
                return (body, j + 1, newlines, true);
            }
            if j + 2 < n && chars[j + 1] == quote && chars[j + 2] == quote {
                let body: String = chars[body_start..j].iter().collect();
                return (body, j + 3, newlines, true);
            }
        }
        j += 1;
    }
    let end = j.min(n);
    let body: String = chars[body_start.min(end)..end].iter().collect();
    (body, n, newlines, false)
}

const COMPOUND_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "while", "for", "def", "class", "try", "except", "finally", "with",
];

/// A statement and, for compound statements, its nested body.
#[derive(Debug, Clone)]
pub struct Statement {
    pub line: usize,
    pub indent: usize,
    pub tokens: Vec<Token>,
    pub body: Vec<Statement>,
}

impl Statement {
    /// Leading keyword, looking through `async`.
    pub fn keyword(&self) -> Option<&str> {
        let first = self.tokens.first()?;
        if first.is_name("async") {
            return self.tokens.get(1).map(|t| t.text.as_str());
        }
        (first.kind == TokenKind::Name).then_some(first.text.as_str())
    }

    pub fn is_compound(&self) -> bool {
        self.keyword().is_some_and(|k| COMPOUND_KEYWORDS.contains(&k))
    }

    /// Name declared by a `def` or `class` header.
    pub fn declared_name(&self) -> Option<&str> {
        let offset = usize::from(self.tokens.first().is_some_and(|t| t.is_name("async")));
        match self.keyword() {
            Some("def") | Some("class") => self
                .tokens
                .get(offset + 1)
                .filter(|t| t.kind == TokenKind::Name)
                .map(|t| t.text.as_str()),
            _ => None,
        }
    }
}

/// Statement tree plus any recovered lexing issues.
#[derive(Debug, Clone, Default)]
pub struct SyntaxTree {
    pub statements: Vec<Statement>,
    pub issues: Vec<SyntaxIssue>,
}

impl SyntaxTree {
    /// Every token in source order.
    pub fn tokens(&self) -> Vec<&Token> {
        let mut out = Vec::new();
        walk(&self.statements, &mut |stmt| out.extend(stmt.tokens.iter()));
        out.sort_by_key(|t| t.line);
        out
    }
}

/// Parses source into an indentation tree.
pub fn parse(source: &str) -> SyntaxTree {
    let lexed = tokenize(source);
    let mut flat = Vec::with_capacity(lexed.lines.len());
    for line in lexed.lines {
        split_logical_line(line, &mut flat);
    }
    let mut pos = 0;
    let statements = parse_suite(&mut flat, &mut pos, None);
    SyntaxTree {
        statements,
        issues: lexed.issues,
    }
}

struct PendingStatement {
    statement: Statement,
    opens_block: bool,
}

fn split_logical_line(line: LogicalLine, out: &mut Vec<PendingStatement>) {
    for segment in split_depth_zero(&line.tokens, ";") {
        if segment.is_empty() {
            continue;
        }
        let mut statement = Statement {
            line: segment[0].line,
            indent: line.indent,
            tokens: segment.to_vec(),
            body: Vec::new(),
        };
        if !statement.is_compound() {
            out.push(PendingStatement {
                statement,
                opens_block: false,
            });
            continue;
        }
        match find_depth_zero(&statement.tokens, ":") {
            Some(colon) if colon + 1 < statement.tokens.len() => {
                let tail = statement.tokens.split_off(colon + 1);
                statement.body = split_depth_zero(&tail, ";")
                    .into_iter()
                    .filter(|s| !s.is_empty())
                    .map(|s| Statement {
                        line: s[0].line,
                        indent: line.indent + 1,
                        tokens: s.to_vec(),
                        body: Vec::new(),
                    })
                    .collect();
                out.push(PendingStatement {
                    statement,
                    opens_block: false,
                });
            }
            Some(_) => out.push(PendingStatement {
                statement,
                opens_block: true,
            }),
            None => out.push(PendingStatement {
                statement,
                opens_block: false,
            }),
        }
    }
}

fn parse_suite(
    flat: &mut [PendingStatement],
    pos: &mut usize,
    parent_indent: Option<usize>,
) -> Vec<Statement> {
    let mut out = Vec::new();
    let mut suite_indent = None;
    while *pos < flat.len() {
        let indent = flat[*pos].statement.indent;
        if parent_indent.is_some_and(|p| indent <= p) {
            break;
        }
        match suite_indent {
            None => suite_indent = Some(indent),
            Some(expected) if indent < expected => break,
            _ => {}
        }
        let opens_block = flat[*pos].opens_block;
        let mut statement = std::mem::replace(
            &mut flat[*pos].statement,
            Statement {
                line: 0,
                indent: 0,
                tokens: Vec::new(),
                body: Vec::new(),
            },
        );
        *pos += 1;
        if opens_block {
            statement.body = parse_suite(flat, pos, Some(indent));
        }
        out.push(statement);
    }
    out
}

/// Splits on `sep` operators that sit outside any bracket.
pub fn split_depth_zero<'a>(tokens: &'a [Token], sep: &str) -> Vec<&'a [Token]> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Op {
            continue;
        }
        match token.text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            t if t == sep && depth <= 0 => {
                parts.push(&tokens[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&tokens[start..]);
    parts
}

fn find_depth_zero(tokens: &[Token], op: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Op {
            continue;
        }
        match token.text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            t if t == op && depth <= 0 => return Some(idx),
            _ => {}
        }
    }
    None
}

/// Tokens between the bracket at `open` and its match (or end of slice).
pub fn bracket_contents(tokens: &[Token], open: usize) -> &[Token] {
    let mut depth = 0i32;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        if token.kind != TokenKind::Op {
            continue;
        }
        match token.text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => {
                depth -= 1;
                if depth == 0 {
                    return &tokens[open + 1..idx];
                }
            }
            _ => {}
        }
    }
    tokens.get(open + 1..).unwrap_or(&[])
}

/// Pre-order traversal over a statement forest.
pub fn walk<'a>(statements: &'a [Statement], visit: &mut dyn FnMut(&'a Statement)) {
    for statement in statements {
        visit(statement);
        walk(&statement.body, visit);
    }
}
