//! Structural pass over the statement tree.

use crate::finding::{Severity, ThreatCategory, ThreatFinding};
use crate::passes::{free_calls, number_value};
use crate::syntax::{bracket_contents, split_depth_zero, walk, Statement, SyntaxTree, Token, TokenKind};

/// Modules that grant process, network, filesystem, reflection or
/// deserialization capabilities.
const DANGEROUS_MODULES: &[&str] = &[
    "os", "sys", "subprocess", "socket", "socketserver", "ssl", "shutil", "ctypes", "cffi",
    "importlib", "imp", "multiprocessing", "threading", "_thread", "concurrent", "pickle",
    "cPickle", "marshal", "shelve", "dill", "builtins", "__builtin__", "inspect", "gc", "signal",
    "pty", "fcntl", "resource", "requests", "urllib", "urllib2", "urllib3", "http", "httplib",
    "ftplib", "telnetlib", "smtplib", "paramiko", "asyncio", "pathlib", "tempfile", "glob",
    "io", "code", "codeop", "webbrowser", "platform", "mmap", "zipimport", "runpy", "types",
];

const DYNAMIC_EXECUTION: &[&str] = &["eval", "exec", "compile", "execfile"];

const REFLECTION_CALLS: &[&str] = &["getattr", "setattr", "delattr", "globals", "locals", "vars"];

/// Dunder attributes used to walk from any object back to the interpreter.
const ESCAPE_DUNDERS: &[&str] = &[
    "__class__", "__bases__", "__base__", "__subclasses__", "__mro__", "__globals__",
    "__builtins__", "__code__", "__closure__", "__dict__", "__getattribute__", "__reduce__",
    "__reduce_ex__", "__loader__", "__spec__", "__self__", "__func__", "__import__",
];

/// Frame and code attributes; only suspicious after a `.`.
const ESCAPE_ATTRIBUTES: &[&str] = &[
    "f_globals", "f_locals", "f_back", "f_code", "f_builtins", "gi_frame", "gi_code", "cr_frame",
    "tb_frame", "tb_next", "co_code", "func_globals",
];

const EXIT_CALLS: &[&str] = &["exit", "quit"];

pub(crate) fn run(tree: &SyntaxTree, out: &mut Vec<ThreatFinding>) {
    walk(&tree.statements, &mut |stmt| {
        check_imports(stmt, out);
        check_calls(stmt, out);
        check_attributes(stmt, out);
        check_exception_handler(stmt, out);
        check_unbounded_loop(stmt, out);
    });
}

fn check_imports(stmt: &Statement, out: &mut Vec<ThreatFinding>) {
    let tokens = &stmt.tokens;
    let modules: Vec<String> = match tokens.first() {
        Some(first) if first.is_name("import") => split_depth_zero(&tokens[1..], ",")
            .into_iter()
            .map(dotted_name)
            .filter(|m| !m.is_empty())
            .collect(),
        Some(first) if first.is_name("from") => {
            let until_import = tokens
                .iter()
                .position(|t| t.is_name("import"))
                .unwrap_or(tokens.len());
            let module = dotted_name(&tokens[1..until_import]);
            if module.is_empty() {
                Vec::new()
            } else {
                vec![module]
            }
        }
        _ => return,
    };

    for module in modules {
        let root = module.split('.').next().unwrap_or_default();
        if DANGEROUS_MODULES.contains(&root) {
            out.push(ThreatFinding::new(
                Severity::Critical,
                ThreatCategory::DangerousImport,
                stmt.line,
                format!("import of capability-bearing module `{module}`"),
                "Remove the import; strategies may only use the provided market-data and math helpers",
            ));
        }
    }
}

/// Joins a dotted module path, stopping at `as`.
fn dotted_name(tokens: &[Token]) -> String {
    let mut name = String::new();
    for token in tokens {
        if token.is_name("as") {
            break;
        }
        match token.kind {
            TokenKind::Name => name.push_str(&token.text),
            TokenKind::Op if token.is_op(".") => {
                if !name.is_empty() {
                    name.push('.');
                }
            }
            _ => {}
        }
    }
    name
}

fn check_calls(stmt: &Statement, out: &mut Vec<ThreatFinding>) {
    let tokens = &stmt.tokens;
    for idx in free_calls(tokens) {
        let name = tokens[idx].text.as_str();
        if DYNAMIC_EXECUTION.contains(&name) {
            let args = bracket_contents(tokens, idx + 1);
            let literal = args.len() == 1 && args[0].kind == TokenKind::Str;
            let (severity, detail) = if literal {
                (Severity::High, "with a literal argument")
            } else {
                (Severity::Critical, "with content only known at runtime")
            };
            out.push(ThreatFinding::new(
                severity,
                ThreatCategory::DynamicExecution,
                tokens[idx].line,
                format!("call to `{name}` {detail}"),
                "Express the logic directly instead of evaluating strings as code",
            ));
        } else if name == "__import__" {
            out.push(ThreatFinding::new(
                Severity::Critical,
                ThreatCategory::DynamicExecution,
                tokens[idx].line,
                "dynamic import via `__import__`",
                "Remove dynamic imports; only preloaded helpers are available",
            ));
        } else if REFLECTION_CALLS.contains(&name) {
            out.push(ThreatFinding::new(
                Severity::High,
                ThreatCategory::SandboxEscape,
                tokens[idx].line,
                format!("reflective access via `{name}`"),
                "Access attributes and variables directly by name",
            ));
        } else if name == "open" {
            out.push(ThreatFinding::new(
                Severity::High,
                ThreatCategory::SystemAccessPattern,
                tokens[idx].line,
                "filesystem access via `open`",
                "Receive data through entry-point parameters instead of files",
            ));
        } else if name == "breakpoint" {
            out.push(ThreatFinding::new(
                Severity::High,
                ThreatCategory::DynamicExecution,
                tokens[idx].line,
                "debugger hook via `breakpoint`",
                "Remove debugging hooks before submission",
            ));
        }
    }
}

fn check_attributes(stmt: &Statement, out: &mut Vec<ThreatFinding>) {
    let tokens = &stmt.tokens;
    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Name {
            continue;
        }
        let after_dot = idx > 0 && tokens[idx - 1].is_op(".");
        let flagged = ESCAPE_DUNDERS.contains(&token.text.as_str())
            || (after_dot && ESCAPE_ATTRIBUTES.contains(&token.text.as_str()));
        if flagged {
            out.push(ThreatFinding::new(
                Severity::High,
                ThreatCategory::SandboxEscape,
                token.line,
                format!("introspection attribute `{}`", token.text),
                "Do not walk class hierarchies, frames or interpreter internals",
            ));
        }
    }
}

fn check_exception_handler(stmt: &Statement, out: &mut Vec<ThreatFinding>) {
    if stmt.keyword() != Some("except") {
        return;
    }
    let tokens = &stmt.tokens;
    let bare = tokens.len() == 2 && tokens[1].is_op(":");
    let catch_all = tokens.len() == 3
        && (tokens[1].is_name("Exception") || tokens[1].is_name("BaseException"))
        && tokens[2].is_op(":");
    let swallows = !stmt.body.is_empty()
        && stmt.body.iter().all(|s| {
            s.tokens.len() == 1
                && (s.tokens[0].is_name("pass")
                    || s.tokens[0].is_name("continue")
                    || s.tokens[0].is_op("..."))
        });

    let finding = match (bare, catch_all, swallows) {
        (true, _, true) => Some((Severity::Medium, "bare `except` silently swallows every error")),
        (true, _, false) => Some((
            Severity::Low,
            "bare `except` also catches interpreter exit and interrupts",
        )),
        (false, true, true) => Some((Severity::Low, "catch-all handler silently swallows errors")),
        _ => None,
    };
    if let Some((severity, description)) = finding {
        out.push(ThreatFinding::new(
            severity,
            ThreatCategory::ExceptionSwallowing,
            stmt.line,
            description,
            "Catch specific exception types and handle or re-raise them",
        ));
    }
}

fn check_unbounded_loop(stmt: &Statement, out: &mut Vec<ThreatFinding>) {
    if stmt.keyword() != Some("while") || !is_unconditional(&stmt.tokens) {
        return;
    }
    if stmt.body.iter().any(|s| exits_loop(s, true)) {
        return;
    }
    out.push(ThreatFinding::new(
        Severity::High,
        ThreatCategory::InfiniteLoop,
        stmt.line,
        "unconditional `while` loop with no reachable exit",
        "Bound the loop or add a `break` on a terminating condition",
    ));
}

/// `while True:`, `while 1:`, `while (True):` and friends.
fn is_unconditional(header: &[Token]) -> bool {
    let condition: Vec<&Token> = header
        .iter()
        .skip(1)
        .take(header.len().saturating_sub(2))
        .filter(|t| !t.is_op("(") && !t.is_op(")"))
        .collect();
    match condition.as_slice() {
        [only] if only.is_name("True") => true,
        [only] if only.kind == TokenKind::Number => number_value(&only.text).is_some_and(|v| v != 0.0),
        [only] if only.kind == TokenKind::Str => !only.text.is_empty(),
        _ => false,
    }
}

/// Whether `stmt` can leave the loop being inspected.
fn exits_loop(stmt: &Statement, direct_child: bool) -> bool {
    match stmt.keyword() {
        Some("break") => direct_child,
        Some("return") | Some("raise") => true,
        Some("def") | Some("class") => false,
        Some("while") | Some("for") => stmt.body.iter().any(|s| exits_loop(s, false)),
        _ => calls_exit(&stmt.tokens) || stmt.body.iter().any(|s| exits_loop(s, direct_child)),
    }
}

fn calls_exit(tokens: &[Token]) -> bool {
    free_calls(tokens).any(|idx| EXIT_CALLS.contains(&tokens[idx].text.as_str()))
        || tokens.windows(4).any(|w| {
            (w[0].is_name("sys") || w[0].is_name("os"))
                && w[1].is_op(".")
                && (w[2].is_name("exit") || w[2].is_name("_exit"))
                && w[3].is_op("(")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse;

    fn scan(src: &str) -> Vec<ThreatFinding> {
        let mut out = Vec::new();
        run(&parse(src), &mut out);
        out
    }

    fn categories(src: &str) -> Vec<(ThreatCategory, Severity)> {
        scan(src).into_iter().map(|f| (f.category, f.severity)).collect()
    }

    #[test]
    fn flags_dangerous_imports() {
        assert_eq!(
            categories("import os.path as p, math\n"),
            vec![(ThreatCategory::DangerousImport, Severity::Critical)]
        );
        assert_eq!(
            categories("from subprocess import Popen\n"),
            vec![(ThreatCategory::DangerousImport, Severity::Critical)]
        );
        assert!(scan("import math\nfrom statistics import mean\n").is_empty());
    }

    #[test]
    fn escalates_non_literal_eval() {
        assert_eq!(
            categories("x = eval('1 + 1')\n"),
            vec![(ThreatCategory::DynamicExecution, Severity::High)]
        );
        assert_eq!(
            categories("x = eval(user_input)\n"),
            vec![(ThreatCategory::DynamicExecution, Severity::Critical)]
        );
        assert_eq!(
            categories("exec('a' + b)\n"),
            vec![(ThreatCategory::DynamicExecution, Severity::Critical)]
        );
    }

    #[test]
    fn method_named_eval_is_not_flagged() {
        assert!(scan("frame.eval('x > 1')\n").is_empty());
    }

    #[test]
    fn flags_class_hierarchy_walk() {
        let found = scan("x = ().__class__.__bases__[0].__subclasses__()\n");
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|f| f.category == ThreatCategory::SandboxEscape));
    }

    #[test]
    fn bare_except_pass_is_medium() {
        let src = "try:\n    x = 1\nexcept:\n    pass\n";
        assert_eq!(
            categories(src),
            vec![(ThreatCategory::ExceptionSwallowing, Severity::Medium)]
        );
    }

    #[test]
    fn specific_except_is_fine() {
        assert!(scan("try:\n    x = 1\nexcept ValueError:\n    pass\n").is_empty());
    }

    #[test]
    fn while_true_without_exit_is_high() {
        let src = "def f(x, p):\n    while True:\n        x = x + 1\n    return x\n";
        assert_eq!(
            categories(src),
            vec![(ThreatCategory::InfiniteLoop, Severity::High)]
        );
        assert_eq!(
            categories("while 1: pass\n"),
            vec![(ThreatCategory::InfiniteLoop, Severity::High)]
        );
    }

    #[test]
    fn while_true_with_break_is_fine() {
        let src = "while True:\n    if done():\n        break\n";
        assert!(scan(src).is_empty());
        assert!(scan("while True:\n    return 1\n").is_empty());
    }

    #[test]
    fn break_in_inner_loop_does_not_exit_outer() {
        let src = "while True:\n    for i in items:\n        break\n";
        assert_eq!(
            categories(src),
            vec![(ThreatCategory::InfiniteLoop, Severity::High)]
        );
    }

    #[test]
    fn conditional_while_is_fine() {
        assert!(scan("while n > 0:\n    n = n - 1\n").is_empty());
    }
}
