//! Static validation of workflow source.
//!
//! Runs before any execution: the source must parse, and its AST must not
//! reference host modules. Nothing is importable inside the sandbox; the
//! blocklist exists so that attempts to reach the host are reported as what
//! they are rather than as generic unknown modules.

use super::parser::{parse, Stmt};

/// Modules that expose network, file, process, thread, reflection or
/// dynamic-compilation capabilities from the host environment.
pub const BLOCKED_IMPORTS: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "requests",
    "urllib",
    "http",
    "ftplib",
    "smtplib",
    "telnetlib",
    "ssl",
    "asyncio",
    "multiprocessing",
    "threading",
    "ctypes",
    "importlib",
    "builtins",
    "eval",
    "exec",
    "compile",
    "open",
    "file",
    "input",
    "breakpoint",
];

/// Validate workflow source. Returns the list of violations; an empty list
/// means the source is safe to execute. Empty source is valid.
pub fn validate_source(source: &str) -> Vec<String> {
    let program = match parse(source) {
        Ok(program) => program,
        Err(e) => return vec![format!("syntax error: {}", e)],
    };
    let mut violations = Vec::new();
    check_statements(&program, &mut violations);
    violations
}

fn check_statements(stmts: &[Stmt], violations: &mut Vec<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Import { module, line } => check_import(module, *line, violations),
            Stmt::FromImport { module, line, .. } => check_import(module, *line, violations),
            Stmt::If {
                branches,
                else_body,
                ..
            } => {
                for (_, body) in branches {
                    check_statements(body, violations);
                }
                check_statements(else_body, violations);
            }
            Stmt::For { body, .. } | Stmt::While { body, .. } | Stmt::With { body, .. } => {
                check_statements(body, violations);
            }
            _ => {}
        }
    }
}

fn check_import(module: &str, line: usize, violations: &mut Vec<String>) {
    let root = module.split('.').next().unwrap_or(module);
    if BLOCKED_IMPORTS.contains(&root) {
        violations.push(format!("line {}: blocked import: {}", line, module));
    } else {
        violations.push(format!(
            "line {}: unknown module: {} (nothing is importable in a workflow)",
            line, module
        ));
    }
}
