//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the gateway MUST NOT use blocking I/O.
//! **Required**: `tokio::fs`, `tokio::io`, `reqwest` async client.
//! Blocking calls are acceptable in plain functions that run before the
//! runtime starts (configuration loading, argument parsing) and in tests.

use architectural_enforcement::{
    code_part, is_in_async_function, is_in_test_code, rust_sources, PRODUCTION_DIRS,
};

const FORBIDDEN: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("reqwest::blocking", "Blocking HTTP client"),
    ("std::io::stdin()", "Blocking stdin"),
    ("std::io::stdout()", "Blocking stdout"),
    ("std::thread::sleep", "Blocking sleep"),
];

/// Test that async production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_async_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in async code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read().await, tokio::fs::write().await");
        eprintln!("  - tokio::io::stdout() with AsyncWriteExt");
        eprintln!("  - reqwest::Client (async)");

        panic!(
            "\nFound {} blocking I/O violation(s) in async code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Blocking I/O is never imported at module level in library code
#[test]
fn test_no_blocking_io_imports_in_core() {
    let mut violations = Vec::new();
    for file in rust_sources("gateway/core/src") {
        for (number, line) in file.production_lines() {
            let code = code_part(line).trim();
            if code.starts_with("use std::fs") || code.starts_with("use std::net") {
                violations.push(format!("{}:{} - {}", file.path.display(), number, line.trim()));
            }
        }
    }
    assert!(violations.is_empty(), "Blocking imports: {violations:#?}");
}

fn find_blocking_io_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        for file in rust_sources(dir) {
            let lines = file.line_refs();
            for (idx, line) in lines.iter().enumerate() {
                if is_in_test_code(&lines, idx) || !is_in_async_function(&lines, idx) {
                    continue;
                }
                let code = code_part(line);
                for (pattern, label) in FORBIDDEN {
                    if code.contains(pattern) {
                        violations.push(format!(
                            "{}:{} - {}: {}",
                            file.path.display(),
                            idx + 1,
                            label,
                            line.trim()
                        ));
                    }
                }
            }
        }
    }

    violations
}
