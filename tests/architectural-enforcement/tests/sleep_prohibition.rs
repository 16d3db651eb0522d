//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Waiting is done
//! on I/O, channels, cancellation tokens or `tokio::time::timeout`.
//! **Exceptions**: test code.

use architectural_enforcement::{code_part, rust_sources, PRODUCTION_DIRS};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");
        eprintln!("\n✅ USE INSTEAD:");
        eprintln!("  - tokio::time::timeout around the awaited I/O");
        eprintln!("  - tokio::time::interval for periodic work");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn find_sleep_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        for file in rust_sources(dir) {
            for (number, line) in file.production_lines() {
                let code = code_part(line);
                if code.contains("::sleep(") || code.contains("sleep_until(") {
                    violations.push(format!(
                        "{}:{} - {}",
                        file.path.display(),
                        number,
                        line.trim()
                    ));
                }
            }
        }
    }

    violations
}
