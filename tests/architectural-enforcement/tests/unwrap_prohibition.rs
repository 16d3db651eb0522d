//! Integration Test: Panicking Shortcuts in Library Code
//!
//! **Policy**: `gateway-core` propagates errors with `?` or classifies them;
//! it MUST NOT call `.unwrap()` or `.expect(..)` outside tests.

use architectural_enforcement::{code_part, rust_sources};

#[test]
fn test_no_unwrap_in_core_library() {
    let mut violations = Vec::new();

    for file in rust_sources("gateway/core/src") {
        for (number, line) in file.production_lines() {
            let code = code_part(line);
            if code.contains(".unwrap()") || code.contains(".expect(") {
                violations.push(format!(
                    "{}:{} - {}",
                    file.path.display(),
                    number,
                    line.trim()
                ));
            }
        }
    }

    if !violations.is_empty() {
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        panic!(
            "\nFound {} unwrap/expect call(s) in library code.\nPropagate or classify the error instead.",
            violations.len()
        );
    }
}
