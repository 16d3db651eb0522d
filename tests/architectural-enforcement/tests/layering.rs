//! Integration Test: Separation of Concerns
//!
//! **Policy**: `gateway-core` is a library with no front-end dependencies.
//! Argument parsing and log output setup belong to `gateway-cli`, and the
//! core never reaches into the CLI crate.

use std::fs;

use architectural_enforcement::{code_part, rust_sources, workspace_root};

const FRONT_END_CRATES: &[&str] = &["clap", "tracing-subscriber", "anyhow", "gateway-cli"];

#[test]
fn test_core_manifest_has_no_front_end_dependencies() {
    let manifest = fs::read_to_string(workspace_root().join("gateway/core/Cargo.toml"))
        .expect("core manifest is readable");

    let mut in_dependencies = false;
    let mut violations = Vec::new();
    for line in manifest.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_dependencies = line == "[dependencies]";
            continue;
        }
        if !in_dependencies || line.starts_with('#') {
            continue;
        }
        let name = line.split(['=', ' ', '.']).next().unwrap_or_default();
        if FRONT_END_CRATES.contains(&name) {
            violations.push(line.to_string());
        }
    }

    assert!(
        violations.is_empty(),
        "gateway-core depends on front-end crates: {violations:#?}"
    );
}

#[test]
fn test_core_sources_do_not_print() {
    let mut violations = Vec::new();
    for file in rust_sources("gateway/core/src") {
        for (number, line) in file.production_lines() {
            let code = code_part(line);
            if code.contains("println!(") || code.contains("eprintln!(") {
                violations.push(format!("{}:{} - {}", file.path.display(), number, line.trim()));
            }
        }
    }
    assert!(
        violations.is_empty(),
        "Library code must log through tracing: {violations:#?}"
    );
}
