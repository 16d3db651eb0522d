//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! of the gateway workspace:
//! - No blocking I/O inside async functions
//! - No sleep() in production code (wait on I/O or timers' deadlines instead)
//! - No unwrap()/expect() in library code
//! - The core library stays free of front-end dependencies
//!
//! The helpers below do line-oriented scanning; they are heuristics, not a
//! parser, and are tuned to the formatting `rustfmt` produces.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root, resolved from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| Path::new(env!("CARGO_MANIFEST_DIR")).join("../.."))
}

/// Production source directories scanned by every check
pub const PRODUCTION_DIRS: &[&str] = &["gateway/core/src", "gateway/cli/src"];

/// One loaded source file
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// File lines
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Lines before the first `#[cfg(test)]`, paired with 1-based numbers
    pub fn production_lines(&self) -> impl Iterator<Item = (usize, &str)> {
        self.lines
            .iter()
            .take_while(|line| !line.trim().starts_with("#[cfg(test)]"))
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.as_str()))
    }

    /// Borrowed view of all lines
    #[must_use]
    pub fn line_refs(&self) -> Vec<&str> {
        self.lines.iter().map(String::as_str).collect()
    }
}

/// Every `.rs` file under `dir` (relative to the workspace root)
#[must_use]
pub fn rust_sources(dir: &str) -> Vec<SourceFile> {
    let root = workspace_root();
    let base = root.join(dir);
    if !base.exists() {
        return Vec::new();
    }

    walkdir::WalkDir::new(&base)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter_map(|e| {
            let content = fs::read_to_string(e.path()).ok()?;
            Some(SourceFile {
                path: e
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(e.path())
                    .to_path_buf(),
                lines: content.lines().map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Code part of a line, without a trailing `//` comment
///
/// Doc comments and `//` inside string literals are both cut; that only
/// makes the checks more lenient.
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

fn is_fn_header(line: &str) -> bool {
    let line = line.trim_start();
    let line = line
        .strip_prefix("pub(crate) ")
        .or_else(|| line.strip_prefix("pub "))
        .unwrap_or(line);
    line.starts_with("fn ") || line.starts_with("async fn ")
}

/// Check if line is inside an async function
#[must_use]
pub fn is_in_async_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..=current_idx).rev() {
        let line = lines[i].trim();

        if is_fn_header(line) {
            return line.contains("async fn ");
        }

        // Stop at module/impl boundaries
        if line.starts_with("mod ") || (line.starts_with("impl") && line.contains('{')) {
            return false;
        }
    }
    false
}

/// Check if line is inside a test function or test module
#[must_use]
pub fn is_in_test_code(lines: &[&str], current_idx: usize) -> bool {
    lines[..=current_idx]
        .iter()
        .any(|line| line.trim().starts_with("#[cfg(test)]"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_function_detection() {
        let code = vec![
            "pub async fn bad() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];
        assert!(is_in_async_function(&code, 1));

        let code = vec![
            "pub fn load() {",
            "    let contents = std::fs::read_to_string(\"config.toml\")?;",
            "}",
        ];
        assert!(!is_in_async_function(&code, 1));
    }

    #[test]
    fn test_test_code_detection() {
        let code = vec!["fn prod() {}", "#[cfg(test)]", "mod tests {", "    fn t() {}"];
        assert!(!is_in_test_code(&code, 0));
        assert!(is_in_test_code(&code, 3));
    }

    #[test]
    fn test_code_part_strips_comments() {
        assert_eq!(code_part("let x = 1; // std::fs::read"), "let x = 1; ");
        assert_eq!(code_part("/// uses std::fs"), "");
    }

    #[test]
    fn test_workspace_is_found() {
        assert!(workspace_root().join("gateway/core/Cargo.toml").exists());
    }
}
