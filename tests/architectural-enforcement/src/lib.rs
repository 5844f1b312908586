//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the dispatch crates:
//! - No sleep() calls in production code (waits are on I/O, permits or deadlines)
//! - No blocking I/O inside async functions
//! - No unwrap()/expect() in production code
//! - No process-wide mutable globals
//!
//! The helpers here load production sources once and hand the tests a
//! line-oriented view with test modules stripped off.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["dispatch/core/src", "dispatch/daemon/src"];

/// Files that only exist for tests even though they live under `src/`
const TEST_ONLY_FILES: &[&str] = &["test_utils.rs"];

/// Workspace root, resolved from this crate's manifest
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// One production source file, cut before its `#[cfg(test)] mod tests`
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Path relative to the workspace root, for readable reports
    #[must_use]
    pub fn display_path(&self) -> String {
        let root = workspace_root();
        self.path
            .strip_prefix(&root)
            .unwrap_or(&self.path)
            .display()
            .to_string()
    }

    #[must_use]
    pub fn ends_with(&self, suffix: &str) -> bool {
        self.path.ends_with(suffix)
    }
}

/// A rule violation at a specific line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub location: String,
    pub line_number: usize,
    pub reason: &'static str,
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.location, self.line_number, self.reason, self.text
        )
    }
}

/// Load every production `.rs` file
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let file = entry.path();
            if file.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let name = file.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if TEST_ONLY_FILES.contains(&name) {
                continue;
            }
            let Ok(content) = fs::read_to_string(file) else {
                continue;
            };
            files.push(SourceFile {
                path: file.to_path_buf(),
                lines: strip_test_module(&content),
            });
        }
    }

    files
}

/// Lines up to the first `#[cfg(test)]` that opens a `mod` block
#[must_use]
pub fn strip_test_module(content: &str) -> Vec<String> {
    let lines: Vec<&str> = content.lines().collect();
    let mut end = lines.len();

    for (idx, line) in lines.iter().enumerate() {
        if line.trim() != "#[cfg(test)]" {
            continue;
        }
        let opens_module = lines[idx + 1..]
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .is_some_and(|l| l.starts_with("mod ") && l.ends_with('{'));
        if opens_module {
            end = idx;
            break;
        }
    }

    lines[..end].iter().map(|l| (*l).to_string()).collect()
}

/// Code portion of a line: doc and line comments removed
#[must_use]
pub fn code_part(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") {
        return "";
    }
    line.split("//").next().unwrap_or(line)
}

/// Kind of function enclosing a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enclosing {
    AsyncFn,
    SyncFn,
    /// Module level or an `impl` header
    Item,
}

fn declares_fn(line: &str) -> Option<bool> {
    let line = line.trim_start();
    let line = line
        .strip_prefix("pub(crate) ")
        .or_else(|| line.strip_prefix("pub "))
        .unwrap_or(line);
    if line.starts_with("async fn ") {
        Some(true)
    } else if line.starts_with("fn ") {
        Some(false)
    } else {
        None
    }
}

/// Find the nearest function declaration above `current_idx`
#[must_use]
pub fn enclosing_function(lines: &[String], current_idx: usize) -> Enclosing {
    for line in lines[..=current_idx].iter().rev() {
        match declares_fn(line) {
            Some(true) => return Enclosing::AsyncFn,
            Some(false) => return Enclosing::SyncFn,
            None => {}
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with("impl") || trimmed.starts_with("mod ") {
            return Enclosing::Item;
        }
    }
    Enclosing::Item
}

/// Run `check` over every production line, collecting violations
pub fn scan<F>(reason: &'static str, mut check: F) -> Vec<Violation>
where
    F: FnMut(&SourceFile, usize, &str) -> bool,
{
    let mut violations = Vec::new();
    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if code.trim().is_empty() {
                continue;
            }
            if check(&file, idx, code) {
                violations.push(Violation {
                    location: file.display_path(),
                    line_number: idx + 1,
                    reason,
                    text: line.trim().to_string(),
                });
            }
        }
    }
    violations
}

/// Print violations and fail the calling test
pub fn report(title: &str, violations: &[Violation], acceptable: &[&str]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ CRITICAL: {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    if !acceptable.is_empty() {
        eprintln!("\n✅ ACCEPTABLE:");
        for line in acceptable {
            eprintln!("  - {line}");
        }
    }

    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| (*l).to_string()).collect()
    }

    #[test]
    fn test_strip_test_module() {
        let content = "fn a() {}\n#[cfg(test)]\npub mod test_utils;\nfn b() {}\n#[cfg(test)]\nmod tests {\n    fn c() {}\n}\n";
        let lines = strip_test_module(content);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], "fn b() {}");
    }

    #[test]
    fn test_code_part_drops_comments() {
        assert_eq!(code_part("    /// calls thread::sleep()"), "");
        assert_eq!(code_part("let x = 1; // sleep"), "let x = 1; ");
    }

    #[test]
    fn test_enclosing_function() {
        let lines = owned(&[
            "impl Thing {",
            "    pub async fn load(&self) {",
            "        let x = 1;",
            "    }",
            "    pub(crate) fn parse() {",
            "        let y = 2;",
            "    }",
            "}",
        ]);
        assert_eq!(enclosing_function(&lines, 2), Enclosing::AsyncFn);
        assert_eq!(enclosing_function(&lines, 5), Enclosing::SyncFn);
        assert_eq!(enclosing_function(&lines, 0), Enclosing::Item);
    }

    #[test]
    fn test_production_sources_found() {
        let files = production_sources();
        assert!(files.iter().any(|f| f.ends_with("dispatch/core/src/lib.rs")));
        assert!(!files.iter().any(|f| f.ends_with("test_utils.rs")));
    }
}
