//! Integration Test: Error Propagation and Shared State
//!
//! **Policy**:
//! - Production code propagates errors; `unwrap()` / `expect()` are for tests.
//! - No process-wide mutable state: the `Dispatcher` owns every component.

use architectural_enforcement::{report, scan};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = scan("Panicking unwrap", |_, _, code| {
        code.contains(".unwrap()") || code.contains(".expect(")
    });

    report(
        "unwrap()/expect() found in production code!",
        &violations,
        &[
            "`?` with a thiserror variant",
            "unwrap_or / unwrap_or_else / unwrap_or_default",
            "anyhow::Context in the daemon",
        ],
    );
}

#[test]
fn test_no_mutable_globals() {
    const SHARED: &[&str] = &["Mutex", "RwLock", "OnceLock", "OnceCell", "Lazy", "Atomic", "static mut"];

    let violations = scan("Process-wide mutable state", |_, _, code| {
        let trimmed = code.trim_start();
        let is_static = trimmed.starts_with("static ") || trimmed.starts_with("pub static ");
        (is_static && SHARED.iter().any(|s| code.contains(s))) || code.contains("lazy_static!")
    });

    report(
        "Global mutable state found in production code!",
        &violations,
        &["Fields on Dispatcher / WorkerContext shared through Arc"],
    );
}
