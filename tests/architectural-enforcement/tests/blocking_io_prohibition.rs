//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async functions in the dispatch crates MUST NOT use blocking
//! I/O. Synchronous helpers (config loading before the runtime matters,
//! stdout printing of reports) are fine.
//! **Required**: `tokio::fs`, `tokio::net`, `tokio::process`, async `reqwest`.

use architectural_enforcement::{enclosing_function, report, scan, Enclosing};

const BLOCKING_PATTERNS: &[&str] = &[
    "std::fs::",
    "std::net::",
    "std::process::Command",
    "std::thread::sleep",
];

#[test]
fn test_no_blocking_io_in_async_functions() {
    let violations = scan("Blocking I/O in async fn", |file, idx, code| {
        BLOCKING_PATTERNS.iter().any(|p| code.contains(p))
            && enclosing_function(&file.lines, idx) == Enclosing::AsyncFn
    });

    report(
        "Blocking I/O calls found inside async functions!",
        &violations,
        &[
            "Non-async functions (config loading)",
            "tokio::fs::read_to_string().await for job files",
        ],
    );
}

#[test]
fn test_no_blocking_http_client() {
    let violations = scan("Blocking HTTP client", |_, _, code| {
        code.contains("reqwest::blocking")
    });

    report("Blocking HTTP client found!", &violations, &[]);
}
