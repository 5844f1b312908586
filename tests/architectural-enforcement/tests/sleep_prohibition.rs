//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production dispatch code MUST NOT sleep. Workers wait on the
//! queue, the rate window, pool permits or timeouts, never on a fixed delay.
//! **Exception**: the rate window waits until its oldest admission expires,
//! which is a deadline (`sleep_until`) and only allowed in `rate_limit.rs`.

use architectural_enforcement::{report, scan};

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan("Sleep call", |_, _, code| {
        code.contains("::sleep(") || code.contains(".sleep(") || code.contains(" sleep(")
    });

    report(
        "Sleep calls found in production code!",
        &violations,
        &[
            "tokio::time::timeout() around awaited work",
            "Notify / Semaphore / channel waits",
            "Test code (#[cfg(test)] modules, test_utils.rs, tests/)",
        ],
    );
}

#[test]
fn test_deadline_waits_only_in_rate_window() {
    let violations = scan("Deadline wait outside rate window", |file, _, code| {
        code.contains("sleep_until(") && !file.ends_with("routing/rate_limit.rs")
    });

    report(
        "Deadline waits found outside the rate limiter!",
        &violations,
        &["tokio::time::sleep_until in routing/rate_limit.rs (window expiry)"],
    );
}
