//! Integration Test: Panic Prohibition
//!
//! **Policy**: production code propagates failures with `?` and typed errors.
//! `unwrap()` and `expect()` are reserved for tests.

use architectural_enforcement::{is_panicking_unwrap, production_files, report, scan_production};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = scan_production(is_panicking_unwrap);
    report("No unwrap()/expect() in production code", &violations);
}

#[test]
fn test_scanner_sees_the_router() {
    let files = production_files();
    assert!(
        files.iter().any(|p| p.ends_with("routing/router.rs")),
        "scanner found no router source; is the workspace layout intact?"
    );
}
