//! Integration Test: Global State Prohibition
//!
//! **Policy**: all routing state (quota windows, breakers, score windows,
//! the config snapshot) is owned by a router instance. Two routers in one
//! process must never share state.

use architectural_enforcement::{is_global_state, report, scan_production};

#[test]
fn test_no_process_wide_mutable_state() {
    let violations = scan_production(is_global_state);
    report("No process-wide mutable state", &violations);
}
