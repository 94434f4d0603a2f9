//! Integration Test: Sleep Prohibition
//!
//! **Policy**: production code waits on I/O, timers or notifications owned by
//! tokio. It never sleeps to poll or to paper over a race.
//!
//! Test code is exempt: it lives below `#[cfg(test)]` or under `tests/`.

use architectural_enforcement::{is_sleep, report, scan_production};

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan_production(is_sleep);
    report("No sleep in production code", &violations);
}
