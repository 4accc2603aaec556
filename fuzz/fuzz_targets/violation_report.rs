#![no_main]
//! Report bodies arrive from untrusted browsers; parsing must never panic
//! and an accepted event must always name a directive.

use citadel_edge_security::{parse_report_body, ViolationReport};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(event) = parse_report_body(data) {
        let report = ViolationReport::from_event(&event, "fuzz", None, Default::default());
        assert!(!report.violated_directive.is_empty());
        let _ = serde_json::to_string(&report);
    }
});
