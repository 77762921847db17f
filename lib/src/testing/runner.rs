//! Single-test execution with result logging.

use super::TestResult;
use crate::{klog_debug, klog_info};

/// Run one test function, logging its outcome.
pub fn run_single_test(name: &str, f: impl FnOnce() -> TestResult) -> TestResult {
    klog_debug!("TEST: {} ...", name);
    let result = f();
    match result {
        TestResult::Pass => klog_debug!("TEST: {} ok", name),
        TestResult::Fail => klog_info!("TEST: {} FAILED", name),
        TestResult::Skipped => klog_debug!("TEST: {} skipped", name),
    }
    result
}
