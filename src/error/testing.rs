//! Assertion helpers for tests that exercise [`super::XtraqError`].

#![cfg(test)]

use super::XtraqResult;

/// # Panics
/// Panics if `result` is `Ok` or the error's exit code doesn't match.
pub fn assert_error_exit_code<T>(result: XtraqResult<T>, expected: i32) {
    match result {
        Err(e) => {
            assert_eq!(
                e.exit_code(),
                expected,
                "expected exit code {expected}, got {}: {e}",
                e.exit_code()
            );
        }
        Ok(_) => panic!("expected error with exit code {expected}, operation succeeded"),
    }
}

/// # Panics
/// Panics if `result` is `Ok` or the error message doesn't contain `needle`.
pub fn assert_error_contains<T>(result: XtraqResult<T>, needle: &str) {
    match result {
        Err(e) => {
            let message = e.to_string();
            assert!(
                message.contains(needle),
                "error message '{message}' does not contain '{needle}'"
            );
        }
        Ok(_) => panic!("expected error containing '{needle}', operation succeeded"),
    }
}
