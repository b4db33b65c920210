//! Per-response assertions.
//!
//! Both checks run on every response and are tallied separately; a failed check is a metric,
//! never a control-flow error.

use serde::Serialize;

pub const STATUS_WAS_200: &str = "status was 200";
pub const RESPONSE_HAS_SUCCESS_STATUS: &str = "response has success status";

/// Every check evaluated per response
pub const CHECK_NAMES: [&str; 2] = [STATUS_WAS_200, RESPONSE_HAS_SUCCESS_STATUS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
}

/// Evaluate the response checks. `None` for status and body means the request never got a
/// response (connection refused, timeout, ...).
pub fn evaluate(status: Option<u16>, body: Option<&[u8]>) -> [Check; 2] {
    [
        Check {
            name: STATUS_WAS_200,
            passed: status == Some(200),
        },
        Check {
            name: RESPONSE_HAS_SUCCESS_STATUS,
            passed: body.is_some_and(has_success_status),
        },
    ]
}

fn has_success_status(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("status").and_then(|status| status.as_str()).map(|s| s == "success"))
        .unwrap_or(false)
}
