//! Response classification
//!
//! Decides what a response means for the credential that received it. The
//! checks run in a fixed priority order; the first match wins:
//!
//! 1. remaining quota 0 with a reset time → rate limited until reset
//! 2. code 88 while quota remains → banned
//! 3. codes 32 / 326 → authentication failed
//! 4. bare 403 without error payload → forbidden
//! 5. code 131 → dependency failure (with or without usable data)
//! 6. missing-status message → success
//! 7. any other error payload → logged, success
//! 8. otherwise success (or an unhandled status, when configured)

use serde_json::Value;
use transport::RawResponse;

pub const REMAINING_HEADER: &str = "x-rate-limit-remaining";
pub const RESET_HEADER: &str = "x-rate-limit-reset";

const CODE_RATE_LIMIT: i64 = 88;
const CODES_AUTH: &[i64] = &[32, 326];
const CODE_DEPENDENCY: i64 = 131;
const MISSING_STATUS: &str = "_Missing: No status found with that ID";

/// Classification outcome of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    RateLimited { reset: i64 },
    Banned { message: String },
    AuthFailed { message: String },
    Forbidden,
    DependencyWithData,
    DependencyAbort { message: String },
    Missing,
    OtherError { message: String },
    /// Non-success status other than 404 with no error payload.
    UnhandledStatus { status: u16 },
    Ok,
}

impl Verdict {
    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::RateLimited { .. } => "rate_limited",
            Verdict::Banned { .. } => "banned",
            Verdict::AuthFailed { .. } => "auth_failed",
            Verdict::Forbidden => "forbidden",
            Verdict::DependencyWithData => "dependency_with_data",
            Verdict::DependencyAbort { .. } => "dependency_abort",
            Verdict::Missing => "missing",
            Verdict::OtherError { .. } => "other_error",
            Verdict::UnhandledStatus { .. } => "unhandled_status",
            Verdict::Ok => "ok",
        }
    }
}

/// Error payload of a response: `errors[]` rendered as `(<code>) <message>`,
/// de-duplicated in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorPayload {
    pub codes: Vec<i64>,
    pub messages: Vec<String>,
}

impl ErrorPayload {
    pub fn from_json(body: &Value) -> Option<Self> {
        let errors = body.get("errors")?.as_array()?;
        let mut payload = ErrorPayload::default();
        for error in errors {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error.get("message").and_then(Value::as_str).unwrap_or("");
            let rendered = format!("({code}) {message}");
            if !payload.messages.contains(&rendered) {
                payload.codes.push(code);
                payload.messages.push(rendered);
            }
        }
        (!payload.messages.is_empty()).then_some(payload)
    }

    pub fn has_code(&self, code: i64) -> bool {
        self.codes.contains(&code)
    }

    pub fn message(&self) -> String {
        self.messages.join("; ")
    }
}

/// Whether the body carries a non-null, non-empty `data` member.
fn has_data(body: &Value) -> bool {
    match body.get("data") {
        None | Some(Value::Null) => false,
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Classify `rep` in priority order.
pub fn classify(rep: &RawResponse) -> Verdict {
    let remaining = rep.header_i64(REMAINING_HEADER).unwrap_or(-1);
    let reset = rep.header_i64(RESET_HEADER).unwrap_or(-1);
    let body = rep.json().unwrap_or(Value::Null);
    let errors = ErrorPayload::from_json(&body);

    if remaining == 0 && reset > 0 {
        return Verdict::RateLimited { reset };
    }

    if let Some(errors) = &errors {
        if errors.has_code(CODE_RATE_LIMIT) && remaining > 0 {
            return Verdict::Banned {
                message: errors.message(),
            };
        }
        if CODES_AUTH.iter().any(|c| errors.has_code(*c)) {
            return Verdict::AuthFailed {
                message: errors.message(),
            };
        }
    }

    if rep.status == 403 && errors.is_none() {
        return Verdict::Forbidden;
    }

    let Some(errors) = errors else {
        if !rep.is_success() && rep.status != 404 {
            return Verdict::UnhandledStatus { status: rep.status };
        }
        return Verdict::Ok;
    };

    if errors.has_code(CODE_DEPENDENCY) {
        if has_data(&body) {
            return Verdict::DependencyWithData;
        }
        return Verdict::DependencyAbort {
            message: errors.message(),
        };
    }

    let message = errors.message();
    if message.contains(MISSING_STATUS) {
        return Verdict::Missing;
    }
    Verdict::OtherError { message }
}
