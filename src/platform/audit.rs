//! Audit logging and log-safe redaction for the platform client.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::info;

/// Header/field names considered sensitive. Matched case-insensitively.
const SENSITIVE_FIELDS: &[&str] = &[
    "authorization",
    "x-hub-signature-256",
    "x-signature-sha256",
    "cookie",
    "set-cookie",
    "token",
    "secret",
    "password",
];

static LONG_ALPHANUMERIC_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_-]{20,}").unwrap());

/// Redacts a single header/field value: preserves first/last 2 characters,
/// fully masks shorter values. Used when the field *name* is sensitive.
#[must_use]
pub fn redact_value(value: &str) -> String {
    if value.len() <= 4 {
        return "*".repeat(value.len());
    }
    let chars: Vec<char> = value.chars().collect();
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 4))
}

/// Replaces long alphanumeric runs in free text with `[TOKEN]`, for bodies
/// and non-sensitive-named fields that may still carry embedded secrets.
#[must_use]
pub fn redact_free_text(text: &str) -> String {
    LONG_ALPHANUMERIC_RUN.replace_all(text, "[TOKEN]").into_owned()
}

/// Returns `true` if `field_name` matches the configured sensitive set.
#[must_use]
pub fn is_sensitive_field(field_name: &str) -> bool {
    let lower = field_name.to_ascii_lowercase();
    SENSITIVE_FIELDS.iter().any(|f| *f == lower)
}

/// Sanitizes a single header for logging: fully redacted if the name is
/// sensitive, otherwise scrubbed of long alphanumeric runs.
#[must_use]
pub fn sanitize_header(name: &str, value: &str) -> String {
    if is_sensitive_field(name) {
        redact_value(value)
    } else {
        redact_free_text(value)
    }
}

/// One audit record: every platform-client request produces exactly one,
/// regardless of outcome, keyed by the request's correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub correlation_id: String,
    pub endpoint: String,
    pub method: String,
    pub status: Option<u16>,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

/// Emits an audit record via `tracing`. Security-relevant errors (auth
/// failures, webhook verification failures, permission denials) are
/// always logged at `warn` even when the caller's log level would
/// otherwise suppress info-level events; callers pass
/// `security_relevant = true` for those.
pub fn emit(record: &AuditRecord, security_relevant: bool) {
    if security_relevant {
        tracing::warn!(
            correlation_id = %record.correlation_id,
            endpoint = %record.endpoint,
            method = %record.method,
            status = ?record.status,
            outcome = %record.outcome,
            "security-relevant platform request"
        );
    } else {
        info!(
            correlation_id = %record.correlation_id,
            endpoint = %record.endpoint,
            method = %record.method,
            status = ?record.status,
            outcome = %record.outcome,
            "platform request audited"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_value_preserves_head_and_tail() {
        assert_eq!(redact_value("ghp_abcdef1234567890"), "gh****************90");
    }

    #[test]
    fn redact_value_fully_masks_short_values() {
        assert_eq!(redact_value("abcd"), "****");
    }

    #[test]
    fn redact_free_text_replaces_long_runs() {
        let text = "token=ghp_1234567890abcdef1234 and more";
        let redacted = redact_free_text(text);
        assert!(redacted.contains("[TOKEN]"));
        assert!(!redacted.contains("1234567890abcdef1234"));
    }

    #[test]
    fn sensitive_field_detection_is_case_insensitive() {
        assert!(is_sensitive_field("Authorization"));
        assert!(is_sensitive_field("X-Hub-Signature-256"));
        assert!(!is_sensitive_field("content-type"));
    }
}
