//! Failure-message normalization, applied before hashing and before
//! variance counting. Idempotent: `normalize(normalize(m)) == normalize(m)`.

use std::sync::LazyLock;

use regex::Regex;

struct Rule {
    pattern: &'static Regex,
    replacement: &'static str,
}

static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?").unwrap()
});
static FILE_LINE_COL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(/[\w./-]+|[A-Za-z]:\\[\w\\.-]+):\d+(:\d+)?").unwrap());
static HEX_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{8,}\b").unwrap());
static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .unwrap()
});
static PID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bPID\s+\d+\b").unwrap());
static EXPECTED_ACTUAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"expected:\s*[^,]+,\s*actual:\s*[^\s,]+").unwrap());
static NUMERIC_WITH_UNIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(\.\d+)?\s?(ms|bytes|s|kb|mb|gb)\b").unwrap());
static STACK_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*at .+\([^)]*:\d+(:\d+)?\)\s*$").unwrap());

/// Ordered substitution rules. Order matters: timestamps and UUIDs must be
/// replaced before the generic hex-run rule would otherwise eat into them,
/// and `expected/actual` before the generic numeric-unit rule.
fn rules() -> Vec<Rule> {
    vec![
        Rule { pattern: &ISO_TIMESTAMP, replacement: "[TIMESTAMP]" },
        Rule { pattern: &UUID, replacement: "[UUID]" },
        Rule { pattern: &FILE_LINE_COL, replacement: "[FILE:LINE]" },
        Rule { pattern: &STACK_FRAME, replacement: "[STACK]" },
        Rule { pattern: &PID, replacement: "PID [PID]" },
        Rule { pattern: &EXPECTED_ACTUAL, replacement: "expected: [VALUE], actual: [VALUE]" },
        Rule { pattern: &NUMERIC_WITH_UNIT, replacement: "[NUM] $2" },
        Rule { pattern: &HEX_RUN, replacement: "[HEX]" },
    ]
}

/// Normalizes a failure message so that semantically-equivalent failures
/// (differing only in timestamp, PID, exact byte count, stack addresses,
/// …) hash and compare equal.
#[must_use]
pub fn normalize(message: &str) -> String {
    let mut current = message.to_string();
    for rule in rules() {
        current = rule.pattern.replace_all(&current, rule.replacement).into_owned();
    }
    current
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "Connection timeout after 5000ms",
            "at com.acme.Foo.bar(Foo.java:42)",
            "expected: 1, actual: 2",
            "process PID 12345 crashed at 2024-01-01T00:00:00Z",
            "seen hash deadbeefcafebabe0123",
        ];
        for sample in samples {
            let once = normalize(sample);
            let twice = normalize(&once);
            assert_eq!(once, twice, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn differing_durations_normalize_identically() {
        let a = normalize("Connection timeout after 5000ms");
        let b = normalize("Connection timeout after 3000ms");
        assert_eq!(a, b);
        assert!(a.contains("[NUM] ms"), "got {a:?}");
    }

    #[test]
    fn timestamps_are_masked() {
        let normalized = normalize("failed at 2024-03-14T10:00:00Z during setup");
        assert!(normalized.contains("[TIMESTAMP]"));
        assert!(!normalized.contains("2024"));
    }
}
