//! Failure pattern detector, feeding the temporal clustering analysis.

use std::sync::LazyLock;

use regex::RegexSet;

/// A failure-pattern category a normalized message can match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePattern {
    Timeout,
    ResourceContention,
    ExternalDependency,
    RaceCondition,
    Environment,
    Assertion,
    Connection,
    Memory,
    FlakyDependency,
}

struct Group {
    pattern: FailurePattern,
    keywords: &'static [&'static str],
}

const GROUPS: &[Group] = &[
    Group { pattern: FailurePattern::Timeout, keywords: &["timeout", "timed out", "deadline exceeded"] },
    Group {
        pattern: FailurePattern::ResourceContention,
        keywords: &["resource busy", "lock wait", "too many connections", "pool exhausted"],
    },
    Group {
        pattern: FailurePattern::ExternalDependency,
        keywords: &["dns", "service unavailable", "upstream", "502", "503", "gateway"],
    },
    Group {
        pattern: FailurePattern::RaceCondition,
        keywords: &["race", "concurrent modification", "data race", "non-deterministic order"],
    },
    Group {
        pattern: FailurePattern::Environment,
        keywords: &["permission denied", "no such file", "environment variable", "not found on path"],
    },
    Group {
        pattern: FailurePattern::Assertion,
        keywords: &["assertionerror", "expected:", "assert_eq", "assertion failed"],
    },
    Group {
        pattern: FailurePattern::Connection,
        keywords: &["connection reset", "connection refused", "broken pipe", "econnrefused"],
    },
    Group { pattern: FailurePattern::Memory, keywords: &["out of memory", "oom", "heap space", "segmentation fault"] },
    Group {
        pattern: FailurePattern::FlakyDependency,
        keywords: &["flaky", "retry exhausted", "intermittent"],
    },
];

struct Matcher {
    pattern: FailurePattern,
    set: RegexSet,
}

static MATCHERS: LazyLock<Vec<Matcher>> = LazyLock::new(|| {
    GROUPS
        .iter()
        .map(|group| Matcher {
            pattern: group.pattern,
            set: RegexSet::new(group.keywords.iter().map(|k| regex::escape(k))).expect("static keyword sets compile"),
        })
        .collect()
});

/// Classifies a normalized failure message against the keyword groups.
/// A pattern is reported only when its confidence (fraction of matched
/// keyword groups' hits, saturating at 1.0 after the first hit) exceeds
/// 0.5 — i.e. any single keyword hit in a group is already decisive.
#[must_use]
pub fn classify(normalized_message: &str) -> Vec<FailurePattern> {
    let lower = normalized_message.to_lowercase();
    MATCHERS
        .iter()
        .filter(|m| m.set.is_match(&lower))
        .map(|m| m.pattern)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_timeout_messages() {
        let patterns = classify("connection timed out after [NUM] ms");
        assert!(patterns.contains(&FailurePattern::Timeout));
    }

    #[test]
    fn classifies_assertion_messages() {
        let patterns = classify("AssertionError: expected: [VALUE], actual: [VALUE]");
        assert!(patterns.contains(&FailurePattern::Assertion));
    }

    #[test]
    fn no_match_returns_empty() {
        let patterns = classify("completely unrelated message about nothing in particular");
        assert!(patterns.is_empty());
    }
}
