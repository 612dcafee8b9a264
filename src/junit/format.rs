//! Source-format detection for JUnit-shaped XML reports.

/// The producer a test report most likely came from. Carried through
/// for provenance and diagnostics; the parser itself handles the shared
/// `testsuite(s)/testcase/failure|error|skipped` shape uniformly since
/// every one of these producers emits a JUnit-schema superset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Surefire,
    Gradle,
    Jest,
    Pytest,
    Phpunit,
    #[default]
    Generic,
}

/// Bytes of `head` actually scanned for content keywords: the first 4
/// KiB, or up to (and including) the first closing `</testsuite>`,
/// whichever comes first.
const CONTENT_SCAN_BYTES: usize = 4096;

/// A keyword and its contribution to that format's score if found.
/// Weights fall in `[0.2, 0.25]`; a format's total score is the sum of
/// its matched keywords', clamped to `1.0`.
const KEYWORD_TABLE: &[(Format, &[(&str, f64)])] = &[
    (Format::Pytest, &[("pytest", 0.25), ("conftest", 0.2)]),
    (Format::Gradle, &[("gradle", 0.25), ("org.gradle", 0.2)]),
    (Format::Jest, &[("jest", 0.25), ("@jest", 0.2)]),
    (Format::Phpunit, &[("phpunit", 0.25)]),
    (Format::Surefire, &[("surefire", 0.25), ("maven", 0.2)]),
];

/// Keywords checked against the filename alone. A filename match is a
/// stronger signal than content keywords and short-circuits content
/// scoring entirely.
const FILENAME_KEYWORDS: &[(Format, &[&str])] = &[
    (Format::Surefire, &["test-", "surefire"]),
    (Format::Gradle, &["gradle"]),
    (Format::Jest, &["jest"]),
    (Format::Pytest, &["pytest"]),
    (Format::Phpunit, &["phpunit"]),
];

/// Confidence assigned to a filename-heuristic match.
const FILENAME_CONFIDENCE: f64 = 0.9;

/// Minimum content score required before a format is considered
/// detected by content alone; below this, falls back to `Generic`.
const CONTENT_SCORE_THRESHOLD: f64 = 0.3;

/// Confidence assigned when content scoring falls back to `Generic`.
const GENERIC_CONFIDENCE: f64 = 0.1;

/// Detects the report format by filename heuristic first, falling back
/// to weighted keyword scoring over the first few kilobytes of content.
/// Returns the detected format alongside a confidence in `[0.0, 1.0]`.
#[must_use]
pub fn detect(file_name: &str, head: &str) -> (Format, f64) {
    let lower_name = file_name.to_lowercase();
    for (format, keywords) in FILENAME_KEYWORDS {
        if keywords.iter().any(|k| lower_name.contains(k)) {
            return (*format, FILENAME_CONFIDENCE);
        }
    }

    let window = content_window(head);
    let lower_head = window.to_lowercase();

    let mut best: Option<(Format, f64)> = None;
    for (format, keywords) in KEYWORD_TABLE {
        let score: f64 = keywords
            .iter()
            .filter(|(keyword, _)| lower_head.contains(keyword))
            .map(|(_, weight)| weight)
            .sum::<f64>()
            .min(1.0);
        if score > 0.0 && best.as_ref().is_none_or(|(_, best_score)| score > *best_score) {
            best = Some((*format, score));
        }
    }

    match best {
        Some((format, score)) if score > CONTENT_SCORE_THRESHOLD => (format, (0.5 + score).min(0.9)),
        _ => (Format::Generic, GENERIC_CONFIDENCE),
    }
}

/// Truncates `head` to the first [`CONTENT_SCAN_BYTES`] bytes, or up to
/// and including the first `</testsuite>` close tag, whichever is
/// shorter.
fn content_window(head: &str) -> &str {
    let byte_cap = head.len().min(CONTENT_SCAN_BYTES);
    let capped = char_boundary_floor(head, byte_cap);
    match head[..capped].find("</testsuite>") {
        Some(close_at) => &head[..close_at + "</testsuite>".len()],
        None => &head[..capped],
    }
}

fn char_boundary_floor(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_heuristic_wins_over_content() {
        assert_eq!(detect("TEST-com.example.Foo.xml", "pytest").0, Format::Surefire);
    }

    #[test]
    fn filename_heuristic_detects_gradle() {
        assert_eq!(detect("gradle-test-results.xml", "").0, Format::Gradle);
    }

    #[test]
    fn content_keyword_fallback() {
        let (format, confidence) = detect("results.xml", "generated by pytest 8.0");
        assert_eq!(format, Format::Pytest);
        assert!(confidence > 0.3, "confidence was {confidence}");
    }

    #[test]
    fn unrecognized_input_is_generic_with_low_confidence() {
        let (format, confidence) = detect("results.xml", "no recognizable markers here");
        assert_eq!(format, Format::Generic);
        assert_eq!(confidence, GENERIC_CONFIDENCE);
    }

    #[test]
    fn weak_single_keyword_match_stays_below_threshold() {
        // "maven" alone scores 0.2, under the 0.3 threshold, so this
        // falls back to generic rather than claiming Surefire.
        let (format, _) = detect("results.xml", "built with maven");
        assert_eq!(format, Format::Generic);
    }

    #[test]
    fn content_window_stops_at_first_closing_testsuite() {
        let head = "<testsuite>pytest stuff</testsuite><testsuite>gradle stuff</testsuite>";
        let window = content_window(head);
        assert!(window.contains("pytest"));
        assert!(!window.contains("gradle"));
    }
}
