//! Streaming JUnit XML parser.
//!
//! SAX-style over `quick_xml::Reader`, grounded in the streaming-chunk
//! idiom this crate's download pipeline uses for bounded reads
//! (`stream_to_file`'s chunk loop): here the "chunks" are XML events
//! instead of byte buffers, but the principle is the same — never hold
//! the whole document as a parsed tree, bail out early once a hard limit
//! is crossed.
//!
//! Per-format differences are a lookup table of `(open_tag, close_tag)`
//! function pointers keyed by [`Format`] rather than a class hierarchy:
//! a format that needs no special handling for a tag just gets the
//! generic entry, a format that does gets its own function.

pub mod format;

use std::collections::HashMap;
use std::io::BufRead;
use std::time::Instant;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::ParseError;
use crate::model::OccurrenceStatus;

pub use format::Format;

/// Hard limits enforced while parsing, independent of the artifact
/// handler's byte cap.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_depth: usize,
    pub max_test_cases: usize,
    pub max_file_size_bytes: u64,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_depth: 100,
            max_test_cases: 50_000,
            max_file_size_bytes: 50 * 1024 * 1024,
        }
    }
}

/// One `<testcase>` as observed in the report, before being matched
/// against (or used to create) a [`crate::model::TestCase`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedOccurrence {
    pub suite: String,
    pub class_name: String,
    pub name: String,
    pub status: OccurrenceStatus,
    pub duration_ms: u64,
    pub failure_message: Option<String>,
    pub failure_stack: Option<String>,
    pub system_out: Option<String>,
    pub system_err: Option<String>,
}

/// One `<testsuite>`, with its own declared counts and any `<property>`
/// or `<system-out>`/`<system-err>` content attached directly to it
/// rather than to one of its cases.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TestSuite {
    pub name: String,
    pub cases: Vec<ParsedOccurrence>,
    pub properties: HashMap<String, String>,
    pub system_out: Option<String>,
    pub system_err: Option<String>,
    pub declared_tests: Option<i64>,
    pub declared_failures: Option<i64>,
    pub declared_errors: Option<i64>,
    pub declared_skipped: Option<i64>,
}

impl TestSuite {
    fn observed_tests(&self) -> u64 {
        self.cases.len() as u64
    }

    fn observed_failures(&self) -> u64 {
        self.cases.iter().filter(|c| c.status == OccurrenceStatus::Failed).count() as u64
    }

    fn observed_errors(&self) -> u64 {
        self.cases.iter().filter(|c| c.status == OccurrenceStatus::Error).count() as u64
    }

    fn observed_skipped(&self) -> u64 {
        self.cases.iter().filter(|c| c.status == OccurrenceStatus::Skipped).count() as u64
    }

    /// `max(declared, observed)` per field, the reconciliation rule
    /// every level of the count hierarchy follows.
    fn reconciled_tests(&self) -> u64 {
        reconcile(self.declared_tests, self.observed_tests())
    }

    fn reconciled_failures(&self) -> u64 {
        reconcile(self.declared_failures, self.observed_failures())
    }

    fn reconciled_errors(&self) -> u64 {
        reconcile(self.declared_errors, self.observed_errors())
    }

    fn reconciled_skipped(&self) -> u64 {
        reconcile(self.declared_skipped, self.observed_skipped())
    }
}

fn reconcile(declared: Option<i64>, observed: u64) -> u64 {
    match declared {
        Some(d) if d > 0 => (d as u64).max(observed),
        _ => observed,
    }
}

/// The full result of parsing one report: a tree of [`TestSuite`]s plus
/// the detection/size/timing metadata a caller needs to decide whether
/// to trust the parse.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParseOutcome {
    pub test_suites: Vec<TestSuite>,
    pub format: Format,
    pub format_confidence: f64,
    pub warnings: Vec<String>,
    pub bytes_parsed: u64,
    pub elements_processed: u64,
    pub duration_ms: u64,
    pub memory_peak_mb: f64,
    /// Declared totals on the wrapping `<testsuites>` root, if present.
    pub declared_tests: Option<i64>,
    pub declared_failures: Option<i64>,
    pub declared_errors: Option<i64>,
    pub declared_skipped: Option<i64>,
}

impl ParseOutcome {
    /// All parsed occurrences across every suite, in document order.
    pub fn occurrences(&self) -> impl Iterator<Item = &ParsedOccurrence> {
        self.test_suites.iter().flat_map(|s| s.cases.iter())
    }

    /// Validates the report's declared counts against what was actually
    /// observed. Aggregate totals at every level are `max(declared,
    /// sum-of-children)`: a producer may under-declare (we trust
    /// observation) but an over-declaration is honored as the total, on
    /// the theory that cases may have been dropped from the body
    /// without the producer updating its summary attribute.
    ///
    /// # Errors
    /// Returns [`ParseError::ValidationFailed`] if any declared count is
    /// negative, or if `failures + errors + skipped > tests` at the root.
    pub fn validate_counts(&self, source_name: &str) -> Result<(), ParseError> {
        for suite in &self.test_suites {
            for (label, declared) in [
                ("tests", suite.declared_tests),
                ("failures", suite.declared_failures),
                ("errors", suite.declared_errors),
                ("skipped", suite.declared_skipped),
            ] {
                if declared.is_some_and(|d| d < 0) {
                    return Err(ParseError::validation_failed(
                        source_name,
                        format!("suite {:?} declared negative {label} count", suite.name),
                    ));
                }
            }
        }
        for (label, declared) in [
            ("tests", self.declared_tests),
            ("failures", self.declared_failures),
            ("errors", self.declared_errors),
            ("skipped", self.declared_skipped),
        ] {
            if declared.is_some_and(|d| d < 0) {
                return Err(ParseError::validation_failed(source_name, format!("root declared negative {label} count")));
            }
        }

        let sum_tests: u64 = self.test_suites.iter().map(TestSuite::reconciled_tests).sum();
        let sum_failures: u64 = self.test_suites.iter().map(TestSuite::reconciled_failures).sum();
        let sum_errors: u64 = self.test_suites.iter().map(TestSuite::reconciled_errors).sum();
        let sum_skipped: u64 = self.test_suites.iter().map(TestSuite::reconciled_skipped).sum();

        let root_tests = reconcile(self.declared_tests, sum_tests);
        let root_failures = reconcile(self.declared_failures, sum_failures);
        let root_errors = reconcile(self.declared_errors, sum_errors);
        let root_skipped = reconcile(self.declared_skipped, sum_skipped);

        if root_failures + root_errors + root_skipped > root_tests {
            return Err(ParseError::validation_failed(
                source_name,
                format!("failures({root_failures}) + errors({root_errors}) + skipped({root_skipped}) exceeds tests({root_tests})"),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct InProgressCase {
    suite: String,
    class_name: String,
    name: String,
    duration_ms: u64,
    status: OccurrenceStatus,
    failure_message: Option<String>,
    failure_stack: Option<String>,
    system_out: Option<String>,
    system_err: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Capture {
    Failure,
    Error,
    SystemOut,
    SystemErr,
    Property,
}

struct ParserState {
    limits: ParseLimits,
    depth: usize,
    elements_processed: u64,
    warnings: Vec<String>,
    suites: Vec<TestSuite>,
    current_suite: Option<TestSuite>,
    current_case: Option<InProgressCase>,
    capture: Option<Capture>,
    pending_property_name: Option<String>,
    root_declared_tests: Option<i64>,
    root_declared_failures: Option<i64>,
    root_declared_errors: Option<i64>,
    root_declared_skipped: Option<i64>,
}

impl ParserState {
    fn new(limits: ParseLimits) -> Self {
        Self {
            limits,
            depth: 0,
            elements_processed: 0,
            warnings: Vec::new(),
            suites: Vec::new(),
            current_suite: None,
            current_case: None,
            capture: None,
            pending_property_name: None,
            root_declared_tests: None,
            root_declared_failures: None,
            root_declared_errors: None,
            root_declared_skipped: None,
        }
    }

    fn suite_mut(&mut self) -> &mut TestSuite {
        self.current_suite.get_or_insert_with(TestSuite::default)
    }
}

type OpenTagFn = fn(&str, &BytesStart, &mut ParserState) -> Result<(), ()>;
type CloseTagFn = fn(&str, &mut ParserState);

/// Per-format entry in the dispatch table. Formats that don't need a
/// tag override reuse [`generic_open`]/[`generic_close`] directly.
#[derive(Clone, Copy)]
struct FormatHandlers {
    open_tag: OpenTagFn,
    close_tag: CloseTagFn,
}

const GENERIC_HANDLERS: FormatHandlers = FormatHandlers {
    open_tag: generic_open,
    close_tag: generic_close,
};

/// Gradle's reporters attach an optional `message` attribute to
/// `<skipped>`; every other producer leaves it text-only (if at all),
/// so this is the one tag where Gradle needs its own opener.
const GRADLE_HANDLERS: FormatHandlers = FormatHandlers {
    open_tag: gradle_open,
    close_tag: generic_close,
};

fn handlers_for(format: Format) -> FormatHandlers {
    match format {
        Format::Gradle => GRADLE_HANDLERS,
        Format::Surefire | Format::Jest | Format::Pytest | Format::Phpunit | Format::Generic => GENERIC_HANDLERS,
    }
}

fn gradle_open(local: &str, e: &BytesStart, state: &mut ParserState) -> Result<(), ()> {
    if local == "skipped" {
        if let Some(case) = state.current_case.as_mut() {
            case.status = OccurrenceStatus::Skipped;
            if let Some(message) = attr(e, "message") {
                case.failure_message = Some(message);
            }
        }
        return Ok(());
    }
    generic_open(local, e, state)
}

fn generic_open(local: &str, e: &BytesStart, state: &mut ParserState) -> Result<(), ()> {
    match local {
        "testsuites" => {
            if let Some(v) = parsed_attr_i64(e, "tests") {
                *state.root_declared_tests.get_or_insert(0) += v;
            }
            if let Some(v) = parsed_attr_i64(e, "failures") {
                *state.root_declared_failures.get_or_insert(0) += v;
            }
            if let Some(v) = parsed_attr_i64(e, "errors") {
                *state.root_declared_errors.get_or_insert(0) += v;
            }
            if let Some(v) = parsed_attr_i64(e, "skipped") {
                *state.root_declared_skipped.get_or_insert(0) += v;
            }
        }
        "testsuite" => {
            let suite = state.suite_mut();
            suite.name = attr(e, "name").unwrap_or_default();
            suite.declared_tests = parsed_attr_i64(e, "tests");
            suite.declared_failures = parsed_attr_i64(e, "failures");
            suite.declared_errors = parsed_attr_i64(e, "errors");
            suite.declared_skipped = parsed_attr_i64(e, "skipped");
        }
        "testcase" => {
            if state.current_suite.is_none() {
                state.current_suite = Some(TestSuite::default());
            }
            let suite_cases = state.current_suite.as_ref().map_or(0, |s| s.cases.len());
            if suite_cases >= state.limits.max_test_cases {
                return Err(());
            }
            let suite_name = state.current_suite.as_ref().map(|s| s.name.clone()).unwrap_or_default();
            let class_name = attr(e, "classname").or_else(|| attr(e, "class")).unwrap_or_default();
            let name = attr(e, "name").unwrap_or_default();
            let duration_ms = attr(e, "time")
                .and_then(|t| t.parse::<f64>().ok())
                .map(|secs| (secs * 1000.0).round() as u64)
                .unwrap_or(0);
            state.current_case = Some(InProgressCase {
                suite: suite_name,
                class_name,
                name,
                duration_ms,
                status: OccurrenceStatus::Passed,
                failure_message: None,
                failure_stack: None,
                system_out: None,
                system_err: None,
            });
        }
        "failure" | "error" => {
            if let Some(case) = state.current_case.as_mut() {
                case.status = if local == "failure" { OccurrenceStatus::Failed } else { OccurrenceStatus::Error };
                case.failure_message = attr(e, "message");
                state.capture = Some(if local == "failure" { Capture::Failure } else { Capture::Error });
            }
        }
        "skipped" => {
            if let Some(case) = state.current_case.as_mut() {
                case.status = OccurrenceStatus::Skipped;
            }
        }
        "system-out" => state.capture = Some(Capture::SystemOut),
        "system-err" => state.capture = Some(Capture::SystemErr),
        "property" => {
            if let (Some(name), Some(value)) = (attr(e, "name"), attr(e, "value")) {
                state.suite_mut().properties.insert(name, value);
            } else {
                state.pending_property_name = attr(e, "name");
                state.capture = Some(Capture::Property);
            }
        }
        _ => {}
    }
    Ok(())
}

fn generic_close(local: &str, state: &mut ParserState) {
    match local {
        "failure" | "error" | "system-out" | "system-err" => {
            state.capture = None;
        }
        "property" => {
            state.capture = None;
            state.pending_property_name = None;
        }
        "testcase" => {
            if let Some(case) = state.current_case.take() {
                state.suite_mut().cases.push(ParsedOccurrence {
                    suite: case.suite,
                    class_name: case.class_name,
                    name: case.name,
                    status: case.status,
                    duration_ms: case.duration_ms,
                    failure_message: case.failure_message,
                    failure_stack: case.failure_stack,
                    system_out: case.system_out,
                    system_err: case.system_err,
                });
            }
        }
        "testsuite" => {
            if let Some(suite) = state.current_suite.take() {
                state.suites.push(suite);
            }
        }
        _ => {}
    }
}

fn capture_text(state: &mut ParserState, text: String) {
    match state.capture {
        Some(Capture::Failure) | Some(Capture::Error) => {
            if let Some(case) = state.current_case.as_mut() {
                case.failure_stack = Some(text);
            }
        }
        Some(Capture::SystemOut) => {
            if let Some(case) = state.current_case.as_mut() {
                case.system_out = Some(text);
            } else {
                state.suite_mut().system_out = Some(text);
            }
        }
        Some(Capture::SystemErr) => {
            if let Some(case) = state.current_case.as_mut() {
                case.system_err = Some(text);
            } else {
                state.suite_mut().system_err = Some(text);
            }
        }
        Some(Capture::Property) => {
            if let Some(name) = state.pending_property_name.clone() {
                state.suite_mut().properties.insert(name, text);
            }
        }
        None => {}
    }
}

fn parsed_attr_i64(e: &BytesStart, key: &str) -> Option<i64> {
    attr(e, key).and_then(|s| s.parse::<i64>().ok())
}

fn attr(e: &BytesStart, key: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key.as_bytes())
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Parses `xml` (a single report's full text), detecting its producer
/// format from `source_name` and the document's own head before
/// dispatching tag handling through that format's entry in the handler
/// table.
///
/// # Errors
/// Returns [`ParseError::ParseFailed`] on malformed XML, or a hard-limit
/// breach (`maxDepth`, `maxFileSizeBytes`, `maxTestCases`).
pub fn parse(source_name: &str, xml: &str, limits: ParseLimits) -> Result<ParseOutcome, ParseError> {
    let started = Instant::now();
    let byte_len = xml.len() as u64;
    if byte_len > limits.max_file_size_bytes {
        return Err(ParseError::parse_failed(
            source_name,
            format!("report is {byte_len} bytes, exceeds max {}", limits.max_file_size_bytes),
        ));
    }

    let head_len = xml.len().min(4096);
    let head = &xml[..head_len];
    let (format, format_confidence) = format::detect(source_name, head);
    let handlers = handlers_for(format);

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut state = ParserState::new(limits);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                state.depth += 1;
                if state.depth > limits.max_depth {
                    return Err(ParseError::parse_failed(source_name, format!("exceeded max depth {}", limits.max_depth)));
                }
                state.elements_processed += 1;
                let local = local_name(&e);
                (handlers.open_tag)(&local, &e, &mut state)
                    .map_err(|()| ParseError::parse_failed(source_name, format!("exceeded max test cases {}", limits.max_test_cases)))?;
            }
            Ok(Event::Empty(e)) => {
                state.elements_processed += 1;
                let local = local_name(&e);
                (handlers.open_tag)(&local, &e, &mut state)
                    .map_err(|()| ParseError::parse_failed(source_name, format!("exceeded max test cases {}", limits.max_test_cases)))?;
                (handlers.close_tag)(&local, &mut state);
            }
            Ok(Event::Text(e)) => {
                if state.capture.is_some() {
                    let text = e.unescape().map(|c| c.into_owned()).unwrap_or_default();
                    capture_text(&mut state, text);
                }
            }
            Ok(Event::End(e)) => {
                state.depth = state.depth.saturating_sub(1);
                let local = local_name(&e);
                (handlers.close_tag)(&local, &mut state);
            }
            Ok(_) => {}
            Err(e) => return Err(ParseError::parse_failed(source_name, e.to_string())),
        }
        buf.clear();
    }

    if let Some(suite) = state.current_suite.take() {
        state.suites.push(suite);
    }

    Ok(ParseOutcome {
        test_suites: state.suites,
        format,
        format_confidence,
        warnings: state.warnings,
        bytes_parsed: byte_len,
        elements_processed: state.elements_processed,
        duration_ms: started.elapsed().as_millis() as u64,
        memory_peak_mb: (byte_len as f64) / (1024.0 * 1024.0),
        declared_tests: state.root_declared_tests,
        declared_failures: state.root_declared_failures,
        declared_errors: state.root_declared_errors,
        declared_skipped: state.root_declared_skipped,
    })
}

/// Reads an entire report from a `BufRead` source (e.g. a ZIP entry
/// reader) into memory and parses it. Size limiting happens upstream in
/// the artifact handler; this is a convenience wrapper for callers that
/// already have a bounded reader.
///
/// # Errors
/// See [`parse`].
pub fn parse_from_reader<R: BufRead>(source_name: &str, mut reader: R, limits: ParseLimits) -> Result<ParseOutcome, ParseError> {
    use std::io::Read;
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .map_err(|e| ParseError::parse_failed(source_name, e.to_string()))?;
    parse(source_name, &text, limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
    <testsuite name="com.example.FooTest" tests="3" failures="1" errors="0" skipped="1">
        <properties>
            <property name="os.name" value="Linux"/>
        </properties>
        <testcase classname="com.example.FooTest" name="passes" time="0.012"/>
        <testcase classname="com.example.FooTest" name="fails" time="0.034">
            <failure message="expected 1 but was 2">stack trace here</failure>
        </testcase>
        <testcase classname="com.example.FooTest" name="skipped_case" time="0.0">
            <skipped/>
        </testcase>
        <system-out>all good</system-out>
    </testsuite>"#;

    fn occurrences(outcome: &ParseOutcome) -> Vec<&ParsedOccurrence> {
        outcome.occurrences().collect()
    }

    #[test]
    fn parses_passed_failed_and_skipped_cases() {
        let outcome = parse("sample.xml", SAMPLE, ParseLimits::default()).unwrap();
        let cases = occurrences(&outcome);
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[0].status, OccurrenceStatus::Passed);
        assert_eq!(cases[1].status, OccurrenceStatus::Failed);
        assert_eq!(cases[1].failure_message.as_deref(), Some("expected 1 but was 2"));
        assert_eq!(cases[2].status, OccurrenceStatus::Skipped);
    }

    #[test]
    fn captures_suite_level_properties_and_system_out() {
        let outcome = parse("sample.xml", SAMPLE, ParseLimits::default()).unwrap();
        let suite = &outcome.test_suites[0];
        assert_eq!(suite.properties.get("os.name").map(String::as_str), Some("Linux"));
        assert_eq!(suite.system_out.as_deref(), Some("all good"));
    }

    #[test]
    fn count_reconciliation_passes_for_matching_counts() {
        let outcome = parse("sample.xml", SAMPLE, ParseLimits::default()).unwrap();
        assert!(outcome.validate_counts("sample.xml").is_ok());
    }

    #[test]
    fn count_reconciliation_tolerates_under_declared_counts() {
        // Declares fewer tests than actually observed: max(declared,
        // observed) takes the observed count, so this is not an error.
        let xml = r#"<testsuite name="s" tests="1" failures="0" errors="0" skipped="0">
            <testcase classname="c" name="a" time="0.0"/>
            <testcase classname="c" name="b" time="0.0"/>
        </testsuite>"#;
        let outcome = parse("under.xml", xml, ParseLimits::default()).unwrap();
        assert!(outcome.validate_counts("under.xml").is_ok());
        assert_eq!(occurrences(&outcome).len(), 2);
    }

    #[test]
    fn count_reconciliation_fails_when_failures_exceed_tests() {
        let xml = r#"<testsuite name="s" tests="1" failures="5" errors="0" skipped="0">
            <testcase classname="c" name="only_one" time="0.0"/>
        </testsuite>"#;
        let outcome = parse("bad.xml", xml, ParseLimits::default()).unwrap();
        assert!(outcome.validate_counts("bad.xml").is_err());
    }

    #[test]
    fn count_reconciliation_fails_on_negative_declared_count() {
        let xml = r#"<testsuite name="s" tests="-1" failures="0" errors="0" skipped="0">
            <testcase classname="c" name="t" time="0.0"/>
        </testsuite>"#;
        let outcome = parse("neg.xml", xml, ParseLimits::default()).unwrap();
        assert!(outcome.validate_counts("neg.xml").is_err());
    }

    #[test]
    fn nested_testsuites_accumulate_declared_counts() {
        let xml = r#"<testsuites>
            <testsuite name="a" tests="1" failures="0" errors="0" skipped="0">
                <testcase classname="a" name="t1" time="0.0"/>
            </testsuite>
            <testsuite name="b" tests="1" failures="0" errors="0" skipped="0">
                <testcase classname="b" name="t2" time="0.0"/>
            </testsuite>
        </testsuites>"#;
        let outcome = parse("multi.xml", xml, ParseLimits::default()).unwrap();
        assert_eq!(outcome.declared_tests, Some(2));
        assert_eq!(occurrences(&outcome).len(), 2);
    }

    #[test]
    fn rejects_excessive_depth() {
        let mut xml = String::from("<testsuite name=\"s\">");
        for _ in 0..40 {
            xml.push_str("<nested>");
        }
        for _ in 0..40 {
            xml.push_str("</nested>");
        }
        xml.push_str("</testsuite>");
        let result = parse("deep.xml", &xml, ParseLimits { max_depth: 10, ..ParseLimits::default() });
        assert!(result.is_err());
    }

    #[test]
    fn rejects_oversized_input() {
        let xml = format!("<testsuite name=\"s\">{}</testsuite>", "x".repeat(100));
        let result = parse("huge.xml", &xml, ParseLimits { max_file_size_bytes: 10, ..ParseLimits::default() });
        assert!(result.is_err());
    }

    #[test]
    fn gradle_skipped_message_attribute_is_captured() {
        let xml = r#"<testsuite name="s" tests="1" failures="0" errors="0" skipped="1">
            <testcase classname="c" name="t">
                <skipped message="disabled on CI"/>
            </testcase>
        </testsuite>"#;
        let outcome = parse("gradle-results.xml", xml, ParseLimits::default()).unwrap();
        assert_eq!(outcome.format, Format::Gradle);
        let cases = occurrences(&outcome);
        assert_eq!(cases[0].failure_message.as_deref(), Some("disabled on CI"));
    }

    #[test]
    fn detects_format_and_reports_confidence() {
        let outcome = parse("pytest-results.xml", SAMPLE, ParseLimits::default()).unwrap();
        assert_eq!(outcome.format, Format::Pytest);
        assert!(outcome.format_confidence > 0.0);
    }
}
