//! JUnit XML report generation.
//!
//! One `<testsuite>` per test suite and one `<testcase>` per test, using the
//! test's reconciled outcome rather than each attempt:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="fleetrun" tests="3" failures="1" skipped="0" time="42.100">
//!   <testsuite name="LoginTests" tests="3" failures="1" skipped="0" time="12.300">
//!     <testcase classname="LoginTests" name="testLogin" time="4.200"/>
//!     <testcase classname="LoginTests" name="testLogout" time="3.100">
//!       <system-out>Flaky: 1 of 2 attempts failed</system-out>
//!     </testcase>
//!     <testcase classname="LoginTests" name="testReset" time="-1.000">
//!       <failure message="Test crashed" type="crash"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Reporter;
use crate::aggregator::{FinalStatus, SessionSummary, TestOutcome};
use crate::scheduler::RetryKind;
use crate::test_case::{TestCase, TestCaseResult};

/// Reporter that writes a JUnit XML file when the session completes.
///
/// Parent directories are created automatically.
///
/// # Example
///
/// ```
/// use fleetrun::report::JUnitReporter;
///
/// let reporter = JUnitReporter::new("test-results/junit.xml".into())
///     .with_name("checkout-ui-tests");
/// ```
pub struct JUnitReporter {
    output_path: PathBuf,
    name: String,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            name: "fleetrun".to_string(),
        }
    }

    /// Sets the `name` attribute of `<testsuites>`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Renders the summary as JUnit XML.
    pub fn generate_xml(&self, summary: &SessionSummary) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut suites: BTreeMap<&str, Vec<&TestOutcome>> = BTreeMap::new();
        for outcome in &summary.tests {
            suites.entry(outcome.suite.as_str()).or_default().push(outcome);
        }

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("name", self.name.as_str()));
        push_counts(&mut testsuites, &summary.tests.iter().collect::<Vec<_>>());
        testsuites.push_attribute(("time", format!("{:.3}", summary.duration_secs).as_str()));
        writer.write_event(Event::Start(testsuites))?;

        for (suite, outcomes) in &suites {
            let time: f64 = outcomes.iter().map(|o| o.duration.max(0.0)).sum();

            let mut testsuite = BytesStart::new("testsuite");
            testsuite.push_attribute(("name", *suite));
            push_counts(&mut testsuite, outcomes);
            testsuite.push_attribute(("time", format!("{:.3}", time).as_str()));
            writer.write_event(Event::Start(testsuite))?;

            for outcome in outcomes {
                write_testcase(&mut writer, outcome)?;
            }

            writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write(&self, summary: &SessionSummary) -> anyhow::Result<()> {
        let xml = self.generate_xml(summary)?;
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.output_path, xml)?;
        Ok(())
    }
}

fn push_counts(element: &mut BytesStart<'_>, outcomes: &[&TestOutcome]) {
    let failures = outcomes
        .iter()
        .filter(|o| o.status == FinalStatus::Failed)
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| o.status == FinalStatus::NotRun)
        .count();
    element.push_attribute(("tests", outcomes.len().to_string().as_str()));
    element.push_attribute(("failures", failures.to_string().as_str()));
    element.push_attribute(("skipped", skipped.to_string().as_str()));
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    outcome: &TestOutcome,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", outcome.suite.as_str()));
    testcase.push_attribute(("name", outcome.name.as_str()));
    testcase.push_attribute(("time", format!("{:.3}", outcome.duration).as_str()));

    match outcome.status {
        FinalStatus::Passed => {
            writer.write_event(Event::Empty(testcase))?;
        }
        FinalStatus::Flaky => {
            writer.write_event(Event::Start(testcase))?;
            writer.write_event(Event::Start(BytesStart::new("system-out")))?;
            let note = format!(
                "Flaky: {} of {} attempts failed",
                outcome.failures, outcome.attempts
            );
            writer.write_event(Event::Text(BytesText::new(&note)))?;
            writer.write_event(Event::End(BytesEnd::new("system-out")))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        FinalStatus::Failed => {
            writer.write_event(Event::Start(testcase))?;

            let message = strip_invalid_xml_chars(
                outcome.message.as_deref().unwrap_or("Test failed"),
            );
            let kind = if outcome.crashes > 0 { "crash" } else { "failure" };
            let mut failure = BytesStart::new("failure");
            failure.push_attribute(("message", message.as_str()));
            failure.push_attribute(("type", kind));
            writer.write_event(Event::Empty(failure))?;

            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        FinalStatus::NotRun => {
            writer.write_event(Event::Start(testcase))?;
            let mut skipped = BytesStart::new("skipped");
            skipped.push_attribute(("message", "not run"));
            writer.write_event(Event::Empty(skipped))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }

    Ok(())
}

/// Removes characters XML 1.0 cannot represent. Escaping is left to the
/// writer.
fn strip_invalid_xml_chars(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'))
        .collect()
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_session_start(&self, _tests: &[TestCase], _runners: usize) {}

    async fn on_attempt_complete(&self, _result: &TestCaseResult, _retry: Option<RetryKind>) {}

    async fn on_session_complete(&self, summary: &SessionSummary) {
        match self.write(summary) {
            Ok(()) => tracing::info!("JUnit XML written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JUnit XML: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scheduler::{RetryLedger, SchedulerOutcome};
    use crate::test_case::TestStatus;

    fn summary() -> SessionSummary {
        let ok = TestCase::new("LoginTests", "testLogin");
        let flaky = TestCase::new("LoginTests", "testLogout");
        let crashed = TestCase::new("CartTests", "testAdd");
        let never = TestCase::new("CartTests", "testRemove");

        let mut crash = TestCaseResult::new(&crashed, "mac-1", "SIM-1", TestStatus::Failed, -1.0)
            .with_message("Test crashed <EXC_BAD_ACCESS>");
        crash.crashed = true;

        let outcome = SchedulerOutcome {
            results: vec![
                TestCaseResult::new(&ok, "mac-1", "SIM-1", TestStatus::Passed, 4.2),
                TestCaseResult::new(&flaky, "mac-1", "SIM-1", TestStatus::Failed, 1.0),
                TestCaseResult::new(&flaky, "mac-1", "SIM-2", TestStatus::Passed, 3.1),
                crash,
            ],
            ledger: RetryLedger::default(),
            pending: Vec::new(),
            aborted: false,
        };
        SessionSummary::build(&[ok, flaky, crashed, never], &outcome, Duration::from_secs(42))
    }

    #[test]
    fn test_generate_xml() {
        let xml = JUnitReporter::new("junit.xml".into())
            .generate_xml(&summary())
            .unwrap();

        assert!(xml.contains(r#"<testsuites name="fleetrun" tests="4" failures="1" skipped="1" time="42.000">"#));
        assert!(xml.contains(r#"<testsuite name="CartTests" tests="2" failures="1" skipped="1""#));
        assert!(xml.contains(r#"<testcase classname="LoginTests" name="testLogin" time="4.200"/>"#));
        assert!(xml.contains("Flaky: 1 of 2 attempts failed"));
        assert!(xml.contains(r#"type="crash""#));
        assert!(xml.contains("&lt;EXC_BAD_ACCESS&gt;"));
        assert!(xml.contains(r#"<skipped message="not run"/>"#));

        // Suites are written in name order.
        assert!(xml.find("CartTests").unwrap() < xml.find("LoginTests").unwrap());
    }

    #[tokio::test]
    async fn test_reporter_writes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reports/junit.xml");

        JUnitReporter::new(path.clone())
            .on_session_complete(&summary())
            .await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("<?xml"));
    }

    #[test]
    fn test_strip_invalid_xml_chars() {
        assert_eq!(strip_invalid_xml_chars("ok\u{0}\u{1b}[31m"), "ok[31m");
        assert_eq!(strip_invalid_xml_chars("line\nbreak"), "line\nbreak");
    }
}
