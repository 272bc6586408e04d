//! Session reporting and output generation.
//!
//! A [`Reporter`] receives events while a session runs. The built-in
//! reporters are:
//!
//! | Reporter | Output |
//! |----------|--------|
//! | [`ConsoleReporter`] | Progress bar and a colored summary |
//! | [`JUnitReporter`] | JUnit XML for CI dashboards |
//! | [`JsonReporter`] | Full session summary as JSON |
//! | [`MultiReporter`] | Fans events out to several reporters |

pub mod junit;

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::aggregator::{FinalStatus, SessionSummary};
use crate::scheduler::RetryKind;
use crate::test_case::{TestCase, TestCaseResult};

pub use junit::JUnitReporter;

/// Receives events during a session.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the queue is seeded, before any test runs.
    async fn on_session_start(&self, tests: &[TestCase], runners: usize);

    /// Called as soon as a runner's output reports a result, while the
    /// command is still running. Must not block.
    fn on_progress(&self, _result: &TestCaseResult) {}

    /// Called when an attempt has been recorded. `retry` says whether the
    /// test was queued again; `None` means this attempt is final.
    async fn on_attempt_complete(&self, result: &TestCaseResult, retry: Option<RetryKind>);

    /// Called once with the reconciled summary.
    async fn on_session_complete(&self, summary: &SessionSummary);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_session_start(&self, _tests: &[TestCase], _runners: usize) {}
    async fn on_attempt_complete(&self, _result: &TestCaseResult, _retry: Option<RetryKind>) {}
    async fn on_session_complete(&self, _summary: &SessionSummary) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_session_start(&self, tests: &[TestCase], runners: usize) {
        for reporter in &self.reporters {
            reporter.on_session_start(tests, runners).await;
        }
    }

    fn on_progress(&self, result: &TestCaseResult) {
        for reporter in &self.reporters {
            reporter.on_progress(result);
        }
    }

    async fn on_attempt_complete(&self, result: &TestCaseResult, retry: Option<RetryKind>) {
        for reporter in &self.reporters {
            reporter.on_attempt_complete(result, retry).await;
        }
    }

    async fn on_session_complete(&self, summary: &SessionSummary) {
        for reporter in &self.reporters {
            reporter.on_session_complete(summary).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
///
/// The bar advances once per test, when its final attempt is recorded.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn with_bar(&self, f: impl FnOnce(&indicatif::ProgressBar)) {
        let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pb) = progress.as_ref() {
            f(pb);
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_session_start(&self, tests: &[TestCase], runners: usize) {
        println!("Running {} tests on {} runners", tests.len(), runners);

        let pb = indicatif::ProgressBar::new(tests.len() as u64);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);

        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(pb);
    }

    fn on_progress(&self, result: &TestCaseResult) {
        if self.verbose {
            self.with_bar(|pb| pb.set_message(format!("{} on {}", result.test_id(), result.runner_id)));
        }
    }

    async fn on_attempt_complete(&self, result: &TestCaseResult, retry: Option<RetryKind>) {
        let status = match (result.status.is_success(), result.crashed, retry) {
            (_, _, Some(RetryKind::Failure)) => console::style("RETRY").yellow(),
            (true, _, Some(RetryKind::Stability)) => console::style("AGAIN").cyan(),
            (true, _, _) => console::style("PASS ").green(),
            (false, true, _) => console::style("CRASH").red().bold(),
            (false, false, _) => console::style("FAIL ").red(),
        };
        let show = self.verbose || !result.status.is_success();

        self.with_bar(|pb| {
            if retry.is_none() {
                pb.inc(1);
            }
            if show {
                pb.println(format!(
                    "{} {} [{} on {}]",
                    status,
                    result.test_id(),
                    result.runner_id,
                    result.node
                ));
            }
        });
    }

    async fn on_session_complete(&self, summary: &SessionSummary) {
        if let Some(pb) = self.progress.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pb.finish_and_clear();
        }
        print_summary(summary);
    }
}

/// Writes the session summary, including every attempt, as pretty JSON.
pub struct JsonReporter {
    output_path: PathBuf,
}

impl JsonReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn write(&self, summary: &SessionSummary) -> anyhow::Result<()> {
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&self.output_path, json)?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_session_start(&self, _tests: &[TestCase], _runners: usize) {}
    async fn on_attempt_complete(&self, _result: &TestCaseResult, _retry: Option<RetryKind>) {}

    async fn on_session_complete(&self, summary: &SessionSummary) {
        match self.write(summary) {
            Ok(()) => tracing::info!("Session summary written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write session summary: {}", e),
        }
    }
}

/// Prints a summary of the session to the console.
pub fn print_summary(summary: &SessionSummary) {
    println!();
    println!("Test Results:");
    println!("  Total:   {}", summary.total_tests);
    println!("  Passed:  {}", console::style(summary.passed).green());
    println!("  Failed:  {}", console::style(summary.failed).red());

    if summary.flaky > 0 {
        println!("  Flaky:   {}", console::style(summary.flaky).yellow());
    }
    if summary.not_run > 0 {
        println!("  Not Run: {}", console::style(summary.not_run).red().bold());
    }

    println!(
        "  Attempts: {} ({} failure retries, {} stability retries)",
        summary.attempts, summary.failure_retries, summary.stability_retries
    );
    println!("  Duration: {:.1}s", summary.duration_secs);

    if !summary.nodes.is_empty() {
        println!();
        println!("Nodes:");
        for node in &summary.nodes {
            println!(
                "  {:<16} {:>4} attempts  {:>8.1}s",
                node.node, node.attempts, node.execution_time
            );
        }
    }

    for merged in &summary.merged_bundles {
        println!("  Merged {} bundles on {}: {}", merged.inputs, merged.node, merged.path);
    }

    println!();
    if summary.aborted {
        println!("{}", console::style("Session was aborted.").red().bold());
    }

    if summary.success() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
        println!();
        println!("Failed tests:");
        for outcome in summary
            .tests
            .iter()
            .filter(|o| matches!(o.status, FinalStatus::Failed | FinalStatus::NotRun))
        {
            println!("  - {}", outcome.id());
            if let Some(msg) = &outcome.message {
                println!("    {}", console::style(msg).dim());
            } else if outcome.status == FinalStatus::NotRun {
                println!("    {}", console::style("not run").dim());
            }
        }
    }

    if summary.flaky > 0 {
        println!();
        println!("Flaky tests:");
        for outcome in summary.tests.iter().filter(|o| o.status == FinalStatus::Flaky) {
            println!(
                "  - {} ({} of {} attempts failed)",
                outcome.id(),
                outcome.failures,
                outcome.attempts
            );
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
        let test = TestCase::new("LoginTests", "testLogin");
        let outcome = SchedulerOutcome {
            results: vec![TestCaseResult::new(&test, "mac-1", "SIM-1", TestStatus::Passed, 2.0)],
            ledger: RetryLedger::default(),
            pending: Vec::new(),
            aborted: false,
        };
        SessionSummary::build(&[test], &outcome, Duration::from_secs(3))
    }

    #[tokio::test]
    async fn test_json_reporter_writes_summary() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out/session.json");
        let reporter = JsonReporter::new(path.clone());

        reporter.on_session_complete(&summary()).await;

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["passed"], 1);
        assert_eq!(json["tests"][0]["status"], "passed");
        assert_eq!(json["results"][0]["runner_id"], "SIM-1");
    }

    #[tokio::test]
    async fn test_multi_reporter_fans_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = dir.path().join("a.json");
        let second = dir.path().join("b.json");
        let reporter = MultiReporter::new()
            .with_reporter(NullReporter)
            .with_reporter(JsonReporter::new(first.clone()))
            .with_reporter(JsonReporter::new(second.clone()));

        reporter.on_session_start(&[], 1).await;
        reporter.on_session_complete(&summary()).await;

        assert!(first.exists());
        assert!(second.exists());
    }
}
