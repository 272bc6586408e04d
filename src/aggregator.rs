//! Reconciles per-attempt results into the session summary.
//!
//! A test may have several attempts (failure retries, stability retries).
//! Its final classification is:
//!
//! | Attempts | Final status |
//! |----------|--------------|
//! | none | `NotRun` |
//! | all passed | `Passed` |
//! | some passed, some failed | `Flaky` (counts as passed) |
//! | all failed | `Failed` |
//!
//! [`SessionSummary::exit_code`] follows the same convention as the rest of
//! the toolchain: 0 all passed, 1 failures or unrun tests, 2 all passed but
//! some flaky.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::channel::{CommandTemplate, ExecutionChannel};
use crate::scheduler::{RetryKind, SchedulerOutcome};
use crate::test_case::{TestCase, TestCaseResult};

pub type AggregatorResult<T> = Result<T, AggregatorError>;

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("No result bundles to merge")]
    NoBundles,

    #[error("Merging result bundles failed: {0}")]
    MergeFailed(String),
}

/// Final classification of one test across all its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Passed,
    Failed,
    /// Failed at least once and passed at least once.
    Flaky,
    NotRun,
}

impl FinalStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, FinalStatus::Passed | FinalStatus::Flaky)
    }
}

/// One test's reconciled outcome.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub suite: String,
    pub name: String,
    pub status: FinalStatus,
    pub attempts: usize,
    pub failures: usize,
    pub crashes: usize,
    /// Duration of the deciding attempt: the last pass, or the last failure
    /// if nothing passed.
    pub duration: f64,
    /// Message of the most recent failed attempt.
    pub message: Option<String>,
    pub result_paths: Vec<String>,
}

impl TestOutcome {
    pub fn id(&self) -> String {
        format!("{}/{}", self.suite, self.name)
    }
}

/// Work done by one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub node: String,
    pub attempts: usize,
    pub passed: usize,
    pub failed: usize,
    /// Sum of attempt durations in seconds. Crashed attempts count as zero.
    pub execution_time: f64,
}

/// A merged result bundle produced on a node.
#[derive(Debug, Clone, Serialize)]
pub struct MergedBundle {
    pub node: String,
    pub path: String,
    pub inputs: usize,
}

/// Everything known about a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub total_tests: usize,
    /// Tests with at least one passing attempt, flaky ones included.
    pub passed: usize,
    pub failed: usize,
    pub flaky: usize,
    pub not_run: usize,
    pub attempts: usize,
    pub failure_retries: usize,
    pub stability_retries: usize,
    pub duration_secs: f64,
    /// True if the session stopped before the queue drained.
    pub aborted: bool,
    pub tests: Vec<TestOutcome>,
    pub nodes: Vec<NodeStats>,
    pub merged_bundles: Vec<MergedBundle>,
    pub results: Vec<TestCaseResult>,
}

impl SessionSummary {
    /// Reconciles the scheduler's results for `tests`.
    ///
    /// Results for tests outside `tests` are kept in `results` and node
    /// statistics but have no [`TestOutcome`].
    pub fn build(tests: &[TestCase], outcome: &SchedulerOutcome, duration: Duration) -> Self {
        let mut by_test: BTreeMap<String, Vec<&TestCaseResult>> = BTreeMap::new();
        for result in &outcome.results {
            by_test.entry(result.test_id()).or_default().push(result);
        }

        let mut seen = std::collections::HashSet::new();
        let outcomes: Vec<TestOutcome> = tests
            .iter()
            .filter(|t| seen.insert(t.id()))
            .map(|test| {
                let attempts = by_test.get(&test.id()).map(Vec::as_slice).unwrap_or(&[]);
                reconcile(test, attempts)
            })
            .collect();

        let count = |status: FinalStatus| outcomes.iter().filter(|o| o.status == status).count();
        let flaky = count(FinalStatus::Flaky);

        Self {
            total_tests: outcomes.len(),
            passed: count(FinalStatus::Passed) + flaky,
            failed: count(FinalStatus::Failed),
            flaky,
            not_run: count(FinalStatus::NotRun),
            attempts: outcome.results.len(),
            failure_retries: outcome.ledger.total(RetryKind::Failure),
            stability_retries: outcome.ledger.total(RetryKind::Stability),
            duration_secs: duration.as_secs_f64(),
            aborted: outcome.aborted,
            tests: outcomes,
            nodes: node_stats(&outcome.results),
            merged_bundles: Vec::new(),
            results: outcome.results.clone(),
        }
    }

    /// Returns true if every test ran and ultimately passed.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.not_run == 0
    }

    /// Process exit code for this session.
    pub fn exit_code(&self) -> i32 {
        if !self.success() {
            1
        } else if self.flaky > 0 {
            2
        } else {
            0
        }
    }

    pub fn outcome(&self, test: &TestCase) -> Option<&TestOutcome> {
        self.tests
            .iter()
            .find(|o| o.suite == test.suite && o.name == test.name)
    }

    /// Result bundle paths grouped by node, in node name order.
    pub fn bundles_by_node(&self) -> BTreeMap<String, Vec<String>> {
        let mut bundles: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for result in &self.results {
            if let Some(path) = &result.runner_result_path {
                bundles.entry(result.node.clone()).or_default().push(path.clone());
            }
        }
        bundles
    }
}

fn reconcile(test: &TestCase, attempts: &[&TestCaseResult]) -> TestOutcome {
    let passes = attempts.iter().filter(|r| r.status.is_success()).count();
    let failures = attempts.len() - passes;

    let status = match (passes, failures) {
        (0, 0) => FinalStatus::NotRun,
        (_, 0) => FinalStatus::Passed,
        (0, _) => FinalStatus::Failed,
        _ => FinalStatus::Flaky,
    };

    let deciding = attempts
        .iter()
        .rev()
        .find(|r| r.status.is_success())
        .or_else(|| attempts.last());

    TestOutcome {
        suite: test.suite.clone(),
        name: test.name.clone(),
        status,
        attempts: attempts.len(),
        failures,
        crashes: attempts.iter().filter(|r| r.crashed).count(),
        duration: deciding.map(|r| r.duration).unwrap_or(0.0),
        message: attempts
            .iter()
            .rev()
            .find(|r| !r.status.is_success())
            .and_then(|r| r.message.clone()),
        result_paths: attempts
            .iter()
            .filter_map(|r| r.runner_result_path.clone())
            .collect(),
    }
}

fn node_stats(results: &[TestCaseResult]) -> Vec<NodeStats> {
    let mut nodes: BTreeMap<&str, NodeStats> = BTreeMap::new();
    for result in results {
        let stats = nodes.entry(result.node.as_str()).or_insert_with(|| NodeStats {
            node: result.node.clone(),
            attempts: 0,
            passed: 0,
            failed: 0,
            execution_time: 0.0,
        });
        stats.attempts += 1;
        if result.status.is_success() {
            stats.passed += 1;
        } else {
            stats.failed += 1;
        }
        stats.execution_time += result.duration.max(0.0);
    }
    nodes.into_values().collect()
}

/// Merges each node's result bundles with the configured merge command.
///
/// The command runs on the node that holds the bundles, with `{inputs}`
/// expanded to the bundle paths and `{output}` set to
/// `<results_dir>/merged-<node>.xcresult`. A failure on one node is logged;
/// only a failure on every node is an error.
pub async fn merge_result_bundles(
    channels: &[Arc<dyn ExecutionChannel>],
    bundles: &BTreeMap<String, Vec<String>>,
    template: &CommandTemplate,
    results_dir: &str,
) -> AggregatorResult<Vec<MergedBundle>> {
    if bundles.values().all(Vec::is_empty) {
        return Err(AggregatorError::NoBundles);
    }

    let mut merged = Vec::new();
    let mut failures = Vec::new();

    for (node, inputs) in bundles.iter().filter(|(_, inputs)| !inputs.is_empty()) {
        let Some(channel) = channels.iter().find(|c| &c.node().name == node) else {
            warn!("No channel for node {}; skipping {} bundles", node, inputs.len());
            failures.push(format!("{}: no channel", node));
            continue;
        };

        let output = format!("{}/merged-{}.xcresult", results_dir.trim_end_matches('/'), node);
        let cmd = template.render_with_lists(&[("output", output.as_str())], &[("inputs", inputs.as_slice())]);

        match channel.exec(&cmd).await {
            Ok(result) if result.success() => {
                info!(node = %node, "Merged {} result bundles into {}", inputs.len(), output);
                merged.push(MergedBundle {
                    node: node.clone(),
                    path: output,
                    inputs: inputs.len(),
                });
            }
            Ok(result) => {
                warn!(node = %node, "Merge exited with {}", result.exit_code);
                failures.push(format!(
                    "{}: exit code {}: {}",
                    node,
                    result.exit_code,
                    result.combined_output().trim()
                ));
            }
            Err(e) => {
                warn!(node = %node, "Merge failed: {}", e);
                failures.push(format!("{}: {}", node, e));
            }
        }
    }

    if merged.is_empty() {
        return Err(AggregatorError::MergeFailed(failures.join("; ")));
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::scripted::{ScriptedChannel, Step};
    use crate::fleet::Node;
    use crate::scheduler::RetryLedger;
    use crate::test_case::TestStatus;

    fn attempt(test: &TestCase, node: &str, status: TestStatus, duration: f64) -> TestCaseResult {
        TestCaseResult::new(test, node, "SIM-1", status, duration)
    }

    fn outcome(results: Vec<TestCaseResult>) -> SchedulerOutcome {
        SchedulerOutcome {
            results,
            ledger: RetryLedger::default(),
            pending: Vec::new(),
            aborted: false,
        }
    }

    #[test]
    fn test_retried_and_recovered_test_is_flaky_not_failed() {
        let c = TestCase::new("S", "C");
        let results = vec![
            attempt(&c, "mac-1", TestStatus::Failed, 3.0).with_message("Test failed"),
            attempt(&c, "mac-2", TestStatus::Passed, 2.0),
        ];

        let summary = SessionSummary::build(&[c.clone()], &outcome(results), Duration::from_secs(5));

        let c_outcome = summary.outcome(&c).unwrap();
        assert_eq!(c_outcome.status, FinalStatus::Flaky);
        assert!(c_outcome.status.is_success());
        assert_eq!(c_outcome.attempts, 2);
        assert_eq!(c_outcome.duration, 2.0);
        assert_eq!(c_outcome.message.as_deref(), Some("Test failed"));
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.flaky, 1);
        assert_eq!(summary.exit_code(), 2);
    }

    #[test]
    fn test_counts_and_exit_codes() {
        let a = TestCase::new("S", "a");
        let b = TestCase::new("S", "b");
        let never = TestCase::new("S", "never");

        let all_passed = SessionSummary::build(
            &[a.clone()],
            &outcome(vec![attempt(&a, "n", TestStatus::Passed, 1.0)]),
            Duration::ZERO,
        );
        assert!(all_passed.success());
        assert_eq!(all_passed.exit_code(), 0);

        let mut crash = attempt(&b, "n", TestStatus::Failed, -1.0);
        crash.crashed = true;
        let summary = SessionSummary::build(
            &[a.clone(), b.clone(), never.clone()],
            &outcome(vec![attempt(&a, "n", TestStatus::Passed, 1.0), crash]),
            Duration::ZERO,
        );
        assert_eq!(summary.total_tests, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.not_run, 1);
        assert_eq!(summary.outcome(&b).unwrap().crashes, 1);
        assert_eq!(summary.outcome(&never).unwrap().status, FinalStatus::NotRun);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_node_stats() {
        let a = TestCase::new("S", "a");
        let results = vec![
            attempt(&a, "mac-2", TestStatus::Passed, 4.0),
            attempt(&a, "mac-1", TestStatus::Failed, 1.5),
            attempt(&a, "mac-1", TestStatus::Failed, -1.0),
        ];
        let summary = SessionSummary::build(&[a], &outcome(results), Duration::ZERO);

        assert_eq!(summary.nodes.len(), 2);
        assert_eq!(summary.nodes[0].node, "mac-1");
        assert_eq!(summary.nodes[0].attempts, 2);
        assert_eq!(summary.nodes[0].failed, 2);
        assert_eq!(summary.nodes[0].execution_time, 1.5);
        assert_eq!(summary.nodes[1].passed, 1);
    }

    #[test]
    fn test_bundles_by_node() {
        let a = TestCase::new("S", "a");
        let mut first = attempt(&a, "mac-1", TestStatus::Passed, 1.0);
        first.runner_result_path = Some("/r/1.xcresult".to_string());
        let second = attempt(&a, "mac-1", TestStatus::Passed, 1.0);

        let summary = SessionSummary::build(&[a.clone()], &outcome(vec![first, second]), Duration::ZERO);
        assert_eq!(summary.bundles_by_node()["mac-1"], vec!["/r/1.xcresult"]);
        assert_eq!(summary.outcome(&a).unwrap().result_paths.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_runs_once_per_node() {
        let channel: Arc<dyn ExecutionChannel> =
            Arc::new(ScriptedChannel::new(Node::local("mac-1", 1), |_| vec![Step::Exit(0)]));
        let bundles = BTreeMap::from([(
            "mac-1".to_string(),
            vec!["/r/1.xcresult".to_string(), "/r/2.xcresult".to_string()],
        )]);
        let template = CommandTemplate::parse("xcrun xcresulttool merge {inputs} --output-path {output}").unwrap();

        let merged = merge_result_bundles(&[channel], &bundles, &template, "/r/")
            .await
            .unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].path, "/r/merged-mac-1.xcresult");
        assert_eq!(merged[0].inputs, 2);
    }

    #[tokio::test]
    async fn test_merge_errors() {
        let template = CommandTemplate::parse("merge {inputs} {output}").unwrap();

        let err = merge_result_bundles(&[], &BTreeMap::new(), &template, "/r")
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::NoBundles));

        let channel: Arc<dyn ExecutionChannel> = Arc::new(ScriptedChannel::new(
            Node::local("mac-1", 1),
            |_| vec![Step::Out("corrupt bundle\n".to_string()), Step::Exit(1)],
        ));
        let bundles = BTreeMap::from([("mac-1".to_string(), vec!["/r/1.xcresult".to_string()])]);
        let err = merge_result_bundles(&[channel], &bundles, &template, "/r")
            .await
            .unwrap_err();
        match err {
            AggregatorError::MergeFailed(message) => assert!(message.contains("corrupt bundle")),
            other => panic!("unexpected error: {}", other),
        }
    }
}
