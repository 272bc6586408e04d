//! One test session: wiring the pool, the scheduler, and the executers.
//!
//! ```text
//!   tests ──► sort_longest_first ──► Scheduler (queue + ledger)
//!                                        ▲   │
//!   NodePool::execute                    │   │ next / record
//!     ├─ mac-1: run_worker × runners ────┘   │
//!     └─ mac-2: run_worker × runners ────────┘
//!                     │
//!                     ▼
//!   SessionSummary ──► merge bundles ──► timings.json ──► Reporter
//! ```
//!
//! Cancelling the session's token aborts the scheduler and terminates every
//! channel. Workers then stop at their next command, and the session still
//! reports whatever was recorded.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregatorError, SessionSummary, merge_result_bundles};
use crate::channel::{ChannelOptions, CommandTemplate, ExecutionChannel};
use crate::config::Config;
use crate::executer::{ExecuterSettings, TestExecuter};
use crate::fleet::Fleet;
use crate::pool::NodePool;
use crate::report::Reporter;
use crate::scheduler::{
    DurationEstimator, HistoricalEstimator, Scheduler, SchedulerSettings, sort_longest_first,
};
use crate::test_case::TestCase;
use crate::watchdog::CommandRecovery;

/// File under the report directory where measured durations are saved.
pub const TIMINGS_FILE: &str = "timings.json";

/// Runs a set of tests across the fleet once.
///
/// # Example
///
/// ```no_run
/// use fleetrun::config::load_config;
/// use fleetrun::report::ConsoleReporter;
/// use fleetrun::session::Session;
/// use fleetrun::test_case::load_test_cases;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = load_config(std::path::Path::new("fleetrun.toml"))?;
/// let tests = load_test_cases(std::path::Path::new("tests.json"))?;
///
/// let session = Session::new(config, tests);
/// let summary = session.run(&ConsoleReporter::new(false)).await?;
/// std::process::exit(summary.exit_code());
/// # }
/// ```
pub struct Session {
    config: Config,
    fleet: Fleet,
    tests: Vec<TestCase>,
    estimator: Option<Box<dyn DurationEstimator>>,
    cancel: CancellationToken,
}

impl Session {
    /// Creates a session over the fleet described by `config`.
    pub fn new(config: Config, tests: Vec<TestCase>) -> Self {
        let fleet = Fleet::from_config(&config);
        Self {
            config,
            fleet,
            tests,
            estimator: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the roster derived from the configuration.
    pub fn with_fleet(mut self, fleet: Fleet) -> Self {
        self.fleet = fleet;
        self
    }

    /// Orders the queue longest-first using `estimator`. Without one, tests
    /// run in the order given.
    pub fn with_estimator(mut self, estimator: impl DurationEstimator + 'static) -> Self {
        self.estimator = Some(Box::new(estimator));
        self
    }

    /// Token that stops the session when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// Connects to every node, runs the session, and closes the channels.
    ///
    /// # Errors
    ///
    /// A node that cannot be reached, an invalid command template, or an
    /// environment fault on any runner. Reporters still receive the partial
    /// summary when an environment fault aborts the run.
    pub async fn run(&self, reporter: &dyn Reporter) -> anyhow::Result<SessionSummary> {
        let options = ChannelOptions::from(&self.config.runner);
        let pool = NodePool::connect(&self.fleet, &options).await?;

        let summary = self.run_on(&pool, reporter).await;
        pool.terminate().await;
        summary
    }

    /// Runs the session on channels that are already open.
    ///
    /// Requires the multi-threaded runtime.
    pub async fn run_on(
        &self,
        pool: &NodePool,
        reporter: &dyn Reporter,
    ) -> anyhow::Result<SessionSummary> {
        let start = Instant::now();

        let template = Arc::new(
            CommandTemplate::parse(&self.config.runner.test_command)
                .context("Invalid runner.test_command")?,
        );
        let recovery = CommandRecovery::from_config(&self.config.runner)
            .context("Invalid runner recovery command")?;
        let executer_settings = ExecuterSettings::from(&self.config.fleetrun);

        let tests = match &self.estimator {
            Some(estimator) => sort_longest_first(self.tests.clone(), estimator.as_ref()),
            None => self.tests.clone(),
        };
        if tests.is_empty() {
            warn!("No tests to run");
        }

        let scheduler = Arc::new(Scheduler::new(
            tests,
            self.fleet.roster(),
            SchedulerSettings::from(&self.config.fleetrun),
        ));
        // Duplicates are queued once; report what was actually queued.
        let tests = scheduler.snapshot().pending;
        info!(
            "Scheduled {} tests on {} runners across {} nodes",
            tests.len(),
            self.fleet.runner_count(),
            self.fleet.nodes().len()
        );
        reporter.on_session_start(&tests, self.fleet.runner_count()).await;

        let finished = CancellationToken::new();
        let watcher = tokio::spawn({
            let cancel = self.cancel.clone();
            let finished = finished.clone();
            let scheduler = scheduler.clone();
            let pool = pool.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!("Session cancelled; terminating every channel");
                        scheduler.abort();
                        pool.terminate().await;
                    }
                    _ = finished.cancelled() => {}
                }
            }
        });

        let scheduler_ref = &scheduler;
        let template = &template;
        let recovery = &recovery;
        let executer_settings = &executer_settings;
        let run = pool
            .execute(move |channel: Arc<dyn ExecutionChannel>| {
                let scheduler = scheduler_ref;
                async move {
                    let node = channel.node().name.clone();
                    let executers: Vec<(usize, TestExecuter)> = scheduler
                        .slots_on(&node)
                        .into_iter()
                        .map(|(slot, runner)| {
                            let executer = TestExecuter::new(
                                channel.clone(),
                                runner,
                                template.clone(),
                                recovery.clone(),
                                executer_settings.clone(),
                            );
                            (slot, executer)
                        })
                        .collect();
                    debug!(node = %node, "Starting {} workers", executers.len());

                    let workers = executers
                        .iter()
                        .map(|(slot, executer)| scheduler.run_worker(*slot, executer, reporter));
                    let mut first_error = None;
                    for outcome in join_all(workers).await {
                        if let Err(e) = outcome {
                            first_error.get_or_insert(e);
                        }
                    }
                    match first_error {
                        Some(e) => Err(anyhow::Error::from(e)),
                        None => Ok(()),
                    }
                }
            })
            .await;

        finished.cancel();
        if let Err(e) = watcher.await {
            warn!("Cancellation watcher failed: {}", e);
        }

        let outcome = scheduler.snapshot();
        if outcome.aborted {
            warn!(
                "Session aborted with {} tests still queued",
                outcome.pending.len()
            );
        }
        let mut summary = SessionSummary::build(&tests, &outcome, start.elapsed());

        if let Some(merge_command) = &self.config.report.merge_command {
            self.merge_bundles(pool, merge_command, &mut summary).await?;
        }
        self.save_timings(&summary);

        reporter.on_session_complete(&summary).await;

        run.context("Session aborted")?;
        Ok(summary)
    }

    async fn merge_bundles(
        &self,
        pool: &NodePool,
        merge_command: &str,
        summary: &mut SessionSummary,
    ) -> anyhow::Result<()> {
        let template =
            CommandTemplate::parse(merge_command).context("Invalid report.merge_command")?;

        match merge_result_bundles(
            pool.channels(),
            &summary.bundles_by_node(),
            &template,
            &self.config.fleetrun.results_dir,
        )
        .await
        {
            Ok(merged) => summary.merged_bundles = merged,
            Err(AggregatorError::NoBundles) => debug!("No result bundles to merge"),
            Err(e) => warn!("{}", e),
        }
        Ok(())
    }

    /// Folds this session's durations into the timings file so the next
    /// session can order its queue.
    fn save_timings(&self, summary: &SessionSummary) {
        let path = self.config.report.output_dir.join(TIMINGS_FILE);
        let mut timings = if path.exists() {
            HistoricalEstimator::load(&path).unwrap_or_else(|e| {
                warn!("Ignoring unreadable timings file: {:#}", e);
                HistoricalEstimator::default()
            })
        } else {
            HistoricalEstimator::default()
        };
        timings.merge(HistoricalEstimator::from_results(&summary.results));

        match timings.save(&path) {
            Ok(()) => debug!("Saved {} timings to {}", timings.len(), path.display()),
            Err(e) => warn!("Failed to save timings: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::aggregator::FinalStatus;
    use crate::channel::Command;
    use crate::channel::scripted::{ScriptedChannel, Step};
    use crate::config::load_config_str;
    use crate::fleet::{Node, Runner};
    use crate::report::NullReporter;
    use crate::scheduler::RetryKind;
    use crate::test_case::TestCaseResult;

    fn config(output_dir: &std::path::Path, extra: &str) -> Config {
        load_config_str(&format!(
            r#"
            [fleetrun]
            failing_tests_retry_count = 1
            wait_poll_interval_ms = 5
            {extra}

            [[nodes]]
            name = "mac-1"
            address = "localhost"
            concurrent_runner_count = 2

            [[nodes]]
            name = "mac-2"
            address = "localhost"
            concurrent_runner_count = 1

            [runner]
            test_command = "xcodebuild test -only-testing:{{suite}}/{{name}}"

            [report]
            output_dir = "{}"
            "#,
            output_dir.display()
        ))
        .unwrap()
    }

    fn name_of(cmd: &Command) -> String {
        cmd.args
            .iter()
            .find_map(|a| a.strip_prefix("-only-testing:S/"))
            .unwrap()
            .to_string()
    }

    fn finished(name: &str, verdict: &str) -> Vec<Step> {
        vec![
            Step::Out(format!("Test Case '-[App.S {}]' started.\n", name)),
            Step::Sleep(Duration::from_millis(2)),
            Step::Out(format!("Test Case '-[App.S {}]' {} (1.500 seconds).\n", name, verdict)),
            Step::Exit(if verdict == "passed" { 0 } else { 65 }),
        ]
    }

    fn pool(handler: impl Fn(&Command) -> Vec<Step> + Send + Sync + Clone + 'static) -> NodePool {
        let channels = ["mac-1", "mac-2"]
            .into_iter()
            .map(|name| {
                Arc::new(ScriptedChannel::new(Node::local(name, 1), handler.clone()))
                    as Arc<dyn ExecutionChannel>
            })
            .collect();
        NodePool::from_channels(channels)
    }

    fn tests(names: &[&str]) -> Vec<TestCase> {
        names.iter().map(|n| TestCase::new("S", *n)).collect()
    }

    #[derive(Default)]
    struct Recording {
        started: Mutex<Option<usize>>,
        attempts: Mutex<Vec<(String, Option<RetryKind>)>>,
        completed: Mutex<Option<SessionSummary>>,
    }

    #[async_trait]
    impl Reporter for Recording {
        async fn on_session_start(&self, tests: &[TestCase], _runners: usize) {
            *self.started.lock().unwrap() = Some(tests.len());
        }

        async fn on_attempt_complete(&self, result: &TestCaseResult, retry: Option<RetryKind>) {
            self.attempts
                .lock()
                .unwrap()
                .push((result.name.clone(), retry));
        }

        async fn on_session_complete(&self, summary: &SessionSummary) {
            *self.completed.lock().unwrap() = Some(summary.clone());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_runs_every_test_across_nodes() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = pool(|cmd| {
            let name = name_of(cmd);
            finished(&name, "passed")
        });
        let session = Session::new(config(dir.path(), ""), tests(&["a", "b", "c", "d", "e"]));
        let reporter = Recording::default();

        let summary = session.run_on(&pool, &reporter).await.unwrap();

        assert_eq!(summary.total_tests, 5);
        assert_eq!(summary.passed, 5);
        assert_eq!(summary.exit_code(), 0);
        assert!(!summary.aborted);
        assert_eq!(reporter.attempts.lock().unwrap().len(), 5);
        assert!(reporter.completed.lock().unwrap().is_some());

        let timings = HistoricalEstimator::load(&dir.path().join(TIMINGS_FILE)).unwrap();
        assert_eq!(timings.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_tests_are_announced_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = pool(|cmd| {
            let name = name_of(cmd);
            finished(&name, "passed")
        });
        let session = Session::new(config(dir.path(), ""), tests(&["a", "b", "a"]));
        let reporter = Recording::default();

        let summary = session.run_on(&pool, &reporter).await.unwrap();

        assert_eq!(*reporter.started.lock().unwrap(), Some(2));
        assert_eq!(summary.total_tests, 2);
        assert_eq!(reporter.attempts.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_test_is_retried_and_reported_flaky() {
        let dir = tempfile::TempDir::new().unwrap();
        let failed_once = Arc::new(Mutex::new(false));
        let pool = pool(move |cmd| {
            let name = name_of(cmd);
            let mut failed = failed_once.lock().unwrap();
            if name == "flaky" && !*failed {
                *failed = true;
                finished(&name, "failed")
            } else {
                finished(&name, "passed")
            }
        });
        let session = Session::new(config(dir.path(), ""), tests(&["flaky", "steady"]));
        let reporter = Recording::default();

        let summary = session.run_on(&pool, &reporter).await.unwrap();

        let outcome = summary.outcome(&TestCase::new("S", "flaky")).unwrap();
        assert_eq!(outcome.status, FinalStatus::Flaky);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(summary.failure_retries, 1);
        assert_eq!(summary.exit_code(), 2);
        assert!(
            reporter
                .attempts
                .lock()
                .unwrap()
                .contains(&("flaky".to_string(), Some(RetryKind::Failure)))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_estimator_orders_queue_longest_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let pool = pool(move |cmd| {
            let name = name_of(cmd);
            seen.lock().unwrap().push(name.clone());
            finished(&name, "passed")
        });
        let fleet = Fleet::new(vec![(Runner::new("SIM-1", "iPhone"), Node::local("mac-1", 1))]);
        let estimator = HistoricalEstimator::new(HashMap::from([
            ("S/short".to_string(), 5.0),
            ("S/long".to_string(), 90.0),
        ]));
        let session = Session::new(config(dir.path(), ""), tests(&["short", "long"]))
            .with_fleet(fleet)
            .with_estimator(estimator);

        session.run_on(&pool, &NullReporter).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["long", "short"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_environment_fault_aborts_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = pool(|cmd| {
            let name = name_of(cmd);
            if name == "broken" {
                vec![
                    Step::Out("\"App.app\" is damaged and can't be opened.\n".to_string()),
                    Step::Exit(70),
                ]
            } else {
                finished(&name, "passed")
            }
        });
        let fleet = Fleet::new(vec![(Runner::new("SIM-1", "iPhone"), Node::local("mac-1", 1))]);
        let session = Session::new(config(dir.path(), ""), tests(&["broken", "never"])).with_fleet(fleet);
        let reporter = Recording::default();

        let err = session.run_on(&pool, &reporter).await.unwrap_err();

        let message = format!("{:#}", err);
        assert!(message.contains("Session aborted"));
        assert!(message.contains("SIM-1"));
        let summary = reporter.completed.lock().unwrap().clone().unwrap();
        assert!(summary.aborted);
        assert_eq!(summary.not_run, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_terminates_channels_and_keeps_results() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = pool(|cmd| {
            let name = name_of(cmd);
            if name == "quick" {
                finished(&name, "passed")
            } else {
                vec![Step::Out(format!("Test Case '-[App.S {}]' started.\n", name)), Step::Hang]
            }
        });
        let fleet = Fleet::new(vec![(Runner::new("SIM-1", "iPhone"), Node::local("mac-1", 1))]);
        let session = Session::new(config(dir.path(), ""), tests(&["quick", "stuck", "queued"]))
            .with_fleet(fleet);

        let cancel = session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let summary = tokio::time::timeout(Duration::from_secs(5), session.run_on(&pool, &NullReporter))
            .await
            .expect("cancelled session should finish")
            .unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.not_run, 2);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_merge_command_runs_per_node() {
        let dir = tempfile::TempDir::new().unwrap();
        let merges = Arc::new(Mutex::new(Vec::new()));
        let seen = merges.clone();
        let pool = pool(move |cmd| {
            if cmd.program == "merge" {
                seen.lock().unwrap().push(cmd.to_shell_string());
                return vec![Step::Exit(0)];
            }
            if cmd.program != "xcodebuild" {
                return vec![Step::Exit(0)];
            }
            let name = name_of(cmd);
            finished(&name, "passed")
        });
        let mut config = config(dir.path(), r#"results_dir = "/r""#);
        config.runner.test_command =
            "xcodebuild test -only-testing:{suite}/{name} -resultBundlePath {result_bundle}".to_string();
        config.report.merge_command = Some("merge {inputs} --output {output}".to_string());
        let session = Session::new(config, tests(&["a", "b", "c"]));

        let summary = session.run_on(&pool, &NullReporter).await.unwrap();

        assert_eq!(summary.bundles_by_node().values().map(Vec::len).sum::<usize>(), 3);
        let merged_inputs: usize = summary.merged_bundles.iter().map(|m| m.inputs).sum();
        assert_eq!(merged_inputs, 3);
        assert_eq!(merges.lock().unwrap().len(), summary.merged_bundles.len());
        assert!(
            summary
                .merged_bundles
                .iter()
                .all(|m| m.path == format!("/r/merged-{}.xcresult", m.node))
        );
    }
}
