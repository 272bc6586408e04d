//! Runs one test case to completion on one runner.
//!
//! The [`TestExecuter`] renders the configured `test_command` for a test,
//! streams its output through the channel, reassembles lines, and folds the
//! parsed [`XcodebuildLineEvent`]s into a single [`TestCaseResult`].
//!
//! ```text
//!  channel.exec_stream(cmd)
//!        │ raw chunks (stdout / stderr)
//!        ▼
//!   LineBuffer ──► lines ──► detect_environment_fault ──► escalate
//!        │                          │
//!        │                      classify
//!        │                          ▼
//!        │                 Attempt (running test, pending failure)
//!        │                          │ on_progress
//!        ▼                          ▼
//!   Watchdog.reset()         TestCaseResult
//! ```
//!
//! # Fault handling
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | No output for the idle window | Runner recovered, attempt recorded as failed |
//! | `No space left on device` | Attempt recorded as failed, runner recovered afterwards |
//! | Crash after a failure line | Failure replaced by a crash (`duration = -1`) |
//! | Damaged build / missing permission | [`ExecuterError::Environment`], aborts the session |
//! | Channel terminated | [`ExecuterError::Channel`], worker stops |
//! | Any other channel error | Attempt recorded as failed |

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, Command, CommandTemplate, ExecutionChannel, OutputChunk};
use crate::config::FleetrunConfig;
use crate::fleet::Runner;
use crate::parser::{
    EnvironmentFault, LineBuffer, XcodebuildLineEvent, classify, detect_environment_fault,
};
use crate::test_case::{CRASHED_DURATION, TestCase, TestCaseResult, TestStatus};
use crate::watchdog::{RunnerRecovery, Watchdog};

/// Number of trailing output lines attached to escalated faults.
const OUTPUT_TAIL_LINES: usize = 40;

pub type ExecuterResult<T> = Result<T, ExecuterError>;

/// Faults that cannot be handled by recording a failed attempt.
#[derive(Debug, thiserror::Error)]
pub enum ExecuterError {
    /// The runner's channel was terminated, normally because the session was
    /// cancelled.
    #[error("Runner {runner} lost its channel: {source}")]
    Channel {
        runner: String,
        #[source]
        source: ChannelError,
    },

    /// The node is unusable for every runner; the session must stop.
    #[error("Environment fault on node {node} ({address}), runner {runner}: {fault}\n{output}")]
    Environment {
        node: String,
        address: String,
        runner: String,
        fault: EnvironmentFault,
        output: String,
    },
}

/// Called for every attempt result as soon as the output reports it.
pub type ProgressFn<'a> = dyn Fn(&TestCaseResult) + Send + Sync + 'a;

/// Per-session settings shared by every executer.
#[derive(Debug, Clone)]
pub struct ExecuterSettings {
    /// Silence after which the watchdog recovers the runner.
    pub idle_timeout: Duration,
    /// Directory on the node under which result bundles are created.
    pub results_dir: String,
    /// Prune files above this size from passing bundles.
    pub blob_threshold_kb: Option<u64>,
    /// Echo every output line to the console.
    pub stream_output: bool,
}

impl From<&FleetrunConfig> for ExecuterSettings {
    fn from(config: &FleetrunConfig) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.maximum_stdout_idle_time_secs),
            results_dir: config.results_dir.clone(),
            blob_threshold_kb: config.xcresult_blob_threshold_kb,
            stream_output: config.stream_output,
        }
    }
}

struct RunningTest {
    test: TestCase,
    since: Instant,
    started_at: DateTime<Utc>,
}

/// Event-folding state for one invocation of the test command.
///
/// Lives for exactly one attempt on one runner, so a crash line can only
/// ever upgrade a failure this same runner just reported.
struct Attempt<'a> {
    node: &'a str,
    runner_id: &'a str,
    running: Option<RunningTest>,
    pending_failure: Option<TestCaseResult>,
    completed: Vec<TestCaseResult>,
    no_space: bool,
    watched: Arc<Mutex<Option<TestCase>>>,
}

impl<'a> Attempt<'a> {
    fn new(node: &'a str, runner_id: &'a str, watched: Arc<Mutex<Option<TestCase>>>) -> Self {
        Self {
            node,
            runner_id,
            running: None,
            pending_failure: None,
            completed: Vec::new(),
            no_space: false,
            watched,
        }
    }

    fn on_event(&mut self, event: XcodebuildLineEvent, on_progress: &ProgressFn<'_>) {
        match event {
            XcodebuildLineEvent::SuiteStarted { suite } => {
                debug!(runner = self.runner_id, "Suite {} started", suite);
            }
            XcodebuildLineEvent::TestStarted(test) => {
                self.flush(on_progress);
                self.set_watched(Some(test.clone()));
                self.running = Some(RunningTest {
                    test,
                    since: Instant::now(),
                    started_at: Utc::now(),
                });
            }
            XcodebuildLineEvent::TestPassed(duration) => {
                self.flush(on_progress);
                if let Some(result) = self.close(TestStatus::Passed, duration) {
                    self.complete(result, on_progress);
                }
            }
            XcodebuildLineEvent::TestFailed(duration) => {
                self.flush(on_progress);
                self.pending_failure = self
                    .close(TestStatus::Failed, duration)
                    .map(|r| r.with_message("Test failed"));
            }
            XcodebuildLineEvent::TestCrashed => {
                let crashed = self
                    .pending_failure
                    .take()
                    .or_else(|| self.close(TestStatus::Failed, 0.0));
                match crashed {
                    Some(mut result) => {
                        result.crashed = true;
                        result.duration = CRASHED_DURATION;
                        result.message = Some("Test crashed".to_string());
                        self.complete(result, on_progress);
                    }
                    None => debug!(runner = self.runner_id, "Crash reported with no running test"),
                }
            }
            XcodebuildLineEvent::NoSpaceOnDevice => {
                warn!(runner = self.runner_id, node = self.node, "No space left on device");
                self.no_space = true;
            }
            XcodebuildLineEvent::Undefined => {}
        }
    }

    /// Closes the running test, preferring the tool's reported duration.
    fn close(&mut self, status: TestStatus, reported: f64) -> Option<TestCaseResult> {
        let running = self.running.take()?;
        self.set_watched(None);

        let duration = if reported > 0.0 {
            reported
        } else {
            running.since.elapsed().as_secs_f64()
        };
        Some(
            TestCaseResult::new(&running.test, self.node, self.runner_id, status, duration)
                .with_started_at(running.started_at),
        )
    }

    /// Reports a failure no crash line followed.
    fn flush(&mut self, on_progress: &ProgressFn<'_>) {
        if let Some(result) = self.pending_failure.take() {
            self.complete(result, on_progress);
        }
    }

    fn complete(&mut self, result: TestCaseResult, on_progress: &ProgressFn<'_>) {
        on_progress(&result);
        self.completed.push(result);
    }

    fn set_watched(&self, test: Option<TestCase>) {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        *watched = test;
    }

    /// Removes and returns the last completed result for `test`.
    fn take_result_for(&mut self, test: &TestCase) -> Option<TestCaseResult> {
        let index = self.completed.iter().rposition(|r| r.is_for(test))?;
        Some(self.completed.remove(index))
    }
}

/// Drives single-test invocations on one runner.
pub struct TestExecuter {
    channel: Arc<dyn ExecutionChannel>,
    runner: Runner,
    template: Arc<CommandTemplate>,
    recovery: Arc<dyn RunnerRecovery>,
    settings: ExecuterSettings,
}

impl TestExecuter {
    pub fn new(
        channel: Arc<dyn ExecutionChannel>,
        runner: Runner,
        template: Arc<CommandTemplate>,
        recovery: Arc<dyn RunnerRecovery>,
        settings: ExecuterSettings,
    ) -> Self {
        Self {
            channel,
            runner,
            template,
            recovery,
            settings,
        }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Name of the node this executer runs on.
    pub fn node_name(&self) -> &str {
        &self.channel.node().name
    }

    /// Runs `test` once and returns the raw output and the attempt's result.
    ///
    /// `on_progress` is called for every result the output reports while the
    /// command runs, including results for tests other than `test` if the
    /// command happens to run more than one.
    ///
    /// # Errors
    ///
    /// Only for faults a retry cannot fix: an environment fault, or the
    /// channel being terminated. Every other problem yields a failed result.
    pub async fn launch(
        &self,
        test: &TestCase,
        on_progress: &ProgressFn<'_>,
    ) -> ExecuterResult<(String, TestCaseResult)> {
        let node = self.channel.node().name.as_str();
        let started_at = Utc::now();
        let start = Instant::now();

        let bundle = self
            .template
            .uses("result_bundle")
            .then(|| self.result_bundle_path());
        if let Some(path) = &bundle {
            self.prepare_bundle_dir(path).await;
        }
        let cmd = self.command_for(test, bundle.as_deref());
        debug!(runner = %self.runner.id, "Launching {}", test);

        let watched = Arc::new(Mutex::new(None));
        let abandon = CancellationToken::new();
        let mut watchdog = self.watchdog(test, watched.clone(), abandon.clone());

        let mut stream = match self.channel.exec_stream(&cmd).await {
            Ok(stream) => stream,
            Err(ChannelError::Terminated(reason)) => {
                return Err(ExecuterError::Channel {
                    runner: self.runner.id.clone(),
                    source: ChannelError::Terminated(reason),
                });
            }
            Err(e) => {
                warn!(runner = %self.runner.id, "Failed to start {}: {}", test, e);
                let result = TestCaseResult::new(
                    test,
                    node,
                    &self.runner.id,
                    TestStatus::Failed,
                    start.elapsed().as_secs_f64(),
                )
                .with_started_at(started_at)
                .with_message(format!("Could not start test command: {}", e));
                return Ok((String::new(), result));
            }
        };
        watchdog.arm();

        let mut attempt = Attempt::new(node, &self.runner.id, watched);
        let mut raw = String::new();
        let mut stdout_lines = LineBuffer::default();
        let mut stderr_lines = LineBuffer::default();
        let mut exit_code = None;
        let mut fault = None;

        while fault.is_none() {
            let chunk = tokio::select! {
                _ = abandon.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };

            let lines = match &chunk {
                OutputChunk::Stdout(text) => stdout_lines.push(text),
                OutputChunk::Stderr(text) => stderr_lines.push(text),
                OutputChunk::ExitCode(code) => {
                    exit_code = Some(*code);
                    Vec::new()
                }
            };
            if let Some(text) = chunk.text().filter(|t| !t.is_empty()) {
                raw.push_str(text);
                if watchdog.fired() == 0 {
                    watchdog.reset();
                }
            }
            fault = self.feed(lines, &mut attempt, on_progress);
        }
        drop(stream);

        if fault.is_none() {
            let rest: Vec<String> = [stdout_lines.finish(), stderr_lines.finish()]
                .into_iter()
                .flatten()
                .collect();
            fault = self.feed(rest, &mut attempt, on_progress);
        }
        attempt.flush(on_progress);
        watchdog.disarm();

        let stalled = watchdog.fired() > 0;
        if stalled {
            // Recovery runs in the background; the runner is not reusable
            // until it finishes.
            abandon.cancelled().await;
        }

        if let Some(fault) = fault {
            error!(
                runner = %self.runner.id,
                node = %self.channel.node().address,
                "{} while running {}",
                fault,
                test
            );
            return Err(ExecuterError::Environment {
                node: node.to_string(),
                address: self.channel.node().address.clone(),
                runner: self.runner.id.clone(),
                fault,
                output: output_tail(&raw),
            });
        }

        if exit_code.is_none() && !stalled {
            return Err(ExecuterError::Channel {
                runner: self.runner.id.clone(),
                source: ChannelError::Terminated(format!(
                    "output of {} ended without an exit status",
                    test
                )),
            });
        }

        let mut result = match attempt.take_result_for(test) {
            Some(result) => result,
            None => {
                let message = if stalled {
                    format!(
                        "No output for {}s; runner {} was recovered",
                        self.settings.idle_timeout.as_secs(),
                        self.runner.id
                    )
                } else if attempt.running.is_some() {
                    format!(
                        "Test started but did not finish (exit code {})",
                        exit_code.unwrap_or(-1)
                    )
                } else {
                    format!("Test did not run (exit code {})", exit_code.unwrap_or(-1))
                };
                TestCaseResult::new(
                    test,
                    node,
                    &self.runner.id,
                    TestStatus::Failed,
                    start.elapsed().as_secs_f64(),
                )
                .with_started_at(started_at)
                .with_message(message)
            }
        };

        if attempt.no_space {
            result.status = TestStatus::Failed;
            result.message = Some("No space left on device".to_string());
        }

        if let Some(path) = bundle {
            result.runner_result_path = self.collect_bundle(path, result.status).await;
        }

        if attempt.no_space {
            if let Err(e) = self.recovery.recover(self.channel.as_ref(), &self.runner).await {
                warn!(runner = %self.runner.id, "Recovery after disk exhaustion failed: {}", e);
            }
        }

        info!(
            runner = %self.runner.id,
            "{} {} in {:.1}s",
            test,
            if result.status.is_success() { "passed" } else { "failed" },
            start.elapsed().as_secs_f64()
        );

        Ok((raw, result))
    }

    /// Classifies complete lines. Stops at the first environment fault.
    fn feed(
        &self,
        lines: Vec<String>,
        attempt: &mut Attempt<'_>,
        on_progress: &ProgressFn<'_>,
    ) -> Option<EnvironmentFault> {
        for line in lines {
            if self.settings.stream_output {
                println!("[{}] {}", self.runner.id, line);
            }
            if let Some(fault) = detect_environment_fault(&line) {
                return Some(fault);
            }
            attempt.on_event(classify(&line), on_progress);
        }
        None
    }

    fn watchdog(
        &self,
        test: &TestCase,
        watched: Arc<Mutex<Option<TestCase>>>,
        abandon: CancellationToken,
    ) -> Watchdog {
        let channel = self.channel.clone();
        let recovery = self.recovery.clone();
        let runner = self.runner.clone();
        let launched = test.clone();
        let idle = self.settings.idle_timeout;

        Watchdog::new(idle, move || {
            let running = watched
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            match running {
                Some(running) => warn!(
                    runner = %runner.id,
                    "No output for {}s while running {}; recovering runner",
                    idle.as_secs(),
                    running
                ),
                None => warn!(
                    runner = %runner.id,
                    "No output for {}s after launching {}; recovering runner",
                    idle.as_secs(),
                    launched
                ),
            }

            let channel = channel.clone();
            let recovery = recovery.clone();
            let runner = runner.clone();
            let abandon = abandon.clone();
            tokio::spawn(async move {
                if let Err(e) = recovery.recover(channel.as_ref(), &runner).await {
                    warn!(runner = %runner.id, "Recovery failed: {}", e);
                }
                abandon.cancel();
            });
        })
    }

    fn command_for(&self, test: &TestCase, bundle: Option<&str>) -> Command {
        let test_id = test.id();
        let mut vars = vec![
            ("runner_id", self.runner.id.as_str()),
            ("runner_name", self.runner.name.as_str()),
            ("suite", test.suite.as_str()),
            ("name", test.name.as_str()),
            ("test_id", test_id.as_str()),
        ];
        if let Some(bundle) = bundle {
            vars.push(("result_bundle", bundle));
        }
        self.template.render(&vars)
    }

    fn result_bundle_path(&self) -> String {
        format!(
            "{}/{}/{}.xcresult",
            self.settings.results_dir.trim_end_matches('/'),
            self.runner.id,
            uuid::Uuid::new_v4().simple()
        )
    }

    async fn prepare_bundle_dir(&self, bundle: &str) {
        let Some((dir, _)) = bundle.rsplit_once('/') else {
            return;
        };
        let cmd = Command::new("mkdir").args(["-p", dir]);
        match self.channel.exec(&cmd).await {
            Ok(result) if result.success() => {}
            Ok(result) => warn!(
                runner = %self.runner.id,
                "Could not create {}: {}",
                dir,
                result.combined_output().trim()
            ),
            Err(e) => warn!(runner = %self.runner.id, "Could not create {}: {}", dir, e),
        }
    }

    /// Confirms the bundle exists and prunes large blobs from passing ones.
    async fn collect_bundle(&self, bundle: String, status: TestStatus) -> Option<String> {
        let exists = self
            .channel
            .exec(&Command::new("test").args(["-e", bundle.as_str()]))
            .await
            .map(|r| r.success())
            .unwrap_or(false);
        if !exists {
            warn!(runner = %self.runner.id, "Result bundle {} not found", bundle);
            return None;
        }

        if let Some(threshold) = self.settings.blob_threshold_kb
            && status.is_success()
        {
            let size = format!("+{}k", threshold);
            let prune = Command::new("find").args([
                bundle.as_str(),
                "-type",
                "f",
                "-size",
                size.as_str(),
                "-delete",
            ]);
            if let Err(e) = self.channel.exec(&prune).await {
                warn!(runner = %self.runner.id, "Failed to prune {}: {}", bundle, e);
            }
        }

        Some(bundle)
    }
}

fn output_tail(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().collect();
    let skip = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[skip..].join("\n")
}
