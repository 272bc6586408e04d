//! Shared work queue and the per-runner worker loop.
//!
//! Every runner in the fleet gets a [`RunnerSlot`] and a worker. Workers
//! pull one test at a time from a single queue, run it, and hand the result
//! back; the scheduler then decides whether the test goes back into the
//! queue.
//!
//! ```text
//!            ┌──────────── pop (lock) ────────────┐
//!            ▼                                    │
//!   IDLE ──────────► EXECUTING ──► RECORD (lock) ─┘
//!    │  queue empty,
//!    │  others busy ──► WAIT (sleep poll_interval) ──► IDLE
//!    │
//!    └─ queue empty, every slot idle ──► TERMINATED
//! ```
//!
//! # Re-enqueue policy
//!
//! | Outcome | Condition | Re-inserted at |
//! |---------|-----------|----------------|
//! | Passed | stability retries < `test_for_stability_count` | front (index 0) |
//! | Failed | failure retries < `failing_tests_retry_count` | index 1, so another runner likely claims it |
//! | Otherwise | | not re-inserted; the attempt is final |
//!
//! The queue, the [`RetryLedger`], the idle flags, and the collected results
//! sit behind one lock. Recording a result re-inserts the retry and marks the
//! slot idle in the same critical section, and the termination check reads
//! the queue and every idle flag in one critical section, so no worker can
//! observe an empty queue while a retry is about to be queued.

pub mod ledger;
pub mod ordering;

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::FleetrunConfig;
use crate::executer::{ExecuterError, ExecuterResult, TestExecuter};
use crate::fleet::{Node, Runner};
use crate::report::Reporter;
use crate::test_case::{TestCase, TestCaseResult};

pub use ledger::{RetryKind, RetryLedger};
pub use ordering::{DurationEstimator, HistoricalEstimator, sort_longest_first};

/// Retry budgets and pacing.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub failing_tests_retry_count: usize,
    pub test_for_stability_count: usize,
    /// Sleep between checks while the queue is empty but work is in flight.
    pub poll_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            failing_tests_retry_count: 1,
            test_for_stability_count: 0,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl From<&FleetrunConfig> for SchedulerSettings {
    fn from(config: &FleetrunConfig) -> Self {
        Self {
            failing_tests_retry_count: config.failing_tests_retry_count,
            test_for_stability_count: config.test_for_stability_count,
            poll_interval: Duration::from_millis(config.wait_poll_interval_ms),
        }
    }
}

/// A runner paired with its node and its busy state.
#[derive(Debug, Clone)]
pub struct RunnerSlot {
    pub runner: Runner,
    pub node: Node,
    pub idle: bool,
}

/// What a worker should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    Execute(TestCase),
    /// Nothing to claim yet, but other runners may still queue retries.
    Wait,
    Terminated,
}

/// Everything the scheduler collected once the session is over.
#[derive(Debug, Clone)]
pub struct SchedulerOutcome {
    pub results: Vec<TestCaseResult>,
    pub ledger: RetryLedger,
    /// Tests still queued when the session was aborted.
    pub pending: Vec<TestCase>,
    pub aborted: bool,
}

struct State {
    queue: VecDeque<TestCase>,
    ledger: RetryLedger,
    slots: Vec<RunnerSlot>,
    claimed: HashSet<TestCase>,
    results: Vec<TestCaseResult>,
    aborted: bool,
}

/// The work queue shared by every worker of a session.
pub struct Scheduler {
    state: Mutex<State>,
    settings: SchedulerSettings,
}

impl Scheduler {
    /// Seeds the queue with `tests` in the given order.
    ///
    /// Duplicate tests (same suite and name) are queued once.
    pub fn new(tests: Vec<TestCase>, roster: &[(Runner, Node)], settings: SchedulerSettings) -> Self {
        let mut seen = HashSet::new();
        let queue: VecDeque<TestCase> = tests
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();

        let slots = roster
            .iter()
            .map(|(runner, node)| RunnerSlot {
                runner: runner.clone(),
                node: node.clone(),
                idle: true,
            })
            .collect();

        Self {
            state: Mutex::new(State {
                queue,
                ledger: RetryLedger::default(),
                slots,
                claimed: HashSet::new(),
                results: Vec::new(),
                aborted: false,
            }),
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Slot indices and runners belonging to `node_name`.
    pub fn slots_on(&self, node_name: &str) -> Vec<(usize, Runner)> {
        self.lock()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.node.name == node_name)
            .map(|(i, slot)| (i, slot.runner.clone()))
            .collect()
    }

    /// Claims the next test for `slot`, or says why there is none.
    pub fn next(&self, slot: usize) -> NextStep {
        let mut state = self.lock();

        if state.aborted {
            state.slots[slot].idle = true;
            return NextStep::Terminated;
        }

        if let Some(test) = state.queue.pop_front() {
            let fresh = state.claimed.insert(test.clone());
            debug_assert!(fresh, "{} claimed by two runners", test);
            state.slots[slot].idle = false;
            return NextStep::Execute(test);
        }

        state.slots[slot].idle = true;
        if state.slots.iter().all(|s| s.idle) {
            NextStep::Terminated
        } else {
            NextStep::Wait
        }
    }

    /// Records the result of `slot`'s attempt at `test` and applies the
    /// retry policy.
    ///
    /// Returns the kind of retry queued, if any.
    pub fn record(&self, slot: usize, test: &TestCase, result: TestCaseResult) -> Option<RetryKind> {
        let mut state = self.lock();
        let state = &mut *state;

        state.claimed.remove(test);
        let passed = result.status.is_success();
        state.results.push(result);

        let retry = if state.aborted {
            None
        } else if passed
            && state.ledger.allows(
                test,
                RetryKind::Stability,
                self.settings.test_for_stability_count,
            )
        {
            let count = state.ledger.increment(test, RetryKind::Stability);
            state.queue.push_front(test.clone());
            debug!(
                "{} passed; stability retry {}/{}",
                test, count, self.settings.test_for_stability_count
            );
            Some(RetryKind::Stability)
        } else if !passed
            && state.ledger.allows(
                test,
                RetryKind::Failure,
                self.settings.failing_tests_retry_count,
            )
        {
            let count = state.ledger.increment(test, RetryKind::Failure);
            let index = state.queue.len().min(1);
            state.queue.insert(index, test.clone());
            info!(
                "{} failed; retry {}/{}",
                test, count, self.settings.failing_tests_retry_count
            );
            Some(RetryKind::Failure)
        } else {
            None
        };

        state.slots[slot].idle = true;
        retry
    }

    /// Marks `slot` idle after an attempt that produced no result.
    ///
    /// `test` is not queued again.
    pub fn release(&self, slot: usize, test: &TestCase) {
        let mut state = self.lock();
        state.claimed.remove(test);
        state.slots[slot].idle = true;
    }

    /// Stops handing out work. Returns true if already aborted.
    pub fn abort(&self) -> bool {
        let mut state = self.lock();
        std::mem::replace(&mut state.aborted, true)
    }

    /// Number of tests waiting in the queue.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Results recorded so far.
    pub fn results(&self) -> Vec<TestCaseResult> {
        self.lock().results.clone()
    }

    pub fn ledger(&self) -> RetryLedger {
        self.lock().ledger.clone()
    }

    pub fn slots(&self) -> Vec<RunnerSlot> {
        self.lock().slots.clone()
    }

    /// Copies the current state out without consuming the scheduler.
    pub fn snapshot(&self) -> SchedulerOutcome {
        let state = self.lock();
        SchedulerOutcome {
            results: state.results.clone(),
            ledger: state.ledger.clone(),
            pending: state.queue.iter().cloned().collect(),
            aborted: state.aborted,
        }
    }

    pub fn into_outcome(self) -> SchedulerOutcome {
        let state = self.state.into_inner().unwrap_or_else(|e| e.into_inner());
        SchedulerOutcome {
            results: state.results,
            ledger: state.ledger,
            pending: state.queue.into_iter().collect(),
            aborted: state.aborted,
        }
    }

    /// Worker loop for `slot`: claim, execute, record, until terminated.
    ///
    /// # Errors
    ///
    /// Returns the executer's error after aborting the scheduler, so the
    /// other workers stop claiming tests. Channel errors after the session
    /// was already aborted are not errors.
    pub async fn run_worker(
        &self,
        slot: usize,
        executer: &TestExecuter,
        reporter: &dyn Reporter,
    ) -> ExecuterResult<()> {
        let runner = executer.runner().id.clone();
        let on_progress = |result: &TestCaseResult| reporter.on_progress(result);

        loop {
            match self.next(slot) {
                NextStep::Terminated => {
                    debug!(runner = %runner, "Worker finished");
                    return Ok(());
                }
                NextStep::Wait => tokio::time::sleep(self.settings.poll_interval).await,
                NextStep::Execute(test) => match executer.launch(&test, &on_progress).await {
                    Ok((_, result)) => {
                        let retry = self.record(slot, &test, result.clone());
                        reporter.on_attempt_complete(&result, retry).await;
                    }
                    Err(e) => {
                        self.release(slot, &test);
                        let already_aborted = self.abort();
                        if already_aborted && matches!(e, ExecuterError::Channel { .. }) {
                            debug!(runner = %runner, "Worker stopped: {}", e);
                            return Ok(());
                        }
                        warn!(runner = %runner, "Aborting session: {}", e);
                        return Err(e);
                    }
                },
            }
        }
    }
}
