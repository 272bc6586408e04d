//! Retry bookkeeping.

use std::collections::HashMap;

use serde::Serialize;

use crate::test_case::TestCase;

/// Why a test was queued again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryKind {
    /// The previous attempt failed.
    Failure,
    /// The previous attempt passed and is being repeated to prove it is stable.
    Stability,
}

/// Counts retries per test and kind.
///
/// Failure and stability retries are independent budgets. Counts only grow.
///
/// # Example
///
/// ```
/// use fleetrun::scheduler::{RetryKind, RetryLedger};
/// use fleetrun::test_case::TestCase;
///
/// let test = TestCase::new("LoginTests", "testLogin");
/// let mut ledger = RetryLedger::default();
///
/// assert!(ledger.allows(&test, RetryKind::Failure, 1));
/// ledger.increment(&test, RetryKind::Failure);
/// assert!(!ledger.allows(&test, RetryKind::Failure, 1));
/// assert!(ledger.allows(&test, RetryKind::Stability, 1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryLedger {
    counts: HashMap<(TestCase, RetryKind), usize>,
}

impl RetryLedger {
    /// Number of retries of `kind` already granted to `test`.
    pub fn count(&self, test: &TestCase, kind: RetryKind) -> usize {
        self.counts
            .get(&(test.clone(), kind))
            .copied()
            .unwrap_or(0)
    }

    /// Returns true if `test` may be retried once more under `bound`.
    pub fn allows(&self, test: &TestCase, kind: RetryKind, bound: usize) -> bool {
        self.count(test, kind) < bound
    }

    /// Records one more retry and returns the new count.
    pub fn increment(&mut self, test: &TestCase, kind: RetryKind) -> usize {
        let count = self.counts.entry((test.clone(), kind)).or_insert(0);
        *count += 1;
        *count
    }

    /// Total retries of `kind` across all tests.
    pub fn total(&self, kind: RetryKind) -> usize {
        self.counts
            .iter()
            .filter(|((_, k), _)| *k == kind)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Every non-zero count, sorted by test id then kind.
    pub fn entries(&self) -> Vec<(TestCase, RetryKind, usize)> {
        let mut entries: Vec<_> = self
            .counts
            .iter()
            .map(|((test, kind), count)| (test.clone(), *kind, *count))
            .collect();
        entries.sort_by(|a, b| {
            (a.0.id(), a.1 == RetryKind::Stability).cmp(&(b.0.id(), b.1 == RetryKind::Stability))
        });
        entries
    }
}
