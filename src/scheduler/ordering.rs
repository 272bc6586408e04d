//! Longest-first ordering of the initial work queue.
//!
//! Tests expected to take longest are claimed first, so the session does
//! not end with one runner grinding through a long test while the others
//! sit idle.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::test_case::{TestCase, TestCaseResult};

/// Estimates how long a test will take, in seconds.
pub trait DurationEstimator: Send + Sync {
    /// Returns `None` for tests the estimator knows nothing about.
    fn estimate(&self, test: &TestCase) -> Option<f64>;
}

/// Sorts `tests` longest-first.
///
/// Tests without an estimate follow all estimated ones, in their original
/// order. Ties keep their original order.
pub fn sort_longest_first(mut tests: Vec<TestCase>, estimator: &dyn DurationEstimator) -> Vec<TestCase> {
    // Stable sort keyed on descending estimate; unknowns sort last.
    tests.sort_by(|a, b| {
        let a = estimator.estimate(a);
        let b = estimator.estimate(b);
        match (a, b) {
            (Some(a), Some(b)) => b.total_cmp(&a),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
    });
    tests
}

/// Estimates from recorded durations of a previous session.
///
/// Stored as a JSON object mapping test id (`Suite/name`) to seconds:
///
/// ```json
/// {"LoginTests/testLogin": 42.5, "CheckoutTests/testPay": 118.0}
/// ```
#[derive(Debug, Clone, Default)]
pub struct HistoricalEstimator {
    timings: HashMap<String, f64>,
}

impl HistoricalEstimator {
    pub fn new(timings: HashMap<String, f64>) -> Self {
        Self { timings }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read timings file: {}", path.display()))?;
        let timings: HashMap<String, f64> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse timings file: {}", path.display()))?;
        Ok(Self { timings })
    }

    /// Averages the durations of every non-crashed attempt per test.
    pub fn from_results(results: &[TestCaseResult]) -> Self {
        let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
        for result in results.iter().filter(|r| !r.crashed && r.duration >= 0.0) {
            let entry = sums.entry(result.test_id()).or_insert((0.0, 0));
            entry.0 += result.duration;
            entry.1 += 1;
        }
        let timings = sums
            .into_iter()
            .map(|(id, (sum, count))| (id, sum / count as f64))
            .collect();
        Self { timings }
    }

    /// Overlays `other`'s timings onto these.
    pub fn merge(&mut self, other: HistoricalEstimator) {
        self.timings.extend(other.timings);
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let sorted: std::collections::BTreeMap<_, _> = self.timings.iter().collect();
        let json = serde_json::to_string_pretty(&sorted)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write timings file: {}", path.display()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.timings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timings.is_empty()
    }
}

impl DurationEstimator for HistoricalEstimator {
    fn estimate(&self, test: &TestCase) -> Option<f64> {
        self.timings.get(&test.id()).copied()
    }
}
