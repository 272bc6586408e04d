//! Test identity and per-attempt results.
//!
//! A [`TestCase`] names one UI test by `(suite, name)`. Every execution
//! attempt of a test produces exactly one [`TestCaseResult`]; retries of the
//! same test therefore produce several results, which the
//! [`aggregator`](crate::aggregator) later reconciles into a single verdict.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Duration recorded for attempts that crashed before the tool reported one.
pub const CRASHED_DURATION: f64 = -1.0;

/// Identity of one test.
///
/// Equality and hashing consider only `suite` and `name`; tags and external
/// IDs are descriptive metadata carried along for reporting.
///
/// # Example
///
/// ```
/// use fleetrun::test_case::TestCase;
///
/// let a = TestCase::new("LoginTests", "testValidCredentials").with_tag("smoke");
/// let b = TestCase::new("LoginTests", "testValidCredentials");
/// assert_eq!(a, b);
/// assert_eq!(a.id(), "LoginTests/testValidCredentials");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Test suite (the XCTestCase subclass).
    pub suite: String,

    /// Test method name, without trailing `()`.
    pub name: String,

    /// Free-form labels attached at discovery time.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Identifiers in external tracking systems (test management tools).
    #[serde(default)]
    pub external_ids: Vec<String>,
}

impl TestCase {
    /// Creates a test case with no tags or external IDs.
    pub fn new(suite: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            name: name.into(),
            tags: Vec::new(),
            external_ids: Vec::new(),
        }
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds an external identifier.
    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_ids.push(id.into());
        self
    }

    /// Returns the `suite/name` identifier used on the command line and in
    /// timing files.
    pub fn id(&self) -> String {
        format!("{}/{}", self.suite, self.name)
    }
}

impl PartialEq for TestCase {
    fn eq(&self, other: &Self) -> bool {
        self.suite == other.suite && self.name == other.name
    }
}

impl Eq for TestCase {}

impl Hash for TestCase {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.suite.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.suite, self.name)
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
}

impl TestStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TestStatus::Passed)
    }
}

/// The outcome of one execution attempt of one test on one runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    /// Name of the node the attempt ran on.
    pub node: String,

    /// Runner the attempt ran on.
    pub runner_id: String,

    /// Result bundle produced by the attempt, if it was found on the node.
    pub runner_result_path: Option<String>,

    pub suite: String,
    pub name: String,
    pub status: TestStatus,

    /// Duration in seconds. [`CRASHED_DURATION`] when the test crashed.
    pub duration: f64,

    /// Failure or diagnostic message.
    pub message: Option<String>,

    /// True when the attempt ended in a crash rather than an assertion failure.
    #[serde(default)]
    pub crashed: bool,

    /// Wall-clock start of the attempt.
    pub started_at: DateTime<Utc>,
}

impl TestCaseResult {
    /// Creates a result for `test` with no bundle and no message.
    pub fn new(
        test: &TestCase,
        node: impl Into<String>,
        runner_id: impl Into<String>,
        status: TestStatus,
        duration: f64,
    ) -> Self {
        Self {
            node: node.into(),
            runner_id: runner_id.into(),
            runner_result_path: None,
            suite: test.suite.clone(),
            name: test.name.clone(),
            status,
            duration,
            message: None,
            crashed: false,
            started_at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    /// Returns the test this result belongs to (without tags).
    pub fn test_case(&self) -> TestCase {
        TestCase::new(self.suite.clone(), self.name.clone())
    }

    /// Returns true if this result belongs to `test`.
    pub fn is_for(&self, test: &TestCase) -> bool {
        self.suite == test.suite && self.name == test.name
    }

    pub fn test_id(&self) -> String {
        format!("{}/{}", self.suite, self.name)
    }
}

/// Loads a discovered test list from a JSON array of test cases.
///
/// ```json
/// [{"suite": "LoginTests", "name": "testValidCredentials", "tags": ["smoke"]}]
/// ```
pub fn load_test_cases(path: &Path) -> Result<Vec<TestCase>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read test list: {}", path.display()))?;
    let tests: Vec<TestCase> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse test list: {}", path.display()))?;
    Ok(tests)
}
