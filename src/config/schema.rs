//! Configuration schema definitions for fleetrun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── FleetrunConfig         - Retry budgets, watchdog window, result paths
//! ├── [NodeConfig]           - One entry per machine in the fleet
//! │   ├── Authentication     - Tagged enum: none / key / agent
//! │   └── [RunnerEntry]      - Optional explicit runner roster
//! ├── RunnerConfig           - Command templates for running and recovering
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for fleetrun.
///
/// # TOML Structure
///
/// ```toml
/// [fleetrun]
/// failing_tests_retry_count = 1
/// test_for_stability_count = 0
/// maximum_stdout_idle_time_secs = 300
///
/// [[nodes]]
/// name = "local"
/// address = "localhost"
/// concurrent_runner_count = 2
///
/// [runner]
/// test_command = "xcodebuild test-without-building -xctestrun App.xctestrun -destination id={runner_id} -only-testing:{suite}/{name} -resultBundlePath {result_bundle}"
/// shutdown_command = "xcrun simctl shutdown {runner_id}"
/// boot_command = "xcrun simctl boot {runner_id}"
///
/// [report]
/// output_dir = "test-results"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core scheduling settings (retry budgets, watchdog).
    pub fleetrun: FleetrunConfig,

    /// Machines hosting runners.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// How tests are launched and runners recovered.
    pub runner: RunnerConfig,

    /// Report configuration for output generation (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core scheduling settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `failing_tests_retry_count` | 1 |
/// | `test_for_stability_count` | 0 |
/// | `maximum_stdout_idle_time_secs` | 300 |
/// | `xcresult_blob_threshold_kb` | None |
/// | `wait_poll_interval_ms` | 250 |
/// | `results_dir` | `/tmp/fleetrun/results` |
/// | `stream_output` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetrunConfig {
    /// How many times a failing test is re-queued before its failure is final.
    ///
    /// Default: 1
    #[serde(default = "default_failing_retry_count")]
    pub failing_tests_retry_count: usize,

    /// How many extra times a passing test is re-run to prove it is stable.
    ///
    /// Default: 0
    #[serde(default)]
    pub test_for_stability_count: usize,

    /// Seconds a runner may go without producing output before the watchdog
    /// recovers it.
    ///
    /// Default: 300
    #[serde(default = "default_idle_time")]
    pub maximum_stdout_idle_time_secs: u64,

    /// Files larger than this inside a passing attempt's result bundle are
    /// pruned to save space on the node.
    pub xcresult_blob_threshold_kb: Option<u64>,

    /// How long an idle worker sleeps while other runners may still re-queue
    /// retries.
    ///
    /// Default: 250
    #[serde(default = "default_poll_interval")]
    pub wait_poll_interval_ms: u64,

    /// Directory on each node where per-attempt result bundles are written.
    ///
    /// Default: `/tmp/fleetrun/results`
    #[serde(default = "default_results_dir")]
    pub results_dir: String,

    /// Echo raw runner output to the console as it streams in.
    ///
    /// Default: false
    #[serde(default)]
    pub stream_output: bool,
}

fn default_failing_retry_count() -> usize {
    1
}

fn default_idle_time() -> u64 {
    300 // 5 minutes
}

fn default_poll_interval() -> u64 {
    250
}

fn default_results_dir() -> String {
    "/tmp/fleetrun/results".to_string()
}

impl Default for FleetrunConfig {
    fn default() -> Self {
        Self {
            failing_tests_retry_count: default_failing_retry_count(),
            test_for_stability_count: 0,
            maximum_stdout_idle_time_secs: default_idle_time(),
            xcresult_blob_threshold_kb: None,
            wait_poll_interval_ms: default_poll_interval(),
            results_dir: default_results_dir(),
            stream_output: false,
        }
    }
}

/// A machine in the fleet.
///
/// Nodes whose address is `localhost` or `127.0.0.1` run commands through a
/// local shell; every other node is reached over a persistent SSH connection.
///
/// # Example
///
/// ```toml
/// [[nodes]]
/// name = "mac-mini-1"
/// address = "10.0.0.5"
/// concurrent_runner_count = 3
///
/// [nodes.authentication]
/// type = "key"
/// user = "ci"
/// key_path = "~/.ssh/id_ed25519"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Unique node name used in logs and reports.
    pub name: String,

    /// Hostname or IP address.
    pub address: String,

    /// How to authenticate against a remote node.
    #[serde(default)]
    pub authentication: Authentication,

    /// SSH port.
    ///
    /// Default: 22
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of runners hosted by this node.
    ///
    /// Default: 1
    #[serde(default = "default_runner_count")]
    pub concurrent_runner_count: usize,

    /// Explicit runner roster. When empty, runners are named
    /// `{node}-{index}`.
    #[serde(default)]
    pub runners: Vec<RunnerEntry>,

    /// Skip host key verification. Only for throwaway fleets.
    #[serde(default)]
    pub disable_host_key_check: bool,

    /// Shell used to run commands on a local node.
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl NodeConfig {
    /// Number of runners this node contributes to the session.
    pub fn runner_count(&self) -> usize {
        if self.runners.is_empty() {
            self.concurrent_runner_count
        } else {
            self.runners.len()
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_runner_count() -> usize {
    1
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Credentials reference for a node.
///
/// Only key paths and user names are stored; secrets stay in the SSH agent
/// or key files.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Authentication {
    /// No explicit credentials (local node, or SSH defaults).
    #[default]
    None,

    /// Private key authentication.
    Key { user: String, key_path: PathBuf },

    /// Use whatever the running SSH agent offers.
    Agent { user: String },
}

/// One runner in an explicit roster.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerEntry {
    /// Stable identifier (simulator UDID or device serial).
    pub id: String,

    /// Display name.
    pub name: String,

    /// Device model, if known.
    pub device: Option<String>,
}

/// Command templates used to drive runners.
///
/// Templates are split with shell quoting rules first, then placeholders are
/// substituted per argument, so substituted values never need quoting.
///
/// | Placeholder | Available in |
/// |-------------|--------------|
/// | `{runner_id}`, `{runner_name}` | all commands |
/// | `{suite}`, `{name}`, `{test_id}` | `test_command` |
/// | `{result_bundle}` | `test_command` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Runs exactly one test on one runner.
    pub test_command: String,

    /// Shuts a runner's target down during recovery.
    pub shutdown_command: Option<String>,

    /// Boots a runner's target after shutdown during recovery.
    pub boot_command: Option<String>,

    /// Working directory for commands on every node.
    pub working_dir: Option<String>,

    /// Environment variables exported for every command.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Report generation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files are written.
    ///
    /// Default: `"test-results"`
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to generate a JUnit XML report.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename for the JUnit XML report.
    ///
    /// Default: `"junit.xml"`
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Filename for the JSON session report.
    ///
    /// Default: `"session.json"`
    #[serde(default = "default_json_file")]
    pub json_file: String,

    /// Command merging per-attempt result bundles on each node.
    ///
    /// `{inputs}` expands to one argument per bundle, `{output}` to the
    /// merged bundle path.
    ///
    /// # Example
    /// ```toml
    /// merge_command = "xcrun xcresulttool merge {inputs} --output-path {output}"
    /// ```
    pub merge_command: Option<String>,
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

fn default_json_file() -> String {
    "session.json".to_string()
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
            json_file: default_json_file(),
            merge_command: None,
        }
    }
}
