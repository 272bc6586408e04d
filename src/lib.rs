//! fleetrun: a distributed UI test scheduler.
//!
//! fleetrun spreads a UI test suite over a fleet of machines ("nodes"),
//! each hosting one or more simulators or devices ("runners"). Runners pull
//! tests one at a time from a shared queue; stalled runners are recovered
//! by a watchdog; failing tests are retried on other runners within a
//! bounded budget; and every attempt is reconciled into one session report.
//!
//! # Architecture
//!
//! - [`channel`]: run shell commands on one node, locally or over SSH
//! - [`pool`]: one channel per node, work fanned out across nodes
//! - [`parser`]: classify lines of test-tool output into events
//! - [`executer`]: run one test on one runner and produce its result
//! - [`watchdog`]: recover runners that stop producing output
//! - [`scheduler`]: the shared work queue, retry ledger, and worker loop
//! - [`aggregator`]: reconcile attempts into the session summary
//! - [`report`]: console progress, JUnit XML, JSON session file
//! - [`session`]: wire all of the above for one run
//!
//! # Example
//!
//! ```no_run
//! use fleetrun::config::load_config;
//! use fleetrun::report::ConsoleReporter;
//! use fleetrun::session::Session;
//! use fleetrun::test_case::load_test_cases;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("fleetrun.toml"))?;
//!     let tests = load_test_cases(std::path::Path::new("tests.json"))?;
//!
//!     let summary = Session::new(config, tests)
//!         .run(&ConsoleReporter::new(false))
//!         .await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod executer;
pub mod fleet;
pub mod parser;
pub mod pool;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod test_case;
pub mod watchdog;

// Re-export commonly used types
pub use aggregator::SessionSummary;
pub use config::{Config, load_config};
pub use report::Reporter;
pub use session::Session;
pub use test_case::{TestCase, TestCaseResult};
