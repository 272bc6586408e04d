//! fleetrun CLI - distributed UI test scheduler.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fleetrun::config;
use fleetrun::fleet::Fleet;
use fleetrun::report::{ConsoleReporter, JUnitReporter, JsonReporter, MultiReporter};
use fleetrun::scheduler::HistoricalEstimator;
use fleetrun::session::{Session, TIMINGS_FILE};
use fleetrun::test_case::load_test_cases;

#[derive(Parser)]
#[command(name = "fleetrun")]
#[command(about = "Distributed UI test scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "fleetrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests across the fleet
    Run {
        /// JSON list of tests to run ({"suite": ..., "name": ...} objects)
        #[arg(short, long)]
        tests: PathBuf,

        /// Timings from a previous session, used to run long tests first
        #[arg(long)]
        timings: Option<PathBuf>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Number of runners on the local node
        #[arg(short, long, default_value_t = 2)]
        runners: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG takes precedence over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            tests,
            timings,
            junit,
        } => run_tests(&cli.config, &tests, timings, junit, cli.verbose).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { runners } => init_config(&cli.config, runners),
    }
}

async fn run_tests(
    config_path: &Path,
    tests_path: &Path,
    timings_path: Option<PathBuf>,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config::validate_config(&config)
        .with_context(|| format!("Invalid config {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());

    let tests = load_test_cases(tests_path)?;
    info!("Loaded {} tests from {}", tests.len(), tests_path.display());

    let timings_path = timings_path.unwrap_or_else(|| config.report.output_dir.join(TIMINGS_FILE));
    let estimator = if timings_path.exists() {
        match HistoricalEstimator::load(&timings_path) {
            Ok(estimator) => {
                info!("Ordering by {} known durations", estimator.len());
                Some(estimator)
            }
            Err(e) => {
                warn!("Ignoring timings: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let reporter = create_reporter(&config, junit_path, verbose);

    let mut session = Session::new(config, tests);
    if let Some(estimator) = estimator {
        session = session.with_estimator(estimator);
    }

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping the session");
            cancel.cancel();
        }
    });

    let summary = session.run(&reporter).await?;
    std::process::exit(summary.exit_code());
}

fn create_reporter(
    config: &config::Config,
    junit_override: Option<PathBuf>,
    verbose: bool,
) -> MultiReporter {
    let mut multi = MultiReporter::new();

    // Add console reporter
    multi = multi.with_reporter(ConsoleReporter::new(verbose));

    // Add JUnit reporter if enabled
    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        multi = multi.with_reporter(JUnitReporter::new(junit_path));
    }

    let json_path = config.report.output_dir.join(&config.report.json_file);
    multi.with_reporter(JsonReporter::new(json_path))
}

fn validate_config(config_path: &Path) -> Result<()> {
    let loaded = config::load_config(config_path)
        .and_then(|config| config::validate_config(&config).map(|()| config));

    match loaded {
        Ok(config) => {
            let fleet = Fleet::from_config(&config);

            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!(
                "  Failure retries: {}",
                config.fleetrun.failing_tests_retry_count
            );
            println!(
                "  Stability retries: {}",
                config.fleetrun.test_for_stability_count
            );
            println!(
                "  Idle timeout: {}s",
                config.fleetrun.maximum_stdout_idle_time_secs
            );
            println!();
            println!("Fleet:");
            for node in fleet.nodes() {
                println!(
                    "  {} ({}): {} runners",
                    node.name,
                    node.address,
                    fleet.runners_on(&node.name).len()
                );
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path, runners: usize) -> Result<()> {
    let config = format!(
        r#"# fleetrun configuration file

[fleetrun]
failing_tests_retry_count = 1
test_for_stability_count = 0
maximum_stdout_idle_time_secs = 300
results_dir = "/tmp/fleetrun/results"

[[nodes]]
name = "local"
address = "localhost"
concurrent_runner_count = {runners}
# List simulator UDIDs to pin runners to devices:
# runners = [{{ id = "A1B2C3D4-...", name = "iPhone 15" }}]

# [[nodes]]
# name = "mac-mini-1"
# address = "10.0.0.5"
# concurrent_runner_count = 3
#
# [nodes.authentication]
# type = "key"
# user = "ci"
# key_path = "~/.ssh/id_ed25519"

[runner]
test_command = "xcodebuild test-without-building -xctestrun App.xctestrun -destination id={{runner_id}} -only-testing:{{suite}}/{{name}} -resultBundlePath {{result_bundle}}"
shutdown_command = "xcrun simctl shutdown {{runner_id}}"
boot_command = "xcrun simctl boot {{runner_id}}"

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
# merge_command = "xcrun xcresulttool merge {{inputs}} --output-path {{output}}"
"#
    );

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config)?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  fleetrun run --tests tests.json");

    Ok(())
}
