//! Configuration loading and validation for fleetrun.
//!
//! The configuration file is TOML. It names the node fleet, the retry and
//! watchdog budgets, the command templates used to drive runners, and where
//! reports go. See [`schema`] for every field and its default.

pub mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Loads fleetrun configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use fleetrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("fleetrun.toml"))?;
/// println!("Failure retries: {}", config.fleetrun.failing_tests_retry_count);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads fleetrun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use fleetrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [fleetrun]
///     failing_tests_retry_count = 2
///
///     [[nodes]]
///     name = "local"
///     address = "localhost"
///     concurrent_runner_count = 2
///
///     [runner]
///     test_command = "xcodebuild test-without-building -destination id={runner_id} -only-testing:{suite}/{name} -resultBundlePath {result_bundle}"
/// "#)?;
///
/// assert_eq!(config.fleetrun.failing_tests_retry_count, 2);
/// assert_eq!(config.nodes.len(), 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Checks a loaded configuration for mistakes that would only surface
/// mid-session.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.nodes.is_empty() {
        bail!("At least one [[nodes]] entry is required");
    }

    let mut names = HashSet::new();
    for node in &config.nodes {
        if !names.insert(node.name.as_str()) {
            bail!("Duplicate node name: {}", node.name);
        }
        if node.runner_count() == 0 {
            bail!("Node {} has no runners", node.name);
        }
    }

    for placeholder in ["{suite}", "{name}"] {
        if !config.runner.test_command.contains(placeholder)
            && !config.runner.test_command.contains("{test_id}")
        {
            bail!(
                "runner.test_command must reference {} (or {{test_id}})",
                placeholder
            );
        }
    }

    shell_words::split(&config.runner.test_command)
        .context("runner.test_command is not a valid shell command")?;

    if let Some(merge) = &config.report.merge_command
        && !(merge.contains("{inputs}") && merge.contains("{output}"))
    {
        bail!("report.merge_command must reference {{inputs}} and {{output}}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [fleetrun]

        [[nodes]]
        name = "local"
        address = "localhost"

        [runner]
        test_command = "run-test {runner_id} {suite} {name}"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = load_config_str(MINIMAL).unwrap();

        assert_eq!(config.fleetrun.failing_tests_retry_count, 1);
        assert_eq!(config.fleetrun.test_for_stability_count, 0);
        assert_eq!(config.fleetrun.maximum_stdout_idle_time_secs, 300);
        assert!(config.fleetrun.xcresult_blob_threshold_kb.is_none());
        assert_eq!(config.nodes[0].concurrent_runner_count, 1);
        assert_eq!(config.nodes[0].port, 22);
        assert!(matches!(
            config.nodes[0].authentication,
            Authentication::None
        ));
        assert!(config.report.junit);
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_remote_node_with_key() {
        let config = load_config_str(
            r#"
            [fleetrun]
            maximum_stdout_idle_time_secs = 120
            xcresult_blob_threshold_kb = 512

            [[nodes]]
            name = "mac-mini-1"
            address = "10.0.0.5"
            concurrent_runner_count = 2
            runners = [
                { id = "A1B2", name = "iPhone 15 (1)" },
                { id = "C3D4", name = "iPhone 15 (2)" },
            ]

            [nodes.authentication]
            type = "key"
            user = "ci"
            key_path = "~/.ssh/id_ed25519"

            [runner]
            test_command = "run-test {test_id}"
            shutdown_command = "xcrun simctl shutdown {runner_id}"
            boot_command = "xcrun simctl boot {runner_id}"
        "#,
        )
        .unwrap();

        let node = &config.nodes[0];
        assert_eq!(node.runners.len(), 2);
        assert!(matches!(&node.authentication, Authentication::Key { user, .. } if user == "ci"));
        assert_eq!(config.fleetrun.xcresult_blob_threshold_kb, Some(512));
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicate_nodes() {
        let config = load_config_str(
            r#"
            [fleetrun]

            [[nodes]]
            name = "a"
            address = "localhost"

            [[nodes]]
            name = "a"
            address = "10.0.0.2"

            [runner]
            test_command = "run {suite} {name}"
        "#,
        )
        .unwrap();

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("Duplicate node name"));
    }

    #[test]
    fn test_validate_rejects_command_without_test() {
        let config = load_config_str(
            r#"
            [fleetrun]

            [[nodes]]
            name = "a"
            address = "localhost"

            [runner]
            test_command = "xcodebuild test"
        "#,
        )
        .unwrap();

        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_fleet() {
        let config = load_config_str(
            r#"
            [fleetrun]

            [runner]
            test_command = "run {suite} {name}"
        "#,
        )
        .unwrap();

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("nodes"));
    }
}
