//! Nodes, runners, and the session's fixed runner roster.
//!
//! Provisioning runners (creating simulators, arranging windows) happens
//! before a session starts. By the time fleetrun sees the fleet, each
//! [`Runner`] already exists and is bound to exactly one [`Node`]; the
//! roster never grows or shrinks during a session.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{Authentication, Config, NodeConfig};

/// A configured machine hosting one or more runners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub authentication: Authentication,
    pub port: u16,
    pub concurrent_runner_count: usize,
    pub disable_host_key_check: bool,
    pub shell: String,
}

impl Node {
    /// A node that runs commands on this machine.
    pub fn local(name: impl Into<String>, concurrent_runner_count: usize) -> Self {
        Self {
            name: name.into(),
            address: "localhost".to_string(),
            authentication: Authentication::None,
            port: 22,
            concurrent_runner_count,
            disable_host_key_check: false,
            shell: "/bin/sh".to_string(),
        }
    }

    /// Returns true if commands for this node run through a local shell.
    pub fn is_local(&self) -> bool {
        matches!(self.address.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

impl From<&NodeConfig> for Node {
    fn from(config: &NodeConfig) -> Self {
        Self {
            name: config.name.clone(),
            address: config.address.clone(),
            authentication: config.authentication.clone(),
            port: config.port,
            concurrent_runner_count: config.runner_count(),
            disable_host_key_check: config.disable_host_key_check,
            shell: config.shell.clone(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// One isolated execution target (a simulator or a dedicated device).
///
/// Identity is `id`. Recovery reboots the target but never changes the
/// runner itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: String,
    pub name: String,
    pub device: Option<String>,
}

impl Runner {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device: None,
        }
    }
}

impl PartialEq for Runner {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Runner {}

/// The runner roster for one session: every runner paired with its node.
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    nodes: Vec<Node>,
    roster: Vec<(Runner, Node)>,
}

impl Fleet {
    /// Builds a fleet from an explicit roster.
    ///
    /// Nodes are collected in order of first appearance.
    pub fn new(roster: Vec<(Runner, Node)>) -> Self {
        let mut nodes: Vec<Node> = Vec::new();
        for (_, node) in &roster {
            if !nodes.iter().any(|n| n.name == node.name) {
                nodes.push(node.clone());
            }
        }
        Self { nodes, roster }
    }

    /// Builds the roster described by the configuration.
    ///
    /// Nodes without an explicit `runners` list get runners named
    /// `{node}-{index}` (1-based).
    ///
    /// # Example
    ///
    /// ```
    /// use fleetrun::config::load_config_str;
    /// use fleetrun::fleet::Fleet;
    ///
    /// let config = load_config_str(r#"
    ///     [fleetrun]
    ///
    ///     [[nodes]]
    ///     name = "local"
    ///     address = "localhost"
    ///     concurrent_runner_count = 3
    ///
    ///     [runner]
    ///     test_command = "run {suite} {name}"
    /// "#)?;
    ///
    /// let fleet = Fleet::from_config(&config);
    /// assert_eq!(fleet.runner_count(), 3);
    /// assert_eq!(fleet.roster()[0].0.id, "local-1");
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_config(config: &Config) -> Self {
        let mut roster = Vec::new();
        for node_config in &config.nodes {
            let node = Node::from(node_config);
            if node_config.runners.is_empty() {
                for i in 1..=node_config.concurrent_runner_count {
                    let id = format!("{}-{}", node.name, i);
                    roster.push((Runner::new(id.clone(), id), node.clone()));
                }
            } else {
                for entry in &node_config.runners {
                    let runner = Runner {
                        id: entry.id.clone(),
                        name: entry.name.clone(),
                        device: entry.device.clone(),
                    };
                    roster.push((runner, node.clone()));
                }
            }
        }
        Self::new(roster)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn roster(&self) -> &[(Runner, Node)] {
        &self.roster
    }

    pub fn runner_count(&self) -> usize {
        self.roster.len()
    }

    /// Returns the runners hosted by the named node, in roster order.
    pub fn runners_on(&self, node_name: &str) -> Vec<&Runner> {
        self.roster
            .iter()
            .filter(|(_, node)| node.name == node_name)
            .map(|(runner, _)| runner)
            .collect()
    }
}
