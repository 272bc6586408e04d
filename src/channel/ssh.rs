//! SSH channel implementation.
//!
//! Runs commands on a remote node over a single persistent SSH connection.
//! [`SshChannel::open`] starts an OpenSSH control master; every command is
//! then multiplexed over its control socket, so runners on the same node do
//! not pay a handshake per test.
//!
//! # Prerequisites
//!
//! - `ssh` available locally
//! - Key-based or agent authentication (password auth not supported)
//! - Test bundles already present on the node (building is out of scope)
//!
//! # Commands
//!
//! Commands are executed as:
//! ```sh
//! ssh -o ControlPath=/tmp/fleetrun-<id>.sock [options] user@host "export KEY='value'; cd '/path'; command"
//! ```

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ChannelError, ChannelOptions, ChannelResult, Command, ExecutionChannel, OutputStream,
    spawn_streaming,
};
use crate::config::Authentication;
use crate::fleet::Node;

/// Channel running commands on a remote node over SSH.
pub struct SshChannel {
    node: Node,
    options: ChannelOptions,
    destination: String,
    ssh_opts: Vec<String>,
    control_path: PathBuf,
    cancel: CancellationToken,
}

impl SshChannel {
    /// Creates a channel for `node` without connecting.
    pub fn new(node: Node, options: ChannelOptions) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        // Unix socket paths are short; keep this out of $TMPDIR.
        let control_path = PathBuf::from(format!("/tmp/fleetrun-{}.sock", &id[..12]));

        let destination = match &node.authentication {
            Authentication::Key { user, .. } | Authentication::Agent { user } => {
                format!("{}@{}", user, node.address)
            }
            Authentication::None => node.address.clone(),
        };

        let mut ssh_opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=30".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
        ];

        if node.disable_host_key_check {
            ssh_opts.push("-o".to_string());
            ssh_opts.push("StrictHostKeyChecking=no".to_string());
            ssh_opts.push("-o".to_string());
            ssh_opts.push("UserKnownHostsFile=/dev/null".to_string());
        }

        if let Authentication::Key { key_path, .. } = &node.authentication {
            let key = shellexpand::tilde(&key_path.to_string_lossy()).into_owned();
            ssh_opts.push("-i".to_string());
            ssh_opts.push(key);
        }

        ssh_opts.push("-p".to_string());
        ssh_opts.push(node.port.to_string());

        Self {
            node,
            options,
            destination,
            ssh_opts,
            control_path,
            cancel: CancellationToken::new(),
        }
    }

    /// Starts the control master connection.
    ///
    /// # Errors
    ///
    /// `ChannelError::Connection` if the node cannot be reached or rejects
    /// authentication.
    pub async fn open(&self) -> ChannelResult<()> {
        info!(node = %self.node.name, "Connecting to {}", self.destination);

        // -f backgrounds the master after authentication, so only the exit
        // status is waited on; its pipes stay open for the master's lifetime.
        let status = self
            .base_command()
            .args(["-M", "-N", "-f", "-o", "ControlPersist=yes"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        if !status.success() {
            return Err(ChannelError::Connection(format!(
                "ssh to {} (node {}) exited with {}",
                self.destination,
                self.node.name,
                status.code().unwrap_or(-1)
            )));
        }

        Ok(())
    }

    /// Removes the control socket if the master left it behind.
    async fn remove_control_socket(&self) {
        match tokio::fs::remove_file(&self.control_path).await {
            Ok(()) => debug!(node = %self.node.name, "Removed stale {}", self.control_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                node = %self.node.name,
                "Failed to remove {}: {}",
                self.control_path.display(),
                e
            ),
        }
    }

    fn base_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(&self.ssh_opts);
        cmd
    }

    /// Builds the remote shell string: exports, `cd`, then the command.
    fn remote_command_string(&self, cmd: &Command) -> String {
        let mut full_cmd = String::new();

        for (key, value) in self.options.env.iter().chain(cmd.env.iter()) {
            full_cmd.push_str(&format!(
                "export {}='{}'; ",
                key,
                value.replace('\'', "'\\''")
            ));
        }

        if let Some(dir) = cmd.working_dir.as_ref().or(self.options.working_dir.as_ref()) {
            full_cmd.push_str(&format!("cd '{}' && ", dir.replace('\'', "'\\''")));
        }

        full_cmd.push_str(&cmd.to_shell_string());
        full_cmd
    }
}

#[async_trait]
impl ExecutionChannel for SshChannel {
    fn node(&self) -> &Node {
        &self.node
    }

    async fn exec_stream(&self, cmd: &Command) -> ChannelResult<OutputStream> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Terminated(format!(
                "ssh channel to {} is closed",
                self.destination
            )));
        }

        let full_cmd = self.remote_command_string(cmd);
        debug!(node = %self.node.name, "exec: {}", full_cmd);

        let mut ssh_cmd = self.base_command();
        ssh_cmd.arg(&self.destination).arg(&full_cmd);

        spawn_streaming(ssh_cmd, self.cancel.clone())
    }

    async fn terminate(&self) -> ChannelResult<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.cancel.cancel();

        let output = self
            .base_command()
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                debug!(node = %self.node.name, "Closed control connection");
            }
            Ok(output) => warn!(
                node = %self.node.name,
                "Closing control connection failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!(node = %self.node.name, "Closing control connection failed: {}", e),
        }

        self.remove_control_socket().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_node(authentication: Authentication) -> Node {
        Node {
            name: "mac-1".to_string(),
            address: "10.0.0.5".to_string(),
            authentication,
            port: 2222,
            concurrent_runner_count: 2,
            disable_host_key_check: true,
            shell: "/bin/sh".to_string(),
        }
    }

    #[test]
    fn test_destination_and_options() {
        let channel = SshChannel::new(
            remote_node(Authentication::Key {
                user: "ci".to_string(),
                key_path: PathBuf::from("/keys/id_ed25519"),
            }),
            ChannelOptions::default(),
        );

        assert_eq!(channel.destination, "ci@10.0.0.5");
        assert!(channel.ssh_opts.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(channel.ssh_opts.windows(2).any(|w| w == ["-i", "/keys/id_ed25519"]));
        assert!(channel.ssh_opts.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(
            channel
                .ssh_opts
                .iter()
                .any(|o| o.starts_with("ControlPath=/tmp/fleetrun-"))
        );
    }

    #[test]
    fn test_destination_without_user() {
        let channel = SshChannel::new(remote_node(Authentication::None), ChannelOptions::default());
        assert_eq!(channel.destination, "10.0.0.5");
        assert!(!channel.ssh_opts.contains(&"-i".to_string()));
    }

    #[test]
    fn test_remote_command_string() {
        let options = ChannelOptions {
            working_dir: Some("/Users/ci/app".to_string()),
            env: vec![("NSUnbufferedIO".to_string(), "YES".to_string())],
        };
        let channel = SshChannel::new(remote_node(Authentication::None), options);

        let cmd = Command::new("xcodebuild")
            .arg("-only-testing:Suite/test it")
            .env("QUOTE", "it's");
        assert_eq!(
            channel.remote_command_string(&cmd),
            "export NSUnbufferedIO='YES'; export QUOTE='it'\\''s'; cd '/Users/ci/app' && xcodebuild '-only-testing:Suite/test it'"
        );
    }

    #[tokio::test]
    async fn test_exec_after_terminate_fails() {
        let channel = SshChannel::new(remote_node(Authentication::None), ChannelOptions::default());
        channel.cancel.cancel();

        let err = channel.exec(&Command::new("true")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Terminated(_)));
    }

    #[tokio::test]
    async fn test_stale_control_socket_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel =
            SshChannel::new(remote_node(Authentication::None), ChannelOptions::default());
        channel.control_path = dir.path().join("master.sock");
        std::fs::write(&channel.control_path, "").unwrap();

        channel.remove_control_socket().await;
        assert!(!channel.control_path.exists());

        // Already gone is fine.
        channel.remove_control_socket().await;
    }
}
