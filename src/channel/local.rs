//! Local shell channel.
//!
//! Runs commands as child processes of fleetrun via `{shell} -c`. Used for
//! nodes whose address is `localhost`, typically a developer machine or a
//! single-host CI agent running several simulators.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ChannelError, ChannelOptions, ChannelResult, Command, ExecutionChannel, OutputStream,
    spawn_streaming,
};
use crate::fleet::Node;

/// Channel running commands on this machine.
///
/// # Example
///
/// ```no_run
/// use fleetrun::channel::{ChannelOptions, Command, ExecutionChannel, LocalChannel};
/// use fleetrun::fleet::Node;
///
/// # async fn example() -> anyhow::Result<()> {
/// let channel = LocalChannel::new(Node::local("local", 2), ChannelOptions::default());
/// let result = channel.exec(&Command::new("xcrun").args(["simctl", "list"])).await?;
/// println!("{}", result.stdout);
/// # Ok(())
/// # }
/// ```
pub struct LocalChannel {
    node: Node,
    options: ChannelOptions,
    cancel: CancellationToken,
}

impl LocalChannel {
    pub fn new(node: Node, options: ChannelOptions) -> Self {
        Self {
            node,
            options,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl ExecutionChannel for LocalChannel {
    fn node(&self) -> &Node {
        &self.node
    }

    async fn exec_stream(&self, cmd: &Command) -> ChannelResult<OutputStream> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Terminated(format!(
                "local channel for {} is closed",
                self.node.name
            )));
        }

        let shell_cmd = cmd.to_shell_string();
        debug!(node = %self.node.name, "exec: {}", shell_cmd);

        let mut process = tokio::process::Command::new(&self.node.shell);
        process.arg("-c").arg(&shell_cmd);

        for (key, value) in &self.options.env {
            process.env(key, value);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }

        if let Some(dir) = cmd.working_dir.as_ref().or(self.options.working_dir.as_ref()) {
            process.current_dir(dir);
        }

        spawn_streaming(process, self.cancel.clone())
    }

    async fn terminate(&self) -> ChannelResult<()> {
        self.cancel.cancel();
        Ok(())
    }
}
