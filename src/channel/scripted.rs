//! In-memory channel replaying scripted output, for tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{
    ChannelError, ChannelResult, Command, ExecutionChannel, OutputChunk, OutputStream,
};
use crate::fleet::Node;

/// One step of a scripted command.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Emit a stdout chunk.
    Out(String),
    /// Pause before the next step.
    Sleep(Duration),
    /// Emit the exit code.
    Exit(i32),
    /// Never produce anything again.
    Hang,
}

type Handler = Box<dyn Fn(&Command) -> Vec<Step> + Send + Sync>;

/// Channel whose commands replay steps chosen by a handler.
pub(crate) struct ScriptedChannel {
    node: Node,
    handler: Handler,
    commands: Mutex<Vec<String>>,
    cancel: CancellationToken,
}

impl ScriptedChannel {
    pub(crate) fn new(
        node: Node,
        handler: impl Fn(&Command) -> Vec<Step> + Send + Sync + 'static,
    ) -> Self {
        Self {
            node,
            handler: Box::new(handler),
            commands: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Shell strings of every command started so far.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

/// Output lines followed by exit code 0.
pub(crate) fn lines(lines: &[&str]) -> Vec<Step> {
    let mut steps: Vec<Step> = lines.iter().map(|l| Step::Out(format!("{}\n", l))).collect();
    steps.push(Step::Exit(0));
    steps
}

#[async_trait]
impl ExecutionChannel for ScriptedChannel {
    fn node(&self) -> &Node {
        &self.node
    }

    async fn exec_stream(&self, cmd: &Command) -> ChannelResult<OutputStream> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Terminated("scripted channel closed".to_string()));
        }
        self.commands.lock().unwrap().push(cmd.to_shell_string());

        let steps = (self.handler)(cmd);
        let replay = stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    Step::Out(text) => return Some((OutputChunk::Stdout(text), steps)),
                    Step::Exit(code) => return Some((OutputChunk::ExitCode(code), steps)),
                    Step::Sleep(delay) => tokio::time::sleep(delay).await,
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        });

        Ok(Box::pin(replay.take_until(self.cancel.clone().cancelled_owned())))
    }

    async fn terminate(&self) -> ChannelResult<()> {
        self.cancel.cancel();
        Ok(())
    }
}
