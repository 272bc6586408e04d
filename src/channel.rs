//! Execution channels: running shell commands on one node.
//!
//! An [`ExecutionChannel`] is bound to exactly one [`Node`] for its
//! lifetime. It runs commands either to completion ([`exec`]) or while
//! streaming raw output as it arrives ([`exec_stream`]), and can be
//! [`terminate`]d, which kills every command still in flight.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  ExecutionChannel                        │
//! │                                                          │
//! │  exec(Command) ─────────► ExecResult                     │
//! │  exec_stream(Command) ──► OutputStream                   │
//! │                            Stdout/Stderr chunks ...      │
//! │                            ExitCode(i32)                 │
//! │  terminate()                                             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Channels
//!
//! | Channel | Module | Used for |
//! |---------|--------|----------|
//! | Local | [`local`] | Nodes at `localhost` |
//! | SSH | [`ssh`] | Every other node, over a persistent multiplexed connection |
//!
//! Streamed chunks are whatever a single read returned, so a line of output
//! may be split across several chunks. Reassembling lines is the reader's
//! job (see [`LineBuffer`](crate::parser::LineBuffer)).
//!
//! [`exec`]: ExecutionChannel::exec
//! [`exec_stream`]: ExecutionChannel::exec_stream
//! [`terminate`]: ExecutionChannel::terminate

pub mod local;
pub mod ssh;

#[cfg(test)]
pub(crate) mod scripted;

use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use futures::future;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RunnerConfig;
use crate::fleet::Node;

pub use local::LocalChannel;
pub use ssh::SshChannel;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur while running commands on a node.
///
/// A command that runs but exits non-zero is NOT an error; the exit code is
/// reported in [`ExecResult`] or as [`OutputChunk::ExitCode`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The command could not be started.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// Failed to establish or keep the connection to the node.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The command exceeded its timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The channel was terminated while the command was in flight.
    #[error("Channel terminated: {0}")]
    Terminated(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A command to execute on a node.
///
/// # Example
///
/// ```
/// use fleetrun::channel::Command;
///
/// let cmd = Command::new("xcrun")
///     .args(["simctl", "boot", "A1B2-C3D4"])
///     .working_dir("/Users/ci/app")
///     .env("NSUnbufferedIO", "YES")
///     .timeout(60);
///
/// assert_eq!(cmd.program, "xcrun");
/// assert_eq!(cmd.to_shell_string(), "xcrun simctl boot A1B2-C3D4");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory. `None` uses the channel's default.
    pub working_dir: Option<String>,

    /// Environment variables, merged over the channel's own.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds for [`ExecutionChannel::exec`].
    pub timeout_secs: Option<u64>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Converts the command to a shell-executable string.
    ///
    /// ```
    /// use fleetrun::channel::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// A command line with `{placeholder}` arguments, parsed once and rendered
/// per invocation.
///
/// Placeholders are substituted inside each argument after splitting, so a
/// value containing spaces or quotes stays a single argument.
///
/// # Example
///
/// ```
/// use fleetrun::channel::CommandTemplate;
///
/// let template = CommandTemplate::parse("xcrun simctl boot {runner_id}").unwrap();
/// let cmd = template.render(&[("runner_id", "A1B2 C3")]);
/// assert_eq!(cmd.to_shell_string(), "xcrun simctl boot 'A1B2 C3'");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl CommandTemplate {
    /// Splits `template` with shell quoting rules.
    pub fn parse(template: &str) -> anyhow::Result<Self> {
        let argv = shell_words::split(template)
            .map_err(|e| anyhow::anyhow!("Invalid command template '{}': {}", template, e))?;
        if argv.is_empty() {
            anyhow::bail!("Command template is empty");
        }
        Ok(Self { argv })
    }

    /// Returns true if any argument mentions `{key}`.
    pub fn uses(&self, key: &str) -> bool {
        let placeholder = format!("{{{}}}", key);
        self.argv.iter().any(|arg| arg.contains(&placeholder))
    }

    /// Substitutes every `{key}` with its value.
    pub fn render(&self, vars: &[(&str, &str)]) -> Command {
        self.render_with_lists(vars, &[])
    }

    /// Like [`render`](Self::render), but an argument that is exactly
    /// `{key}` for a list variable expands to one argument per element.
    pub fn render_with_lists(&self, vars: &[(&str, &str)], lists: &[(&str, &[String])]) -> Command {
        let mut argv = Vec::with_capacity(self.argv.len());
        for arg in &self.argv {
            let bare = arg.strip_prefix('{').and_then(|s| s.strip_suffix('}'));
            let spliced = lists.iter().find(|(key, _)| bare == Some(*key));
            match spliced {
                Some((_, values)) => argv.extend(values.iter().cloned()),
                None => {
                    let mut rendered = arg.clone();
                    for (key, value) in vars {
                        rendered = rendered.replace(&format!("{{{}}}", key), value);
                    }
                    argv.push(rendered);
                }
            }
        }

        let mut iter = argv.into_iter();
        let program = iter.next().unwrap_or_default();
        Command::new(program).args(iter)
    }
}

/// Escape a string for use in a shell command.
pub(crate) fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| {
            c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '+' | ',' | '@')
        })
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Result of running a command to completion.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, for diagnostics.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

/// A piece of output from a streaming command.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputChunk {
    /// Text read from standard output. May end mid-line, never mid-character.
    Stdout(String),
    /// Text read from standard error. May end mid-line, never mid-character.
    Stderr(String),
    /// The exit code of the command (yielded last, after all output).
    ExitCode(i32),
}

impl OutputChunk {
    /// Returns the text carried by a stdout/stderr chunk.
    pub fn text(&self) -> Option<&str> {
        match self {
            OutputChunk::Stdout(s) | OutputChunk::Stderr(s) => Some(s),
            OutputChunk::ExitCode(_) => None,
        }
    }
}

/// A stream of output chunks from a command.
///
/// A stream that ends without an [`OutputChunk::ExitCode`] means the command
/// was killed (the channel was terminated or the stream was dropped).
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputChunk> + Send>>;

/// Settings applied to every command a channel runs.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
}

impl From<&RunnerConfig> for ChannelOptions {
    fn from(config: &RunnerConfig) -> Self {
        let mut env: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        Self {
            working_dir: config.working_dir.clone(),
            env,
        }
    }
}

/// Runs commands on one node.
///
/// Channels are shared between the runners of a node, so implementations
/// must allow concurrent commands. A single runner never issues two commands
/// at once.
#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    /// The node this channel is bound to.
    fn node(&self) -> &Node;

    /// Starts a command and streams its output as it is produced.
    async fn exec_stream(&self, cmd: &Command) -> ChannelResult<OutputStream>;

    /// Runs a command to completion, capturing its output.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Timeout` if `cmd.timeout_secs` elapses first
    /// - `ChannelError::Terminated` if the channel is terminated meanwhile
    async fn exec(&self, cmd: &Command) -> ChannelResult<ExecResult> {
        let stream = self.exec_stream(cmd).await?;
        collect_output(stream, cmd.timeout_secs.map(Duration::from_secs)).await
    }

    /// Kills in-flight commands and closes the connection.
    ///
    /// Commands started afterwards fail with `ChannelError::Terminated`.
    /// Idempotent.
    async fn terminate(&self) -> ChannelResult<()>;
}

/// Opens the channel appropriate for `node`: a local shell for local nodes,
/// a persistent SSH connection otherwise.
pub async fn connect(
    node: &Node,
    options: &ChannelOptions,
) -> ChannelResult<Arc<dyn ExecutionChannel>> {
    if node.is_local() {
        Ok(Arc::new(LocalChannel::new(node.clone(), options.clone())))
    } else {
        let channel = SshChannel::new(node.clone(), options.clone());
        channel.open().await?;
        Ok(Arc::new(channel))
    }
}

/// Drains a stream into an [`ExecResult`].
pub async fn collect_output(
    mut stream: OutputStream,
    timeout: Option<Duration>,
) -> ChannelResult<ExecResult> {
    let start = Instant::now();

    let collect = async {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                OutputChunk::Stdout(s) => stdout.push_str(&s),
                OutputChunk::Stderr(s) => stderr.push_str(&s),
                OutputChunk::ExitCode(code) => exit_code = Some(code),
            }
        }
        (stdout, stderr, exit_code)
    };

    let (stdout, stderr, exit_code) = match timeout {
        Some(limit) => tokio::time::timeout(limit, collect).await.map_err(|_| {
            ChannelError::Timeout(format!("Command timed out after {}s", limit.as_secs()))
        })?,
        None => collect.await,
    };

    let exit_code = exit_code.ok_or_else(|| {
        ChannelError::Terminated("command ended without an exit status".to_string())
    })?;

    Ok(ExecResult {
        exit_code,
        stdout,
        stderr,
        duration: start.elapsed(),
    })
}

/// Decodes UTF-8 from reads that may split a multi-byte character.
///
/// An incomplete sequence at the end of a read is held back until the next
/// one. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes as much of `pending + bytes` as forms complete characters.
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Truncated character: wait for the rest.
                        None => {
                            self.pending.drain(..valid);
                            return text;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Decodes whatever is left once the input has ended.
    pub(crate) fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Reads `reader` to the end as a stream of decoded text chunks.
fn decode_stream<R>(
    reader: R,
    wrap: fn(String) -> OutputChunk,
) -> impl Stream<Item = OutputChunk> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let state = (ReaderStream::new(reader), Utf8Decoder::default(), false);
    stream::unfold(state, move |(mut reader, mut decoder, done)| async move {
        if done {
            return None;
        }
        loop {
            match reader.next().await {
                Some(Ok(bytes)) => {
                    let text = decoder.decode(&bytes);
                    if !text.is_empty() {
                        return Some((wrap(text), (reader, decoder, false)));
                    }
                }
                Some(Err(e)) => {
                    warn!("Failed to read command output: {}", e);
                    break;
                }
                None => break,
            }
        }
        let rest = decoder.finish();
        if rest.is_empty() {
            None
        } else {
            Some((wrap(rest), (reader, decoder, true)))
        }
    })
}

/// Spawns `process` and turns its output into an [`OutputStream`].
///
/// The child is killed when the stream is dropped or `cancel` fires.
pub(crate) fn spawn_streaming(
    mut process: tokio::process::Command,
    cancel: CancellationToken,
) -> ChannelResult<OutputStream> {
    process.stdin(Stdio::null());
    process.stdout(Stdio::piped());
    process.stderr(Stdio::piped());
    process.kill_on_drop(true);

    let mut child = process
        .spawn()
        .map_err(|e| ChannelError::ExecFailed(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ChannelError::ExecFailed("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ChannelError::ExecFailed("stderr not captured".to_string()))?;

    let stdout_stream = decode_stream(stdout, OutputChunk::Stdout);
    let stderr_stream = decode_stream(stderr, OutputChunk::Stderr);

    let exit = stream::once(async move {
        match child.wait().await {
            Ok(status) => Some(OutputChunk::ExitCode(status.code().unwrap_or(-1))),
            Err(e) => {
                warn!("Failed to wait for child process: {}", e);
                None
            }
        }
    })
    .filter_map(future::ready);

    let combined = stream::select(stdout_stream, stderr_stream)
        .chain(exit)
        .take_until(cancel.cancelled_owned());

    Ok(Box::pin(combined))
}
