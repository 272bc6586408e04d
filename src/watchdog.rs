//! Output-idle watchdog and runner recovery.
//!
//! A [`Watchdog`] schedules a callback after a period of silence. Every call
//! to [`reset`](Watchdog::reset) cancels the pending callback and schedules a
//! new one, so the callback only runs once the supervised command has
//! produced no output for the whole window.
//!
//! When a runner stalls, its target (usually a simulator) is shut down and
//! booted again by a [`RunnerRecovery`]. The default implementation,
//! [`CommandRecovery`], runs the `shutdown_command` and `boot_command`
//! templates from the `[runner]` configuration section.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{CommandTemplate, ExecutionChannel};
use crate::config::RunnerConfig;
use crate::fleet::Runner;

/// Handle to a scheduled callback. Dropping it cancels the callback.
#[derive(Debug)]
pub struct WatchdogHandle {
    cancel: CancellationToken,
}

impl WatchdogHandle {
    /// Prevents the callback from running, if it has not run yet.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs `on_fire` after `after`, unless the returned handle is cancelled or
/// dropped first.
///
/// Must be called from within a tokio runtime.
pub fn schedule<F>(after: Duration, on_fire: F) -> WatchdogHandle
where
    F: FnOnce() + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(after) => on_fire(),
        }
    });
    WatchdogHandle { cancel }
}

type FireCallback = Arc<dyn Fn() + Send + Sync>;

/// Re-armable idle timer.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use fleetrun::watchdog::Watchdog;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut watchdog = Watchdog::new(Duration::from_secs(300), || {
///     eprintln!("no output for five minutes");
/// });
/// watchdog.arm();
/// // ... on every chunk of output:
/// watchdog.reset();
/// // ... once the command returns:
/// watchdog.disarm();
/// # }
/// ```
pub struct Watchdog {
    timeout: Duration,
    on_fire: FireCallback,
    fired: Arc<AtomicUsize>,
    current: Option<WatchdogHandle>,
}

impl Watchdog {
    pub fn new(timeout: Duration, on_fire: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            timeout,
            on_fire: Arc::new(on_fire),
            fired: Arc::new(AtomicUsize::new(0)),
            current: None,
        }
    }

    /// Schedules the callback, replacing any pending one.
    pub fn arm(&mut self) {
        let on_fire = self.on_fire.clone();
        let fired = self.fired.clone();
        // Assigning drops, and so cancels, the previous handle.
        self.current = Some(schedule(self.timeout, move || {
            fired.fetch_add(1, Ordering::SeqCst);
            on_fire();
        }));
    }

    /// Restarts the idle window. Same as [`arm`](Self::arm).
    pub fn reset(&mut self) {
        self.arm();
    }

    /// Cancels the pending callback.
    pub fn disarm(&mut self) {
        self.current = None;
    }

    /// How many times the callback has run.
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Brings a stalled or broken runner back to a usable state.
#[async_trait]
pub trait RunnerRecovery: Send + Sync {
    /// Recovers `runner` using `channel`, which is bound to the runner's node.
    async fn recover(&self, channel: &dyn ExecutionChannel, runner: &Runner) -> anyhow::Result<()>;
}

/// Recovery that does nothing. Used when no shutdown/boot commands are
/// configured.
pub struct NoRecovery;

#[async_trait]
impl RunnerRecovery for NoRecovery {
    async fn recover(&self, _channel: &dyn ExecutionChannel, runner: &Runner) -> anyhow::Result<()> {
        debug!(runner = %runner.id, "No recovery commands configured");
        Ok(())
    }
}

/// Shuts the runner's target down and boots it again with configured
/// command templates.
///
/// Templates may use `{runner_id}` and `{runner_name}`.
pub struct CommandRecovery {
    shutdown: Option<CommandTemplate>,
    boot: Option<CommandTemplate>,
    timeout_secs: u64,
}

impl CommandRecovery {
    pub fn new(shutdown: Option<CommandTemplate>, boot: Option<CommandTemplate>) -> Self {
        Self {
            shutdown,
            boot,
            timeout_secs: 120,
        }
    }

    /// Builds the recovery from the `[runner]` section.
    ///
    /// Returns [`NoRecovery`] when neither command is configured.
    pub fn from_config(config: &RunnerConfig) -> anyhow::Result<Arc<dyn RunnerRecovery>> {
        let shutdown = config
            .shutdown_command
            .as_deref()
            .map(CommandTemplate::parse)
            .transpose()?;
        let boot = config
            .boot_command
            .as_deref()
            .map(CommandTemplate::parse)
            .transpose()?;

        if shutdown.is_none() && boot.is_none() {
            return Ok(Arc::new(NoRecovery));
        }
        Ok(Arc::new(Self::new(shutdown, boot)))
    }
}

#[async_trait]
impl RunnerRecovery for CommandRecovery {
    async fn recover(&self, channel: &dyn ExecutionChannel, runner: &Runner) -> anyhow::Result<()> {
        let vars = [("runner_id", runner.id.as_str()), ("runner_name", runner.name.as_str())];

        if let Some(shutdown) = &self.shutdown {
            let cmd = shutdown.render(&vars).timeout(self.timeout_secs);
            // Shutting down an already stopped target fails; that is fine.
            match channel.exec(&cmd).await {
                Ok(result) if !result.success() => debug!(
                    runner = %runner.id,
                    "Shutdown exited with {}: {}",
                    result.exit_code,
                    result.combined_output().trim()
                ),
                Ok(_) => {}
                Err(e) => warn!(runner = %runner.id, "Shutdown failed: {}", e),
            }
        }

        if let Some(boot) = &self.boot {
            let cmd = boot.render(&vars).timeout(self.timeout_secs);
            let result = channel.exec(&cmd).await?;
            if !result.success() {
                anyhow::bail!(
                    "Boot of runner {} exited with {}: {}",
                    runner.id,
                    result.exit_code,
                    result.combined_output().trim()
                );
            }
        }

        info!(runner = %runner.id, node = %channel.node().name, "Runner recovered");
        Ok(())
    }
}
