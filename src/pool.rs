//! One execution channel per node, and concurrent work across nodes.
//!
//! A [`NodePool`] owns the channels of a session. [`NodePool::execute`] runs
//! a unit of work once per node, concurrently, each unit bound to its node's
//! channel, and waits for every unit to finish:
//!
//! ```text
//!              execute(work)
//!                   │
//!      ┌────────────┼────────────┐
//!      ▼            ▼            ▼
//!  work(mac-1)  work(mac-2)  work(mac-3)     (scoped tasks)
//!      │            │            │
//!      └────────────┼────────────┘
//!                   ▼
//!          first error, if any
//! ```
//!
//! A failing unit does not cancel its siblings. Stopping the others is the
//! caller's job, usually by calling [`NodePool::terminate`] from another
//! task, which closes every channel and makes in-flight commands fail.

use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use futures::future::join_all;
use tracing::{debug, error, warn};

use crate::channel::{self, ChannelOptions, ExecutionChannel};
use crate::fleet::Fleet;

/// The channels of one session, one per node.
#[derive(Clone)]
pub struct NodePool {
    channels: Vec<Arc<dyn ExecutionChannel>>,
}

impl NodePool {
    /// Opens a channel to every node of `fleet` concurrently.
    ///
    /// If any node cannot be reached, the channels that did open are closed
    /// again and the first connection error is returned.
    pub async fn connect(fleet: &Fleet, options: &ChannelOptions) -> anyhow::Result<Self> {
        let attempts = join_all(fleet.nodes().iter().map(|node| async move {
            channel::connect(node, options)
                .await
                .with_context(|| format!("Failed to connect to node {} ({})", node.name, node.address))
        }))
        .await;

        let mut channels = Vec::new();
        let mut first_error = None;
        for attempt in attempts {
            match attempt {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    error!("{:#}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let pool = Self::from_channels(channels);
        if let Some(e) = first_error {
            pool.terminate().await;
            return Err(e);
        }

        debug!("Connected to {} nodes", pool.channels.len());
        Ok(pool)
    }

    /// Wraps channels that are already open.
    pub fn from_channels(channels: Vec<Arc<dyn ExecutionChannel>>) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> &[Arc<dyn ExecutionChannel>] {
        &self.channels
    }

    /// Runs `work` once per node, concurrently, and waits for all of them.
    ///
    /// Requires the multi-threaded runtime: the units run as scoped tasks so
    /// `work` may borrow from the caller.
    ///
    /// # Errors
    ///
    /// The first error a unit returned, with the node name attached. Units
    /// on other nodes still run to completion.
    pub async fn execute<F, Fut>(&self, work: F) -> anyhow::Result<()>
    where
        F: Fn(Arc<dyn ExecutionChannel>) -> Fut + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

        tokio_scoped::scope(|scope| {
            for channel in &self.channels {
                let work = &work;
                let first_error = &first_error;
                let channel = channel.clone();

                scope.spawn(async move {
                    let node = channel.node().name.clone();
                    if let Err(e) = work(channel).await {
                        warn!(node = %node, "Node work failed: {:#}", e);
                        let mut slot = first_error.lock().unwrap_or_else(|e| e.into_inner());
                        slot.get_or_insert(e.context(format!("Node {} failed", node)));
                    }
                });
            }
        });

        match first_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Closes every channel. In-flight commands fail with
    /// [`ChannelError::Terminated`](crate::channel::ChannelError::Terminated).
    ///
    /// Errors are logged; every channel is attempted.
    pub async fn terminate(&self) {
        let closing = self.channels.iter().map(|channel| async move {
            if let Err(e) = channel.terminate().await {
                warn!(node = %channel.node().name, "Failed to close channel: {}", e);
            }
        });
        join_all(closing).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::channel::Command;
    use crate::channel::scripted::{ScriptedChannel, Step};
    use crate::fleet::Node;

    fn pool(names: &[&str]) -> NodePool {
        let channels = names
            .iter()
            .map(|name| {
                Arc::new(ScriptedChannel::new(Node::local(*name, 1), |_| vec![Step::Exit(0)]))
                    as Arc<dyn ExecutionChannel>
            })
            .collect();
        NodePool::from_channels(channels)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_runs_once_per_node() {
        let pool = pool(&["mac-1", "mac-2", "mac-3"]);
        let seen = Mutex::new(Vec::new());
        let seen_ref = &seen;

        pool.execute(move |channel| {
            let seen = seen_ref;
            async move {
                channel.exec(&Command::new("true")).await?;
                seen.lock().unwrap().push(channel.node().name.clone());
                Ok(())
            }
        })
        .await
        .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec!["mac-1", "mac-2", "mac-3"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_surfaces_first_error_and_finishes_siblings() {
        let pool = pool(&["good", "bad"]);
        let finished = AtomicUsize::new(0);
        let finished_ref = &finished;

        let err = pool
            .execute(move |channel| {
                let finished = finished_ref;
                async move {
                    if channel.node().name == "bad" {
                        anyhow::bail!("runner exploded");
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Node bad failed"));
        assert!(format!("{:#}", err).contains("runner exploded"));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminate_closes_every_channel() {
        let pool = pool(&["mac-1", "mac-2"]);
        pool.terminate().await;

        for channel in pool.channels() {
            assert!(channel.exec(&Command::new("true")).await.is_err());
        }
    }
}
