//! Spawn queue — serializes cluster spawns.
//!
//! Clusters are spawned one at a time. In `auto` mode the queue
//! advances by itself after the inter-spawn delay; in `manual` mode it
//! waits for an explicit advance from a child or the host.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use shardline_core::config::QueueMode;
use shardline_core::error::{FabricError, FabricResult};

use crate::cluster::Cluster;

pub struct SpawnQueue {
    mode: QueueMode,
    /// Inter-spawn delay in auto mode.
    delay: Duration,
    /// Ready-wait bound handed to each queued spawn. `None` returns
    /// from each spawn immediately.
    spawn_timeout: Option<Duration>,
    queue: Mutex<VecDeque<Arc<Cluster>>>,
    advance: Notify,
}

impl SpawnQueue {
    pub fn new(mode: QueueMode, delay: Duration, spawn_timeout: Option<Duration>) -> Self {
        Self {
            mode,
            delay,
            spawn_timeout,
            queue: Mutex::new(VecDeque::new()),
            advance: Notify::new(),
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Append a cluster to the back of the queue.
    pub fn enqueue(&self, cluster: Arc<Cluster>) {
        self.lock().push_back(cluster);
    }

    /// Drive the queue in a background task until it drains.
    pub fn start(self: &Arc<Self>) {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                let next = queue.lock().pop_front();
                let Some(cluster) = next else {
                    break;
                };

                if let Err(e) = cluster.spawn(queue.spawn_timeout).await {
                    warn!(cluster = cluster.id(), error = %e, "queued spawn failed");
                }

                if queue.lock().is_empty() {
                    break;
                }
                match queue.mode {
                    QueueMode::Auto => tokio::time::sleep(queue.delay).await,
                    QueueMode::Manual => queue.advance.notified().await,
                }
            }
            debug!("spawn queue drained");
        });
    }

    /// Advance a manual queue to the next cluster.
    ///
    /// Calling this on an auto queue is an error: auto queues advance
    /// themselves.
    pub fn next(&self) -> FabricResult<()> {
        match self.mode {
            QueueMode::Auto => Err(FabricError::QueueAuto),
            QueueMode::Manual => {
                self.advance.notify_one();
                Ok(())
            }
        }
    }

    /// Clusters still waiting to spawn.
    pub fn remaining(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Cluster>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}
