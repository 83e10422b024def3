//! Worker transport: an isolated in-process task with shared-nothing
//! message passing.
//!
//! The worker receives its identity as structured data instead of
//! environment variables, plus a channel pair mirroring the process
//! pipes. Killing a worker aborts its task; an entry error becomes the
//! exit notice message.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use shardline_core::config::Bootstrap;
use shardline_core::error::{FabricError, FabricResult};

use crate::transport::{ChildLink, ExitNotice, LinkEvents, ParentLink};

const FRAME_BUFFER: usize = 64;

/// Entry point of a worker child. The worker runs until its future
/// completes or it is killed.
pub type WorkerEntry =
    Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Everything a worker child is handed at startup.
pub struct WorkerContext {
    pub bootstrap: Bootstrap,
    /// Frames from the manager, FIFO.
    pub inbox: mpsc::Receiver<Value>,
    /// Frames to the manager.
    pub outbox: mpsc::Sender<Value>,
}

/// Manager end of a worker child.
pub struct WorkerLink {
    tx: mpsc::Sender<Value>,
    abort: AbortHandle,
}

impl WorkerLink {
    /// Start `entry` as an isolated task wired to a fresh channel pair.
    pub fn spawn(entry: &WorkerEntry, bootstrap: Bootstrap) -> (Arc<Self>, LinkEvents) {
        let (to_child, inbox) = mpsc::channel(FRAME_BUFFER);
        let (outbox, frames) = mpsc::channel(FRAME_BUFFER);
        let (exit_tx, exit) = oneshot::channel();

        let context = WorkerContext {
            bootstrap,
            inbox,
            outbox,
        };
        let task = tokio::spawn(entry(context));
        let abort = task.abort_handle();

        tokio::spawn(async move {
            let notice = match task.await {
                Ok(Ok(())) => ExitNotice {
                    code: Some(0),
                    message: None,
                },
                Ok(Err(err)) => ExitNotice {
                    code: Some(1),
                    message: Some(err.to_string()),
                },
                Err(join_err) if join_err.is_cancelled() => ExitNotice {
                    code: None,
                    message: Some("worker killed".to_string()),
                },
                Err(join_err) => ExitNotice {
                    code: None,
                    message: Some(join_err.to_string()),
                },
            };
            let _ = exit_tx.send(notice);
        });

        let link = Arc::new(Self {
            tx: to_child,
            abort,
        });
        (link, LinkEvents { frames, exit })
    }
}

#[async_trait]
impl ChildLink for WorkerLink {
    async fn send(&self, frame: Value) -> FabricResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| FabricError::Send("worker inbox closed".to_string()))
    }

    fn kill(&self) {
        self.abort.abort();
    }
}

/// Child end of a worker link.
pub struct WorkerParent {
    tx: mpsc::Sender<Value>,
}

impl WorkerParent {
    pub fn new(outbox: mpsc::Sender<Value>) -> Arc<Self> {
        Arc::new(Self { tx: outbox })
    }
}

#[async_trait]
impl ParentLink for WorkerParent {
    async fn send(&self, frame: Value) -> FabricResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| FabricError::Send("manager inbox closed".to_string()))
    }
}
