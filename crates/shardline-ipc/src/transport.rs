//! Transport contract shared by the process and worker variants.
//!
//! A transport delivers whole frames in FIFO order per direction and
//! never reorders or silently drops them. When the peer dies or the
//! channel fails, the exit notice fires exactly once.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use shardline_core::error::FabricResult;

/// Delivered exactly once when the child is gone.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitNotice {
    /// Process exit code, when one exists.
    pub code: Option<i32>,
    /// Human-readable cause (worker entry error, kill, join failure).
    pub message: Option<String>,
}

/// The receiving half of a spawned child link.
pub struct LinkEvents {
    /// Inbound frames from the child, FIFO.
    pub frames: mpsc::Receiver<Value>,
    /// Fires once when the child exits or is killed.
    pub exit: oneshot::Receiver<ExitNotice>,
}

/// Manager-side handle to one child.
#[async_trait]
pub trait ChildLink: Send + Sync {
    /// Queue a frame for delivery. Resolution means the transport
    /// accepted the write, not that peer code observed it.
    async fn send(&self, frame: Value) -> FabricResult<()>;

    /// Terminate the child. Idempotent; the exit notice still fires
    /// exactly once.
    fn kill(&self);
}

/// Child-side handle to the parent.
#[async_trait]
pub trait ParentLink: Send + Sync {
    async fn send(&self, frame: Value) -> FabricResult<()>;
}
