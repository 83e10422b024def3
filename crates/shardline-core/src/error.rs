//! Fabric error types.
//!
//! A single enum covers both sides of the IPC boundary. Every payload is
//! a small `Clone` value so a `FabricResult` can flow through shared
//! in-flight futures and be handed to multiple concurrent callers.

use thiserror::Error;

use crate::envelope::RemoteError;
use crate::partition::ClusterId;

/// Errors surfaced by the supervisor, the child façade, and the IPC
/// fabric between them.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FabricError {
    #[error("cluster {0} already has a live child")]
    ChildExists(ClusterId),

    #[error("cluster {0} has no live child")]
    NoChild(ClusterId),

    #[error("cluster {0} disconnected while waiting for ready")]
    ReadyDisconnected(ClusterId),

    #[error("cluster {0} died while waiting for ready")]
    ReadyDied(ClusterId),

    #[error("cluster {0} did not become ready within {1}ms")]
    ReadyTimeout(ClusterId, u64),

    #[error("broadcast eval timed out after {0}ms")]
    BroadcastEvalTimeout(u64),

    #[error("eval request timed out after {0}ms")]
    EvalRequestTimeout(u64),

    #[error("no target cluster: provide a cluster id, a shard, or an entity id")]
    TargetClusterNotProvided,

    #[error("script refused: {0}")]
    InvalidScript(String),

    #[error("heartbeat ack could not be delivered to cluster {0}")]
    AckDeliveryFailed(ClusterId),

    #[error("spawn queue advances automatically; explicit advance is only valid in manual mode")]
    QueueAuto,

    #[error("CLUSTER_MANAGER_MODE is missing or not one of \"process\"/\"worker\"")]
    BootstrapMode,

    #[error("bad bootstrap value for {key}: {value:?}")]
    Bootstrap { key: String, value: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("request timed out")]
    TimedOut,

    #[error("{0}")]
    Remote(RemoteError),
}

impl FabricError {
    /// Stable kind name, used as the `name` of a wire-level error reply.
    pub fn kind(&self) -> &'static str {
        match self {
            FabricError::ChildExists(_) => "ChildExists",
            FabricError::NoChild(_) => "NoChild",
            FabricError::ReadyDisconnected(_) => "ReadyDisconnected",
            FabricError::ReadyDied(_) => "ReadyDied",
            FabricError::ReadyTimeout(..) => "ReadyTimeout",
            FabricError::BroadcastEvalTimeout(_) => "BroadcastEvalTimeout",
            FabricError::EvalRequestTimeout(_) => "EvalRequestTimeout",
            FabricError::TargetClusterNotProvided => "TargetClusterNotProvided",
            FabricError::InvalidScript(_) => "InvalidScript",
            FabricError::AckDeliveryFailed(_) => "AckDeliveryFailed",
            FabricError::QueueAuto => "QueueAuto",
            FabricError::BootstrapMode => "BootstrapMode",
            FabricError::Bootstrap { .. } => "Bootstrap",
            FabricError::Send(_) => "SendError",
            FabricError::TimedOut => "TimedOut",
            FabricError::Remote(_) => "RemoteError",
        }
    }

    /// Render as the wire-level error shape. A wrapped remote error
    /// passes through unchanged.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            FabricError::Remote(err) => err.clone(),
            other => RemoteError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<RemoteError> for FabricError {
    fn from(err: RemoteError) -> Self {
        FabricError::Remote(err)
    }
}

pub type FabricResult<T> = Result<T, FabricError>;
