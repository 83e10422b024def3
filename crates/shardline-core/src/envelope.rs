//! Wire envelope for the IPC fabric.
//!
//! Frames are JSON values. Control envelopes carry an `op` tag with the
//! discriminator string plus the fields of that operation; a frame that
//! does not decode as a control envelope is an application message and
//! is surfaced to the host unchanged.
//!
//! Reply envelopes echo the request nonce when one was supplied; error
//! replies carry `_error: {name, message, stack}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FabricError, FabricResult};
use crate::partition::ClusterId;

/// A control message exchanged between the manager and a cluster child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Correlation id; echoed on replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
}

/// The closed set of control operations.
///
/// The serialized tag values are the wire-level discriminators and must
/// not change; peers match on them byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op")]
pub enum Payload {
    /// Child's embedded client is connected and serving its shards.
    #[serde(rename = "_ready")]
    Ready,

    /// Child's embedded client lost its upstream connection.
    #[serde(rename = "_disconnect")]
    Disconnect,

    /// Child's embedded client is re-establishing its upstream connection.
    #[serde(rename = "_reconnecting")]
    Reconnecting,

    /// Liveness beat, child → manager. `last` is the sender's epoch millis.
    #[serde(rename = "_keepAlive")]
    KeepAlive { last: u64 },

    /// Beat acknowledgement, manager → child.
    #[serde(rename = "ack")]
    Ack { last: u64 },

    /// Child asks the manager to fetch a client value on every cluster
    /// (or on the cluster owning `_sFetchPropShard`).
    #[serde(rename = "_sFetchProp")]
    FetchPropBroadcast {
        prop: String,
        #[serde(
            rename = "_sFetchPropShard",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        shard: Option<u32>,
    },

    /// Child asks the manager to evaluate a script on every cluster
    /// (or on the cluster owning `_sEvalShard`).
    #[serde(rename = "_sEval")]
    EvalBroadcast {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
        #[serde(
            rename = "_sEvalShard",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        shard: Option<u32>,
        #[serde(
            rename = "_sEvalTimeout",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        timeout: Option<u64>,
    },

    /// Child asks the manager to evaluate a script on the manager itself.
    #[serde(rename = "_sManagerEval")]
    ManagerEval {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },

    /// Child asks the manager to route an eval to a single target cluster.
    #[serde(rename = "_sClusterEval")]
    ClusterEval {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cluster: Option<ClusterId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shard: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },

    /// Manager → target cluster: evaluate and reply under the same nonce.
    #[serde(rename = "_sClusterEvalRequest")]
    ClusterEvalRequest {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },

    /// Target cluster's reply; routed back to the originating cluster.
    #[serde(rename = "_sClusterEvalResponse")]
    ClusterEvalResponse {
        #[serde(rename = "_result", default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(rename = "_error", default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },

    /// Manager's reply to a `_sManagerEval`.
    #[serde(rename = "_sManagerEvalResponse")]
    ManagerEvalResponse {
        #[serde(rename = "_result", default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(rename = "_error", default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },

    /// Child asks the manager to respawn every cluster.
    #[serde(rename = "_sRespawnAll")]
    RespawnAll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cluster_delay: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respawn_delay: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },

    /// Child asks the manager to advance a manual spawn queue.
    #[serde(rename = "_spawnNextCluster")]
    SpawnNextCluster,

    /// Application-defined request/reply, relayed opaquely.
    #[serde(rename = "_sCustom")]
    Custom {
        #[serde(rename = "_sRequest", default, skip_serializing_if = "is_false")]
        request: bool,
        #[serde(rename = "_sReply", default, skip_serializing_if = "is_false")]
        reply: bool,
        #[serde(default)]
        payload: Value,
    },

    /// Manager → child: resolve a dotted path against the embedded client.
    #[serde(rename = "_fetchProp")]
    FetchProp { prop: String },

    /// Manager → child: evaluate a script in the embedded client's context.
    #[serde(rename = "_eval")]
    Eval {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },

    /// Generic reply carrying a result or an error under the request nonce.
    #[serde(rename = "_reply")]
    Reply {
        #[serde(rename = "_result", default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(rename = "_error", default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            nonce: None,
            payload,
        }
    }

    pub fn with_nonce(nonce: impl Into<String>, payload: Payload) -> Self {
        Self {
            nonce: Some(nonce.into()),
            payload,
        }
    }

    /// A `_reply` envelope resolving `nonce` with a value.
    pub fn reply_ok(nonce: Option<String>, result: Value) -> Self {
        Self {
            nonce,
            payload: Payload::Reply {
                result: Some(result),
                error: None,
            },
        }
    }

    /// A `_reply` envelope rejecting `nonce` with an error.
    pub fn reply_err(nonce: Option<String>, error: RemoteError) -> Self {
        Self {
            nonce,
            payload: Payload::Reply {
                result: None,
                error: Some(error),
            },
        }
    }

    /// Serialize to a wire frame.
    pub fn encode(&self) -> FabricResult<Value> {
        serde_json::to_value(self).map_err(|e| FabricError::Send(e.to_string()))
    }

    /// Decode a frame. `None` means the frame is an application message,
    /// not a control envelope.
    pub fn decode(frame: &Value) -> Option<Self> {
        serde_json::from_value(frame.clone()).ok()
    }
}

/// Wire shape of an error raised on the remote side of a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The error a script host reports for an operation outside its
    /// whitelist.
    pub fn invalid_script(op: &str) -> Self {
        Self::new("InvalidScript", format!("unknown operation {op:?}"))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {}
