//! Core types for the shardline fabric.
//!
//! Everything both sides of the IPC boundary agree on lives here: the
//! wire envelope and its discriminators, the shard partition math, the
//! fabric error enum, the closed event surface, the pluggable script
//! host, and the configuration/bootstrap types.

pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod partition;
pub mod script;

pub use config::{Bootstrap, KeepAliveConfig, Mode, QueueMode, SpawnOptions};
pub use envelope::{Envelope, Payload, RemoteError};
pub use error::{FabricError, FabricResult};
pub use event::{Event, EventBus, EventKind, HandlerId};
pub use partition::{ClusterId, ShardId};
pub use script::{CommandHost, ScriptHost};
