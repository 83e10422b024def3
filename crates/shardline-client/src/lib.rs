//! Child-side façade for the shardline fabric.
//!
//! A cluster child constructs a [`ClusterClient`] — from the process
//! environment in process mode, or from its [`WorkerContext`] in
//! worker mode — wires its application lifecycle into it, and uses the
//! same request surface the manager exposes: broadcast eval, client
//! value fetches, manager eval, cross-cluster eval, and custom
//! requests.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use shardline_client::ClusterClient;
//! use shardline_core::CommandHost;
//!
//! # async fn run() -> shardline_core::FabricResult<()> {
//! let host = Arc::new(CommandHost::new());
//! host.register_fn("shard-count", |_| Ok(json!(2)));
//!
//! let client = ClusterClient::from_env(host)?;
//! client.publish_state(json!({"stats": {"connected": true}}));
//! client.notify_ready().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod heartbeat;

pub use client::{BroadcastOptions, ClusterClient, ClusterEvalOptions, RespawnAllOptions};
pub use shardline_ipc::worker::WorkerContext;
