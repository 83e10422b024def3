//! Manager-side supervisor for the shardline fabric.
//!
//! A [`ClusterManager`] partitions upstream shards across N clusters,
//! spawns each as a child process or an isolated worker, supervises
//! them via heartbeats with a per-cluster restart budget, and mediates
//! the request fabric between them.

pub mod cluster;
mod heartbeat;
pub mod manager;
pub mod queue;

pub use cluster::Cluster;
pub use manager::{
    BroadcastOptions, ClusterEvalOptions, ClusterManager, ManagerOptions, RespawnOptions,
    SERVICE_TOKEN,
};
pub use queue::SpawnQueue;
