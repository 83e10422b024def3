//! Public configuration and child bootstrap.
//!
//! Process-mode children receive their identity through environment
//! variables; worker-mode children receive the same fields as a
//! structured `Bootstrap` value. Both sides round-trip through the
//! accessors here.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, FabricResult};
use crate::partition::{ClusterId, ShardId};

pub const ENV_MODE: &str = "CLUSTER_MANAGER_MODE";
pub const ENV_CLUSTER: &str = "CLUSTER";
pub const ENV_CLUSTER_COUNT: &str = "CLUSTER_COUNT";
pub const ENV_SHARD_LIST: &str = "SHARD_LIST";
pub const ENV_TOTAL_SHARDS: &str = "TOTAL_SHARDS";
pub const ENV_KEEP_ALIVE_INTERVAL: &str = "KEEP_ALIVE_INTERVAL";
pub const ENV_QUEUE_MODE: &str = "CLUSTER_QUEUE_MODE";

/// How children are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Forked OS process, frames over the parent-child pipe.
    Process,
    /// Isolated in-process worker, frames over channels.
    Worker,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Process => "process",
            Mode::Worker => "worker",
        }
    }
}

/// How the spawn queue advances between clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Advance automatically after the inter-spawn delay.
    Auto,
    /// Advance only on an explicit request from a child or the host.
    Manual,
}

impl QueueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueMode::Auto => "auto",
            QueueMode::Manual => "manual",
        }
    }
}

/// Heartbeat policy. `None` at the manager level disables heartbeats
/// entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// Beat period in milliseconds.
    pub interval: u64,
    /// Missed beats tolerated before the watchdog respawns the cluster.
    pub max_missed_heartbeats: u32,
    /// Heartbeat-driven respawns allowed per cluster per hour.
    pub max_cluster_restarts: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: 5_000,
            max_missed_heartbeats: 5,
            max_cluster_restarts: 3,
        }
    }
}

/// Options forwarded to the process transport at spawn time.
///
/// Only options with an OS-process counterpart are carried; `cluster_data`
/// overrides the computed child environment wholesale when set.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Override for the executable to run instead of the configured file.
    pub exec_path: Option<PathBuf>,
    #[cfg(unix)]
    pub uid: Option<u32>,
    #[cfg(unix)]
    pub gid: Option<u32>,
    /// Suppress the child's stderr instead of inheriting it.
    pub silent: bool,
    /// Replacement for the computed bootstrap environment.
    pub cluster_data: Option<HashMap<String, String>>,
}

/// The identity a child receives at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub mode: Mode,
    pub id: ClusterId,
    /// Total number of clusters.
    pub count: u32,
    /// Shards owned by this cluster, in order. Never empty.
    pub shard_list: Vec<ShardId>,
    pub total_shards: u32,
    /// Beat period in milliseconds; `0` disables the heartbeat.
    pub keep_alive_interval: u64,
    pub queue_mode: QueueMode,
    /// Application-defined variables. Populated for worker-mode children;
    /// process-mode children read their real environment instead.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Bootstrap {
    /// Read the bootstrap from the process environment.
    ///
    /// Fails fast when `CLUSTER_MANAGER_MODE` is absent or invalid.
    pub fn from_env() -> FabricResult<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Read the bootstrap from an arbitrary variable source.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> FabricResult<Self> {
        let mode = match lookup(ENV_MODE).as_deref() {
            Some("process") => Mode::Process,
            Some("worker") => Mode::Worker,
            _ => return Err(FabricError::BootstrapMode),
        };

        let id = parse_var(&lookup, ENV_CLUSTER)?;
        let count = parse_var(&lookup, ENV_CLUSTER_COUNT)?;
        let total_shards = parse_var(&lookup, ENV_TOTAL_SHARDS)?;

        let raw_shards = lookup(ENV_SHARD_LIST).unwrap_or_default();
        let shard_list = parse_shard_list(&raw_shards)?;

        let keep_alive_interval = match lookup(ENV_KEEP_ALIVE_INTERVAL) {
            Some(raw) => raw.parse().map_err(|_| FabricError::Bootstrap {
                key: ENV_KEEP_ALIVE_INTERVAL.to_string(),
                value: raw,
            })?,
            None => 0,
        };

        let queue_mode = match lookup(ENV_QUEUE_MODE).as_deref() {
            Some("manual") => QueueMode::Manual,
            _ => QueueMode::Auto,
        };

        Ok(Self {
            mode,
            id,
            count,
            shard_list,
            total_shards,
            keep_alive_interval,
            queue_mode,
            env: HashMap::new(),
        })
    }

    /// Render the bootstrap as environment pairs for a process child.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let shard_list = self
            .shard_list
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        vec![
            (ENV_MODE.to_string(), self.mode.as_str().to_string()),
            (ENV_CLUSTER.to_string(), self.id.to_string()),
            (ENV_CLUSTER_COUNT.to_string(), self.count.to_string()),
            (ENV_SHARD_LIST.to_string(), shard_list),
            (ENV_TOTAL_SHARDS.to_string(), self.total_shards.to_string()),
            (
                ENV_KEEP_ALIVE_INTERVAL.to_string(),
                self.keep_alive_interval.to_string(),
            ),
            (
                ENV_QUEUE_MODE.to_string(),
                self.queue_mode.as_str().to_string(),
            ),
        ]
    }

    pub fn first_shard_id(&self) -> ShardId {
        self.shard_list.first().copied().unwrap_or(0)
    }

    pub fn last_shard_id(&self) -> ShardId {
        self.shard_list.last().copied().unwrap_or(0)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> FabricResult<T> {
    let raw = lookup(key).ok_or_else(|| FabricError::Bootstrap {
        key: key.to_string(),
        value: "<missing>".to_string(),
    })?;
    raw.parse().map_err(|_| FabricError::Bootstrap {
        key: key.to_string(),
        value: raw,
    })
}

fn parse_shard_list(raw: &str) -> FabricResult<Vec<ShardId>> {
    let list: Vec<ShardId> = raw
        .split(',')
        .filter(|piece| !piece.is_empty())
        .map(|piece| {
            piece.trim().parse().map_err(|_| FabricError::Bootstrap {
                key: ENV_SHARD_LIST.to_string(),
                value: raw.to_string(),
            })
        })
        .collect::<FabricResult<_>>()?;
    if list.is_empty() {
        return Err(FabricError::Bootstrap {
            key: ENV_SHARD_LIST.to_string(),
            value: raw.to_string(),
        });
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full_vars() -> HashMap<String, String> {
        vars(&[
            (ENV_MODE, "process"),
            (ENV_CLUSTER, "2"),
            (ENV_CLUSTER_COUNT, "4"),
            (ENV_SHARD_LIST, "4,5,6"),
            (ENV_TOTAL_SHARDS, "12"),
            (ENV_KEEP_ALIVE_INTERVAL, "5000"),
            (ENV_QUEUE_MODE, "manual"),
        ])
    }

    #[test]
    fn from_vars_parses_everything() {
        let env = full_vars();
        let bootstrap = Bootstrap::from_vars(|k| env.get(k).cloned()).unwrap();

        assert_eq!(bootstrap.mode, Mode::Process);
        assert_eq!(bootstrap.id, 2);
        assert_eq!(bootstrap.count, 4);
        assert_eq!(bootstrap.shard_list, vec![4, 5, 6]);
        assert_eq!(bootstrap.total_shards, 12);
        assert_eq!(bootstrap.keep_alive_interval, 5000);
        assert_eq!(bootstrap.queue_mode, QueueMode::Manual);
    }

    #[test]
    fn missing_mode_fails_fast() {
        let mut env = full_vars();
        env.remove(ENV_MODE);
        let err = Bootstrap::from_vars(|k| env.get(k).cloned()).unwrap_err();
        assert_eq!(err, FabricError::BootstrapMode);
    }

    #[test]
    fn bad_mode_fails_fast() {
        let mut env = full_vars();
        env.insert(ENV_MODE.to_string(), "thread".to_string());
        let err = Bootstrap::from_vars(|k| env.get(k).cloned()).unwrap_err();
        assert_eq!(err, FabricError::BootstrapMode);
    }

    #[test]
    fn empty_shard_list_rejected() {
        let mut env = full_vars();
        env.insert(ENV_SHARD_LIST.to_string(), String::new());
        assert!(Bootstrap::from_vars(|k| env.get(k).cloned()).is_err());
    }

    #[test]
    fn keep_alive_defaults_to_disabled() {
        let mut env = full_vars();
        env.remove(ENV_KEEP_ALIVE_INTERVAL);
        let bootstrap = Bootstrap::from_vars(|k| env.get(k).cloned()).unwrap();
        assert_eq!(bootstrap.keep_alive_interval, 0);
    }

    #[test]
    fn env_roundtrip() {
        let env = full_vars();
        let bootstrap = Bootstrap::from_vars(|k| env.get(k).cloned()).unwrap();

        let rendered: HashMap<String, String> = bootstrap.to_env().into_iter().collect();
        let again = Bootstrap::from_vars(|k| rendered.get(k).cloned()).unwrap();
        assert_eq!(bootstrap, again);
    }

    #[test]
    fn first_and_last_shard_ids() {
        let env = full_vars();
        let bootstrap = Bootstrap::from_vars(|k| env.get(k).cloned()).unwrap();
        assert_eq!(bootstrap.first_shard_id(), 4);
        assert_eq!(bootstrap.last_shard_id(), 6);
    }

    #[test]
    fn keep_alive_config_defaults() {
        let config = KeepAliveConfig::default();
        assert_eq!(config.interval, 5_000);
        assert_eq!(config.max_missed_heartbeats, 5);
        assert_eq!(config.max_cluster_restarts, 3);
    }
}
