//! The cluster manager.
//!
//! Owns the cluster set and the spawn queue, computes the shard
//! partition, and mediates the request fabric: broadcast fan-out with
//! aggregated replies, manager-local eval, and cross-cluster eval
//! routing with origin tagging.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::info;

use shardline_core::config::{KeepAliveConfig, Mode, QueueMode, SpawnOptions};
use shardline_core::envelope::{Envelope, Payload, RemoteError};
use shardline_core::error::{FabricError, FabricResult};
use shardline_core::event::{Event, EventBus, EventKind, HandlerId};
use shardline_core::partition::{
    cluster_for_shard, partition_shards, shard_for_entity, ClusterId, ShardId,
};
use shardline_core::script::ScriptHost;
use shardline_ipc::registry::{await_reply, generate_nonce, NonceRegistry, RegisterOptions};
use shardline_ipc::worker::WorkerEntry;

use crate::cluster::{Cluster, DEFAULT_TIMEOUT_MS};
use crate::queue::SpawnQueue;

/// Environment variable carrying the upstream credential to children.
pub const SERVICE_TOKEN: &str = "SERVICE_TOKEN";

/// Extra wait the manager-side waiter allows beyond the per-cluster
/// eval bound during a broadcast.
const BROADCAST_GRACE_MS: u64 = 100;

/// Construction-time knobs for [`ClusterManager`].
pub struct ManagerOptions {
    pub(crate) mode: Mode,
    pub(crate) file: Option<PathBuf>,
    pub(crate) worker_entry: Option<WorkerEntry>,
    pub(crate) total_shards: u32,
    pub(crate) total_clusters: u32,
    pub(crate) shard_lists: Option<Vec<Vec<ShardId>>>,
    pub(crate) keep_alive: Option<KeepAliveConfig>,
    pub(crate) respawn: bool,
    pub(crate) queue_mode: QueueMode,
    pub(crate) spawn_delay: Duration,
    pub(crate) spawn_timeout: Option<Duration>,
    pub(crate) spawn_options: SpawnOptions,
    pub(crate) token: Option<String>,
}

impl ManagerOptions {
    fn defaults(mode: Mode) -> Self {
        Self {
            mode,
            file: None,
            worker_entry: None,
            total_shards: 1,
            total_clusters: 1,
            shard_lists: None,
            keep_alive: None,
            respawn: true,
            queue_mode: QueueMode::Auto,
            spawn_delay: Duration::from_millis(5_000),
            spawn_timeout: Some(Duration::from_millis(30_000)),
            spawn_options: SpawnOptions::default(),
            token: None,
        }
    }

    /// Process mode: fork `file` for every cluster.
    pub fn process(file: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(file.into()),
            ..Self::defaults(Mode::Process)
        }
    }

    /// Worker mode: run `entry` as an isolated task for every cluster.
    pub fn worker(entry: WorkerEntry) -> Self {
        Self {
            worker_entry: Some(entry),
            ..Self::defaults(Mode::Worker)
        }
    }

    pub fn with_shards(mut self, total_shards: u32, total_clusters: u32) -> Self {
        self.total_shards = total_shards;
        self.total_clusters = total_clusters;
        self
    }

    /// Use an explicit partition instead of the even contiguous split.
    pub fn with_shard_lists(mut self, shard_lists: Vec<Vec<ShardId>>) -> Self {
        self.total_clusters = shard_lists.len() as u32;
        self.shard_lists = Some(shard_lists);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Option<KeepAliveConfig>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Whether clusters respawn automatically after an exit.
    pub fn with_respawn(mut self, respawn: bool) -> Self {
        self.respawn = respawn;
        self
    }

    pub fn with_queue_mode(mut self, mode: QueueMode) -> Self {
        self.queue_mode = mode;
        self
    }

    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    /// Ready-wait bound per queued spawn; `None` starts children
    /// without waiting.
    pub fn with_spawn_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    pub fn with_spawn_options(mut self, options: SpawnOptions) -> Self {
        self.spawn_options = options;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Target/timeout options for broadcast operations.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    /// Evaluate on this single cluster instead of fanning out.
    pub cluster: Option<ClusterId>,
    /// Restrict the fan-out to the cluster owning this shard.
    pub shard: Option<ShardId>,
    /// Per-cluster bound in milliseconds.
    pub timeout: Option<u64>,
    pub context: Option<Value>,
}

/// Target options for a cross-cluster eval.
#[derive(Debug, Clone, Default)]
pub struct ClusterEvalOptions {
    pub cluster: Option<ClusterId>,
    pub shard: Option<ShardId>,
    /// Snowflake-style id routed via its high bits to a shard.
    pub entity: Option<u64>,
    pub timeout: Option<u64>,
    pub context: Option<Value>,
}

/// Pacing for a rolling respawn of the whole cluster set.
#[derive(Debug, Clone)]
pub struct RespawnOptions {
    /// Pause between clusters, milliseconds.
    pub cluster_delay: u64,
    /// Kill-to-spawn pause per cluster, milliseconds.
    pub respawn_delay: u64,
    /// Ready-wait bound per cluster, milliseconds.
    pub timeout: Option<u64>,
}

impl Default for RespawnOptions {
    fn default() -> Self {
        Self {
            cluster_delay: 5_000,
            respawn_delay: 7_000,
            timeout: Some(30_000),
        }
    }
}

pub(crate) struct ManagerInner {
    pub(crate) options: ManagerOptions,
    pub(crate) shard_lists: Mutex<Vec<Vec<ShardId>>>,
    pub(crate) clusters: Mutex<BTreeMap<ClusterId, Arc<Cluster>>>,
    pub(crate) registry: NonceRegistry,
    pub(crate) queue: Arc<SpawnQueue>,
    pub(crate) script_host: Arc<dyn ScriptHost>,
    pub(crate) events: EventBus,
}

/// The manager-side supervisor. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<ManagerInner>,
}

impl ClusterManager {
    pub fn new(options: ManagerOptions, script_host: Arc<dyn ScriptHost>) -> Self {
        let queue = Arc::new(SpawnQueue::new(
            options.queue_mode,
            options.spawn_delay,
            options.spawn_timeout,
        ));
        Self {
            inner: Arc::new(ManagerInner {
                options,
                shard_lists: Mutex::new(Vec::new()),
                clusters: Mutex::new(BTreeMap::new()),
                registry: NonceRegistry::new(),
                queue,
                script_host,
                events: EventBus::new(),
            }),
        }
    }

    /// Partition the shards, construct every cluster, and start the
    /// spawn queue.
    pub async fn spawn(&self) -> FabricResult<()> {
        let inner = &self.inner;
        {
            let clusters = inner.lock_clusters();
            if let Some((&id, _)) = clusters.iter().next() {
                return Err(FabricError::ChildExists(id));
            }
        }

        let lists = match &inner.options.shard_lists {
            Some(lists) => lists.clone(),
            None => partition_shards(inner.options.total_shards, inner.options.total_clusters)?,
        };
        *inner.lock_shard_lists() = lists.clone();

        info!(
            clusters = lists.len(),
            shards = inner.options.total_shards,
            mode = inner.options.mode.as_str(),
            "spawning cluster set"
        );

        let mut clusters = inner.lock_clusters();
        for (index, shard_list) in lists.into_iter().enumerate() {
            let id = index as ClusterId;
            let cluster = Cluster::new(
                id,
                shard_list,
                inner.options.total_shards,
                Arc::downgrade(inner),
                inner.registry.clone(),
            );
            clusters.insert(id, cluster.clone());
            inner.queue.enqueue(cluster);
        }
        drop(clusters);

        inner.queue.start();
        Ok(())
    }

    /// Send an application frame to every running cluster, returning
    /// the per-cluster send results in id order.
    pub async fn broadcast(&self, message: Value) -> Vec<FabricResult<()>> {
        let clusters = self.clusters();
        let mut results = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            results.push(cluster.send_frame(message.clone()).await);
        }
        results
    }

    /// Evaluate a script on one cluster or on all of them.
    ///
    /// Fan-out replies aggregate in arrival order; with
    /// `options.cluster` set, the single cluster's value is returned
    /// directly.
    pub async fn broadcast_eval(
        &self,
        script: &str,
        options: BroadcastOptions,
    ) -> FabricResult<Value> {
        if let Some(id) = options.cluster {
            let cluster = self.cluster(id).ok_or(FabricError::NoChild(id))?;
            return cluster.eval(script, options.context, options.timeout).await;
        }
        self.inner
            .eval_fan_out(script, options.context, options.shard, options.timeout)
            .await
    }

    /// Fetch a dotted-path client value from one cluster or all of
    /// them.
    pub async fn fetch_client_values(
        &self,
        prop: &str,
        options: BroadcastOptions,
    ) -> FabricResult<Value> {
        if let Some(id) = options.cluster {
            let cluster = self.cluster(id).ok_or(FabricError::NoChild(id))?;
            return cluster.fetch_client_value(prop, options.timeout).await;
        }
        self.inner
            .fetch_fan_out(prop, options.shard, options.timeout)
            .await
    }

    /// Evaluate a script in the manager's own trusted host.
    pub async fn eval_on_manager(
        &self,
        script: &str,
        context: Value,
    ) -> Result<Value, RemoteError> {
        self.inner.script_host.eval(script, context).await
    }

    /// Route an eval to a single target cluster and await its reply.
    ///
    /// The target resolves from an explicit cluster id, the cluster
    /// owning a shard, or the shard computed from an entity id, in that
    /// order.
    pub async fn eval_on_cluster(
        &self,
        script: &str,
        options: ClusterEvalOptions,
    ) -> FabricResult<Value> {
        let rx = self
            .inner
            .route_cluster_eval(script, options, None, None)
            .await?;
        await_reply(rx).await
    }

    /// Respawn every cluster in id order with pacing between them.
    pub async fn respawn_all(&self, options: RespawnOptions) -> FabricResult<()> {
        self.inner.respawn_all(options).await
    }

    /// Advance a manual spawn queue.
    pub fn spawn_next_cluster(&self) -> FabricResult<()> {
        self.inner.queue.next()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<Arc<Cluster>> {
        self.inner.lock_clusters().get(&id).cloned()
    }

    /// All clusters in id order.
    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.inner.lock_clusters().values().cloned().collect()
    }

    /// The shard partition computed at spawn time.
    pub fn shard_lists(&self) -> Vec<Vec<ShardId>> {
        self.inner.lock_shard_lists().clone()
    }

    /// Cluster owning a shard, per the spawn-time partition.
    pub fn cluster_for_shard(&self, shard: ShardId) -> Option<ClusterId> {
        cluster_for_shard(&self.inner.lock_shard_lists(), shard)
    }

    /// Requests still waiting on a reply or a timeout.
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.pending()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn off(&self, handle: HandlerId) -> bool {
        self.inner.events.off(handle)
    }
}

impl ManagerInner {
    pub(crate) async fn eval_fan_out(
        &self,
        script: &str,
        context: Option<Value>,
        shard: Option<ShardId>,
        timeout: Option<u64>,
    ) -> FabricResult<Value> {
        let script = script.to_string();
        self.fan_out(
            move |timeout_ms| Payload::Eval {
                script: script.clone(),
                context: context.clone(),
                timeout: Some(timeout_ms),
            },
            shard,
            timeout,
        )
        .await
    }

    pub(crate) async fn fetch_fan_out(
        &self,
        prop: &str,
        shard: Option<ShardId>,
        timeout: Option<u64>,
    ) -> FabricResult<Value> {
        let prop = prop.to_string();
        self.fan_out(
            move |_| Payload::FetchProp { prop: prop.clone() },
            shard,
            timeout,
        )
        .await
    }

    /// Send one request to every target under a single nonce and
    /// resolve once all replies (or the deadline) arrive.
    async fn fan_out(
        &self,
        payload_for: impl Fn(u64) -> Payload,
        shard: Option<ShardId>,
        timeout: Option<u64>,
    ) -> FabricResult<Value> {
        let targets = self.fan_out_targets(shard)?;
        if targets.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }

        let timeout_ms = timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        let nonce = generate_nonce();
        let rx = self.registry.register(
            &nonce,
            RegisterOptions {
                timeout: Some(Duration::from_millis(timeout_ms + BROADCAST_GRACE_MS)),
                timeout_error: FabricError::BroadcastEvalTimeout(timeout_ms),
                limit: Some(targets.len()),
                request_cluster: None,
            },
        );

        let frame = Envelope::with_nonce(&nonce, payload_for(timeout_ms)).encode()?;
        for target in &targets {
            if let Err(err) = target.send_frame(frame.clone()).await {
                // A dead pipe counts as that cluster's answer.
                self.registry.insert_result(&nonce, Err(err.to_remote()));
            }
        }
        await_reply(rx).await
    }

    fn fan_out_targets(&self, shard: Option<ShardId>) -> FabricResult<Vec<Arc<Cluster>>> {
        let clusters = self.lock_clusters();
        match shard {
            Some(shard) => {
                let target = clusters
                    .values()
                    .find(|c| c.shard_list().contains(&shard))
                    .cloned()
                    .ok_or(FabricError::TargetClusterNotProvided)?;
                Ok(vec![target])
            }
            None => Ok(clusters.values().filter(|c| c.is_running()).cloned().collect()),
        }
    }

    /// Register a waiter (tagged with the originating cluster, when
    /// any) and ship the eval to the resolved target. The reply routes
    /// back through the target cluster's dispatch.
    pub(crate) async fn route_cluster_eval(
        &self,
        script: &str,
        options: ClusterEvalOptions,
        nonce: Option<String>,
        request_cluster: Option<ClusterId>,
    ) -> FabricResult<oneshot::Receiver<FabricResult<Value>>> {
        let target = self.resolve_target(&options)?;
        let timeout_ms = options.timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        let nonce = nonce.unwrap_or_else(generate_nonce);

        let rx = self.registry.register(
            &nonce,
            RegisterOptions {
                timeout: Some(Duration::from_millis(timeout_ms)),
                timeout_error: FabricError::EvalRequestTimeout(timeout_ms),
                limit: None,
                request_cluster,
            },
        );
        let envelope = Envelope::with_nonce(
            &nonce,
            Payload::ClusterEvalRequest {
                script: script.to_string(),
                context: options.context,
            },
        );
        if let Err(err) = target.send(envelope).await {
            self.registry.settle(&nonce, Err(err.clone()));
            return Err(err);
        }
        Ok(rx)
    }

    fn resolve_target(&self, options: &ClusterEvalOptions) -> FabricResult<Arc<Cluster>> {
        let clusters = self.lock_clusters();
        if let Some(id) = options.cluster {
            return clusters
                .get(&id)
                .cloned()
                .ok_or(FabricError::TargetClusterNotProvided);
        }

        let shard = match (options.shard, options.entity) {
            (Some(shard), _) => Some(shard),
            (None, Some(entity)) => Some(shard_for_entity(entity, self.options.total_shards)),
            (None, None) => None,
        };
        let Some(shard) = shard else {
            return Err(FabricError::TargetClusterNotProvided);
        };
        clusters
            .values()
            .find(|c| c.shard_list().contains(&shard))
            .cloned()
            .ok_or(FabricError::TargetClusterNotProvided)
    }

    pub(crate) async fn respawn_all(&self, options: RespawnOptions) -> FabricResult<()> {
        let clusters: Vec<Arc<Cluster>> = self.lock_clusters().values().cloned().collect();
        let total = clusters.len();
        info!(clusters = total, "respawning all clusters");

        for (index, cluster) in clusters.iter().enumerate() {
            cluster
                .respawn(
                    Duration::from_millis(options.respawn_delay),
                    options.timeout.map(Duration::from_millis),
                )
                .await?;
            if index + 1 < total {
                tokio::time::sleep(Duration::from_millis(options.cluster_delay)).await;
            }
        }
        Ok(())
    }

    pub(crate) fn cluster(&self, id: ClusterId) -> Option<Arc<Cluster>> {
        self.lock_clusters().get(&id).cloned()
    }

    fn lock_clusters(&self) -> std::sync::MutexGuard<'_, BTreeMap<ClusterId, Arc<Cluster>>> {
        self.clusters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_shard_lists(&self) -> std::sync::MutexGuard<'_, Vec<Vec<ShardId>>> {
        self.shard_lists.lock().unwrap_or_else(|e| e.into_inner())
    }
}
