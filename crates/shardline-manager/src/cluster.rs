//! Manager-side cluster record.
//!
//! One `Cluster` per child execution unit: it spawns and kills the
//! transport, tracks readiness, consumes heartbeats, and routes every
//! inbound envelope. At most one live transport exists per cluster, and
//! heartbeat timers are torn down on every transition that stops them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use shardline_core::config::{Bootstrap, KeepAliveConfig, Mode};
use shardline_core::envelope::{Envelope, Payload};
use shardline_core::error::{FabricError, FabricResult};
use shardline_core::event::{Event, EventBus, EventKind, HandlerId};
use shardline_core::partition::{ClusterId, ShardId};
use shardline_ipc::process::ProcessLink;
use shardline_ipc::registry::{await_reply, generate_nonce, NonceRegistry, RegisterOptions};
use shardline_ipc::transport::{ChildLink, ExitNotice, LinkEvents};
use shardline_ipc::worker::WorkerLink;

use crate::heartbeat::{BeatClock, RestartWindow};
use crate::manager::{ClusterEvalOptions, ManagerInner, SERVICE_TOKEN};

/// Default bound on request/eval round-trips.
pub(crate) const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Pause before an exit-driven or heartbeat-driven respawn.
const RESPAWN_DELAY: Duration = Duration::from_millis(500);

/// Ready-wait bound used by automatic respawns.
const RESPAWN_READY_TIMEOUT: Duration = Duration::from_millis(30_000);

/// First of {ready, disconnect, death} observed while a spawn waits.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SpawnOutcome {
    Ready,
    Disconnected,
    Died,
}

struct HeartbeatHandle {
    clock: Arc<Mutex<BeatClock>>,
    watchdog: JoinHandle<()>,
}

type InFlight = Shared<BoxFuture<'static, FabricResult<Value>>>;

pub struct Cluster {
    id: ClusterId,
    shard_list: Vec<ShardId>,
    total_shards: u32,
    manager: Weak<ManagerInner>,
    registry: NonceRegistry,
    events: EventBus,
    link: Mutex<Option<Arc<dyn ChildLink>>>,
    ready: AtomicBool,
    /// Bumped on every spawn/kill so a stale transport task cannot run
    /// exit handling for a replacement child.
    generation: AtomicU64,
    spawn_waiter: Mutex<Option<oneshot::Sender<SpawnOutcome>>>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
    restarts: Mutex<RestartWindow>,
    /// In-flight evals keyed by the exact script string.
    evals: Mutex<HashMap<String, InFlight>>,
    /// In-flight fetches keyed by the exact property path.
    fetches: Mutex<HashMap<String, InFlight>>,
}

impl Cluster {
    pub(crate) fn new(
        id: ClusterId,
        shard_list: Vec<ShardId>,
        total_shards: u32,
        manager: Weak<ManagerInner>,
        registry: NonceRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            shard_list,
            total_shards,
            manager,
            registry,
            events: EventBus::new(),
            link: Mutex::new(None),
            ready: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            spawn_waiter: Mutex::new(None),
            heartbeat: Mutex::new(None),
            restarts: Mutex::new(RestartWindow::new()),
            evals: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> ClusterId {
        self.id
    }

    pub fn shard_list(&self) -> &[ShardId] {
        &self.shard_list
    }

    /// True between a received ready and the next disconnect or exit.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether a live transport exists.
    pub fn is_running(&self) -> bool {
        self.lock_link().is_some()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&self, handle: HandlerId) -> bool {
        self.events.off(handle)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Construct a transport for this cluster and attach the routing
    /// task.
    ///
    /// With `wait_ready` set, resolves on the child's ready signal and
    /// rejects on disconnect, death, or the deadline; with `None` it
    /// returns as soon as the child is started.
    pub async fn spawn(self: &Arc<Self>, wait_ready: Option<Duration>) -> FabricResult<()> {
        let manager = self.upgrade_manager()?;
        if self.lock_link().is_some() {
            return Err(FabricError::ChildExists(self.id));
        }

        self.lock_evals().clear();
        self.lock_fetches().clear();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (link, events) = self.build_transport(&manager)?;
        *self.lock_link() = Some(link);

        let ready_rx = wait_ready.map(|_| {
            let (tx, rx) = oneshot::channel();
            *self.lock_spawn_waiter() = Some(tx);
            rx
        });

        self.attach(events, generation);
        info!(cluster = self.id, shards = ?self.shard_list, "cluster spawned");
        self.emit(Event::Spawn { cluster: self.id });

        let (Some(deadline), Some(rx)) = (wait_ready, ready_rx) else {
            return Ok(());
        };
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(SpawnOutcome::Ready)) => Ok(()),
            Ok(Ok(SpawnOutcome::Disconnected)) => Err(FabricError::ReadyDisconnected(self.id)),
            Ok(Ok(SpawnOutcome::Died)) | Ok(Err(_)) => Err(FabricError::ReadyDied(self.id)),
            Err(_) => {
                *self.lock_spawn_waiter() = None;
                Err(FabricError::ReadyTimeout(self.id, deadline.as_millis() as u64))
            }
        }
    }

    /// Terminate the transport synchronously.
    ///
    /// `force` clears heartbeat state up front so no heartbeat-driven
    /// respawn can race the kill. Exit handling runs immediately with
    /// respawn disabled.
    pub fn kill(self: &Arc<Self>, force: bool) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if force {
            self.cleanup_heartbeat();
        }
        let link = self.lock_link().clone();
        match link {
            Some(link) => {
                link.kill();
                self.finish_exit(
                    ExitNotice {
                        code: None,
                        message: Some("killed".to_string()),
                    },
                    false,
                );
            }
            None => debug!(cluster = self.id, "kill on cluster with no live child"),
        }
    }

    /// Kill, pause, and spawn again.
    pub async fn respawn(
        self: &Arc<Self>,
        delay: Duration,
        wait_ready: Option<Duration>,
    ) -> FabricResult<()> {
        self.kill(true);
        tokio::time::sleep(delay).await;
        self.spawn(wait_ready).await
    }

    // ── Outbound surface ─────────────────────────────────────────────

    /// Serialize an envelope and forward it to the transport.
    pub async fn send(&self, envelope: Envelope) -> FabricResult<()> {
        self.send_frame(envelope.encode()?).await
    }

    /// Forward a raw frame to the transport.
    pub async fn send_frame(&self, frame: Value) -> FabricResult<()> {
        let link = self
            .lock_link()
            .clone()
            .ok_or(FabricError::NoChild(self.id))?;
        match link.send(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.emit(Event::Error {
                    cluster: Some(self.id),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Answer a custom request received via the `ClientRequest` event.
    pub async fn respond(&self, nonce: Option<String>, payload: Value) -> FabricResult<()> {
        self.send(Envelope {
            nonce,
            payload: Payload::Custom {
                request: false,
                reply: true,
                payload,
            },
        })
        .await
    }

    /// Evaluate a script on this cluster's child.
    ///
    /// Concurrent calls with the same script string share one in-flight
    /// request; the timeout is the first caller's.
    pub async fn eval(
        self: &Arc<Self>,
        script: &str,
        context: Option<Value>,
        timeout: Option<u64>,
    ) -> FabricResult<Value> {
        let shared = {
            let mut evals = self.lock_evals();
            match evals.get(script) {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let in_flight = self
                        .clone()
                        .eval_request(script.to_string(), context, timeout)
                        .boxed()
                        .shared();
                    evals.insert(script.to_string(), in_flight.clone());
                    in_flight
                }
            }
        };
        shared.await
    }

    async fn eval_request(
        self: Arc<Self>,
        script: String,
        context: Option<Value>,
        timeout: Option<u64>,
    ) -> FabricResult<Value> {
        let timeout_ms = timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        let nonce = generate_nonce();
        let rx = self.registry.register(
            &nonce,
            RegisterOptions {
                timeout: Some(Duration::from_millis(timeout_ms)),
                timeout_error: FabricError::BroadcastEvalTimeout(timeout_ms),
                ..Default::default()
            },
        );
        let envelope = Envelope::with_nonce(
            &nonce,
            Payload::Eval {
                script: script.clone(),
                context,
                timeout: Some(timeout_ms),
            },
        );

        let result = match self.send(envelope).await {
            Ok(()) => await_reply(rx).await,
            Err(err) => {
                self.registry.settle(&nonce, Err(err.clone()));
                Err(err)
            }
        };
        self.lock_evals().remove(&script);
        result
    }

    /// Fetch a dotted-path value from this cluster's child.
    ///
    /// Same in-flight collapsing as [`Cluster::eval`], keyed by the
    /// property path.
    pub async fn fetch_client_value(
        self: &Arc<Self>,
        prop: &str,
        timeout: Option<u64>,
    ) -> FabricResult<Value> {
        let shared = {
            let mut fetches = self.lock_fetches();
            match fetches.get(prop) {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let in_flight = self
                        .clone()
                        .fetch_request(prop.to_string(), timeout)
                        .boxed()
                        .shared();
                    fetches.insert(prop.to_string(), in_flight.clone());
                    in_flight
                }
            }
        };
        shared.await
    }

    async fn fetch_request(
        self: Arc<Self>,
        prop: String,
        timeout: Option<u64>,
    ) -> FabricResult<Value> {
        let timeout_ms = timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        let nonce = generate_nonce();
        let rx = self.registry.register(
            &nonce,
            RegisterOptions {
                timeout: Some(Duration::from_millis(timeout_ms)),
                timeout_error: FabricError::EvalRequestTimeout(timeout_ms),
                ..Default::default()
            },
        );
        let envelope =
            Envelope::with_nonce(&nonce, Payload::FetchProp { prop: prop.clone() });

        let result = match self.send(envelope).await {
            Ok(()) => await_reply(rx).await,
            Err(err) => {
                self.registry.settle(&nonce, Err(err.clone()));
                Err(err)
            }
        };
        self.lock_fetches().remove(&prop);
        result
    }

    /// Send a custom request and always observe a value: any failure is
    /// folded into the message as an `error` field instead of rejecting,
    /// so broadcast fan-out never short-circuits on one cluster.
    pub async fn request(self: &Arc<Self>, message: Value) -> Value {
        let nonce = generate_nonce();
        let rx = self.registry.register(
            &nonce,
            RegisterOptions {
                timeout: Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
                timeout_error: FabricError::EvalRequestTimeout(DEFAULT_TIMEOUT_MS),
                ..Default::default()
            },
        );
        let envelope = Envelope::with_nonce(
            &nonce,
            Payload::Custom {
                request: true,
                reply: false,
                payload: message.clone(),
            },
        );

        let outcome = match self.send(envelope).await {
            Ok(()) => await_reply(rx).await,
            Err(err) => {
                self.registry.settle(&nonce, Err(err.clone()));
                Err(err)
            }
        };
        match outcome {
            Ok(value) => value,
            Err(err) => merge_error(message, &err),
        }
    }

    // ── Transport wiring ─────────────────────────────────────────────

    fn build_transport(
        &self,
        manager: &Arc<ManagerInner>,
    ) -> FabricResult<(Arc<dyn ChildLink>, LinkEvents)> {
        let options = &manager.options;
        let keep_alive_interval = options
            .keep_alive
            .as_ref()
            .map(|k| k.interval)
            .unwrap_or(0);
        let mut bootstrap = Bootstrap {
            mode: options.mode,
            id: self.id,
            count: options.total_clusters,
            shard_list: self.shard_list.clone(),
            total_shards: self.total_shards,
            keep_alive_interval,
            queue_mode: options.queue_mode,
            env: HashMap::new(),
        };

        match options.mode {
            Mode::Process => {
                let file = options.file.as_ref().ok_or_else(|| {
                    FabricError::Send("process mode requires a child file".to_string())
                })?;
                let mut env = bootstrap.to_env();
                if let Some(token) = &options.token {
                    env.push((SERVICE_TOKEN.to_string(), token.clone()));
                }
                let (link, events) = ProcessLink::spawn(file, &env, &options.spawn_options)?;
                Ok((link, events))
            }
            Mode::Worker => {
                let entry = options.worker_entry.as_ref().ok_or_else(|| {
                    FabricError::Send("worker mode requires a worker entry".to_string())
                })?;
                bootstrap.env = options.spawn_options.env.clone();
                if let Some(token) = &options.token {
                    bootstrap.env.insert(SERVICE_TOKEN.to_string(), token.clone());
                }
                let (link, events) = WorkerLink::spawn(entry, bootstrap);
                Ok((link, events))
            }
        }
    }

    /// Route frames and the exit notice for one transport generation.
    fn attach(self: &Arc<Self>, mut events: LinkEvents, generation: u64) {
        let cluster = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = events.frames.recv() => match frame {
                        Some(frame) => cluster.handle_frame(frame).await,
                        None => break,
                    },
                    notice = &mut events.exit => {
                        let notice = notice.unwrap_or(ExitNotice {
                            code: None,
                            message: None,
                        });
                        cluster.transport_exit(generation, notice);
                        return;
                    }
                }
            }
            // Frame stream closed; the exit notice is still owed.
            let notice = events.exit.await.unwrap_or(ExitNotice {
                code: None,
                message: None,
            });
            cluster.transport_exit(generation, notice);
        });
    }

    fn transport_exit(self: &Arc<Self>, generation: u64, notice: ExitNotice) {
        if self.generation.load(Ordering::SeqCst) != generation {
            // A kill or respawn already handled this child.
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.finish_exit(notice, true);
    }

    /// Common exit bookkeeping for kills and child deaths.
    fn finish_exit(self: &Arc<Self>, notice: ExitNotice, allow_respawn: bool) {
        self.cleanup_heartbeat();
        self.ready.store(false, Ordering::SeqCst);
        *self.lock_link() = None;
        if let Some(tx) = self.lock_spawn_waiter().take() {
            let _ = tx.send(SpawnOutcome::Died);
        }

        warn!(
            cluster = self.id,
            code = ?notice.code,
            message = notice.message.as_deref().unwrap_or(""),
            "cluster exited"
        );
        self.emit(Event::Death {
            cluster: self.id,
            code: notice.code,
        });

        if !allow_respawn {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if !manager.options.respawn {
            return;
        }
        let cluster = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESPAWN_DELAY).await;
            if let Err(e) = cluster.spawn(None).await {
                warn!(cluster = cluster.id, error = %e, "exit-driven respawn failed");
            }
        });
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    async fn handle_frame(self: &Arc<Self>, frame: Value) {
        let Some(envelope) = Envelope::decode(&frame) else {
            self.emit(Event::Message {
                cluster: Some(self.id),
                raw: frame,
            });
            return;
        };
        let nonce = envelope.nonce.clone();

        match envelope.payload {
            Payload::Ready => {
                self.ready.store(true, Ordering::SeqCst);
                if let Some(tx) = self.lock_spawn_waiter().take() {
                    let _ = tx.send(SpawnOutcome::Ready);
                }
                info!(cluster = self.id, "cluster ready");
                self.emit(Event::Ready { cluster: self.id });
                if let Ok(manager) = self.upgrade_manager() {
                    if let Some(config) = manager.options.keep_alive.clone() {
                        if config.interval > 0 {
                            self.start_heartbeat(config);
                        }
                    }
                }
            }

            Payload::Disconnect => {
                self.ready.store(false, Ordering::SeqCst);
                if let Some(tx) = self.lock_spawn_waiter().take() {
                    let _ = tx.send(SpawnOutcome::Disconnected);
                }
                self.emit(Event::Disconnect { cluster: self.id });
            }

            Payload::Reconnecting => {
                self.ready.store(false, Ordering::SeqCst);
                self.emit(Event::Reconnecting { cluster: self.id });
            }

            Payload::KeepAlive { .. } => {
                self.record_beat();
                let ack = Envelope::new(Payload::Ack {
                    last: epoch_millis(),
                });
                if self.send(ack).await.is_err() {
                    let err = FabricError::AckDeliveryFailed(self.id);
                    debug!(cluster = self.id, "{err}");
                    self.emit(Event::ClusterDebug {
                        cluster: Some(self.id),
                        message: err.to_string(),
                    });
                }
            }

            Payload::FetchPropBroadcast { prop, shard } => {
                // Fan-out answers must not block this routing task: the
                // aggregate includes this cluster's own reply.
                let cluster = self.clone();
                tokio::spawn(async move {
                    let Ok(manager) = cluster.upgrade_manager() else {
                        return;
                    };
                    let outcome = manager.fetch_fan_out(&prop, shard, None).await;
                    cluster.reply_with(nonce, outcome).await;
                });
            }

            Payload::EvalBroadcast {
                script,
                context,
                shard,
                timeout,
            } => {
                let cluster = self.clone();
                tokio::spawn(async move {
                    let Ok(manager) = cluster.upgrade_manager() else {
                        return;
                    };
                    let outcome = manager.eval_fan_out(&script, context, shard, timeout).await;
                    cluster.reply_with(nonce, outcome).await;
                });
            }

            Payload::ManagerEval { script, context } => {
                let cluster = self.clone();
                tokio::spawn(async move {
                    let Ok(manager) = cluster.upgrade_manager() else {
                        return;
                    };
                    let outcome = manager
                        .script_host
                        .eval(&script, context.unwrap_or(Value::Null))
                        .await;
                    let payload = match outcome {
                        Ok(result) => Payload::ManagerEvalResponse {
                            result: Some(result),
                            error: None,
                        },
                        Err(err) => Payload::ManagerEvalResponse {
                            result: None,
                            error: Some(err),
                        },
                    };
                    let _ = cluster.send(Envelope { nonce, payload }).await;
                });
            }

            Payload::ClusterEval {
                script,
                context,
                cluster: target,
                shard,
                entity,
                timeout,
            } => {
                let Ok(manager) = self.upgrade_manager() else {
                    return;
                };
                let options = ClusterEvalOptions {
                    cluster: target,
                    shard,
                    entity,
                    timeout,
                    context,
                };
                let routed = manager
                    .route_cluster_eval(&script, options, nonce.clone(), Some(self.id))
                    .await;
                if let Err(err) = routed {
                    let reply = Envelope {
                        nonce,
                        payload: Payload::ClusterEvalResponse {
                            result: None,
                            error: Some(err.to_remote()),
                        },
                    };
                    let _ = self.send(reply).await;
                }
            }

            Payload::ClusterEvalResponse { ref result, ref error } => {
                let Some(nonce) = nonce else {
                    return;
                };
                let outcome = match error {
                    Some(err) => Err(FabricError::Remote(err.clone())),
                    None => Ok(result.clone().unwrap_or(Value::Null)),
                };
                if let Some(meta) = self.registry.settle(&nonce, outcome) {
                    // Route the reply onward to the cluster that asked.
                    if let Some(origin) = meta.request_cluster {
                        if let Ok(manager) = self.upgrade_manager() {
                            if let Some(origin_cluster) = manager.cluster(origin) {
                                let _ = origin_cluster.send_frame(frame).await;
                            }
                        }
                    }
                }
            }

            Payload::ManagerEvalResponse { result, error } => {
                if let Some(nonce) = nonce {
                    let outcome = match error {
                        Some(err) => Err(FabricError::Remote(err)),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    self.registry.settle(&nonce, outcome);
                }
            }

            Payload::RespawnAll {
                cluster_delay,
                respawn_delay,
                timeout,
            } => {
                let cluster = self.clone();
                tokio::spawn(async move {
                    let Ok(manager) = cluster.upgrade_manager() else {
                        return;
                    };
                    let options = crate::manager::RespawnOptions {
                        cluster_delay: cluster_delay.unwrap_or(5_000),
                        respawn_delay: respawn_delay.unwrap_or(7_000),
                        timeout: timeout.or(Some(30_000)),
                    };
                    if let Err(e) = manager.respawn_all(options).await {
                        warn!(requested_by = cluster.id, error = %e, "respawn-all failed");
                    }
                });
            }

            Payload::SpawnNextCluster => {
                if let Ok(manager) = self.upgrade_manager() {
                    if let Err(e) = manager.queue.next() {
                        warn!(cluster = self.id, error = %e, "spawn queue advance refused");
                    }
                }
            }

            Payload::Custom {
                reply: true,
                payload,
                ..
            } => {
                if let Some(nonce) = nonce {
                    self.registry.settle(&nonce, Ok(payload));
                }
            }

            Payload::Custom {
                request: true,
                reply,
                payload,
            } => {
                self.emit(Event::ClientRequest {
                    cluster: Some(self.id),
                    envelope: Envelope {
                        nonce,
                        payload: Payload::Custom {
                            request: true,
                            reply,
                            payload,
                        },
                    },
                });
            }

            Payload::Reply { result, error } => {
                if let Some(nonce) = nonce {
                    let outcome = match error {
                        Some(err) => Err(err),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    self.registry.insert_result(&nonce, outcome);
                }
            }

            // Child-bound operations and flagless customs have no
            // meaning here; surface them to the application unchanged.
            _ => {
                self.emit(Event::Message {
                    cluster: Some(self.id),
                    raw: frame,
                });
            }
        }
    }

    async fn reply_with(&self, nonce: Option<String>, outcome: FabricResult<Value>) {
        let reply = match outcome {
            Ok(value) => Envelope::reply_ok(nonce, value),
            Err(err) => Envelope::reply_err(nonce, err.to_remote()),
        };
        let _ = self.send(reply).await;
    }

    // ── Heartbeat ────────────────────────────────────────────────────

    fn start_heartbeat(self: &Arc<Self>, config: KeepAliveConfig) {
        self.cleanup_heartbeat();

        let clock = Arc::new(Mutex::new(BeatClock::new()));
        let scan_clock = clock.clone();
        let cluster = self.clone();
        let watchdog = tokio::spawn(async move {
            let interval = Duration::from_millis(config.interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let missed = scan_clock
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .scan(interval, Instant::now());
                if missed > config.max_missed_heartbeats && cluster.heartbeat_expired(&config) {
                    return;
                }
            }
        });

        *self.lock_heartbeat() = Some(HeartbeatHandle { clock, watchdog });
    }

    /// The watchdog gave up on this child. Returns whether a respawn was
    /// scheduled (and the watchdog should stop).
    fn heartbeat_expired(self: &Arc<Self>, config: &KeepAliveConfig) -> bool {
        let allowed = self
            .lock_restarts()
            .try_consume(config.max_cluster_restarts, Instant::now());
        if !allowed {
            warn!(
                cluster = self.id,
                max = config.max_cluster_restarts,
                "heartbeat respawn budget exhausted; suspended until the window rolls over"
            );
            self.emit(Event::ClusterDebug {
                cluster: Some(self.id),
                message: "heartbeat respawn suppressed by restart budget".to_string(),
            });
            // Keep scanning so a trigger after the rollover still fires.
            if let Some(handle) = &*self.lock_heartbeat() {
                handle.clock.lock().unwrap_or_else(|e| e.into_inner()).beat();
            }
            return false;
        }

        let consumed = self.lock_restarts().current();
        info!(
            cluster = self.id,
            restarts = consumed,
            "heartbeat missed too many beats; respawning"
        );
        let cluster = self.clone();
        tokio::spawn(async move {
            if let Err(e) = cluster
                .respawn(RESPAWN_DELAY, Some(RESPAWN_READY_TIMEOUT))
                .await
            {
                warn!(cluster = cluster.id, error = %e, "heartbeat-driven respawn failed");
            }
        });
        true
    }

    /// Heartbeat-driven respawns consumed in the current budget window.
    pub fn heartbeat_restarts(&self) -> u32 {
        self.lock_restarts().current()
    }

    fn record_beat(&self) {
        if let Some(handle) = &*self.lock_heartbeat() {
            handle.clock.lock().unwrap_or_else(|e| e.into_inner()).beat();
        }
    }

    /// Tear down heartbeat timers. Safe on every transition; the record
    /// is empty whenever the cluster is not running.
    fn cleanup_heartbeat(&self) {
        if let Some(handle) = self.lock_heartbeat().take() {
            handle.watchdog.abort();
        }
    }

    // ── Plumbing ─────────────────────────────────────────────────────

    fn emit(&self, event: Event) {
        self.events.emit(&event);
        if let Some(manager) = self.manager.upgrade() {
            manager.events.emit(&event);
        }
    }

    fn upgrade_manager(&self) -> FabricResult<Arc<ManagerInner>> {
        self.manager
            .upgrade()
            .ok_or_else(|| FabricError::Send("manager dropped".to_string()))
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn ChildLink>>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_spawn_waiter(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<SpawnOutcome>>> {
        self.spawn_waiter.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_heartbeat(&self) -> std::sync::MutexGuard<'_, Option<HeartbeatHandle>> {
        self.heartbeat.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_restarts(&self) -> std::sync::MutexGuard<'_, RestartWindow> {
        self.restarts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_evals(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.evals.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_fetches(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.fetches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fold a request failure into the message so the caller still observes
/// a value.
fn merge_error(message: Value, error: &FabricError) -> Value {
    match message {
        Value::Object(mut map) => {
            map.insert("error".to_string(), json!(error.to_string()));
            Value::Object(map)
        }
        other => json!({ "message": other, "error": error.to_string() }),
    }
}

pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_error_extends_objects() {
        let message = json!({"op": "sync", "payload": 1});
        let merged = merge_error(message, &FabricError::EvalRequestTimeout(10_000));
        assert_eq!(merged["op"], "sync");
        assert_eq!(merged["payload"], 1);
        assert!(merged["error"]
            .as_str()
            .unwrap()
            .contains("timed out after 10000ms"));
    }

    #[test]
    fn merge_error_wraps_non_objects() {
        let merged = merge_error(json!("ping"), &FabricError::TimedOut);
        assert_eq!(merged["message"], "ping");
        assert_eq!(merged["error"], "request timed out");
    }
}
