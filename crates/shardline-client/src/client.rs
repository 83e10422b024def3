//! Child-side cluster façade.
//!
//! Mirrors the manager-side surface inside a child: it answers fetch
//! and eval requests against the embedded application, relays
//! heartbeats, and re-exports the request fabric (broadcast eval,
//! manager eval, cross-cluster eval, custom requests) to application
//! code running in the cluster.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use shardline_core::config::{Bootstrap, Mode, QueueMode};
use shardline_core::envelope::{Envelope, Payload};
use shardline_core::error::{FabricError, FabricResult};
use shardline_core::event::{Event, EventBus, EventKind, HandlerId};
use shardline_core::partition::{ClusterId, ShardId};
use shardline_core::script::ScriptHost;
use shardline_ipc::process::StdioParent;
use shardline_ipc::registry::{await_reply, generate_nonce, NonceRegistry, RegisterOptions};
use shardline_ipc::transport::ParentLink;
use shardline_ipc::worker::{WorkerContext, WorkerParent};

use crate::heartbeat::{AckClock, ChildHeartbeat, MAX_MISSED_ACKS};

/// Default bound on request round-trips.
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Extra wait beyond the manager-side deadline on broadcast calls, so
/// the manager's own timeout reply arrives first.
const REPLY_GRACE_MS: u64 = 200;

/// Target options for a cross-cluster eval issued from a child.
#[derive(Debug, Clone, Default)]
pub struct ClusterEvalOptions {
    pub cluster: Option<ClusterId>,
    pub shard: Option<ShardId>,
    /// Snowflake-style id routed via its high bits to a shard.
    pub entity: Option<u64>,
    pub timeout: Option<u64>,
    pub context: Option<Value>,
}

/// Target/timeout options for broadcast calls issued from a child.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    /// Restrict the fan-out to the cluster owning this shard.
    pub shard: Option<ShardId>,
    /// Per-cluster bound in milliseconds.
    pub timeout: Option<u64>,
    pub context: Option<Value>,
}

/// Pacing forwarded with a respawn-all request.
#[derive(Debug, Clone, Default)]
pub struct RespawnAllOptions {
    pub cluster_delay: Option<u64>,
    pub respawn_delay: Option<u64>,
    pub timeout: Option<u64>,
}

struct ClientInner {
    bootstrap: Bootstrap,
    link: Arc<dyn ParentLink>,
    registry: NonceRegistry,
    script_host: Arc<dyn ScriptHost>,
    /// Snapshot the embedded application publishes for dotted-path
    /// fetches.
    state: RwLock<Value>,
    ready: AtomicBool,
    heartbeat: Mutex<Option<ChildHeartbeat>>,
    events: EventBus,
}

impl ClientInner {
    fn lock_heartbeat(&self) -> std::sync::MutexGuard<'_, Option<ChildHeartbeat>> {
        self.heartbeat.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The child-side façade. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClientInner>,
}

impl ClusterClient {
    /// Attach to the parent over this process's stdio, reading the
    /// bootstrap from the environment.
    ///
    /// Fails fast when `CLUSTER_MANAGER_MODE` is absent, invalid, or
    /// not `process`.
    pub fn from_env(script_host: Arc<dyn ScriptHost>) -> FabricResult<Self> {
        let bootstrap = Bootstrap::from_env()?;
        if bootstrap.mode != Mode::Process {
            return Err(FabricError::BootstrapMode);
        }
        let (link, inbox) = StdioParent::attach();
        Ok(Self::wire(bootstrap, link, inbox, script_host))
    }

    /// Attach to the parent inside a worker context.
    pub fn from_worker(context: WorkerContext, script_host: Arc<dyn ScriptHost>) -> Self {
        let WorkerContext {
            bootstrap,
            inbox,
            outbox,
        } = context;
        Self::wire(bootstrap, WorkerParent::new(outbox), inbox, script_host)
    }

    fn wire(
        bootstrap: Bootstrap,
        link: Arc<dyn ParentLink>,
        mut inbox: mpsc::Receiver<Value>,
        script_host: Arc<dyn ScriptHost>,
    ) -> Self {
        let client = Self {
            inner: Arc::new(ClientInner {
                bootstrap,
                link,
                registry: NonceRegistry::new(),
                script_host,
                state: RwLock::new(Value::Null),
                ready: AtomicBool::new(false),
                heartbeat: Mutex::new(None),
                events: EventBus::new(),
            }),
        };

        let dispatcher = client.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbox.recv().await {
                dispatcher.handle_frame(frame).await;
            }
            debug!(
                cluster = dispatcher.inner.bootstrap.id,
                "parent channel closed"
            );
        });
        client
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn id(&self) -> ClusterId {
        self.inner.bootstrap.id
    }

    /// Shards owned by this cluster, in order.
    pub fn shard_list(&self) -> &[ShardId] {
        &self.inner.bootstrap.shard_list
    }

    /// Total number of clusters.
    pub fn count(&self) -> u32 {
        self.inner.bootstrap.count
    }

    pub fn mode(&self) -> Mode {
        self.inner.bootstrap.mode
    }

    pub fn queue_mode(&self) -> QueueMode {
        self.inner.bootstrap.queue_mode
    }

    pub fn bootstrap(&self) -> &Bootstrap {
        &self.inner.bootstrap
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
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

    // ── Application lifecycle ────────────────────────────────────────

    /// Publish the state snapshot served to dotted-path fetches.
    pub fn publish_state(&self, state: Value) {
        *self
            .inner
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Report the embedded client connected and serving; starts the
    /// heartbeat when one is configured.
    pub async fn notify_ready(&self) -> FabricResult<()> {
        self.inner.ready.store(true, Ordering::SeqCst);
        self.send_envelope(Envelope::new(Payload::Ready)).await?;
        self.start_heartbeat();
        info!(cluster = self.id(), "reported ready");
        Ok(())
    }

    /// Report an upstream disconnect.
    pub async fn notify_disconnect(&self) -> FabricResult<()> {
        self.inner.ready.store(false, Ordering::SeqCst);
        self.send_envelope(Envelope::new(Payload::Disconnect)).await
    }

    /// Report an upstream reconnect attempt.
    pub async fn notify_reconnecting(&self) -> FabricResult<()> {
        self.inner.ready.store(false, Ordering::SeqCst);
        self.send_envelope(Envelope::new(Payload::Reconnecting))
            .await
    }

    // ── Outbound surface ─────────────────────────────────────────────

    /// Send a raw application frame to the manager.
    pub async fn send(&self, frame: Value) -> FabricResult<()> {
        match self.inner.link.send(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.events.emit(&Event::Error {
                    cluster: Some(self.id()),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn send_envelope(&self, envelope: Envelope) -> FabricResult<()> {
        self.send(envelope.encode()?).await
    }

    /// Evaluate a script on every cluster (or one shard's cluster) and
    /// collect the replies.
    pub async fn broadcast_eval(
        &self,
        script: &str,
        options: BroadcastOptions,
    ) -> FabricResult<Value> {
        let timeout_ms = options.timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        self.round_trip(
            Payload::EvalBroadcast {
                script: script.to_string(),
                context: options.context,
                shard: options.shard,
                timeout: Some(timeout_ms),
            },
            timeout_ms + REPLY_GRACE_MS,
            FabricError::BroadcastEvalTimeout(timeout_ms),
        )
        .await
    }

    /// Fetch a dotted-path client value from every cluster (or one
    /// shard's cluster).
    pub async fn fetch_client_values(
        &self,
        prop: &str,
        options: BroadcastOptions,
    ) -> FabricResult<Value> {
        let timeout_ms = options.timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        self.round_trip(
            Payload::FetchPropBroadcast {
                prop: prop.to_string(),
                shard: options.shard,
            },
            timeout_ms + REPLY_GRACE_MS,
            FabricError::BroadcastEvalTimeout(timeout_ms),
        )
        .await
    }

    /// Evaluate a script on the manager itself.
    pub async fn eval_on_manager(
        &self,
        script: &str,
        context: Option<Value>,
    ) -> FabricResult<Value> {
        self.round_trip(
            Payload::ManagerEval {
                script: script.to_string(),
                context,
            },
            DEFAULT_TIMEOUT_MS,
            FabricError::EvalRequestTimeout(DEFAULT_TIMEOUT_MS),
        )
        .await
    }

    /// Evaluate a script on a single other cluster, routed by the
    /// manager; the reply comes back tagged for this cluster.
    pub async fn eval_on_cluster(
        &self,
        script: &str,
        options: ClusterEvalOptions,
    ) -> FabricResult<Value> {
        let timeout_ms = options.timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        self.round_trip(
            Payload::ClusterEval {
                script: script.to_string(),
                context: options.context,
                cluster: options.cluster,
                shard: options.shard,
                entity: options.entity,
                timeout: Some(timeout_ms),
            },
            timeout_ms + REPLY_GRACE_MS,
            FabricError::EvalRequestTimeout(timeout_ms),
        )
        .await
    }

    /// Send a custom request to the manager and always observe a value:
    /// failures fold into the message as an `error` field.
    pub async fn request(&self, message: Value) -> Value {
        self.request_with_timeout(message, DEFAULT_TIMEOUT_MS).await
    }

    pub async fn request_with_timeout(&self, message: Value, timeout_ms: u64) -> Value {
        let outcome = self
            .round_trip(
                Payload::Custom {
                    request: true,
                    reply: false,
                    payload: message.clone(),
                },
                timeout_ms,
                FabricError::EvalRequestTimeout(timeout_ms),
            )
            .await;
        match outcome {
            Ok(value) => value,
            Err(err) => merge_error(message, &err),
        }
    }

    /// Answer a custom request received via the `ClientRequest` event.
    pub async fn respond(&self, nonce: Option<String>, payload: Value) -> FabricResult<()> {
        self.send_envelope(Envelope {
            nonce,
            payload: Payload::Custom {
                request: false,
                reply: true,
                payload,
            },
        })
        .await
    }

    /// Ask the manager to respawn every cluster. Fire-and-forget.
    pub async fn respawn_all(&self, options: RespawnAllOptions) -> FabricResult<()> {
        self.send_envelope(Envelope::new(Payload::RespawnAll {
            cluster_delay: options.cluster_delay,
            respawn_delay: options.respawn_delay,
            timeout: options.timeout,
        }))
        .await
    }

    /// Ask the manager to advance a manual spawn queue.
    pub async fn spawn_next_cluster(&self) -> FabricResult<()> {
        self.send_envelope(Envelope::new(Payload::SpawnNextCluster))
            .await
    }

    async fn round_trip(
        &self,
        payload: Payload,
        timeout_ms: u64,
        timeout_error: FabricError,
    ) -> FabricResult<Value> {
        let nonce = generate_nonce();
        let rx = self.inner.registry.register(
            &nonce,
            RegisterOptions {
                timeout: Some(Duration::from_millis(timeout_ms)),
                timeout_error,
                ..Default::default()
            },
        );
        let envelope = Envelope::with_nonce(&nonce, payload);
        match self.send_envelope(envelope).await {
            Ok(()) => await_reply(rx).await,
            Err(err) => {
                self.inner.registry.settle(&nonce, Err(err.clone()));
                Err(err)
            }
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    async fn handle_frame(&self, frame: Value) {
        let Some(envelope) = Envelope::decode(&frame) else {
            self.inner.events.emit(&Event::Message {
                cluster: Some(self.id()),
                raw: frame,
            });
            return;
        };
        let nonce = envelope.nonce.clone();

        match envelope.payload {
            Payload::FetchProp { prop } => {
                let value = {
                    let state = self.inner.state.read().unwrap_or_else(|e| e.into_inner());
                    pluck(&state, &prop)
                };
                let _ = self.send_envelope(Envelope::reply_ok(nonce, value)).await;
            }

            Payload::Eval {
                script,
                context,
                timeout,
            } => {
                // Scripts run off the dispatch task so a slow host
                // cannot stall the frame stream.
                let client = self.clone();
                tokio::spawn(async move {
                    let context = context.unwrap_or(Value::Null);
                    let eval = client.inner.script_host.eval(&script, context);
                    let outcome = match timeout {
                        Some(timeout_ms) => {
                            let bound = Duration::from_millis(timeout_ms);
                            match tokio::time::timeout(bound, eval).await {
                                Ok(outcome) => outcome,
                                Err(_) => {
                                    // Stay silent: the manager-side
                                    // waiter owns the timeout.
                                    debug!(
                                        cluster = client.id(),
                                        %script,
                                        timeout_ms,
                                        "script exceeded its bound; dropping reply"
                                    );
                                    return;
                                }
                            }
                        }
                        None => eval.await,
                    };
                    let reply = match outcome {
                        Ok(value) => Envelope::reply_ok(nonce, value),
                        Err(err) => Envelope::reply_err(nonce, err),
                    };
                    let _ = client.send_envelope(reply).await;
                });
            }

            Payload::ClusterEvalRequest { script, context } => {
                let client = self.clone();
                tokio::spawn(async move {
                    let outcome = client
                        .inner
                        .script_host
                        .eval(&script, context.unwrap_or(Value::Null))
                        .await;
                    let payload = match outcome {
                        Ok(value) => Payload::ClusterEvalResponse {
                            result: Some(value),
                            error: None,
                        },
                        Err(err) => Payload::ClusterEvalResponse {
                            result: None,
                            error: Some(err),
                        },
                    };
                    let _ = client.send_envelope(Envelope { nonce, payload }).await;
                });
            }

            Payload::ClusterEvalResponse { result, error }
            | Payload::ManagerEvalResponse { result, error } => {
                if let Some(nonce) = nonce {
                    let outcome = match error {
                        Some(err) => Err(FabricError::Remote(err)),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    self.inner.registry.settle(&nonce, outcome);
                }
            }

            Payload::Ack { .. } => {
                if let Some(handle) = &*self.inner.lock_heartbeat() {
                    handle.clock.lock().unwrap_or_else(|e| e.into_inner()).ack();
                }
            }

            Payload::Custom {
                reply: true,
                payload,
                ..
            } => {
                if let Some(nonce) = nonce {
                    self.inner.registry.settle(&nonce, Ok(payload));
                }
            }

            Payload::Custom {
                request: true,
                reply,
                payload,
            } => {
                self.inner.events.emit(&Event::ClientRequest {
                    cluster: Some(self.id()),
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
                    self.inner.registry.insert_result(&nonce, outcome);
                }
            }

            // Manager-bound operations have no meaning here; surface
            // them to the application unchanged.
            _ => {
                self.inner.events.emit(&Event::Message {
                    cluster: Some(self.id()),
                    raw: frame,
                });
            }
        }
    }

    // ── Heartbeat ────────────────────────────────────────────────────

    fn start_heartbeat(&self) {
        let interval_ms = self.inner.bootstrap.keep_alive_interval;
        if interval_ms == 0 {
            return;
        }
        self.stop_heartbeat();

        let interval = Duration::from_millis(interval_ms);
        let clock = Arc::new(Mutex::new(AckClock::new()));

        let beat_link = self.inner.link.clone();
        let id = self.id();
        let producer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let beat = Envelope::new(Payload::KeepAlive {
                    last: epoch_millis(),
                });
                let frame = match beat.encode() {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if let Err(e) = beat_link.send(frame).await {
                    debug!(cluster = id, error = %e, "beat send failed");
                }
            }
        });

        let inner = self.inner.clone();
        let scan_clock = clock.clone();
        let watchdog = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let missed = scan_clock
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .scan(interval, Instant::now());
                if missed >= MAX_MISSED_ACKS {
                    // Give up locally; the manager-side watchdog owns
                    // recovery from here. The child does not self-kill.
                    warn!(
                        cluster = inner.bootstrap.id,
                        missed, "heartbeat acks lost; tearing down local heartbeat"
                    );
                    if let Some(handle) = inner.lock_heartbeat().take() {
                        handle.producer.abort();
                    }
                    return;
                }
                if missed > 0 {
                    debug!(cluster = inner.bootstrap.id, missed, "heartbeat ack overdue");
                }
            }
        });

        *self.inner.lock_heartbeat() = Some(ChildHeartbeat {
            clock,
            producer,
            watchdog,
        });
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.inner.lock_heartbeat().take() {
            handle.stop();
        }
    }

    /// Whether the local heartbeat tasks are running.
    pub fn heartbeat_active(&self) -> bool {
        self.inner.lock_heartbeat().is_some()
    }
}

/// Resolve a dotted path against a JSON snapshot. Missing segments
/// yield null, mirroring an absent property on the remote side.
fn pluck(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
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

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
