//! Worker-mode fabric integration tests.
//!
//! Each test runs a full manager plus N in-process worker children,
//! entirely in one tokio runtime: ready handshakes, broadcast eval with
//! aggregation, dotted-path fetches, cross-cluster eval routing, custom
//! request round-trips, spawn-queue pacing, and exit- and
//! heartbeat-driven respawns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use shardline_client::{ClusterClient, ClusterEvalOptions as ClientEvalOptions};
use shardline_core::config::{KeepAliveConfig, QueueMode};
use shardline_core::error::FabricError;
use shardline_core::event::EventKind;
use shardline_core::script::CommandHost;
use shardline_ipc::worker::{WorkerContext, WorkerEntry};
use shardline_manager::{BroadcastOptions, ClusterEvalOptions, ClusterManager, ManagerOptions};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// A worker child that wires a `ClusterClient` to a whitelist host and
/// reports ready, like a real embedded application would.
fn app_entry() -> WorkerEntry {
    Arc::new(|ctx: WorkerContext| {
        Box::pin(async move {
            let flags = ctx.bootstrap.env.clone();
            let host = Arc::new(CommandHost::new());
            let client = ClusterClient::from_worker(ctx, host.clone());

            let id = client.id();
            host.register_fn("cluster-id", move |_| Ok(json!(id)));
            host.register("add", |args: Value| async move {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            });
            host.register("stall", |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            });

            let peer = client.clone();
            host.register("probe-peer", move |args: Value| {
                let client = peer.clone();
                async move {
                    let target = args["cluster"].as_u64().unwrap_or(0) as u32;
                    client
                        .eval_on_cluster(
                            "cluster-id",
                            ClientEvalOptions {
                                cluster: Some(target),
                                timeout: Some(2_000),
                                ..Default::default()
                            },
                        )
                        .await
                        .map_err(|e| e.to_remote())
                }
            });

            let advancer = client.clone();
            host.register("advance-queue", move |_| {
                let client = advancer.clone();
                async move {
                    client.spawn_next_cluster().await.map_err(|e| e.to_remote())?;
                    Ok(json!("advanced"))
                }
            });

            // Answer custom requests from the manager.
            let responder = client.clone();
            client.on(EventKind::ClientRequest, move |event| {
                if let shardline_core::event::Event::ClientRequest { envelope, .. } = event {
                    let client = responder.clone();
                    let nonce = envelope.nonce.clone();
                    tokio::spawn(async move {
                        let _ = client.respond(nonce, json!({"granted": true})).await;
                    });
                }
            });

            client.publish_state(json!({
                "shards": client.shard_list(),
                "stats": {"cluster": client.id(), "guilds": 10 * (i64::from(client.id()) + 1)},
            }));

            if flags.contains_key("SILENT_READY") {
                // Claim readiness without ever producing beats, so the
                // manager-side watchdog sees a mute child.
                client.send(json!({"op": "_ready"})).await?;
            } else {
                client.notify_ready().await?;
            }

            if flags.contains_key("EXIT_AFTER_READY") {
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Ok(());
            }
            std::future::pending::<()>().await;
            Ok(())
        })
    })
}

fn fabric(total_shards: u32, total_clusters: u32) -> ClusterManager {
    let options = ManagerOptions::worker(app_entry())
        .with_shards(total_shards, total_clusters)
        .with_respawn(false)
        .with_spawn_delay(Duration::from_millis(10))
        .with_spawn_timeout(Some(Duration::from_millis(5_000)));
    ClusterManager::new(options, Arc::new(CommandHost::new()))
}

/// Poll until `check` passes or the deadline expires.
async fn wait_for(what: &str, deadline: Duration, check: impl Fn() -> bool) {
    let stop = tokio::time::Instant::now() + deadline;
    while !check() {
        if tokio::time::Instant::now() > stop {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn ready_fabric(total_shards: u32, total_clusters: u32) -> ClusterManager {
    let manager = fabric(total_shards, total_clusters);
    manager.spawn().await.unwrap();
    let probe = manager.clone();
    wait_for("all clusters ready", Duration::from_secs(10), move || {
        let clusters = probe.clusters();
        clusters.len() == total_clusters as usize && clusters.iter().all(|c| c.is_ready())
    })
    .await;
    manager
}

// ── Ready handshake and partition ──────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn spawn_brings_every_cluster_ready() {
    init_tracing();
    let manager = ready_fabric(6, 3).await;

    let lists = manager.shard_lists();
    assert_eq!(lists, vec![vec![0, 1], vec![2, 3], vec![4, 5]]);
    for cluster in manager.clusters() {
        assert!(cluster.is_running());
        assert!(cluster.is_ready());
    }
}

// ── Broadcast fabric ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_eval_aggregates_every_cluster() {
    init_tracing();
    let manager = ready_fabric(3, 3).await;

    let result = manager
        .broadcast_eval(
            "cluster-id",
            BroadcastOptions {
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut ids: Vec<u64> = result
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_eval_passes_context_to_every_cluster() {
    init_tracing();
    let manager = ready_fabric(4, 2).await;

    let result = manager
        .broadcast_eval(
            "add",
            BroadcastOptions {
                context: Some(json!({"a": 1, "b": 1})),
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result, json!([2, 2]));
}

#[tokio::test(flavor = "multi_thread")]
async fn targeted_eval_returns_a_single_value() {
    init_tracing();
    let manager = ready_fabric(4, 2).await;

    let result = manager
        .broadcast_eval(
            "cluster-id",
            BroadcastOptions {
                cluster: Some(1),
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, json!(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn shard_target_restricts_the_fan_out() {
    init_tracing();
    let manager = ready_fabric(4, 2).await;

    // Shard 3 lives on cluster 1.
    let result = manager
        .broadcast_eval(
            "cluster-id",
            BroadcastOptions {
                shard: Some(3),
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, json!([1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_client_values_walks_dotted_paths() {
    init_tracing();
    let manager = ready_fabric(3, 3).await;

    let result = manager
        .fetch_client_values(
            "stats.guilds",
            BroadcastOptions {
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut guilds: Vec<u64> = result
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    guilds.sort_unstable();
    assert_eq!(guilds, vec![10, 20, 30]);

    let single = manager
        .fetch_client_values(
            "stats.guilds",
            BroadcastOptions {
                cluster: Some(1),
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(single, json!(20));

    let missing = manager
        .fetch_client_values(
            "stats.missing.deep",
            BroadcastOptions {
                cluster: Some(0),
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(missing, Value::Null);
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_timeout_rejects_and_clears_the_waiter() {
    init_tracing();
    let manager = ready_fabric(2, 2).await;

    let started = tokio::time::Instant::now();
    let err = manager
        .broadcast_eval(
            "stall",
            BroadcastOptions {
                timeout: Some(300),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err, FabricError::BroadcastEvalTimeout(300));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "rejected too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_000), "rejected too late: {elapsed:?}");

    let probe = manager.clone();
    wait_for("waiter cleanup", Duration::from_secs(2), move || {
        probe.pending_requests() == 0
    })
    .await;
}

// ── Cross-cluster eval ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn manager_routes_eval_to_a_single_cluster() {
    init_tracing();
    let manager = ready_fabric(4, 4).await;

    let result = manager
        .eval_on_cluster(
            "cluster-id",
            ClusterEvalOptions {
                cluster: Some(3),
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, json!(3));

    // Shard-based resolution picks the owning cluster.
    let result = manager
        .eval_on_cluster(
            "cluster-id",
            ClusterEvalOptions {
                shard: Some(2),
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, json!(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_to_cluster_eval_round_trips_through_the_manager() {
    init_tracing();
    let manager = ready_fabric(4, 4).await;

    // Cluster 0 evaluates "probe-peer", which internally asks the
    // manager to run "cluster-id" on cluster 3 and returns the answer.
    let result = manager
        .broadcast_eval(
            "probe-peer",
            BroadcastOptions {
                cluster: Some(0),
                context: Some(json!({"cluster": 3})),
                timeout: Some(4_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, json!(3));
}

// ── Custom requests ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn custom_request_resolves_with_the_child_reply() {
    init_tracing();
    let manager = ready_fabric(2, 2).await;

    let cluster = manager.cluster(0).unwrap();
    let value = cluster.request(json!({"ask": "permission"})).await;
    assert_eq!(value, json!({"granted": true}));
}

// ── Spawn queue ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn manual_queue_waits_for_an_explicit_advance() {
    init_tracing();
    let options = ManagerOptions::worker(app_entry())
        .with_shards(2, 2)
        .with_respawn(false)
        .with_queue_mode(QueueMode::Manual)
        .with_spawn_timeout(Some(Duration::from_millis(5_000)));
    let manager = ClusterManager::new(options, Arc::new(CommandHost::new()));
    manager.spawn().await.unwrap();

    let probe = manager.clone();
    wait_for("cluster 0 ready", Duration::from_secs(10), move || {
        probe.cluster(0).map(|c| c.is_ready()).unwrap_or(false)
    })
    .await;

    // Cluster 1 must still be waiting in the queue.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!manager.cluster(1).unwrap().is_running());

    // A child-side advance releases it: cluster 0 runs the
    // "advance-queue" operation, which sends `_spawnNextCluster`.
    let result = manager
        .broadcast_eval(
            "advance-queue",
            BroadcastOptions {
                cluster: Some(0),
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, json!("advanced"));

    let probe = manager.clone();
    wait_for("cluster 1 ready", Duration::from_secs(10), move || {
        probe.cluster(1).map(|c| c.is_ready()).unwrap_or(false)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_queue_refuses_manual_advance() {
    init_tracing();
    let manager = ready_fabric(1, 1).await;
    assert_eq!(
        manager.spawn_next_cluster().unwrap_err(),
        FabricError::QueueAuto
    );
}

// ── Ready-wait rejections ──────────────────────────────────────────

/// Spawn a single-cluster fabric with `entry`, wait for the first
/// (no-ready-wait) spawn, then kill it so the test can re-spawn with a
/// ready deadline and observe the outcome directly.
async fn killed_single_cluster(
    entry: WorkerEntry,
) -> (ClusterManager, Arc<shardline_manager::Cluster>) {
    let options = ManagerOptions::worker(entry)
        .with_shards(1, 1)
        .with_respawn(false)
        .with_spawn_timeout(None);
    let manager = ClusterManager::new(options, Arc::new(CommandHost::new()));
    manager.spawn().await.unwrap();

    let probe = manager.clone();
    wait_for("first spawn", Duration::from_secs(5), move || {
        probe.cluster(0).map(|c| c.is_running()).unwrap_or(false)
    })
    .await;

    let cluster = manager.cluster(0).unwrap();
    cluster.kill(true);
    (manager, cluster)
}

#[tokio::test(flavor = "multi_thread")]
async fn ready_wait_rejects_when_the_child_disconnects() {
    init_tracing();
    let entry: WorkerEntry = Arc::new(|ctx: WorkerContext| {
        Box::pin(async move {
            let client = ClusterClient::from_worker(ctx, Arc::new(CommandHost::new()));
            client.notify_disconnect().await?;
            std::future::pending::<()>().await;
            Ok(())
        })
    });
    let (_manager, cluster) = killed_single_cluster(entry).await;

    let err = cluster
        .spawn(Some(Duration::from_millis(2_000)))
        .await
        .unwrap_err();
    assert_eq!(err, FabricError::ReadyDisconnected(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn ready_wait_rejects_when_the_child_dies() {
    init_tracing();
    let entry: WorkerEntry =
        Arc::new(|_ctx| Box::pin(async { anyhow::bail!("boot failure") }));

    let options = ManagerOptions::worker(entry)
        .with_shards(1, 1)
        .with_respawn(false)
        .with_spawn_timeout(None);
    let manager = ClusterManager::new(options, Arc::new(CommandHost::new()));

    let deaths = Arc::new(AtomicU32::new(0));
    let counter = deaths.clone();
    manager.on(EventKind::Death, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    manager.spawn().await.unwrap();

    let probe = deaths.clone();
    wait_for("first death", Duration::from_secs(5), move || {
        probe.load(Ordering::SeqCst) >= 1
    })
    .await;

    let cluster = manager.cluster(0).unwrap();
    let err = cluster
        .spawn(Some(Duration::from_millis(2_000)))
        .await
        .unwrap_err();
    assert_eq!(err, FabricError::ReadyDied(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn ready_wait_rejects_on_the_deadline() {
    init_tracing();
    let entry: WorkerEntry = Arc::new(|_ctx| {
        Box::pin(async {
            std::future::pending::<()>().await;
            Ok(())
        })
    });
    let (_manager, cluster) = killed_single_cluster(entry).await;

    let err = cluster
        .spawn(Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(err, FabricError::ReadyTimeout(0, 200));
}

// ── Lifecycle: kill, exit respawn, heartbeat respawn ───────────────

#[tokio::test(flavor = "multi_thread")]
async fn kill_stops_a_cluster_without_respawn() {
    init_tracing();
    let manager = ready_fabric(2, 2).await;

    let deaths = Arc::new(AtomicU32::new(0));
    let counter = deaths.clone();
    manager.on(EventKind::Death, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let cluster = manager.cluster(0).unwrap();
    cluster.kill(true);

    assert!(!cluster.is_running());
    assert!(!cluster.is_ready());
    assert_eq!(deaths.load(Ordering::SeqCst), 1);

    // Still dead after the respawn delay would have elapsed.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!cluster.is_running());
}

#[tokio::test(flavor = "multi_thread")]
async fn respawn_replaces_the_child_and_serves_again() {
    init_tracing();
    let manager = ready_fabric(2, 2).await;

    let cluster = manager.cluster(1).unwrap();
    cluster
        .respawn(Duration::from_millis(50), Some(Duration::from_millis(5_000)))
        .await
        .unwrap();

    assert!(cluster.is_ready());
    let value = manager
        .fetch_client_values(
            "stats.cluster",
            BroadcastOptions {
                cluster: Some(1),
                timeout: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(value, json!(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_driven_respawn_brings_the_cluster_back() {
    init_tracing();
    let mut env = HashMap::new();
    env.insert("EXIT_AFTER_READY".to_string(), "1".to_string());
    let spawn_options = shardline_core::config::SpawnOptions {
        env,
        ..Default::default()
    };
    let options = ManagerOptions::worker(app_entry())
        .with_shards(1, 1)
        .with_respawn(true)
        .with_spawn_options(spawn_options)
        .with_spawn_timeout(Some(Duration::from_millis(5_000)));
    let manager = ClusterManager::new(options, Arc::new(CommandHost::new()));

    let spawns = Arc::new(AtomicU32::new(0));
    let counter = spawns.clone();
    manager.on(EventKind::Spawn, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    manager.spawn().await.unwrap();

    // The child exits shortly after ready; the supervisor keeps
    // bringing it back.
    let probe = spawns.clone();
    wait_for("two respawns", Duration::from_secs(15), move || {
        probe.load(Ordering::SeqCst) >= 3
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mute_child_is_respawned_by_the_heartbeat_watchdog() {
    init_tracing();
    let mut env = HashMap::new();
    env.insert("SILENT_READY".to_string(), "1".to_string());
    let spawn_options = shardline_core::config::SpawnOptions {
        env,
        ..Default::default()
    };
    let options = ManagerOptions::worker(app_entry())
        .with_shards(1, 1)
        .with_respawn(false)
        .with_keep_alive(Some(KeepAliveConfig {
            interval: 100,
            max_missed_heartbeats: 2,
            max_cluster_restarts: 2,
        }))
        .with_spawn_options(spawn_options)
        .with_spawn_timeout(Some(Duration::from_millis(5_000)));
    let manager = ClusterManager::new(options, Arc::new(CommandHost::new()));
    manager.spawn().await.unwrap();

    let probe = manager.clone();
    wait_for("cluster ready", Duration::from_secs(10), move || {
        probe.cluster(0).map(|c| c.is_ready()).unwrap_or(false)
    })
    .await;

    // No beats ever arrive; after the grace window the watchdog
    // consumes one respawn from the budget.
    let cluster = manager.cluster(0).unwrap();
    let probe = cluster.clone();
    wait_for(
        "heartbeat-driven respawn",
        Duration::from_secs(15),
        move || probe.heartbeat_restarts() >= 1,
    )
    .await;
}
