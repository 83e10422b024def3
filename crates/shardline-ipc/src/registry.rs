//! Nonce → waiter registry.
//!
//! Every outstanding request on a side lives here until exactly one of
//! resolve, reject, or timeout fires, after which the nonce is gone and
//! late replies fail the lookup silently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

use shardline_core::envelope::RemoteError;
use shardline_core::error::{FabricError, FabricResult};
use shardline_core::partition::ClusterId;

/// A locally unique correlation id: epoch millis plus a random suffix.
pub fn generate_nonce() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let salt: u32 = rand::random();
    format!("{millis:x}-{salt:08x}")
}

/// How a waiter is armed.
pub struct RegisterOptions {
    /// Reject after this long. `None` waits forever.
    pub timeout: Option<Duration>,
    /// The error the timeout rejects with.
    pub timeout_error: FabricError,
    /// Number of results to accumulate before resolving with the list.
    /// `None` resolves on the first result.
    pub limit: Option<usize>,
    /// Origin cluster for cross-cluster calls, so the reply can be
    /// routed back.
    pub request_cluster: Option<ClusterId>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            timeout_error: FabricError::TimedOut,
            limit: None,
            request_cluster: None,
        }
    }
}

/// Metadata carried by a settled waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct WaiterMeta {
    pub request_cluster: Option<ClusterId>,
}

struct Waiter {
    tx: oneshot::Sender<FabricResult<Value>>,
    results: Vec<Value>,
    limit: Option<usize>,
    request_cluster: Option<ClusterId>,
    timer: Option<JoinHandle<()>>,
}

/// Shared handle to the pending-request map. Clones observe the same
/// registry.
#[derive(Clone, Default)]
pub struct NonceRegistry {
    inner: Arc<Mutex<HashMap<String, Waiter>>>,
}

impl NonceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a waiter under `nonce` and return its completion.
    ///
    /// When a timeout is set, a timer task rejects with the configured
    /// error and removes the entry.
    pub fn register(
        &self,
        nonce: &str,
        options: RegisterOptions,
    ) -> oneshot::Receiver<FabricResult<Value>> {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            tx,
            results: Vec::new(),
            limit: options.limit,
            request_cluster: options.request_cluster,
            timer: None,
        };
        self.lock().insert(nonce.to_string(), waiter);

        if let Some(timeout) = options.timeout {
            let registry = self.clone();
            let timer_nonce = nonce.to_string();
            let error = options.timeout_error;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if registry.settle(&timer_nonce, Err(error)).is_some() {
                    trace!(nonce = %timer_nonce, "request timed out");
                }
            });
            match self.lock().get_mut(nonce) {
                Some(waiter) => waiter.timer = Some(timer),
                // Settled before the timer was stored.
                None => timer.abort(),
            }
        }
        rx
    }

    /// Terminally resolve or reject `nonce`.
    ///
    /// Clears the timer, removes the entry, and returns the waiter's
    /// metadata; `None` when the nonce is unknown (late or duplicate
    /// reply).
    pub fn settle(&self, nonce: &str, outcome: FabricResult<Value>) -> Option<WaiterMeta> {
        let waiter = self.lock().remove(nonce)?;
        if let Some(timer) = waiter.timer {
            timer.abort();
        }
        let meta = WaiterMeta {
            request_cluster: waiter.request_cluster,
        };
        let _ = waiter.tx.send(outcome);
        Some(meta)
    }

    /// Feed one result (or error) into an aggregating waiter.
    ///
    /// An error rejects immediately. A value resolves immediately when
    /// no limit is set, or once `limit` values have accumulated, in
    /// which case the waiter resolves with the list in arrival order.
    /// Returns `false` when the nonce is unknown.
    pub fn insert_result(&self, nonce: &str, result: Result<Value, RemoteError>) -> bool {
        let mut map = self.lock();
        let Some(waiter) = map.get_mut(nonce) else {
            return false;
        };

        let outcome = match result {
            Err(err) => Some(Err(FabricError::Remote(err))),
            Ok(value) => {
                waiter.results.push(value);
                match waiter.limit {
                    None => waiter.results.pop().map(Ok),
                    Some(limit) if waiter.results.len() >= limit => {
                        Some(Ok(Value::Array(std::mem::take(&mut waiter.results))))
                    }
                    Some(_) => None,
                }
            }
        };

        if let Some(outcome) = outcome {
            if let Some(waiter) = map.remove(nonce) {
                drop(map);
                if let Some(timer) = waiter.timer {
                    timer.abort();
                }
                let _ = waiter.tx.send(outcome);
            }
        }
        true
    }

    pub fn contains(&self, nonce: &str) -> bool {
        self.lock().contains_key(nonce)
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Await a registered completion, flattening channel loss into a send
/// error.
pub async fn await_reply(rx: oneshot::Receiver<FabricResult<Value>>) -> FabricResult<Value> {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(FabricError::Send(
            "waiter dropped before completion".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_removes_entry_and_completes() {
        let registry = NonceRegistry::new();
        let rx = registry.register("n1", RegisterOptions::default());

        assert!(registry.contains("n1"));
        registry.settle("n1", Ok(json!(42)));
        assert!(!registry.contains("n1"));
        assert_eq!(await_reply(rx).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn exactly_one_settlement_wins() {
        let registry = NonceRegistry::new();
        let rx = registry.register("n1", RegisterOptions::default());

        assert!(registry.settle("n1", Ok(json!(1))).is_some());
        assert!(registry.settle("n1", Ok(json!(2))).is_none());
        assert_eq!(await_reply(rx).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn timeout_rejects_with_supplied_error_and_removes() {
        let registry = NonceRegistry::new();
        let rx = registry.register(
            "n1",
            RegisterOptions {
                timeout: Some(Duration::from_millis(20)),
                timeout_error: FabricError::BroadcastEvalTimeout(20),
                ..Default::default()
            },
        );

        let err = await_reply(rx).await.unwrap_err();
        assert_eq!(err, FabricError::BroadcastEvalTimeout(20));
        assert!(!registry.contains("n1"));
        // A late reply fails the lookup silently.
        assert!(!registry.insert_result("n1", Ok(json!(1))));
    }

    #[tokio::test]
    async fn single_result_resolves_without_limit() {
        let registry = NonceRegistry::new();
        let rx = registry.register("n1", RegisterOptions::default());

        assert!(registry.insert_result("n1", Ok(json!("pong"))));
        assert_eq!(await_reply(rx).await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn limit_accumulates_in_arrival_order() {
        let registry = NonceRegistry::new();
        let rx = registry.register(
            "n1",
            RegisterOptions {
                limit: Some(3),
                ..Default::default()
            },
        );

        registry.insert_result("n1", Ok(json!(2)));
        registry.insert_result("n1", Ok(json!(0)));
        assert!(registry.contains("n1"));
        registry.insert_result("n1", Ok(json!(1)));

        assert_eq!(await_reply(rx).await.unwrap(), json!([2, 0, 1]));
        assert!(!registry.contains("n1"));
    }

    #[tokio::test]
    async fn error_result_rejects_immediately() {
        let registry = NonceRegistry::new();
        let rx = registry.register(
            "n1",
            RegisterOptions {
                limit: Some(4),
                ..Default::default()
            },
        );

        registry.insert_result("n1", Ok(json!(1)));
        registry.insert_result("n1", Err(RemoteError::new("EvalError", "boom")));

        let err = await_reply(rx).await.unwrap_err();
        assert!(matches!(err, FabricError::Remote(_)));
        assert!(!registry.contains("n1"));
    }

    #[tokio::test]
    async fn request_cluster_tag_survives_settlement() {
        let registry = NonceRegistry::new();
        let _rx = registry.register(
            "n1",
            RegisterOptions {
                request_cluster: Some(4),
                ..Default::default()
            },
        );

        let meta = registry.settle("n1", Ok(Value::Null)).unwrap();
        assert_eq!(meta.request_cluster, Some(4));
    }

    #[tokio::test]
    async fn settlement_beats_timeout() {
        let registry = NonceRegistry::new();
        let rx = registry.register(
            "n1",
            RegisterOptions {
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );

        registry.settle("n1", Ok(json!(true)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(await_reply(rx).await.unwrap(), json!(true));
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn nonces_are_unique_enough() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_nonce()));
        }
    }
}
