//! Observer registry for lifecycle events.
//!
//! Cluster, ClusterClient, and ClusterManager each carry an `EventBus`.
//! The event kinds are a closed enum; handlers are registered and
//! deregistered by id, so the core never retains unbounded listener
//! lists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::envelope::Envelope;
use crate::partition::ClusterId;

/// The closed set of observable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Spawn,
    Ready,
    Disconnect,
    Reconnecting,
    Death,
    Error,
    Message,
    ClientRequest,
    ClusterDebug,
}

/// A lifecycle event with its payload.
#[derive(Debug, Clone)]
pub enum Event {
    /// A child transport was created for the cluster.
    Spawn { cluster: ClusterId },
    /// The cluster reported its embedded client ready.
    Ready { cluster: ClusterId },
    /// The cluster reported an upstream disconnect.
    Disconnect { cluster: ClusterId },
    /// The cluster reported an upstream reconnect attempt.
    Reconnecting { cluster: ClusterId },
    /// The child transport exited.
    Death {
        cluster: ClusterId,
        code: Option<i32>,
    },
    /// A non-fatal error surfaced by the transport or a handler.
    Error {
        cluster: Option<ClusterId>,
        message: String,
    },
    /// An application frame that is not a control envelope.
    Message {
        cluster: Option<ClusterId>,
        raw: Value,
    },
    /// A custom request awaiting an application-provided reply.
    ClientRequest {
        cluster: Option<ClusterId>,
        envelope: Envelope,
    },
    /// Supervisor bookkeeping detail, recovered silently.
    ClusterDebug {
        cluster: Option<ClusterId>,
        message: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Spawn { .. } => EventKind::Spawn,
            Event::Ready { .. } => EventKind::Ready,
            Event::Disconnect { .. } => EventKind::Disconnect,
            Event::Reconnecting { .. } => EventKind::Reconnecting,
            Event::Death { .. } => EventKind::Death,
            Event::Error { .. } => EventKind::Error,
            Event::Message { .. } => EventKind::Message,
            Event::ClientRequest { .. } => EventKind::ClientRequest,
            Event::ClusterDebug { .. } => EventKind::ClusterDebug,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Token returned by [`EventBus::on`]; pass to [`EventBus::off`] to
/// deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId {
    kind: EventKind,
    id: u64,
}

/// Per-kind observer registry.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        HandlerId { kind, id }
    }

    /// Deregister a handler. Returns whether it was still registered.
    pub fn off(&self, handle: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        match handlers.get_mut(&handle.kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(id, _)| *id != handle.id);
                list.len() != before
            }
            None => false,
        }
    }

    /// Dispatch an event to every handler registered for its kind.
    ///
    /// Handlers run synchronously on the emitting task and must not
    /// block.
    pub fn emit(&self, event: &Event) {
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in snapshot {
            handler(event);
        }
    }
}
