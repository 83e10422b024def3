//! Child-side heartbeat: the beat producer and the ack watchdog.
//!
//! The producer sends a beat every interval; the watchdog mirrors the
//! manager's scan against the ack stream. After five missed acks the
//! child tears down its local heartbeat state and leaves recovery to
//! the manager-side watchdog — it never kills itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Missed acks tolerated before the child gives up on its local
/// heartbeat state.
pub(crate) const MAX_MISSED_ACKS: u32 = 5;

/// Grace added on top of the beat interval before a scan counts a miss.
pub(crate) const ACK_GRACE: Duration = Duration::from_millis(2000);

/// Last-ack timestamp and missed-ack counter.
#[derive(Debug)]
pub(crate) struct AckClock {
    pub last: Instant,
    pub missed: u32,
}

impl AckClock {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
            missed: 0,
        }
    }

    pub fn ack(&mut self) {
        self.last = Instant::now();
        self.missed = 0;
    }

    pub fn scan(&mut self, interval: Duration, now: Instant) -> u32 {
        if now.duration_since(self.last) > interval + ACK_GRACE {
            self.missed += 1;
        }
        self.missed
    }
}

/// Producer and watchdog task pair for one live heartbeat.
pub(crate) struct ChildHeartbeat {
    pub clock: Arc<Mutex<AckClock>>,
    pub producer: JoinHandle<()>,
    pub watchdog: JoinHandle<()>,
}

impl ChildHeartbeat {
    pub fn stop(self) {
        self.producer.abort();
        self.watchdog.abort();
    }
}
