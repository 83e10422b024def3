//! Manager-side heartbeat bookkeeping.
//!
//! Each live cluster carries a beat clock updated on every `_keepAlive`
//! and scanned by a watchdog task at the beat interval. A cluster whose
//! missed count exceeds the policy is respawned, subject to the
//! per-cluster restart budget.

use std::time::Duration;

use tokio::time::Instant;

/// Grace added on top of the beat interval before a scan counts a miss.
pub(crate) const BEAT_GRACE: Duration = Duration::from_millis(2000);

/// Sliding window for the heartbeat-driven respawn budget.
const RESTART_WINDOW: Duration = Duration::from_secs(3600);

/// Last-beat timestamp and missed-beat counter for one live cluster.
#[derive(Debug)]
pub(crate) struct BeatClock {
    pub last: Instant,
    pub missed: u32,
}

impl BeatClock {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
            missed: 0,
        }
    }

    /// Record a received beat: `missed` resets on any valid beat.
    pub fn beat(&mut self) {
        self.last = Instant::now();
        self.missed = 0;
    }

    /// One watchdog scan: count a miss when the last beat is older than
    /// `interval` plus the grace. Returns the updated missed count.
    pub fn scan(&mut self, interval: Duration, now: Instant) -> u32 {
        if now.duration_since(self.last) > interval + BEAT_GRACE {
            self.missed += 1;
        }
        self.missed
    }
}

/// Heartbeat-driven respawns allowed per cluster, reset every hour.
///
/// Exit-driven respawns bypass this budget entirely.
#[derive(Debug)]
pub(crate) struct RestartWindow {
    window_started: Instant,
    current: u32,
}

impl RestartWindow {
    pub fn new() -> Self {
        Self {
            window_started: Instant::now(),
            current: 0,
        }
    }

    /// Respawns consumed in the current window.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Try to consume one respawn from the budget.
    ///
    /// Rolls the window over when an hour has passed. Returns `false`
    /// once `max` respawns were consumed inside the window; the caller
    /// suspends heartbeat-driven respawns until the rollover.
    pub fn try_consume(&mut self, max: u32, now: Instant) -> bool {
        if now.duration_since(self.window_started) >= RESTART_WINDOW {
            self.window_started = now;
            self.current = 0;
        }
        if self.current >= max {
            return false;
        }
        self.current += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_resets_missed() {
        let mut clock = BeatClock::new();
        clock.missed = 4;
        clock.beat();
        assert_eq!(clock.missed, 0);
    }

    #[test]
    fn scan_counts_misses_past_grace() {
        let interval = Duration::from_millis(1000);
        let mut clock = BeatClock::new();

        // Within interval + grace: no miss.
        let now = clock.last + interval + Duration::from_millis(1500);
        assert_eq!(clock.scan(interval, now), 0);

        // Past the grace: each scan counts one miss.
        let late = clock.last + interval + BEAT_GRACE + Duration::from_millis(1);
        assert_eq!(clock.scan(interval, late), 1);
        assert_eq!(clock.scan(interval, late), 2);
    }

    #[test]
    fn missed_is_monotone_between_resets() {
        let interval = Duration::from_millis(100);
        let mut clock = BeatClock::new();
        let late = clock.last + Duration::from_secs(10);

        let mut previous = 0;
        for _ in 0..5 {
            let missed = clock.scan(interval, late);
            assert!(missed >= previous);
            previous = missed;
        }
        clock.beat();
        assert_eq!(clock.missed, 0);
    }

    #[test]
    fn budget_allows_max_then_suppresses() {
        let mut window = RestartWindow::new();
        let now = window.window_started;

        assert!(window.try_consume(2, now));
        assert_eq!(window.current(), 1);
        assert!(window.try_consume(2, now));
        assert_eq!(window.current(), 2);
        // Third trigger inside the window is suppressed.
        assert!(!window.try_consume(2, now));
        assert_eq!(window.current(), 2);
    }

    #[test]
    fn budget_resets_after_window_rollover() {
        let mut window = RestartWindow::new();
        let now = window.window_started;

        assert!(window.try_consume(1, now));
        assert!(!window.try_consume(1, now));

        let next_hour = now + RESTART_WINDOW;
        assert!(window.try_consume(1, next_hour));
        assert_eq!(window.current(), 1);
    }
}
