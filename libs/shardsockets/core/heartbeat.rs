//! Heartbeat liveness tracking.
//!
//! The shard spawns one beat task per hello. Each tick first checks that the
//! previous beat was acknowledged; a missing ack means the connection is
//! zombied and gets force-closed instead of beaten again. The epoch counter
//! lets a reconnect invalidate the previous task without having to join it.

use std::time::{Duration, Instant};

/// Default used for the send budget before the gateway announces its real
/// heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(45_000);

/// Liveness bookkeeping for one connection. Reset on every (re)connect.
#[derive(Debug)]
pub struct HeartbeatState {
    pub interval: Duration,
    pub last_beat: Option<Instant>,
    pub last_ack: Option<Instant>,
    pub rtt: Option<Duration>,
    /// Whether the previous beat has been acknowledged. Starts true so the
    /// very first tick never reads as a zombie.
    pub acked: bool,
    /// Bumped on start and clear; a beat task exits once its epoch is stale.
    pub epoch: u64,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            last_beat: None,
            last_ack: None,
            rtt: None,
            acked: true,
            epoch: 0,
        }
    }

    /// Begin a fresh heartbeat cycle with the interval from hello.
    pub fn start(&mut self, interval: Duration) -> u64 {
        self.interval = interval;
        self.last_beat = None;
        self.last_ack = None;
        self.rtt = None;
        self.acked = true;
        self.epoch += 1;
        self.epoch
    }

    /// Stop heartbeating; any running beat task sees the stale epoch and exits.
    pub fn clear(&mut self) {
        self.last_beat = None;
        self.acked = true;
        self.epoch += 1;
    }

    pub fn record_beat(&mut self) {
        self.last_beat = Some(Instant::now());
        self.acked = false;
    }

    /// Record an explicit ack and return the measured round-trip time.
    pub fn record_ack(&mut self) -> Option<Duration> {
        self.acked = true;
        let now = Instant::now();
        self.last_ack = Some(now);
        self.rtt = self.last_beat.map(|beat| now.duration_since(beat));
        self.rtt
    }
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

/// First-beat delay: a random fraction of the interval. An exact zero draw is
/// replaced with one half so a fleet of shards never beats immediately in
/// lockstep.
pub fn first_beat_delay(interval: Duration) -> Duration {
    let mut jitter: f64 = rand::random();
    if jitter == 0.0 {
        jitter = 0.5;
    }
    interval.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_then_ack_measures_rtt() {
        let mut heart = HeartbeatState::new();
        heart.start(Duration::from_millis(100));
        assert!(heart.acked);

        heart.record_beat();
        assert!(!heart.acked);

        let rtt = heart.record_ack();
        assert!(heart.acked);
        assert!(rtt.is_some());
    }

    #[test]
    fn start_and_clear_advance_the_epoch() {
        let mut heart = HeartbeatState::new();
        let first = heart.start(Duration::from_millis(100));
        heart.record_beat();
        heart.clear();
        assert!(heart.acked);
        let second = heart.start(Duration::from_millis(100));
        assert!(second > first);
    }

    #[test]
    fn first_beat_lands_inside_the_interval() {
        let interval = Duration::from_millis(45_000);
        for _ in 0..64 {
            let delay = first_beat_delay(interval);
            assert!(delay < interval);
        }
    }
}
