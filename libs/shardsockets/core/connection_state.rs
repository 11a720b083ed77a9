//! Atomic connection state for a shard.
//!
//! The state cell is read from many tasks (heartbeat, reader, callers) so it
//! is a single atomic byte rather than a locked enum.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle states of a shard connection.
///
/// `Disconnected` and `Offline` are terminal-for-now: both always accept a
/// re-entrant `connect`/`identify`/`resume` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShardState {
    /// No socket, no pending work.
    Offline = 0,
    /// Socket handshake in progress.
    Connecting = 1,
    /// Socket open, no identify or resume sent yet.
    Unidentified = 2,
    /// Identify in flight (admission wait included).
    Identifying = 3,
    /// Session ready; dispatch events are flowing.
    Connected = 4,
    /// Resume in flight.
    Resuming = 5,
    /// Socket closed after a planned close; waiting for the caller.
    Disconnected = 6,
}

impl ShardState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ShardState::Connecting,
            2 => ShardState::Unidentified,
            3 => ShardState::Identifying,
            4 => ShardState::Connected,
            5 => ShardState::Resuming,
            6 => ShardState::Disconnected,
            _ => ShardState::Offline,
        }
    }

    /// Whether a socket is expected to be open in this state.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            ShardState::Unidentified
                | ShardState::Identifying
                | ShardState::Connected
                | ShardState::Resuming
        )
    }

    /// Whether the session is ready to carry normal sends.
    pub fn is_ready(self) -> bool {
        matches!(self, ShardState::Connected)
    }
}

/// Lock-free cell holding a [`ShardState`].
#[derive(Debug)]
pub struct AtomicShardState(AtomicU8);

impl AtomicShardState {
    pub fn new(state: ShardState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ShardState {
        ShardState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ShardState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition only when the current state matches `current`.
    pub fn compare_exchange(
        &self,
        current: ShardState,
        new: ShardState,
    ) -> std::result::Result<ShardState, ShardState> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(ShardState::from_u8)
            .map_err(ShardState::from_u8)
    }
}

impl Default for AtomicShardState {
    fn default() -> Self {
        Self::new(ShardState::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_state() {
        let cell = AtomicShardState::default();
        for state in [
            ShardState::Offline,
            ShardState::Connecting,
            ShardState::Unidentified,
            ShardState::Identifying,
            ShardState::Connected,
            ShardState::Resuming,
            ShardState::Disconnected,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn open_and_ready_checks() {
        assert!(ShardState::Connected.is_open());
        assert!(ShardState::Resuming.is_open());
        assert!(!ShardState::Offline.is_open());
        assert!(!ShardState::Disconnected.is_open());
        assert!(ShardState::Connected.is_ready());
        assert!(!ShardState::Identifying.is_ready());
    }

    #[test]
    fn compare_exchange_only_wins_once() {
        let cell = AtomicShardState::new(ShardState::Disconnected);
        assert!(cell
            .compare_exchange(ShardState::Disconnected, ShardState::Connecting)
            .is_ok());
        assert!(cell
            .compare_exchange(ShardState::Disconnected, ShardState::Connecting)
            .is_err());
    }
}
