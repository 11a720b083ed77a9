//! Lifecycle callbacks and per-shard hooks.
//!
//! Every callback has a default no-op body, so consumers implement only the
//! events they care about. Handlers are shared behind `Arc<dyn EventHandler>`
//! and may be swapped on a live shard (the manager does this during
//! resharding).

use crate::core::protocol::GatewayPayload;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Lifecycle and message callbacks invoked by a shard.
///
/// All methods run on the shard's reader task; long work should be handed off
/// to a separate task by the implementation.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// The shard is about to open its socket.
    async fn connecting(&self, _shard_id: u32) {}

    /// The socket transport reported open.
    async fn connected(&self, _shard_id: u32) {}

    /// The shard is about to send an identify payload.
    async fn identifying(&self, _shard_id: u32) {}

    /// The socket closed; `code` is the close code when one was received.
    async fn disconnected(&self, _shard_id: u32, _code: Option<u16>) {}

    /// The gateway sent its hello with the heartbeat interval in ms.
    async fn hello(&self, _shard_id: u32, _heartbeat_interval: u64) {}

    /// A heartbeat was sent.
    async fn heartbeat(&self, _shard_id: u32) {}

    /// The gateway acknowledged a heartbeat.
    async fn heartbeat_ack(&self, _shard_id: u32, _rtt: Duration) {}

    /// The gateway asked this shard to reconnect and resume.
    async fn requested_reconnect(&self, _shard_id: u32) {}

    /// The gateway invalidated the session; `resumable` tells whether a
    /// resume is still worth attempting.
    async fn invalid_session(&self, _shard_id: u32, _resumable: bool) {}

    /// A resume completed and missed events are being replayed.
    async fn resumed(&self, _shard_id: u32) {}

    /// A brand-new session became ready.
    async fn ready(&self, _shard_id: u32) {}

    /// Any decoded payload, including dispatch events.
    async fn message(&self, _shard_id: u32, _payload: GatewayPayload) {}
}

/// Handler that ignores every event.
pub struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {}

/// Admission control hook consulted before a shard sends identify.
///
/// The manager installs a gate backed by the shard's concurrency bucket;
/// standalone shards default to immediate admission.
#[async_trait]
pub trait IdentifyGate: Send + Sync + 'static {
    async fn wait_for_identify(&self, _shard_id: u32) {}
}

/// Gate that admits every identify immediately.
pub struct NoopGate;

#[async_trait]
impl IdentifyGate for NoopGate {}

/// Supplies the presence object embedded in identify payloads.
pub trait PresenceProvider: Send + Sync + 'static {
    /// `None` means identify without a presence field.
    fn make_presence(&self, shard_id: u32) -> Option<Value>;
}

/// Provider that never sets a presence.
pub struct NoPresence;

impl PresenceProvider for NoPresence {
    fn make_presence(&self, _shard_id: u32) -> Option<Value> {
        None
    }
}
