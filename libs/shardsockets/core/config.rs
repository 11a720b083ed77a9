//! Per-shard connection configuration.

use crate::core::compression::TransportCompression;
use crate::core::protocol::API_VERSION;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

/// Base discovery URL used when no resume URL is known.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// The gateway disconnects a shard exceeding this many requests per tick.
pub const MAX_REQUESTS_PER_TICK: u32 = 120;

/// Length of one rate-limit tick.
pub const RATE_LIMIT_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// Connection properties sent in the identify payload.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            browser: "shardsockets".to_owned(),
            device: "shardsockets".to_owned(),
        }
    }
}

/// Everything one shard needs to open and maintain its connection.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub token: String,
    pub intents: u64,
    pub url: String,
    pub version: u8,
    pub total_shards: u32,
    pub compression: TransportCompression,
    /// Legacy whole-payload compression negotiated on identify. Mutually
    /// exclusive with transport compression; `normalize` resolves conflicts.
    pub payload_compression: bool,
    pub properties: IdentifyProperties,
}

impl ShardConfig {
    pub fn new(token: impl Into<String>, intents: u64) -> Self {
        Self {
            token: token.into(),
            intents,
            url: DEFAULT_GATEWAY_URL.to_owned(),
            version: API_VERSION,
            total_shards: 1,
            compression: TransportCompression::None,
            payload_compression: false,
            properties: IdentifyProperties::default(),
        }
    }

    /// Resolve configuration conflicts before the first connect.
    ///
    /// Streaming transport compression wins over the legacy whole-payload
    /// flag, and a transport mode with no compiled-in decoder is dropped.
    pub fn normalize(mut self) -> Self {
        if self.payload_compression && self.compression != TransportCompression::None {
            warn!("payload compression is ignored when transport compression is enabled");
            self.payload_compression = false;
        }
        if !self.compression.is_available() {
            warn!(
                mode = ?self.compression,
                "transport compression mode has no decoder compiled in; disabling"
            );
            self.compression = TransportCompression::None;
        }
        self
    }
}

/// Requests a shard may safely spend per rate-limit tick, reserving room for
/// heartbeats and the forced replies the gateway can demand.
pub fn safe_requests_per_tick(heartbeat_interval: Duration) -> u32 {
    let interval_ms = heartbeat_interval.as_millis().max(1) as f64;
    let beats = (RATE_LIMIT_RESET_INTERVAL.as_millis() as f64 / interval_ms).ceil() as u32;
    MAX_REQUESTS_PER_TICK.saturating_sub(beats * 2)
}
