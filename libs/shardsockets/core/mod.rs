//! Core connection machinery: one shard's state machine plus the primitives
//! it is built from (rate limiting, decompression, heartbeats, transport).

pub mod bucket;
pub mod compression;
pub mod config;
pub mod connection_state;
pub mod heartbeat;
pub mod protocol;
pub mod shard;
pub mod transport;

// Re-export main types
pub use bucket::LeakyBucket;
pub use compression::{Decompressor, TransportCompression, ZLIB_SUFFIX};
pub use config::{
    safe_requests_per_tick, IdentifyProperties, ShardConfig, DEFAULT_GATEWAY_URL,
    MAX_REQUESTS_PER_TICK, RATE_LIMIT_RESET_INTERVAL,
};
pub use connection_state::{AtomicShardState, ShardState};
pub use heartbeat::{first_beat_delay, HeartbeatState, DEFAULT_HEARTBEAT_INTERVAL};
pub use protocol::{
    classify_close, close_codes, dispatch, gateway_close, opcodes, ClosePolicy, GatewayPayload,
    ReadyData, API_VERSION,
};
pub use shard::{Session, Shard};
pub use transport::{ConnSink, ConnStream, Transport, TungsteniteTransport, WireEvent, WireMessage};

// Re-export traits for convenience
pub use crate::traits::*;
