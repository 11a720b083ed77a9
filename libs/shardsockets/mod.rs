//! # ShardSockets
//!
//! A real-time gateway transport client: many concurrent WebSocket shards,
//! each running a stateful session-resumption protocol with streaming
//! decompression, heartbeat liveness detection and rate-limited sends, all
//! paced by a global identify admission controller.
//!
//! ## Features
//!
//! - **Shard state machine**: connect / identify / resume / close recovery
//!   with per-close-code policies and resume/identify alternation
//! - **Admission control**: leaky-bucket pacing per `max_concurrency` slot
//! - **Streaming decompression**: shared-window zlib stream with sync-flush
//!   framing, or independent zstd frames
//! - **Pluggable seams**: event handlers, identify gate, presence provider
//!   and the socket transport itself are all trait objects
//! - **Resharding**: grow to a larger shard count live, switching
//!   generations atomically
//!
//! ## Example
//!
//! ```rust,ignore
//! use shardsockets::{GatewayConfig, GatewayManager, NoopHandler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> shardsockets::Result<()> {
//!     let config = GatewayConfig::builder("token")
//!         .intents(513)
//!         .total_shards(2)
//!         .build()?;
//!
//!     let manager = GatewayManager::new(config, Arc::new(NoopHandler));
//!     manager.spawn_shards().await?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod manager;
pub mod traits;

// Re-export all traits
pub use traits::*;

// Re-export core client functionality
pub use crate::core::{
    close_codes, dispatch, gateway_close, opcodes, ClosePolicy, Decompressor, GatewayPayload,
    LeakyBucket, Session, Shard, ShardConfig, ShardState, Transport, TransportCompression,
    TungsteniteTransport,
};

// Re-export manager
pub use manager::{
    GatewayConfig, GatewayManager, GuildRelocator, MemberRequestOptions, SessionInfo,
    SessionInfoProvider, SessionStartLimit, WorkerAssignment,
};

/// Type alias for Result with GatewayError
pub type Result<T> = std::result::Result<T, traits::GatewayError>;
