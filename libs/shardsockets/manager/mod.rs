//! Multi-shard orchestration and resharding.

pub mod config;
pub mod manager;
pub mod resharding;

pub use config::{GatewayConfig, GatewayConfigBuilder, WorkerAssignment, DEFAULT_SPAWN_SHARD_DELAY};
pub use manager::{ConcurrencyBucket, GatewayManager, MemberRequestOptions, Worker};
pub use resharding::{
    needs_resharding, next_shard_total, GuildRelocator, SessionInfo, SessionInfoProvider,
    SessionStartLimit,
};
