//! Live migration to a larger shard count.
//!
//! A second generation of shards identifies into a side map while the live
//! generation keeps serving traffic. The new shards relay only guild
//! ownership moves until the whole generation is ready; then the manager
//! atomically restores real handlers, cuts the old generation down to
//! member-chunk continuation, closes it with the resharded code and swaps
//! the live map.

use crate::core::protocol::{close_codes, dispatch, GatewayPayload};
use crate::manager::manager::GatewayManager;
use crate::traits::{EventHandler, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Hard ceiling of guilds one shard can hold before identifies are refused.
pub const MAX_GUILDS_PER_SHARD: u64 = 2_500;

/// The gateway recommends roughly one shard per this many guilds; used to
/// estimate the total guild count from its recommendation.
pub const GUILDS_PER_RECOMMENDED_SHARD: u64 = 1_000;

/// Session sizing info fetched from the remote API.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Recommended shard total.
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    pub max_concurrency: u32,
}

/// Source of [`SessionInfo`] for resharding decisions.
#[async_trait]
pub trait SessionInfoProvider: Send + Sync + 'static {
    async fn session_info(&self) -> Result<SessionInfo>;
}

/// Notified when a reshard moves guild ownership to a new shard.
pub trait GuildRelocator: Send + Sync + 'static {
    fn relocate(&self, guild_ids: Vec<u64>, new_shard_id: u32);
}

/// Whether the current topology is full enough to warrant growing.
pub fn needs_resharding(current_total: u32, info: &SessionInfo, threshold_percent: f64) -> bool {
    if current_total == 0 {
        return false;
    }
    let approximate_guilds = u64::from(info.shards) * GUILDS_PER_RECOMMENDED_SHARD;
    let capacity = u64::from(current_total) * MAX_GUILDS_PER_SHARD;
    let fill = approximate_guilds as f64 / capacity as f64 * 100.0;
    fill >= threshold_percent
}

/// Round a needed shard count up to a legal total: a multiple of
/// `max_concurrency`, or of 16 when `max_concurrency` is 1 to stay
/// compatible with future large-bot sharding requirements.
pub fn next_shard_total(needed: u32, max_concurrency: u32) -> u32 {
    let base = if max_concurrency <= 1 { 16 } else { max_concurrency };
    let blocks = (needed + base - 1) / base;
    blocks.max(1) * base
}

impl GatewayManager {
    /// Fetch session info and reshard when the fill heuristic says so.
    /// Returns whether a reshard ran.
    pub async fn check_resharding(
        self: &Arc<Self>,
        provider: &Arc<dyn SessionInfoProvider>,
    ) -> Result<bool> {
        let info = provider.session_info().await?;
        let current = self.total_shards();
        if !needs_resharding(current, &info, self.config.reshard_threshold_percent) {
            debug!(current, recommended = info.shards, "resharding not needed");
            return Ok(false);
        }
        let new_total = next_shard_total(info.shards, self.config.max_concurrency);
        if new_total <= current {
            return Ok(false);
        }
        self.reshard(new_total).await?;
        Ok(true)
    }

    /// Periodically run [`check_resharding`](Self::check_resharding).
    pub fn start_resharding_loop(
        self: &Arc<Self>,
        provider: Arc<dyn SessionInfoProvider>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = self.config.reshard_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match manager.check_resharding(&provider).await {
                    Ok(true) => info!("periodic reshard completed"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "resharding check failed"),
                }
            }
        })
    }

    /// Grow the topology to `new_total` shards without dropping the event
    /// stream.
    pub async fn reshard(self: &Arc<Self>, new_total: u32) -> Result<()> {
        let old_total = self.total_shards();
        info!(old_total, new_total, "resharding started");

        // the new generation gets its own bucket layout; the old generation
        // has already identified and holds no admissions
        self.prepare_buckets(0, new_total - 1);

        let relay: Arc<dyn EventHandler> = Arc::new(RelocationRelay {
            manager: Arc::downgrade(self),
        });
        let mut fresh = HashMap::new();
        for shard_id in 0..new_total {
            fresh.insert(
                shard_id,
                self.create_shard(shard_id, new_total, Arc::clone(&relay)),
            );
        }
        self.identify_generation(&fresh).await?;

        // every new shard is ready; switch generations
        let bridge = self.event_bridge();
        for shard in fresh.values() {
            shard.set_event_handler(Arc::clone(&bridge));
        }
        let old = self.live_shards();
        let continuation: Arc<dyn EventHandler> = Arc::new(ChunkContinuation {
            manager: Arc::downgrade(self),
        });
        for shard in &old {
            // in-flight member requests must still resolve on the old
            // generation; everything else is the new generation's job now
            shard.set_event_handler(Arc::clone(&continuation));
        }
        for shard in &old {
            if let Err(e) = shard.close(close_codes::RESHARDED, "resharded").await {
                warn!(shard_id = shard.id(), error = %e, "old shard close failed");
            }
        }
        self.replace_shards(fresh);
        self.set_total_shards(new_total);

        info!(new_total, "resharding complete");
        Ok(())
    }
}

/// Handler for a not-yet-switched generation: relays guild ownership to the
/// relocation callback and discards everything else so the two generations
/// never double-process business events.
struct RelocationRelay {
    manager: Weak<GatewayManager>,
}

impl RelocationRelay {
    fn relay(&self, guild_ids: Vec<u64>, shard_id: u32) {
        if guild_ids.is_empty() {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let relocator = manager.relocator.read().clone();
        if let Some(relocator) = relocator {
            relocator.relocate(guild_ids, shard_id);
        }
    }
}

#[async_trait]
impl EventHandler for RelocationRelay {
    async fn message(&self, shard_id: u32, payload: GatewayPayload) {
        match payload.t.as_deref() {
            Some(dispatch::GUILD_CREATE) => {
                if let Some(id) = parse_snowflake(payload.d.get("id")) {
                    self.relay(vec![id], shard_id);
                }
            }
            Some(dispatch::READY) => {
                let guild_ids = payload
                    .d
                    .get("guilds")
                    .and_then(Value::as_array)
                    .map(|guilds| {
                        guilds
                            .iter()
                            .filter_map(|guild| parse_snowflake(guild.get("id")))
                            .collect()
                    })
                    .unwrap_or_default();
                self.relay(guild_ids, shard_id);
            }
            _ => {}
        }
    }
}

/// Handler for a retired generation: keeps member-chunk correlation alive so
/// in-flight requests still resolve, discards everything else.
struct ChunkContinuation {
    manager: Weak<GatewayManager>,
}

#[async_trait]
impl EventHandler for ChunkContinuation {
    async fn message(&self, _shard_id: u32, payload: GatewayPayload) {
        if payload.t.as_deref() != Some(dispatch::GUILD_MEMBERS_CHUNK) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.observe_chunk(&payload);
        }
    }
}

fn parse_snowflake(value: Option<&Value>) -> Option<u64> {
    match value {
        Some(Value::String(text)) => text.parse().ok(),
        Some(Value::Number(number)) => number.as_u64(),
        _ => None,
    }
}
