//! Multi-shard orchestration: identify admission pacing, command routing,
//! member-request correlation and the reshard switch.

use crate::core::bucket::LeakyBucket;
use crate::core::connection_state::ShardState;
use crate::core::protocol::{dispatch, opcodes, GatewayPayload};
use crate::core::shard::Shard;
use crate::core::transport::{Transport, TungsteniteTransport};
use crate::manager::config::{GatewayConfig, WorkerAssignment};
use crate::manager::resharding;
use crate::traits::{
    EventHandler, GatewayError, IdentifyGate, NoPresence, PresenceProvider, Result,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// A batching unit inside one concurrency bucket; decides identify order,
/// not threading.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: u32,
    /// Ordered shard ids this worker identifies.
    pub queue: Vec<u32>,
}

/// One identify admission slot (`shard_id % max_concurrency == index`).
#[derive(Clone)]
pub struct ConcurrencyBucket {
    pub index: u32,
    /// One permit, refilled once per spawn delay: the minimum legal spacing
    /// between identifies sharing this slot.
    pub bucket: Arc<LeakyBucket>,
    pub workers: Vec<Worker>,
}

/// Options for a guild-member request.
#[derive(Debug, Clone, Default)]
pub struct MemberRequestOptions {
    pub query: Option<String>,
    pub limit: u32,
    pub presences: bool,
    pub user_ids: Vec<u64>,
}

struct PendingMemberRequest {
    members: Vec<Value>,
    done: oneshot::Sender<Vec<Value>>,
}

type ShardMap = HashMap<u32, Arc<Shard>>;

/// Owns the shard topology and paces identifies against the gateway's
/// `max_concurrency` constraint.
pub struct GatewayManager {
    pub(crate) config: GatewayConfig,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventHandler>,
    presence: RwLock<Arc<dyn PresenceProvider>>,
    pub(crate) relocator: RwLock<Option<Arc<dyn resharding::GuildRelocator>>>,
    shards: RwLock<ShardMap>,
    buckets: Arc<RwLock<HashMap<u32, ConcurrencyBucket>>>,
    pending_members: Mutex<HashMap<String, PendingMemberRequest>>,
    /// Live shard total; grows when a reshard switch completes.
    total_shards: AtomicU32,
}

impl GatewayManager {
    /// Create a manager using the default tokio-tungstenite transport.
    pub fn new(config: GatewayConfig, events: Arc<dyn EventHandler>) -> Arc<Self> {
        Self::with_transport(config, events, Arc::new(TungsteniteTransport))
    }

    /// Create a manager with a custom socket transport.
    pub fn with_transport(
        config: GatewayConfig,
        events: Arc<dyn EventHandler>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let total = config.total_shards;
        Arc::new(Self {
            config,
            transport,
            events,
            presence: RwLock::new(Arc::new(NoPresence)),
            relocator: RwLock::new(None),
            shards: RwLock::new(HashMap::new()),
            buckets: Arc::new(RwLock::new(HashMap::new())),
            pending_members: Mutex::new(HashMap::new()),
            total_shards: AtomicU32::new(total),
        })
    }

    /// Install the presence hook used for identify payloads.
    pub fn set_presence_provider(&self, provider: Arc<dyn PresenceProvider>) {
        *self.presence.write() = provider;
    }

    /// Install the callback notified when a reshard moves guilds.
    pub fn set_guild_relocator(&self, relocator: Arc<dyn resharding::GuildRelocator>) {
        *self.relocator.write() = Some(relocator);
    }

    /// The gateway's mandated sharding formula; bit-exact, and a single
    /// shard always owns everything.
    pub fn calculate_shard_id(entity_id: u64, total_shards: u32) -> u32 {
        if total_shards == 1 {
            return 0;
        }
        ((entity_id >> 22) % u64::from(total_shards)) as u32
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards.load(Ordering::Acquire)
    }

    pub(crate) fn set_total_shards(&self, total: u32) {
        self.total_shards.store(total, Ordering::Release);
    }

    pub fn shard(&self, shard_id: u32) -> Option<Arc<Shard>> {
        self.shards.read().get(&shard_id).cloned()
    }

    /// Connection state of every live shard.
    pub fn shard_states(&self) -> HashMap<u32, ShardState> {
        self.shards
            .read()
            .iter()
            .map(|(id, shard)| (*id, shard.state()))
            .collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Acquire one identify admission for a shard's concurrency slot.
    pub async fn request_identify(&self, shard_id: u32) {
        let bucket = {
            let index = shard_id % self.config.max_concurrency.max(1);
            self.buckets
                .read()
                .get(&index)
                .map(|bucket| Arc::clone(&bucket.bucket))
        };
        if let Some(bucket) = bucket {
            bucket.acquire(false).await;
        }
    }

    /// Build buckets and workers for the shard range `[first, last]`.
    pub(crate) fn prepare_buckets(&self, first_shard_id: u32, last_shard_id: u32) {
        let max_concurrency = self.config.max_concurrency.max(1);
        let mut map = HashMap::new();
        for index in 0..max_concurrency {
            let ids: Vec<u32> = (first_shard_id..=last_shard_id)
                .filter(|id| id % max_concurrency == index)
                .collect();
            let workers = partition_workers(&ids, self.config.worker_assignment);
            map.insert(
                index,
                ConcurrencyBucket {
                    index,
                    bucket: LeakyBucket::new(1, 1, self.config.spawn_shard_delay),
                    workers,
                },
            );
        }
        *self.buckets.write() = map;
    }

    pub(crate) fn create_shard(
        self: &Arc<Self>,
        shard_id: u32,
        total_shards: u32,
        events: Arc<dyn EventHandler>,
    ) -> Arc<Shard> {
        let gate: Arc<dyn IdentifyGate> = Arc::new(BucketGate {
            buckets: Arc::clone(&self.buckets),
            max_concurrency: self.config.max_concurrency.max(1),
        });
        Shard::new(
            shard_id,
            self.config.shard_config(total_shards),
            Arc::clone(&self.transport),
            events,
            gate,
            Arc::clone(&self.presence.read()),
        )
    }

    pub(crate) fn event_bridge(self: &Arc<Self>) -> Arc<dyn EventHandler> {
        Arc::new(ShardEventBridge {
            inner: Arc::clone(&self.events),
            manager: Arc::downgrade(self),
        })
    }

    /// Create every configured shard and identify them all, buckets in
    /// parallel, shards within one bucket at the configured spacing.
    pub async fn spawn_shards(self: &Arc<Self>) -> Result<()> {
        let first = self.config.first_shard_id;
        let last = self.config.last_shard_id;
        let total = self.config.total_shards;
        info!(first, last, total, "spawning shards");

        self.prepare_buckets(first, last);
        let bridge = self.event_bridge();
        {
            let mut shards = self.shards.write();
            for shard_id in first..=last {
                shards.insert(shard_id, self.create_shard(shard_id, total, Arc::clone(&bridge)));
            }
        }
        let snapshot = self.shards.read().clone();
        self.identify_generation(&snapshot).await
    }

    /// Identify every shard of `generation`, draining each bucket's workers
    /// sequentially while buckets advance in parallel.
    pub(crate) async fn identify_generation(self: &Arc<Self>, generation: &ShardMap) -> Result<()> {
        let buckets: Vec<ConcurrencyBucket> = self.buckets.read().values().cloned().collect();
        let mut handles = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            let shards: HashMap<u32, Arc<Shard>> = bucket
                .workers
                .iter()
                .flat_map(|worker| worker.queue.iter())
                .filter_map(|id| generation.get(id).map(|shard| (*id, Arc::clone(shard))))
                .collect();
            handles.push(tokio::spawn(async move {
                for worker in &bucket.workers {
                    for shard_id in &worker.queue {
                        let Some(shard) = shards.get(shard_id) else {
                            continue;
                        };
                        debug!(shard_id, bucket = bucket.index, worker = worker.id, "identifying");
                        if let Err(e) = shard.identify().await {
                            error!(shard_id, error = %e, "identify failed");
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Send a payload on a specific shard; errors when no connection exists
    /// for that id.
    pub async fn send_payload(
        &self,
        shard_id: u32,
        payload: GatewayPayload,
        high_priority: bool,
    ) -> Result<()> {
        let shard = self
            .shard(shard_id)
            .ok_or(GatewayError::ShardNotFound(shard_id))?;
        shard.send(payload, high_priority).await
    }

    /// Join, move or leave a voice channel in a guild.
    pub async fn update_voice_state(
        &self,
        guild_id: u64,
        channel_id: Option<u64>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        let shard_id = Self::calculate_shard_id(guild_id, self.total_shards());
        let payload = GatewayPayload::op(
            opcodes::VOICE_STATE_UPDATE,
            json!({
                "guild_id": guild_id.to_string(),
                "channel_id": channel_id.map(|id| id.to_string()),
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        );
        self.send_payload(shard_id, payload, false).await
    }

    /// Update the presence advertised on one shard.
    pub async fn update_presence(&self, shard_id: u32, presence: Value) -> Result<()> {
        self.send_payload(shard_id, GatewayPayload::op(opcodes::PRESENCE_UPDATE, presence), false)
            .await
    }

    /// Request soundboard sounds for a set of guilds, one request per owning
    /// shard.
    pub async fn request_soundboard_sounds(&self, guild_ids: &[u64]) -> Result<()> {
        let total = self.total_shards();
        let mut by_shard: HashMap<u32, Vec<String>> = HashMap::new();
        for guild_id in guild_ids {
            by_shard
                .entry(Self::calculate_shard_id(*guild_id, total))
                .or_default()
                .push(guild_id.to_string());
        }
        for (shard_id, ids) in by_shard {
            let payload = GatewayPayload::op(
                opcodes::REQUEST_SOUNDBOARD_SOUNDS,
                json!({ "guild_ids": ids }),
            );
            self.send_payload(shard_id, payload, false).await?;
        }
        Ok(())
    }

    /// Fetch guild members through the owning shard. With response
    /// collection enabled the returned vec holds every member from every
    /// chunk; otherwise it is empty and chunks flow only to the event
    /// handler.
    pub async fn request_guild_members(
        &self,
        guild_id: u64,
        options: MemberRequestOptions,
    ) -> Result<Vec<Value>> {
        let shard_id = Self::calculate_shard_id(guild_id, self.total_shards());
        let mut d = json!({
            "guild_id": guild_id.to_string(),
            "limit": options.limit,
        });
        if options.user_ids.is_empty() {
            d["query"] = Value::String(options.query.unwrap_or_default());
        } else {
            d["user_ids"] = Value::Array(
                options
                    .user_ids
                    .iter()
                    .map(|id| Value::String(id.to_string()))
                    .collect(),
            );
        }
        if options.presences {
            d["presences"] = Value::Bool(true);
        }

        let pending = if self.config.collect_member_responses {
            let (nonce, rx) = self.register_member_request();
            d["nonce"] = Value::String(nonce.clone());
            Some((nonce, rx))
        } else {
            None
        };

        let payload = GatewayPayload::op(opcodes::REQUEST_GUILD_MEMBERS, d);
        if let Err(e) = self.send_payload(shard_id, payload, false).await {
            if let Some((nonce, _)) = &pending {
                self.pending_members.lock().remove(nonce);
            }
            return Err(e);
        }

        match pending {
            Some((_, rx)) => rx.await.map_err(|_| {
                GatewayError::ConnectionClosed("member request dropped before completion".into())
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Reserve a fresh nonce, collision-checked against in-flight requests.
    fn register_member_request(&self) -> (String, oneshot::Receiver<Vec<Value>>) {
        let mut pending = self.pending_members.lock();
        loop {
            let nonce: String = thread_rng()
                .sample_iter(&Alphanumeric)
                .take(16)
                .map(char::from)
                .collect();
            if pending.contains_key(&nonce) {
                continue;
            }
            let (done, rx) = oneshot::channel();
            pending.insert(
                nonce.clone(),
                PendingMemberRequest {
                    members: Vec::new(),
                    done,
                },
            );
            return (nonce, rx);
        }
    }

    /// Feed a dispatch into member-request correlation. Resolves a pending
    /// request only when the terminating chunk of its nonce arrives.
    pub(crate) fn observe_chunk(&self, payload: &GatewayPayload) {
        if payload.t.as_deref() != Some(dispatch::GUILD_MEMBERS_CHUNK) {
            return;
        }
        let Some(nonce) = payload.d.get("nonce").and_then(Value::as_str) else {
            return;
        };
        let mut pending = self.pending_members.lock();
        let Some(entry) = pending.get_mut(nonce) else {
            return;
        };
        if let Some(members) = payload.d.get("members").and_then(Value::as_array) {
            entry.members.extend(members.iter().cloned());
        }
        let index = payload.d.get("chunk_index").and_then(Value::as_u64).unwrap_or(0);
        let count = payload.d.get("chunk_count").and_then(Value::as_u64).unwrap_or(1);
        if index + 1 >= count {
            let nonce = nonce.to_owned();
            if let Some(entry) = pending.remove(&nonce) {
                let _ = entry.done.send(entry.members);
            }
        }
    }

    /// Replace the live shard map; returns the previous generation.
    pub(crate) fn replace_shards(&self, generation: ShardMap) -> ShardMap {
        let mut shards = self.shards.write();
        std::mem::replace(&mut *shards, generation)
    }

    pub(crate) fn live_shards(&self) -> Vec<Arc<Shard>> {
        self.shards.read().values().cloned().collect()
    }

    /// Shut down every shard permanently.
    pub async fn shutdown(&self) {
        info!("shutting down all shards");
        for shard in self.live_shards() {
            if let Err(e) = shard.shutdown().await {
                warn!(shard_id = shard.id(), error = %e, "shard shutdown failed");
            }
        }
    }
}

/// Identify gate backed by the manager's concurrency buckets.
struct BucketGate {
    buckets: Arc<RwLock<HashMap<u32, ConcurrencyBucket>>>,
    max_concurrency: u32,
}

#[async_trait]
impl IdentifyGate for BucketGate {
    async fn wait_for_identify(&self, shard_id: u32) {
        let bucket = {
            self.buckets
                .read()
                .get(&(shard_id % self.max_concurrency))
                .map(|bucket| Arc::clone(&bucket.bucket))
        };
        if let Some(bucket) = bucket {
            bucket.acquire(false).await;
        }
    }
}

/// Handler wrapped around the application's handler for live shards: feeds
/// member-chunk correlation, then forwards everything.
pub(crate) struct ShardEventBridge {
    pub(crate) inner: Arc<dyn EventHandler>,
    pub(crate) manager: Weak<GatewayManager>,
}

#[async_trait]
impl EventHandler for ShardEventBridge {
    async fn connecting(&self, shard_id: u32) {
        self.inner.connecting(shard_id).await;
    }

    async fn connected(&self, shard_id: u32) {
        self.inner.connected(shard_id).await;
    }

    async fn identifying(&self, shard_id: u32) {
        self.inner.identifying(shard_id).await;
    }

    async fn disconnected(&self, shard_id: u32, code: Option<u16>) {
        self.inner.disconnected(shard_id, code).await;
    }

    async fn hello(&self, shard_id: u32, heartbeat_interval: u64) {
        self.inner.hello(shard_id, heartbeat_interval).await;
    }

    async fn heartbeat(&self, shard_id: u32) {
        self.inner.heartbeat(shard_id).await;
    }

    async fn heartbeat_ack(&self, shard_id: u32, rtt: std::time::Duration) {
        self.inner.heartbeat_ack(shard_id, rtt).await;
    }

    async fn requested_reconnect(&self, shard_id: u32) {
        self.inner.requested_reconnect(shard_id).await;
    }

    async fn invalid_session(&self, shard_id: u32, resumable: bool) {
        self.inner.invalid_session(shard_id, resumable).await;
    }

    async fn resumed(&self, shard_id: u32) {
        self.inner.resumed(shard_id).await;
    }

    async fn ready(&self, shard_id: u32) {
        self.inner.ready(shard_id).await;
    }

    async fn message(&self, shard_id: u32, payload: GatewayPayload) {
        if let Some(manager) = self.manager.upgrade() {
            manager.observe_chunk(&payload);
        }
        self.inner.message(shard_id, payload).await;
    }
}

/// Split one bucket's ordered shard ids into workers.
fn partition_workers(shard_ids: &[u32], assignment: WorkerAssignment) -> Vec<Worker> {
    match assignment {
        WorkerAssignment::RoundRobin { workers } => {
            let count = workers.max(1) as usize;
            let mut out: Vec<Worker> = (0..count)
                .map(|id| Worker {
                    id: id as u32,
                    queue: Vec::new(),
                })
                .collect();
            for (i, shard_id) in shard_ids.iter().enumerate() {
                out[i % count].queue.push(*shard_id);
            }
            out.retain(|worker| !worker.queue.is_empty());
            out
        }
        WorkerAssignment::Contiguous { shards_per_worker } => {
            let size = shards_per_worker.max(1) as usize;
            shard_ids
                .chunks(size)
                .enumerate()
                .map(|(id, chunk)| Worker {
                    id: id as u32,
                    queue: chunk.to_vec(),
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_shard_owns_every_entity() {
        assert_eq!(GatewayManager::calculate_shard_id(176_635_011_554_918_402, 1), 0);
        assert_eq!(GatewayManager::calculate_shard_id(0, 1), 0);
    }

    #[test]
    fn sharding_formula_is_bit_exact() {
        let entity_id: u64 = 176_635_011_554_918_402;
        let expected = ((entity_id >> 22) % 4) as u32;
        assert_eq!(GatewayManager::calculate_shard_id(entity_id, 4), expected);
        assert_eq!(
            GatewayManager::calculate_shard_id(entity_id, 16),
            ((entity_id >> 22) % 16) as u32
        );
    }

    #[test]
    fn round_robin_deals_shards_evenly() {
        let ids = [0, 4, 8, 12, 16];
        let workers = partition_workers(&ids, WorkerAssignment::RoundRobin { workers: 2 });
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].queue, vec![0, 8, 16]);
        assert_eq!(workers[1].queue, vec![4, 12]);
    }

    #[test]
    fn contiguous_blocks_preserve_order() {
        let ids = [1, 3, 5, 7, 9];
        let workers = partition_workers(&ids, WorkerAssignment::Contiguous { shards_per_worker: 2 });
        assert_eq!(workers.len(), 3);
        assert_eq!(workers[0].queue, vec![1, 3]);
        assert_eq!(workers[1].queue, vec![5, 7]);
        assert_eq!(workers[2].queue, vec![9]);
    }

    #[test]
    fn empty_workers_are_dropped() {
        let ids = [2];
        let workers = partition_workers(&ids, WorkerAssignment::RoundRobin { workers: 4 });
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].queue, vec![2]);
    }
}
