//! One gateway connection slot: socket lifecycle, session resumption,
//! heartbeating, rate-limited sends and close-code recovery.
//!
//! A shard is created once per shard id and never reused for another id. At
//! most one live socket exists per shard at any instant: every reconnect path
//! waits for the previous socket to report fully closed before opening a new
//! one.

use crate::core::bucket::LeakyBucket;
use crate::core::compression::{self, Decompressor, TransportCompression};
use crate::core::config::{safe_requests_per_tick, ShardConfig, RATE_LIMIT_RESET_INTERVAL};
use crate::core::connection_state::{AtomicShardState, ShardState};
use crate::core::heartbeat::{first_beat_delay, HeartbeatState, DEFAULT_HEARTBEAT_INTERVAL};
use crate::core::protocol::{
    self, close_codes, dispatch, gateway_close, opcodes, ClosePolicy, GatewayPayload, ReadyData,
};
use crate::core::transport::{ConnStream, ConnSink, Transport, WireEvent, WireMessage};
use crate::traits::{EventHandler, GatewayError, IdentifyGate, PresenceProvider, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info, warn};

/// Stored session-resumption state.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub session_id: Option<String>,
    /// Last received sequence number. `0` is valid; only an explicit reset on
    /// re-identify clears it.
    pub sequence: Option<u64>,
    pub resume_url: Option<String>,
}

struct QueuedSend {
    payload: GatewayPayload,
    high_priority: bool,
    done: oneshot::Sender<Result<()>>,
}

/// One logical connection to the gateway.
pub struct Shard {
    id: u32,
    config: ShardConfig,
    transport: Arc<dyn Transport>,
    state: AtomicShardState,
    session: Mutex<Session>,
    heart: Mutex<HeartbeatState>,
    /// Sends parked while the session is not ready, strict FIFO.
    queue: Mutex<VecDeque<QueuedSend>>,
    /// Outbound rate limiter; swapped wholesale once the real heartbeat
    /// interval is known, migrating queued waiters.
    send_bucket: Mutex<Arc<LeakyBucket>>,
    socket: AsyncMutex<Option<Box<dyn ConnSink>>>,
    closed_rx: Mutex<Option<watch::Receiver<bool>>>,
    /// Monotonic id of the newest reader task; stale readers must not drive
    /// close recovery.
    reader_generation: AtomicU64,
    /// Set only by a locally requested 1000/1001 close; suppresses the
    /// auto-resume those codes would otherwise trigger.
    going_offline: AtomicBool,
    /// Close code this side last asked for; stands in when the peer drops
    /// the stream without echoing a close frame.
    requested_close: Mutex<Option<u16>>,
    /// Alternates resume/identify recovery so a bad session cannot cause an
    /// endless resume loop.
    last_attempt_was_resume: AtomicBool,
    events: RwLock<Arc<dyn EventHandler>>,
    identify_gate: RwLock<Arc<dyn IdentifyGate>>,
    presence: RwLock<Arc<dyn PresenceProvider>>,
    /// Signalled by READY, RESUMED and invalid-session to resolve a pending
    /// identify() or resume() call.
    resolve: Notify,
}

impl Shard {
    /// Create a shard. Must run inside a tokio runtime (the send bucket's
    /// refill task is spawned immediately).
    pub fn new(
        id: u32,
        config: ShardConfig,
        transport: Arc<dyn Transport>,
        events: Arc<dyn EventHandler>,
        identify_gate: Arc<dyn IdentifyGate>,
        presence: Arc<dyn PresenceProvider>,
    ) -> Arc<Self> {
        let config = config.normalize();
        let initial = safe_requests_per_tick(DEFAULT_HEARTBEAT_INTERVAL);
        Arc::new(Self {
            id,
            config,
            transport,
            state: AtomicShardState::default(),
            session: Mutex::new(Session::default()),
            heart: Mutex::new(HeartbeatState::new()),
            queue: Mutex::new(VecDeque::new()),
            send_bucket: Mutex::new(LeakyBucket::new(
                initial,
                initial,
                RATE_LIMIT_RESET_INTERVAL,
            )),
            socket: AsyncMutex::new(None),
            closed_rx: Mutex::new(None),
            reader_generation: AtomicU64::new(0),
            going_offline: AtomicBool::new(false),
            requested_close: Mutex::new(None),
            last_attempt_was_resume: AtomicBool::new(false),
            events: RwLock::new(events),
            identify_gate: RwLock::new(identify_gate),
            presence: RwLock::new(presence),
            resolve: Notify::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ShardState {
        self.state.get()
    }

    /// Snapshot of the stored session-resumption state.
    pub fn session(&self) -> Session {
        self.session.lock().clone()
    }

    /// Last measured heartbeat round-trip time.
    pub fn latency(&self) -> Option<Duration> {
        self.heart.lock().rtt
    }

    /// Replace the event handler; the manager does this during resharding.
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.events.write() = handler;
    }

    pub fn set_identify_gate(&self, gate: Arc<dyn IdentifyGate>) {
        *self.identify_gate.write() = gate;
    }

    pub fn set_presence_provider(&self, provider: Arc<dyn PresenceProvider>) {
        *self.presence.write() = provider;
    }

    fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.events.read())
    }

    fn bucket(&self) -> Arc<LeakyBucket> {
        Arc::clone(&self.send_bucket.lock())
    }

    async fn socket_open(&self) -> bool {
        self.socket.lock().await.is_some()
    }

    fn connection_url(&self) -> String {
        let base = {
            let session = self.session.lock();
            session
                .resume_url
                .clone()
                .unwrap_or_else(|| self.config.url.clone())
        };
        let mut url = format!(
            "{}/?v={}&encoding=json",
            base.trim_end_matches('/'),
            self.config.version
        );
        if let Some(value) = self.config.compression.query_value() {
            url.push_str("&compress=");
            url.push_str(value);
        }
        url
    }

    /// Open the socket. Sends neither identify nor resume.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.going_offline.store(false, Ordering::SeqCst);
        *self.requested_close.lock() = None;
        let previous = self.state.get();
        let handshaking = matches!(previous, ShardState::Identifying | ShardState::Resuming);
        if !handshaking {
            self.state.set(ShardState::Connecting);
        }
        self.handler().connecting(self.id).await;

        let url = self.connection_url();
        let (sink, stream) = self.transport.connect(&url).await?;
        {
            let mut socket = self.socket.lock().await;
            *socket = Some(sink);
        }
        self.spawn_reader(stream);

        if !handshaking {
            self.state.set(ShardState::Unidentified);
        }
        self.handler().connected(self.id).await;
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>, mut stream: Box<dyn ConnStream>) {
        let (closed_tx, closed_rx) = watch::channel(false);
        *self.closed_rx.lock() = Some(closed_rx);
        let generation = self.reader_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shard = Arc::clone(self);
        tokio::spawn(async move {
            let mut decoder = Decompressor::new(shard.config.compression);
            let mut close_code: Option<u16> = None;
            while let Some(event) = stream.next_event().await {
                match event {
                    WireEvent::Text(text) => match serde_json::from_str::<GatewayPayload>(&text) {
                        Ok(payload) => shard.handle_packet(payload).await,
                        Err(e) => {
                            warn!(shard_id = shard.id, error = %e, "undecodable gateway frame")
                        }
                    },
                    WireEvent::Binary(bytes) => {
                        let decoded = if shard.config.compression != TransportCompression::None {
                            decoder.feed(&bytes)
                        } else if shard.config.payload_compression {
                            compression::inflate_payload(&bytes).map(Some)
                        } else {
                            Err(GatewayError::Configuration(
                                "binary frame received but no decompression context exists".into(),
                            ))
                        };
                        match decoded {
                            Ok(Some(value)) => {
                                match serde_json::from_value::<GatewayPayload>(value) {
                                    Ok(payload) => shard.handle_packet(payload).await,
                                    Err(e) => warn!(
                                        shard_id = shard.id,
                                        error = %e,
                                        "payload did not match the gateway envelope"
                                    ),
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                // the frame is lost; the connection stays up
                                error!(
                                    shard_id = shard.id,
                                    error = %e,
                                    "dropping undecodable binary frame"
                                );
                            }
                        }
                    }
                    WireEvent::Closed(code) => {
                        close_code = code;
                        break;
                    }
                }
            }
            // only the newest reader drives recovery; a superseded socket's
            // close must not race the live connection
            if shard.reader_generation.load(Ordering::SeqCst) == generation {
                if let Err(e) = shard.handle_close(close_code).await {
                    error!(shard_id = shard.id, error = %e, "shard failed fatally");
                }
            }
            let _ = closed_tx.send(true);
        });
    }

    /// Close the socket and wait until the transport actually reports closed.
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        if code == gateway_close::NORMAL || code == gateway_close::GOING_AWAY {
            self.going_offline.store(true, Ordering::SeqCst);
        }
        *self.requested_close.lock() = Some(code);
        let rx = {
            let mut socket = self.socket.lock().await;
            let Some(sink) = socket.as_mut() else {
                return Ok(());
            };
            if let Err(e) = sink.close(code, reason).await {
                debug!(shard_id = self.id, error = %e, "close frame could not be sent");
            }
            *socket = None;
            self.closed_rx.lock().clone()
        };
        if let Some(mut rx) = rx {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Planned, permanent close. The shard settles in `Offline` and will not
    /// reconnect until asked to.
    pub async fn shutdown(&self) -> Result<()> {
        self.going_offline.store(true, Ordering::SeqCst);
        // fail queued sends instead of leaving their callers parked forever
        self.queue.lock().clear();
        self.close(close_codes::SHUTDOWN, "shutting down").await?;
        self.state.set(ShardState::Offline);
        Ok(())
    }

    /// Start a brand-new session, waiting on the identify admission gate.
    pub async fn identify(self: &Arc<Self>) -> Result<()> {
        self.identify_with(false).await
    }

    /// Start a brand-new session; `bypass_admission` skips the gate.
    pub async fn identify_with(self: &Arc<Self>, bypass_admission: bool) -> Result<()> {
        if self.socket_open().await {
            // wait out the old socket completely so its close handling
            // cannot race the new connection attempt
            self.close(close_codes::REIDENTIFYING, "re-identifying").await?;
        }
        self.state.set(ShardState::Identifying);
        self.handler().identifying(self.id).await;

        if !bypass_admission {
            let gate = Arc::clone(&self.identify_gate.read());
            gate.wait_for_identify(self.id).await;
        }
        if !self.socket_open().await {
            self.connect().await?;
        }
        {
            // a fresh identify starts a brand-new session
            let mut session = self.session.lock();
            session.session_id = None;
            session.sequence = None;
        }
        let presence = self.presence.read().clone().make_presence(self.id);
        let payload = protocol::identify_payload(&self.config, self.id, presence);

        let notified = self.resolve.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.send_raw(payload).await?;
        // resolved by READY, or by an invalid session, which during identify
        // is expected and non-fatal
        notified.await;
        Ok(())
    }

    /// Re-attach to the stored session; falls back to `identify` when no
    /// session id is stored.
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        if self.socket_open().await {
            self.close(close_codes::RESUME_SUPERSEDED, "resuming").await?;
        }
        let (session_id, seq) = {
            let session = self.session.lock();
            (session.session_id.clone(), session.sequence)
        };
        let Some(session_id) = session_id else {
            debug!(shard_id = self.id, "no session to resume; identifying instead");
            return self.identify().await;
        };
        self.state.set(ShardState::Resuming);
        self.connect().await?;
        let payload = protocol::resume_payload(&self.config.token, &session_id, seq);

        let notified = self.resolve.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.send_raw(payload).await?;
        notified.await;
        Ok(())
    }

    /// Send a payload, waiting behind the offline queue and the per-shard
    /// rate limiter. High-priority sends jump both lines.
    pub async fn send(&self, payload: GatewayPayload, high_priority: bool) -> Result<()> {
        if !self.state.get().is_ready() {
            let (done, rx) = oneshot::channel();
            let queued = QueuedSend {
                payload,
                high_priority,
                done,
            };
            {
                let mut queue = self.queue.lock();
                if high_priority {
                    queue.push_front(queued);
                } else {
                    queue.push_back(queued);
                }
            }
            return rx.await.unwrap_or_else(|_| {
                Err(GatewayError::ConnectionClosed(
                    "shard went away before the queued send".into(),
                ))
            });
        }
        self.bucket().acquire(high_priority).await;
        self.send_raw(payload).await
    }

    async fn send_raw(&self, payload: GatewayPayload) -> Result<()> {
        let text =
            serde_json::to_string(&payload).map_err(|e| GatewayError::Parse(e.to_string()))?;
        let mut socket = self.socket.lock().await;
        match socket.as_mut() {
            Some(sink) => sink.send(WireMessage::Text(text)).await,
            None => Err(GatewayError::ConnectionClosed("socket is not open".into())),
        }
    }

    /// Replay parked sends in order. Runs on its own task after READY or
    /// RESUMED so slow bucket waits never stall the reader.
    async fn flush_queue(&self) {
        loop {
            let next = { self.queue.lock().pop_front() };
            let Some(item) = next else {
                break;
            };
            self.bucket().acquire(item.high_priority).await;
            let result = self.send_raw(item.payload).await;
            let _ = item.done.send(result);
            if !self.state.get().is_ready() {
                break;
            }
        }
    }

    fn start_heartbeating(self: &Arc<Self>, interval: Duration) {
        let epoch = self.heart.lock().start(interval);
        // the safe send budget depends on the heartbeat interval; swap the
        // bucket now, carrying queued waiters over
        self.swap_send_bucket(interval);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(first_beat_delay(interval)).await;
            loop {
                let Some(shard) = weak.upgrade() else {
                    return;
                };
                let zombied = {
                    let heart = shard.heart.lock();
                    if heart.epoch != epoch {
                        return;
                    }
                    !heart.acked
                };
                if zombied {
                    warn!(
                        shard_id = shard.id,
                        "previous heartbeat unacknowledged; closing zombied connection"
                    );
                    let _ = shard.close(close_codes::ZOMBIE, "zombied connection").await;
                    return;
                }
                shard.beat().await;
                drop(shard);
                tokio::time::sleep(interval).await;
            }
        });
    }

    async fn beat(&self) {
        let seq = self.session.lock().sequence;
        self.heart.lock().record_beat();
        self.handler().heartbeat(self.id).await;
        // heartbeats skip the send bucket; the budget reserves room for them
        if let Err(e) = self.send_raw(protocol::heartbeat_payload(seq)).await {
            debug!(shard_id = self.id, error = %e, "heartbeat could not be sent");
        }
    }

    fn swap_send_bucket(&self, heartbeat_interval: Duration) {
        let safe = safe_requests_per_tick(heartbeat_interval);
        let fresh = LeakyBucket::new(safe, safe, RATE_LIMIT_RESET_INTERVAL);
        let old = {
            let mut bucket = self.send_bucket.lock();
            std::mem::replace(&mut *bucket, Arc::clone(&fresh))
        };
        // waiters parked on the old bucket keep their place in line
        fresh.migrate_from(&old);
    }

    /// Process one decoded gateway packet.
    pub async fn handle_packet(self: &Arc<Self>, payload: GatewayPayload) {
        // some gateways answer a heartbeat with a data event instead of an
        // explicit ack; any inbound traffic proves the connection is alive
        self.heart.lock().acked = true;

        match payload.op {
            opcodes::HEARTBEAT => {
                // the gateway demanded an immediate beat
                self.beat().await;
            }
            opcodes::HELLO => match payload.d.get("heartbeat_interval").and_then(Value::as_u64) {
                Some(ms) => {
                    self.handler().hello(self.id, ms).await;
                    self.start_heartbeating(Duration::from_millis(ms));
                }
                None => warn!(shard_id = self.id, "hello without a heartbeat interval"),
            },
            opcodes::HEARTBEAT_ACK => {
                let rtt = self.heart.lock().record_ack();
                self.handler()
                    .heartbeat_ack(self.id, rtt.unwrap_or_default())
                    .await;
            }
            opcodes::RECONNECT => {
                self.handler().requested_reconnect(self.id).await;
                let shard = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = shard.resume().await {
                        warn!(shard_id = shard.id, error = %e, "requested reconnect failed");
                    }
                });
            }
            opcodes::INVALID_SESSION => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                warn!(shard_id = self.id, resumable, "session invalidated by the gateway");
                self.handler().invalid_session(self.id, resumable).await;
                // release a pending identify()/resume() without error
                self.resolve.notify_waiters();
                let shard = Arc::clone(self);
                tokio::spawn(async move {
                    let result = if resumable {
                        shard.resume().await
                    } else {
                        shard.identify().await
                    };
                    if let Err(e) = result {
                        warn!(shard_id = shard.id, error = %e, "recovery after invalid session failed");
                    }
                });
            }
            _ => {}
        }

        match payload.t.as_deref() {
            Some(dispatch::READY) => {
                match serde_json::from_value::<ReadyData>(payload.d.clone()) {
                    Ok(ready) => {
                        let mut session = self.session.lock();
                        session.session_id = Some(ready.session_id);
                        if let Some(url) = ready.resume_gateway_url {
                            session.resume_url = Some(url);
                        }
                    }
                    Err(e) => {
                        warn!(shard_id = self.id, error = %e, "READY without session fields")
                    }
                }
                self.state.set(ShardState::Connected);
                self.last_attempt_was_resume.store(false, Ordering::SeqCst);
                info!(shard_id = self.id, "shard ready");
                self.resolve.notify_waiters();
                self.handler().ready(self.id).await;
                let shard = Arc::clone(self);
                tokio::spawn(async move { shard.flush_queue().await });
            }
            Some(dispatch::RESUMED) => {
                self.state.set(ShardState::Connected);
                self.last_attempt_was_resume.store(false, Ordering::SeqCst);
                info!(shard_id = self.id, "session resumed");
                self.resolve.notify_waiters();
                self.handler().resumed(self.id).await;
                let shard = Arc::clone(self);
                tokio::spawn(async move { shard.flush_queue().await });
            }
            _ => {}
        }

        if let Some(seq) = payload.s {
            // 0 is a valid sequence; only a null leaves the stored one alone
            self.session.lock().sequence = Some(seq);
        }

        self.handler().message(self.id, payload).await;
    }

    /// Dispatch a socket closure into the recovery state machine.
    pub async fn handle_close(self: &Arc<Self>, code: Option<u16>) -> Result<()> {
        // heartbeat timers never outlive a socket; the decompression context
        // already died with the reader that owned it
        self.heart.lock().clear();
        {
            let mut socket = self.socket.lock().await;
            *socket = None;
        }

        let code_value = code
            .or_else(|| *self.requested_close.lock())
            .unwrap_or(gateway_close::UNKNOWN_ERROR);
        let going_offline = self.going_offline.load(Ordering::SeqCst);
        let policy = protocol::classify_close(code_value, going_offline);
        debug!(shard_id = self.id, code = ?code, ?policy, "socket closed");
        self.handler().disconnected(self.id, code).await;

        match policy {
            ClosePolicy::Settle => {
                self.state.set(ShardState::Disconnected);
                Ok(())
            }
            ClosePolicy::Fatal => {
                self.state.set(ShardState::Offline);
                let err = protocol::fatal_error(code_value);
                error!(shard_id = self.id, code = code_value, error = %err, "fatal close; not reconnecting");
                Err(err)
            }
            ClosePolicy::Reidentify => {
                self.state.set(ShardState::Identifying);
                self.last_attempt_was_resume.store(false, Ordering::SeqCst);
                let shard = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = shard.identify().await {
                        warn!(shard_id = shard.id, error = %e, "re-identify after close failed");
                    }
                });
                Ok(())
            }
            ClosePolicy::Resume => {
                if self.last_attempt_was_resume.load(Ordering::SeqCst) {
                    // the previous attempt was already a resume; identify
                    // instead so a dead session cannot loop forever
                    self.last_attempt_was_resume.store(false, Ordering::SeqCst);
                    self.state.set(ShardState::Identifying);
                    let shard = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = shard.identify().await {
                            warn!(shard_id = shard.id, error = %e, "identify after close failed");
                        }
                    });
                } else {
                    self.last_attempt_was_resume.store(true, Ordering::SeqCst);
                    self.state.set(ShardState::Resuming);
                    let shard = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = shard.resume().await {
                            warn!(shard_id = shard.id, error = %e, "resume after close failed");
                        }
                    });
                }
                Ok(())
            }
        }
    }
}
