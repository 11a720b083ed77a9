//! Shared test utilities: an in-memory transport for deterministic
//! state-machine tests and a mock gateway server speaking the real protocol
//! over a local socket.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shardsockets::core::transport::{ConnSink, ConnStream, Transport, WireEvent, WireMessage};
use shardsockets::{
    GatewayError, NoPresence, NoopGate, NoopHandler, Shard, ShardConfig, ShardState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};

// =============================================================================
// In-memory transport
// =============================================================================

/// Test-side handle for one fake connection.
pub struct FakeConn {
    /// Frames the shard wrote to this socket.
    pub sent: mpsc::UnboundedReceiver<WireMessage>,
    /// Inject inbound events (payloads, closures) into the shard's reader.
    pub events: mpsc::UnboundedSender<WireEvent>,
}

impl FakeConn {
    /// Deliver a gateway payload to the shard.
    pub fn deliver(&self, payload: Value) {
        let _ = self.events.send(WireEvent::Text(payload.to_string()));
    }

    /// Close the connection from the server side.
    pub fn close(&self, code: u16) {
        let _ = self.events.send(WireEvent::Closed(Some(code)));
    }

    /// Next frame the shard sent, parsed as JSON.
    pub async fn next_sent(&mut self) -> Value {
        match self.sent.recv().await.expect("socket closed with no frame") {
            WireMessage::Text(text) => serde_json::from_str(&text).expect("non-JSON frame"),
            WireMessage::Binary(_) => panic!("unexpected binary frame"),
        }
    }
}

/// Transport handing every `connect` call a fresh channel-backed socket and
/// pushing its test-side handle to the receiver returned by `new`.
pub struct FakeTransport {
    handles: Mutex<mpsc::UnboundedSender<FakeConn>>,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeConn>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                handles: Mutex::new(tx),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        _url: &str,
    ) -> shardsockets::Result<(Box<dyn ConnSink>, Box<dyn ConnStream>)> {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.handles
            .lock()
            .send(FakeConn {
                sent: sent_rx,
                events: event_tx.clone(),
            })
            .map_err(|_| GatewayError::WebSocket("test dropped the transport".into()))?;
        Ok((
            Box::new(FakeSink {
                sent: sent_tx,
                events: event_tx,
            }),
            Box::new(FakeStream { events: event_rx }),
        ))
    }
}

struct FakeSink {
    sent: mpsc::UnboundedSender<WireMessage>,
    events: mpsc::UnboundedSender<WireEvent>,
}

#[async_trait]
impl ConnSink for FakeSink {
    async fn send(&mut self, message: WireMessage) -> shardsockets::Result<()> {
        self.sent
            .send(message)
            .map_err(|_| GatewayError::WebSocket("fake socket closed".into()))
    }

    async fn close(&mut self, code: u16, _reason: &str) -> shardsockets::Result<()> {
        // behave like a well-mannered peer echoing the close frame at once
        let _ = self.events.send(WireEvent::Closed(Some(code)));
        Ok(())
    }
}

struct FakeStream {
    events: mpsc::UnboundedReceiver<WireEvent>,
}

#[async_trait]
impl ConnStream for FakeStream {
    async fn next_event(&mut self) -> Option<WireEvent> {
        self.events.recv().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// A standalone shard with no-op hooks on the given transport.
pub fn test_shard(transport: Arc<FakeTransport>) -> Arc<Shard> {
    Shard::new(
        0,
        ShardConfig::new("test-token", 0),
        transport,
        Arc::new(NoopHandler),
        Arc::new(NoopGate),
        Arc::new(NoPresence),
    )
}

/// Poll until the shard reaches `state` or a generous timeout expires.
pub async fn wait_for_state(shard: &Arc<Shard>, state: ShardState) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while shard.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "shard never reached {:?}, still {:?}",
            state,
            shard.state()
        )
    });
}

/// Poll until `check` passes or a generous timeout expires.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A READY dispatch carrying the given session id.
pub fn ready_payload(session_id: &str, seq: u64) -> Value {
    json!({
        "op": 0,
        "s": seq,
        "t": "READY",
        "d": {
            "session_id": session_id,
            "resume_gateway_url": "wss://resume.test",
            "guilds": [],
        },
    })
}

// =============================================================================
// Mock gateway server
// =============================================================================

/// Mock gateway speaking the wire protocol over a real local socket:
/// hello on connect, READY for identify, RESUMED for resume, acks for
/// heartbeats and chunked replies for member requests.
pub struct MockGatewayServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    /// Every payload any connection received, in arrival order.
    pub received: Arc<Mutex<Vec<Value>>>,
}

impl MockGatewayServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let received = Arc::new(Mutex::new(Vec::new()));

        let shutdown_task = Arc::clone(&shutdown);
        let received_task = Arc::clone(&received);
        tokio::spawn(async move {
            let mut session_counter = 0u64;
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        session_counter += 1;
                        let received = Arc::clone(&received_task);
                        let session_id = format!("mock-session-{session_counter}");
                        tokio::spawn(async move {
                            Self::handle_connection(stream, session_id, received).await;
                        });
                    }
                    _ = shutdown_task.notified() => break,
                }
            }
        });

        Self {
            addr,
            shutdown,
            received,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Payloads received so far with the given opcode.
    pub fn received_ops(&self, op: u64) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter(|payload| payload["op"] == op)
            .cloned()
            .collect()
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        session_id: String,
        received: Arc<Mutex<Vec<Value>>>,
    ) {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::accept_async;
        use tokio_tungstenite::tungstenite::Message;

        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(_) => return,
        };
        let (mut write, mut read) = ws_stream.split();

        let hello = json!({"op": 10, "d": {"heartbeat_interval": 45000}, "s": null, "t": null});
        if write.send(Message::Text(hello.to_string())).await.is_err() {
            return;
        }

        let mut seq = 0u64;
        while let Some(Ok(message)) = read.next().await {
            let Message::Text(text) = message else {
                if matches!(message, Message::Close(_)) {
                    break;
                }
                continue;
            };
            let Ok(payload) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            received.lock().push(payload.clone());

            let reply = match payload["op"].as_u64() {
                Some(1) => vec![json!({"op": 11, "d": null, "s": null, "t": null})],
                Some(2) => {
                    seq += 1;
                    vec![json!({
                        "op": 0,
                        "s": seq,
                        "t": "READY",
                        "d": {"session_id": session_id, "resume_gateway_url": null, "guilds": []},
                    })]
                }
                Some(6) => {
                    seq += 1;
                    vec![json!({"op": 0, "s": seq, "t": "RESUMED", "d": null})]
                }
                Some(8) => {
                    let nonce = payload["d"]["nonce"].clone();
                    let guild_id = payload["d"]["guild_id"].clone();
                    (0..2)
                        .map(|index| {
                            seq += 1;
                            json!({
                                "op": 0,
                                "s": seq,
                                "t": "GUILD_MEMBERS_CHUNK",
                                "d": {
                                    "guild_id": guild_id,
                                    "members": [{"user": {"id": format!("user-{index}")}}],
                                    "chunk_index": index,
                                    "chunk_count": 2,
                                    "nonce": nonce,
                                },
                            })
                        })
                        .collect()
                }
                _ => Vec::new(),
            };
            for payload in reply {
                if write.send(Message::Text(payload.to_string())).await.is_err() {
                    return;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockGatewayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
