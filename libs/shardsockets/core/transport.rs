//! Socket transport abstraction.
//!
//! The shard state machine never touches tungstenite directly; it talks to a
//! split sink/stream pair behind these traits. The default implementation is
//! tokio-tungstenite, and tests drive the state machine through an in-memory
//! transport instead of a network.

use crate::traits::{GatewayError, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// One outbound socket frame.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Inbound transport events delivered to a shard's reader task.
#[derive(Debug)]
pub enum WireEvent {
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed the socket; carries the close code when one arrived.
    Closed(Option<u16>),
}

/// Write half of an open socket.
#[async_trait]
pub trait ConnSink: Send {
    async fn send(&mut self, message: WireMessage) -> Result<()>;
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// Read half of an open socket.
#[async_trait]
pub trait ConnStream: Send {
    /// Next event from the socket; `None` once the transport is finished.
    async fn next_event(&mut self) -> Option<WireEvent>;
}

/// Factory opening sockets for shards.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(Box<dyn ConnSink>, Box<dyn ConnStream>)>;
}

/// Default transport backed by tokio-tungstenite.
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<(Box<dyn ConnSink>, Box<dyn ConnStream>)> {
        debug!(url, "opening websocket");
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| GatewayError::WebSocket(e.to_string()))?;
        let (write, read) = stream.split();
        Ok((
            Box::new(TungsteniteSink { write }),
            Box::new(TungsteniteStream { read }),
        ))
    }
}

struct TungsteniteSink {
    write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
}

#[async_trait]
impl ConnSink for TungsteniteSink {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        let frame = match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(bytes) => Message::Binary(bytes),
        };
        self.write
            .send(frame)
            .await
            .map_err(|e| GatewayError::WebSocket(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.write
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| GatewayError::WebSocket(e.to_string()))
    }
}

struct TungsteniteStream {
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

#[async_trait]
impl ConnStream for TungsteniteStream {
    async fn next_event(&mut self) -> Option<WireEvent> {
        while let Some(item) = self.read.next().await {
            match item {
                Ok(Message::Text(text)) => return Some(WireEvent::Text(text)),
                Ok(Message::Binary(bytes)) => return Some(WireEvent::Binary(bytes)),
                Ok(Message::Close(frame)) => {
                    return Some(WireEvent::Closed(frame.map(|f| u16::from(f.code))))
                }
                // pings and pongs are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "websocket read failed");
                    return Some(WireEvent::Closed(None));
                }
            }
        }
        None
    }
}
