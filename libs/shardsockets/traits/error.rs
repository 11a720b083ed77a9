use thiserror::Error;

/// Main error type for shardsockets
#[derive(Error, Debug)]
pub enum GatewayError {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection closed unexpectedly
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The gateway rejected the token
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The gateway rejected the shard id or shard count
    #[error("Invalid shard: {0}")]
    InvalidShard(String),

    /// The session needs more shards than were configured
    #[error("Sharding required by the gateway")]
    ShardingRequired,

    /// The negotiated API version is not supported
    #[error("Invalid API version")]
    InvalidApiVersion,

    /// Invalid or disallowed gateway intents
    #[error("Intents rejected: {0}")]
    Intents(String),

    /// Streaming or payload decompression failed
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Payload could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// No connection exists for the requested shard id
    #[error("No connection for shard {0}")]
    ShardNotFound(u32),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for shardsockets operations
pub type Result<T> = std::result::Result<T, GatewayError>;
