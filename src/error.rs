//! Error types for the wirebus client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur in client operations.
///
/// Timeouts, closed connections, and no-responders outcomes are distinct
/// variants so callers can always tell them apart. Errors detected inline
/// during an application call are returned from that call; errors detected on
/// background tasks are surfaced through the registered error callback and the
/// connection status only.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid argument or option detected at call time
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The reconnect pending buffer is full; the publish was rejected
    #[error("outbound buffer capacity exceeded: {0}")]
    BufferCapacity(String),

    /// Transport failures (connect refused/timed out, read/write failure)
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O errors from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected server operation; fatal to the current session
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the CONNECT handshake
    #[error("authorization error: {0}")]
    Authorization(String),

    /// A subscription exceeded its pending limits and dropped messages
    #[error("slow consumer on subscription {sid}: {dropped} messages dropped")]
    SlowConsumer {
        /// Subscription identifier
        sid: u64,
        /// Total messages dropped so far on this subscription
        dropped: u64,
    },

    /// A blocking call's deadline elapsed; the connection is still valid
    #[error("operation timed out")]
    Timeout,

    /// A request was published but nothing is subscribed to the subject
    #[error("no responders available for request")]
    NoResponders,

    /// The connection has been closed; all operations fail fast
    #[error("connection closed")]
    Closed,

    /// The connection is draining and no longer accepts new work
    #[error("connection draining")]
    Draining,

    /// Payload exceeds the server's negotiated maximum
    #[error("maximum payload exceeded: {size} > {max}")]
    MaxPayload {
        /// Attempted payload size in bytes
        size: usize,
        /// Negotiated server limit in bytes
        max: usize,
    },

    /// The subscription was unsubscribed or invalidated
    #[error("subscription closed")]
    SubscriptionClosed,

    /// The server pool is exhausted; no candidate endpoints remain
    #[error("no servers available for connection")]
    NoServers,

    /// Keepalive detected a half-open connection
    #[error("stale connection: {0} outstanding pings")]
    StaleConnection(u32),
}

impl ClientError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an authorization error
    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a buffer capacity error
    pub fn buffer_capacity(msg: impl Into<String>) -> Self {
        Self::BufferCapacity(msg.into())
    }

    /// Whether this error indicates the connection is permanently unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::NoServers)
    }
}
