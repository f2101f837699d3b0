//! Error types for natswire-client.

use thiserror::Error;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum NatsError {
    /// I/O error on the server socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (INFO and CONNECT bodies).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame received from the wire.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Error reported by the server with `-ERR`.
    #[error("Server error: {0}")]
    Protocol(String),

    /// Invalid subject, queue group, header or option supplied by the caller.
    #[error("Invalid argument: {0}")]
    Validation(String),

    /// Payload is larger than the server's advertised `max_payload`.
    #[error("Payload of {size} bytes exceeds server maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Headers were supplied but the server does not support them.
    #[error("Server does not support headers")]
    HeadersNotSupported,

    /// Outbound buffer is full.
    #[error("Outbound buffer full")]
    Capacity,

    /// Operation did not complete before its deadline.
    #[error("Operation timed out")]
    Timeout,

    /// Request deadline passed without a single reply.
    #[error("No replies received")]
    NoReplies,

    /// Server reported that nobody is subscribed to the request subject.
    #[error("No responders available for request")]
    NoResponders,

    /// Connection is draining; new publishes and subscriptions are refused.
    #[error("Connection is draining")]
    Drained,

    /// Connection closed, either explicitly or after reconnects were exhausted.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No subscription with the given sid.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),
}

impl NatsError {
    /// Whether this error ends the current socket session.
    ///
    /// Session-fatal errors make the supervisor reconnect; everything else is
    /// scoped to the call that produced it.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            NatsError::Io(_) | NatsError::Parse(_) | NatsError::Json(_)
        )
    }
}

/// Result type alias using NatsError.
pub type Result<T> = std::result::Result<T, NatsError>;
