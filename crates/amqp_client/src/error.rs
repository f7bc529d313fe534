//! Broker client error types.

use thiserror::Error;

/// Broker client error type.
#[derive(Debug, Error)]
pub enum AmqpError {
    /// Error reported by the AMQP library.
    #[error("AMQP error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Topology file or descriptor could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Topology file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Topology kind outside of queue/direct/fanout/headers/topic.
    #[error("invalid topology kind `{0}`")]
    InvalidTopologyKind(String),

    /// Subscription registered without a destination name.
    #[error("subscription name is empty")]
    EmptyName,

    /// The broker did not become reachable within the configured wait limit.
    #[error("broker not connected")]
    NotConnected,

    /// The client was closed and will not reconnect.
    #[error("broker client stopped")]
    Stopped,

    /// Operation attempted on a link that has already been torn down.
    #[error("broker link closed: {0}")]
    LinkClosed(String),

    /// Destination referenced before it was declared.
    #[error("unknown destination: {0}")]
    UnknownDestination(String),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, AmqpError>;
