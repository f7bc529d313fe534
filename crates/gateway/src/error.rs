//! Gateway error types.

use amqp_client::AmqpError;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Operation on a connection that has already been torn down.
    #[error("connection closed")]
    ConnectionClosed,

    /// Another live connection already holds this client identity.
    #[error("client already registered: {0}")]
    AlreadyRegistered(String),

    /// No live connection for this client identity.
    #[error("client not registered: {0}")]
    NotRegistered(String),

    /// Missing or malformed configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker client error.
    #[error("broker error: {0}")]
    Broker(#[from] AmqpError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Redis backend error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// MySQL backend error.
    #[error("MySQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Token signing or verification error.
    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
