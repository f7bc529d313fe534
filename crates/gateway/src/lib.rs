//! WebSocket gateway onto an AMQP broker.
//!
//! This service:
//! - Admits WebSocket clients on `/mqtt` after checking their credentials
//! - Keeps at most one live connection per client identity
//! - Forwards client publishes to the broker
//! - Routes broker deliveries back to the clients subscribed to each topic
//!
//! ## Architecture
//!
//! ```text
//! client ──frame──▶ DuplexConnection ──▶ session ──publish──▶ BrokerClient
//!                                           │                      │
//!                                   subscribe/unsubscribe     deliveries
//!                                           ▼                      ▼
//!                                   SubscriptionRouter ◀── InboundHandler
//!                                           │
//!                                           ▼
//!                                   DuplexConnection ──frame──▶ client
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod subscription;
pub mod ws_server;

pub use auth::{
    AuthMode, AuthOutcome, Authenticator, MysqlAuth, OpenAuth, RedisAccounts, TokenAuth,
};
pub use config::Config;
pub use connection::{ConnectionConfig, DuplexConnection, FrameSink, FrameSource};
pub use error::{GatewayError, Result};
pub use protocol::{Action, ControlMessage};
pub use registry::ConnectionRegistry;
pub use router::{InboundHandler, MessageRouter, RouterConfig};
pub use subscription::{DeliveryCallback, SubscriptionRouter};
pub use ws_server::{create_router, AppState};
