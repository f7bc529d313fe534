//! AMQP broker client for the gateway.
//!
//! Provides:
//! - Topology descriptors loaded from JSON and declared at startup
//! - A single self-healing connection with unbounded retry
//! - Subscriptions that survive reconnects
//! - Publishing that waits for the link instead of failing fast
//! - An in-process transport for running without a broker (`memory` feature)

pub mod client;
pub mod error;
pub mod handler;
pub mod lapin_transport;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod topology;
pub mod transport;

pub use client::{BrokerClient, BrokerConfig, ConnectionState, DEFAULT_RECONNECT_DELAY};
pub use error::{AmqpError, Result};
pub use handler::MessageHandler;
pub use lapin_transport::{AmqpEndpoint, LapinTransport};
#[cfg(any(test, feature = "memory"))]
pub use memory::MemoryTransport;
pub use topology::{ExchangeKind, Topology};
pub use transport::{BrokerChannel, Consumer, DeliveryStream, Link, Transport};
