//! Broker transport seam.
//!
//! The [`BrokerClient`](crate::BrokerClient) only needs a handful of broker
//! primitives: dial, declare, bind, publish, consume, cancel and a
//! disconnect notification. Implementations live in
//! [`crate::lapin_transport`] (AMQP) and `memory` (in-process, behind the
//! `memory` feature).

use crate::error::Result;
use crate::topology::ExchangeKind;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Stream of message bodies delivered to a consumer.
///
/// The stream ends when the underlying channel or connection goes away.
pub type DeliveryStream = BoxStream<'static, Vec<u8>>;

/// A started consumer: its broker-assigned tag plus the delivery stream.
pub struct Consumer {
    pub tag: String,
    pub deliveries: DeliveryStream,
}

/// Fires once when the link is lost; carries the reason.
///
/// A dropped sender is treated the same as a fired one.
pub type DisconnectNotice = oneshot::Receiver<String>;

/// A freshly dialed connection plus its open channel.
pub struct Link {
    pub channel: Arc<dyn BrokerChannel>,
    pub disconnected: DisconnectNotice,
}

/// Dials the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection and a channel on it.
    async fn connect(&self) -> Result<Link>;

    /// Address used in log lines (credentials stripped).
    fn describe(&self) -> String;
}

/// Operations on one open channel.
///
/// All declarations are idempotent for identical arguments.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare a queue. An empty name asks the broker for a server-named
    /// exclusive queue. Returns the queue's name.
    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String>;

    /// Declare a durable exchange of the given kind.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Bind a queue to an exchange with a routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Bind `destination` exchange to `source` exchange with a routing key.
    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str)
        -> Result<()>;

    /// Publish a body. An empty exchange name addresses a queue directly by
    /// routing key.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Start an auto-acknowledged consumer on a queue.
    async fn consume(&self, queue: &str) -> Result<Consumer>;

    /// Stop a consumer on the broker. Its delivery stream ends. Unknown tags
    /// are ignored.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Close the channel and its connection.
    async fn close(&self);
}
