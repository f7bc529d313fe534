//! Broker bridge: client publishes out, broker deliveries back in.
//!
//! ```text
//! client publish ──▶ MessageRouter::publish ──▶ RABBITMQ_PUBLISH_TOPIC
//!
//! RABBITMQ_SUBSCRIBE_TOPIC ──▶ InboundHandler ──▶ SubscriptionRouter::dispatch
//!                                                        │
//!                                                        ▼
//!                                             DuplexConnection::send
//! ```

use crate::error::Result;
use crate::protocol::ControlMessage;
use crate::subscription::SubscriptionRouter;
use amqp_client::{BrokerClient, ExchangeKind, MessageHandler};
use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info};

/// Broker destinations used by the gateway.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Queue that client publishes are sent to.
    pub publish_topic: String,
    /// Queue the gateway consumes deliveries from.
    pub subscribe_topic: String,
}

/// Connects the subscription table to the broker.
pub struct MessageRouter {
    broker: Arc<BrokerClient>,
    subscriptions: Arc<SubscriptionRouter>,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(
        broker: Arc<BrokerClient>,
        subscriptions: Arc<SubscriptionRouter>,
        config: RouterConfig,
    ) -> Self {
        Self {
            broker,
            subscriptions,
            config,
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRouter> {
        &self.subscriptions
    }

    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    /// Register the inbound consumer and activate it once the broker is up.
    pub async fn start(&self) -> Result<()> {
        let handler = Arc::new(InboundHandler {
            subscriptions: self.subscriptions.clone(),
        });
        self.broker
            .subscribe(&self.config.subscribe_topic, ExchangeKind::Queue, handler, &[])
            .await?;
        self.broker.subscribe_run().await?;
        info!(
            "Routing broker deliveries from queue {}",
            self.config.subscribe_topic
        );
        Ok(())
    }

    /// Forward a stamped client message to the outbound queue.
    pub async fn publish(&self, msg: &ControlMessage) -> Result<()> {
        let body = msg.to_bytes()?;
        self.broker
            .publish(&self.config.publish_topic, ExchangeKind::Queue, "", &body)
            .await?;
        counter!("gateway_publishes_total").increment(1);
        Ok(())
    }
}

/// Fans inbound broker messages out through the subscription table.
pub struct InboundHandler {
    subscriptions: Arc<SubscriptionRouter>,
}

impl InboundHandler {
    pub fn new(subscriptions: Arc<SubscriptionRouter>) -> Self {
        Self { subscriptions }
    }
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn handle(&self, body: Vec<u8>) {
        let msg = match ControlMessage::parse(&body) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping unparseable broker message: {}", e);
                counter!("gateway_broker_messages_dropped_total").increment(1);
                return;
            }
        };
        let client_id = msg.client_id.as_deref().unwrap_or_default();
        let delivered = self
            .subscriptions
            .dispatch(msg.topic(), client_id, Bytes::from(body))
            .await;
        counter!("gateway_deliveries_total").increment(delivered as u64);
    }
}
