//! Self-healing broker client.
//!
//! One [`BrokerClient`] owns the single logical connection to the broker. A
//! background supervisor watches the link's disconnect notice, tears the link
//! down, redials every `reconnect_delay` until it succeeds, and re-activates
//! every recorded subscription on the new channel before waking anyone blocked
//! in [`BrokerClient::publish`] or [`BrokerClient::subscribe_run`].
//!
//! ```text
//! disconnected ──dial──▶ connecting ──ok──▶ connected
//!      ▲                     │                  │
//!      └──────fail/sleep─────┘◀──disconnect─────┘
//! ```
//!
//! [`BrokerClient::close`] stops the supervisor for good.

use crate::error::{AmqpError, Result};
use crate::handler::MessageHandler;
use crate::topology::{binding_keys, ExchangeKind, Topology};
use crate::transport::{BrokerChannel, Consumer, DisconnectNotice, Transport};
use dashmap::DashMap;
use futures::StreamExt;
use metrics::{counter, gauge};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Configuration for the broker client.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Sleep between failed dials.
    pub reconnect_delay: Duration,
    /// Upper bound for waiting on a connected link. `None` waits forever.
    pub wait_limit: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            wait_limit: None,
        }
    }
}

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The live channel together with the dial it came from.
#[derive(Clone)]
struct ActiveLink {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

#[derive(Clone)]
enum LinkState {
    Disconnected,
    Connecting,
    Connected(ActiveLink),
}

/// Identifies a subscription across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    keys: Vec<String>,
    name: String,
}

/// A recorded subscription.
struct Subscription {
    name: String,
    kind: ExchangeKind,
    keys: Vec<String>,
    handler: Arc<dyn MessageHandler>,
    /// Generation of the link this subscription is consuming on (0 = none).
    active_on: AtomicU64,
    /// Stops this subscription's consumers when it is replaced or the client
    /// closes.
    cancel: CancellationToken,
}

/// Client owning the single logical broker connection.
pub struct BrokerClient {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    state: watch::Sender<LinkState>,
    generation: AtomicU64,
    subscriptions: DashMap<SubscriptionKey, Arc<Subscription>>,
    shutdown: CancellationToken,
}

impl BrokerClient {
    fn new(transport: Arc<dyn Transport>, config: BrokerConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            transport,
            config,
            state,
            generation: AtomicU64::new(0),
            subscriptions: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Connect, declare the topology and start the reconnection supervisor.
    ///
    /// A failure here means the broker was unreachable at startup; callers
    /// treat it as fatal.
    pub async fn init(
        transport: Arc<dyn Transport>,
        config: BrokerConfig,
        topology: &[Topology],
    ) -> Result<Arc<Self>> {
        let client = Arc::new(Self::new(transport, config));
        info!("Connecting to AMQP broker at {}", client.transport.describe());

        let link = client.transport.connect().await?;
        client.install(link.channel).await;

        for node in topology {
            client.init_exchange(node).await?;
        }

        tokio::spawn(client.clone().supervise(link.disconnected));
        info!("Connected to AMQP broker");
        Ok(client)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        if self.shutdown.is_cancelled() {
            return ConnectionState::Stopped;
        }
        match &*self.state.borrow() {
            LinkState::Disconnected => ConnectionState::Disconnected,
            LinkState::Connecting => ConnectionState::Connecting,
            LinkState::Connected(_) => ConnectionState::Connected,
        }
    }

    /// Number of recorded subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Wait until a link is up.
    ///
    /// Unbounded unless `wait_limit` is configured; fails with
    /// [`AmqpError::Stopped`] once the client is closed.
    pub async fn wait_connected(&self) -> Result<()> {
        self.active_link().await.map(|_| ())
    }

    async fn active_link(&self) -> Result<ActiveLink> {
        let mut rx = self.state.subscribe();
        let wait = async {
            tokio::select! {
                _ = self.shutdown.cancelled() => Err(AmqpError::Stopped),
                state = rx.wait_for(|s| matches!(s, LinkState::Connected(_))) => {
                    match state.as_deref() {
                        Ok(LinkState::Connected(link)) => Ok(link.clone()),
                        _ => Err(AmqpError::Stopped),
                    }
                }
            }
        };
        match self.config.wait_limit {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| AmqpError::NotConnected)?,
            None => wait.await,
        }
    }

    fn current_link(&self) -> Option<ActiveLink> {
        match &*self.state.borrow() {
            LinkState::Connected(link) => Some(link.clone()),
            _ => None,
        }
    }

    /// Declare a topology node and its children, binding each child to its
    /// parent with every one of the child's routing keys.
    pub async fn init_exchange(&self, node: &Topology) -> Result<()> {
        let link = self.active_link().await?;
        let channel = &link.channel;

        declare_node(channel, node).await?;
        let mut pending: Vec<&Topology> = vec![node];
        while let Some(parent) = pending.pop() {
            if parent.kind.is_queue() {
                if !parent.children.is_empty() {
                    warn!(
                        "Queue {} cannot have children; ignoring {} node(s)",
                        parent.name,
                        parent.children.len()
                    );
                }
                continue;
            }
            for child in &parent.children {
                declare_node(channel, child).await?;
                for key in child.binding_keys() {
                    if child.kind.is_queue() {
                        channel.bind_queue(&child.name, &parent.name, &key).await?;
                    } else {
                        channel.bind_exchange(&child.name, &parent.name, &key).await?;
                    }
                }
                debug!(
                    "Bound {} {} to {} with keys {:?}",
                    child.kind,
                    child.name,
                    parent.name,
                    child.binding_keys()
                );
                pending.push(child);
            }
        }
        info!("Topology {} ({}) declared", node.name, node.kind);
        Ok(())
    }

    /// Record a subscription and activate it right away if connected.
    ///
    /// The subscription is re-activated after every reconnect. Registering the
    /// same `(keys, name)` again replaces the previous handler.
    pub async fn subscribe(
        &self,
        name: &str,
        kind: ExchangeKind,
        handler: Arc<dyn MessageHandler>,
        keys: &[String],
    ) -> Result<()> {
        if name.is_empty() {
            return Err(AmqpError::EmptyName);
        }
        let keys = binding_keys(keys);
        let subscription = Arc::new(Subscription {
            name: name.to_string(),
            kind,
            keys: keys.clone(),
            handler,
            active_on: AtomicU64::new(0),
            cancel: self.shutdown.child_token(),
        });
        let key = SubscriptionKey {
            keys,
            name: name.to_string(),
        };
        if let Some(previous) = self.subscriptions.insert(key, subscription.clone()) {
            previous.cancel.cancel();
        }

        match self.current_link() {
            Some(link) => self.activate(&link, &subscription).await,
            None => {
                debug!("Broker disconnected; deferring subscription to {}", name);
                Ok(())
            }
        }
    }

    /// Wait for a link, then activate every recorded subscription.
    ///
    /// Activation errors are logged per subscription.
    pub async fn subscribe_run(&self) -> Result<()> {
        let link = self.active_link().await?;
        self.activate_all(&link).await;
        Ok(())
    }

    /// Publish a body.
    ///
    /// Queue kind publishes straight to the named queue; exchange kinds publish
    /// to the named exchange with `routing_key`. Waits for a link first and
    /// does not retry once the link is up.
    pub async fn publish(
        &self,
        name: &str,
        kind: ExchangeKind,
        routing_key: &str,
        body: &[u8],
    ) -> Result<()> {
        let link = self.active_link().await?;
        let channel = &link.channel;
        if kind.is_queue() {
            channel.declare_queue(name, false).await?;
            channel.publish("", name, body).await?;
        } else {
            channel.declare_exchange(name, kind).await?;
            channel.publish(name, routing_key, body).await?;
        }
        counter!("amqp_messages_published_total").increment(1);
        Ok(())
    }

    /// Stop reconnecting and close the live link.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.teardown().await;
        info!("AMQP client closed");
    }

    async fn supervise(self: Arc<Self>, mut disconnected: DisconnectNotice) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                reason = &mut disconnected => {
                    let reason = reason.unwrap_or_else(|_| "link dropped".to_string());
                    warn!("AMQP connection lost: {}", reason);
                    counter!("amqp_disconnects_total").increment(1);
                    self.teardown().await;
                }
            }

            match self.reconnect().await {
                Some(next) => disconnected = next,
                None => break,
            }
        }
        debug!("AMQP supervisor stopped");
    }

    /// Dial until a link comes up; `None` when the client was closed.
    async fn reconnect(&self) -> Option<DisconnectNotice> {
        let mut attempt: u64 = 1;
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            self.state.send_replace(LinkState::Connecting);
            info!(
                "[{}] Reconnecting to AMQP broker at {}",
                attempt,
                self.transport.describe()
            );
            match self.transport.connect().await {
                Ok(link) => {
                    counter!("amqp_reconnects_total").increment(1);
                    self.install(link.channel).await;
                    info!("AMQP broker reconnected after {} attempt(s)", attempt);
                    return Some(link.disconnected);
                }
                Err(e) => {
                    warn!(
                        "[{}] Failed to connect AMQP broker: {}. Retrying in {:?}",
                        attempt, e, self.config.reconnect_delay
                    );
                    self.state.send_replace(LinkState::Disconnected);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
            attempt += 1;
        }
    }

    /// Make `channel` the live link: re-run subscriptions, then wake waiters.
    async fn install(&self, channel: Arc<dyn BrokerChannel>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = ActiveLink {
            channel,
            generation,
        };

        self.activate_all(&link).await;
        self.state.send_replace(LinkState::Connected(link.clone()));
        gauge!("amqp_connected").set(1.0);
        // Catch subscriptions recorded while the link was being prepared.
        self.activate_all(&link).await;

        if self.shutdown.is_cancelled() {
            self.teardown().await;
        }
    }

    async fn teardown(&self) {
        let previous = self.state.send_replace(LinkState::Disconnected);
        gauge!("amqp_connected").set(0.0);
        if let LinkState::Connected(link) = previous {
            link.channel.close().await;
        }
    }

    async fn activate_all(&self, link: &ActiveLink) {
        let subscriptions: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for subscription in subscriptions {
            if let Err(e) = self.activate(link, &subscription).await {
                warn!(
                    "[subscribe] {} {} {:?}: {}",
                    subscription.kind, subscription.name, subscription.keys, e
                );
            }
        }
    }

    async fn activate(&self, link: &ActiveLink, subscription: &Arc<Subscription>) -> Result<()> {
        if subscription.cancel.is_cancelled() {
            return Ok(());
        }
        let previous = subscription
            .active_on
            .swap(link.generation, Ordering::SeqCst);
        if previous == link.generation {
            return Ok(());
        }

        match open_consumer(&link.channel, subscription).await {
            Ok(consumer) => {
                spawn_consumer(
                    subscription.clone(),
                    link.channel.clone(),
                    consumer,
                    self.shutdown.clone(),
                );
                info!(
                    "[subscribe] {} {} {:?}",
                    subscription.kind, subscription.name, subscription.keys
                );
                Ok(())
            }
            Err(e) => {
                let _ = subscription.active_on.compare_exchange(
                    link.generation,
                    previous,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                Err(e)
            }
        }
    }
}

async fn declare_node(channel: &Arc<dyn BrokerChannel>, node: &Topology) -> Result<()> {
    if node.kind.is_queue() {
        channel.declare_queue(&node.name, false).await?;
    } else {
        channel.declare_exchange(&node.name, node.kind).await?;
    }
    Ok(())
}

/// Declare what a subscription consumes from and start consuming.
async fn open_consumer(
    channel: &Arc<dyn BrokerChannel>,
    subscription: &Subscription,
) -> Result<Consumer> {
    let queue = if subscription.kind.is_queue() {
        channel.declare_queue(&subscription.name, false).await?
    } else {
        channel
            .declare_exchange(&subscription.name, subscription.kind)
            .await?;
        let queue = channel.declare_queue("", true).await?;
        for key in &subscription.keys {
            channel.bind_queue(&queue, &subscription.name, key).await?;
        }
        queue
    };
    channel.consume(&queue).await
}

/// Feed deliveries to the handler until the stream ends or the subscription
/// is cancelled. A replaced subscription also cancels its consumer on the
/// broker so the queue stops dispatching to it.
fn spawn_consumer(
    subscription: Arc<Subscription>,
    channel: Arc<dyn BrokerChannel>,
    consumer: Consumer,
    shutdown: CancellationToken,
) {
    let Consumer {
        tag,
        deliveries: mut stream,
    } = consumer;
    tokio::spawn(async move {
        let replaced = loop {
            tokio::select! {
                biased;
                _ = subscription.cancel.cancelled() => break !shutdown.is_cancelled(),
                delivery = stream.next() => match delivery {
                    Some(body) => {
                        counter!("amqp_messages_consumed_total").increment(1);
                        subscription.handler.handle(body).await;
                    }
                    None => break false,
                },
            }
        };
        drop(stream);
        if replaced {
            match channel.cancel(&tag).await {
                Ok(()) => debug!("Cancelled consumer {} on {}", tag, subscription.name),
                Err(e) => debug!("Cancel of consumer {} failed: {}", tag, e),
            }
        }
        debug!("Consumer for {} finished", subscription.name);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Collect(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, body: Vec<u8>) {
            let _ = self.0.send(body);
        }
    }

    fn collector() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Collect(tx)), rx)
    }

    fn fast_config() -> BrokerConfig {
        BrokerConfig {
            reconnect_delay: Duration::from_millis(10),
            wait_limit: None,
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("handler dropped")
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_init_declares_topology() {
        let transport = MemoryTransport::new();
        let topology = vec![Topology::new("events", ExchangeKind::Topic)
            .with_child(Topology::new("events.fan", ExchangeKind::Fanout).with_keys(["audit.#"]))
            .with_child(Topology::new("gateway.in", ExchangeKind::Queue).with_keys(["gw.*"]))];

        let client = BrokerClient::init(Arc::new(transport.clone()), fast_config(), &topology)
            .await
            .unwrap();

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(transport.exchange_kind("events"), Some(ExchangeKind::Topic));
        assert_eq!(transport.exchange_kind("events.fan"), Some(ExchangeKind::Fanout));
        assert!(transport.has_queue("gateway.in"));

        // Declaring again is a no-op.
        for node in &topology {
            client.init_exchange(node).await.unwrap();
        }

        // The queue child receives through its binding.
        client
            .publish("events", ExchangeKind::Topic, "gw.node1", b"routed")
            .await
            .unwrap();
        assert_eq!(transport.pending("gateway.in"), 1);
    }

    #[tokio::test]
    async fn test_init_fails_when_unreachable() {
        let transport = MemoryTransport::new();
        transport.set_reachable(false);
        let result = BrokerClient::init(Arc::new(transport), fast_config(), &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_queue_publish_reaches_subscriber() {
        let transport = MemoryTransport::new();
        let client = BrokerClient::init(Arc::new(transport.clone()), fast_config(), &[])
            .await
            .unwrap();
        let (handler, mut rx) = collector();

        client
            .subscribe("inbox", ExchangeKind::Queue, handler, &[])
            .await
            .unwrap();
        client.subscribe_run().await.unwrap();
        assert_eq!(transport.consumer_count("inbox"), 1);

        client
            .publish("inbox", ExchangeKind::Queue, "", b"first")
            .await
            .unwrap();
        client
            .publish("inbox", ExchangeKind::Queue, "", b"second")
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, b"first");
        assert_eq!(recv(&mut rx).await, b"second");
    }

    #[tokio::test]
    async fn test_exchange_subscription_binds_keys() {
        let transport = MemoryTransport::new();
        let client = BrokerClient::init(Arc::new(transport), fast_config(), &[])
            .await
            .unwrap();
        let (handler, mut rx) = collector();

        client
            .subscribe(
                "news",
                ExchangeKind::Direct,
                handler,
                &["sport".to_string(), "weather".to_string()],
            )
            .await
            .unwrap();

        client
            .publish("news", ExchangeKind::Direct, "politics", b"skip")
            .await
            .unwrap();
        client
            .publish("news", ExchangeKind::Direct, "weather", b"rain")
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, b"rain");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_empty_name() {
        let transport = MemoryTransport::new();
        let client = BrokerClient::init(Arc::new(transport), fast_config(), &[])
            .await
            .unwrap();
        let (handler, _rx) = collector();
        assert!(matches!(
            client.subscribe("", ExchangeKind::Queue, handler, &[]).await,
            Err(AmqpError::EmptyName)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes() {
        let transport = MemoryTransport::new();
        let client = BrokerClient::init(Arc::new(transport.clone()), fast_config(), &[])
            .await
            .unwrap();
        let (handler, mut rx) = collector();
        client
            .subscribe("inbox", ExchangeKind::Queue, handler, &[])
            .await
            .unwrap();

        transport.set_reachable(false);
        transport.drop_links();
        eventually(|| client.state() != ConnectionState::Connected).await;

        // Publishing blocks until the broker is back.
        let publisher = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .publish("inbox", ExchangeKind::Queue, "", b"after")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        transport.set_reachable(true);
        publisher.await.unwrap().unwrap();

        assert_eq!(recv(&mut rx).await, b"after");
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(transport.consumer_count("inbox"), 1);
        assert!(transport.connect_count() >= 2);
    }

    #[tokio::test]
    async fn test_subscription_recorded_while_disconnected_activates_later() {
        let transport = MemoryTransport::new();
        let client = BrokerClient::init(Arc::new(transport.clone()), fast_config(), &[])
            .await
            .unwrap();

        transport.set_reachable(false);
        transport.drop_links();
        eventually(|| client.state() != ConnectionState::Connected).await;

        let (handler, mut rx) = collector();
        client
            .subscribe("late", ExchangeKind::Queue, handler, &[])
            .await
            .unwrap();
        assert_eq!(client.subscription_count(), 1);

        transport.set_reachable(true);
        client.subscribe_run().await.unwrap();
        client
            .publish("late", ExchangeKind::Queue, "", b"hello")
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, b"hello");
        assert_eq!(transport.consumer_count("late"), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_handler() {
        let transport = MemoryTransport::new();
        let client = BrokerClient::init(Arc::new(transport.clone()), fast_config(), &[])
            .await
            .unwrap();
        let (old, mut old_rx) = collector();
        let (new, mut new_rx) = collector();

        client
            .subscribe("inbox", ExchangeKind::Queue, old, &[])
            .await
            .unwrap();
        client
            .subscribe("inbox", ExchangeKind::Queue, new, &[])
            .await
            .unwrap();
        assert_eq!(client.subscription_count(), 1);

        // The replaced consumer is cancelled on the broker, not just dropped.
        eventually(|| transport.consumer_count("inbox") == 1).await;
        for body in [b"1", b"2", b"3", b"4"] {
            client
                .publish("inbox", ExchangeKind::Queue, "", body)
                .await
                .unwrap();
        }
        for body in [b"1", b"2", b"3", b"4"] {
            assert_eq!(recv(&mut new_rx).await, body);
        }
        assert_eq!(transport.lost("inbox"), 0);
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_limit_bounds_publish() {
        let transport = MemoryTransport::new();
        let config = BrokerConfig {
            reconnect_delay: Duration::from_millis(10),
            wait_limit: Some(Duration::from_millis(50)),
        };
        let client = BrokerClient::init(Arc::new(transport.clone()), config, &[])
            .await
            .unwrap();

        transport.set_reachable(false);
        transport.drop_links();
        eventually(|| client.state() != ConnectionState::Connected).await;

        assert!(matches!(
            client.publish("inbox", ExchangeKind::Queue, "", b"x").await,
            Err(AmqpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_stops_reconnecting() {
        let transport = MemoryTransport::new();
        let client = BrokerClient::init(Arc::new(transport.clone()), fast_config(), &[])
            .await
            .unwrap();

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Stopped);
        assert_eq!(transport.link_count(), 0);

        transport.drop_links();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connect_count(), 1);

        assert!(matches!(
            client.publish("inbox", ExchangeKind::Queue, "", b"x").await,
            Err(AmqpError::Stopped)
        ));
    }
}
