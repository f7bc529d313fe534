//! In-process broker transport.
//!
//! Implements the routing rules of the AMQP exchange types closely enough to
//! run the gateway without an external broker: named and server-named queues,
//! direct/fanout/headers/topic exchanges, queue and exchange bindings,
//! round-robin consumers and auto-acknowledged delivery. As on a real broker,
//! a consumer whose stream was dropped without a cancel keeps its share of
//! deliveries and those messages are lost. Links can be dropped
//! and the broker made unreachable on demand, which is what the reconnection
//! tests drive.

use crate::error::{AmqpError, Result};
use crate::topology::{routing_key_matches, ExchangeKind};
use crate::transport::{BrokerChannel, Consumer, Link, Transport};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type LinkId = u64;

struct ConsumerEntry {
    link: LinkId,
    tag: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct QueueState {
    /// Link that declared the queue exclusively.
    owner: Option<LinkId>,
    pending: VecDeque<Vec<u8>>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
    /// Deliveries acknowledged to consumers nobody was reading.
    lost: usize,
}

impl QueueState {
    fn push(&mut self, body: Vec<u8>) {
        if self.consumers.is_empty() {
            self.pending.push_back(body);
            return;
        }
        let idx = self.next_consumer % self.consumers.len();
        self.next_consumer = idx + 1;
        if self.consumers[idx].tx.send(body).is_err() {
            self.lost += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BindTarget {
    Queue(String),
    Exchange(String),
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<(BindTarget, String)>,
}

impl ExchangeState {
    fn accepts(&self, binding_key: &str, routing_key: &str) -> bool {
        match self.kind {
            ExchangeKind::Direct | ExchangeKind::Queue => binding_key == routing_key,
            ExchangeKind::Topic => routing_key_matches(binding_key, routing_key),
            ExchangeKind::Fanout | ExchangeKind::Headers => true,
        }
    }
}

struct LinkEntry {
    closed: Arc<AtomicBool>,
    notify: Option<oneshot::Sender<String>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    links: HashMap<LinkId, LinkEntry>,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let mut targets = HashSet::new();
        let mut seen = HashSet::new();
        self.collect_targets(exchange, routing_key, &mut targets, &mut seen)?;
        for queue in targets {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.push(body.to_vec());
            }
        }
        Ok(())
    }

    fn collect_targets(
        &self,
        exchange: &str,
        routing_key: &str,
        targets: &mut HashSet<String>,
        seen: &mut HashSet<String>,
    ) -> Result<()> {
        if !seen.insert(exchange.to_string()) {
            return Ok(());
        }
        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| AmqpError::UnknownDestination(exchange.to_string()))?;
        for (target, binding_key) in &state.bindings {
            if !state.accepts(binding_key, routing_key) {
                continue;
            }
            match target {
                BindTarget::Queue(queue) => {
                    targets.insert(queue.clone());
                }
                BindTarget::Exchange(next) => {
                    self.collect_targets(next, routing_key, targets, seen)?;
                }
            }
        }
        Ok(())
    }

    /// Drop everything a link owned: consumers and exclusive queues.
    fn release_link(&mut self, link: LinkId) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.link != link);
        }
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(link))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.queues.remove(&name);
            for exchange in self.exchanges.values_mut() {
                exchange
                    .bindings
                    .retain(|(target, _)| *target != BindTarget::Queue(name.clone()));
            }
        }
        if let Some(entry) = self.links.remove(&link) {
            entry.closed.store(true, Ordering::SeqCst);
        }
    }
}

struct MemoryBroker {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
    next_link: AtomicU64,
    next_queue: AtomicU64,
    next_consumer: AtomicU64,
    connects: AtomicUsize,
}

impl MemoryBroker {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process broker; clones share the same broker.
#[derive(Clone)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(MemoryBroker {
                state: Mutex::new(BrokerState::default()),
                reachable: AtomicBool::new(true),
                next_link: AtomicU64::new(1),
                next_queue: AtomicU64::new(1),
                next_consumer: AtomicU64::new(1),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Make subsequent dials succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.broker.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Drop every live link as if the broker connection was lost.
    pub fn drop_links(&self) {
        let mut state = self.broker.state();
        let ids: Vec<LinkId> = state.links.keys().copied().collect();
        for id in ids {
            let notify = state.links.get_mut(&id).and_then(|entry| entry.notify.take());
            state.release_link(id);
            if let Some(tx) = notify {
                let _ = tx.send("connection reset by broker".to_string());
            }
        }
    }

    /// Number of successful dials so far.
    pub fn connect_count(&self) -> usize {
        self.broker.connects.load(Ordering::SeqCst)
    }

    /// Number of live links.
    pub fn link_count(&self) -> usize {
        self.broker.state().links.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.broker.state().queues.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.broker.state().exchanges.get(name).map(|e| e.kind)
    }

    /// Consumers registered on a queue, read or not.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.broker
            .state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Deliveries that went to consumers whose stream had been dropped.
    pub fn lost(&self, queue: &str) -> usize {
        self.broker
            .state()
            .queues
            .get(queue)
            .map(|q| q.lost)
            .unwrap_or(0)
    }

    /// Messages waiting in a queue with no consumer.
    pub fn pending(&self, queue: &str) -> usize {
        self.broker
            .state()
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Link> {
        if !self.broker.reachable.load(Ordering::SeqCst) {
            return Err(AmqpError::LinkClosed("broker unreachable".to_string()));
        }
        let id = self.broker.next_link.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        self.broker.state().links.insert(
            id,
            LinkEntry {
                closed: closed.clone(),
                notify: Some(tx),
            },
        );
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        debug!("Memory broker link {} opened", id);
        Ok(Link {
            channel: Arc::new(MemoryChannel {
                broker: self.broker.clone(),
                link: id,
                closed,
            }),
            disconnected: rx,
        })
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    link: LinkId,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.broker.state();
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::LinkClosed(format!("link {}", self.link)));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String> {
        let mut state = self.open_state()?;
        let name = if name.is_empty() {
            let n = self.broker.next_queue.fetch_add(1, Ordering::SeqCst);
            format!("amq.gen-{}", n)
        } else {
            name.to_string()
        };
        let queue = state.queues.entry(name.clone()).or_default();
        if exclusive {
            queue.owner = Some(self.link);
        }
        Ok(name)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        if kind.is_queue() {
            return Err(AmqpError::InvalidTopologyKind(kind.to_string()));
        }
        let mut state = self.open_state()?;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(AmqpError::LinkClosed(format!(
                "exchange {} already declared as {}",
                name, existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::UnknownDestination(queue.to_string()));
        }
        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| AmqpError::UnknownDestination(exchange.to_string()))?;
        let binding = (BindTarget::Queue(queue.to_string()), routing_key.to_string());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(destination) {
            return Err(AmqpError::UnknownDestination(destination.to_string()));
        }
        let exchange = state
            .exchanges
            .get_mut(source)
            .ok_or_else(|| AmqpError::UnknownDestination(source.to_string()))?;
        let binding = (
            BindTarget::Exchange(destination.to_string()),
            routing_key.to_string(),
        );
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let mut state = self.open_state()?;
        if exchange.is_empty() {
            // Default exchange: unroutable messages are dropped.
            if let Some(queue) = state.queues.get_mut(routing_key) {
                queue.push(body.to_vec());
            }
            return Ok(());
        }
        state.route(exchange, routing_key, body)
    }

    async fn consume(&self, queue: &str) -> Result<Consumer> {
        let mut state = self.open_state()?;
        let queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::UnknownDestination(queue.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        for body in queue.pending.drain(..) {
            let _ = tx.send(body);
        }
        let tag = format!(
            "ctag-{}",
            self.broker.next_consumer.fetch_add(1, Ordering::SeqCst)
        );
        queue.consumers.push(ConsumerEntry {
            link: self.link,
            tag: tag.clone(),
            tx,
        });
        let deliveries = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|body| (body, rx))
        })
        .boxed();
        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.open_state()?;
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.tag != consumer_tag);
        }
        Ok(())
    }

    async fn close(&self) {
        self.broker.state().release_link(self.link);
    }
}
