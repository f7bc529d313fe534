//! Topic subscription routing table.
//!
//! Maps topic → client identity → delivery callback. Broker messages addressed
//! to `(topic, client)` reach exactly that callback; messages addressed to
//! `(topic, "*")` reach every callback under the topic.

use crate::protocol::BROADCAST_CLIENT;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Delivers a raw broker payload to one client.
pub type DeliveryCallback = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Topic-keyed table of per-client delivery callbacks.
#[derive(Default)]
pub struct SubscriptionRouter {
    topics: DashMap<String, HashMap<String, DeliveryCallback>>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the callback for `(topic, client_id)`.
    pub fn add_subscription(&self, topic: &str, client_id: &str, callback: DeliveryCallback) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(client_id.to_string(), callback);
        debug!("Client {} subscribed to {:?}", client_id, topic);
    }

    pub fn remove_subscription(&self, topic: &str, client_id: &str) {
        let removed = self
            .topics
            .get_mut(topic)
            .and_then(|mut clients| clients.remove(client_id));
        if removed.is_some() {
            self.topics.remove_if(topic, |_, clients| clients.is_empty());
            debug!("Client {} unsubscribed from {:?}", client_id, topic);
        }
    }

    /// Drop every subscription held by `client_id`.
    pub fn remove_client(&self, client_id: &str) {
        self.topics.retain(|_, clients| {
            clients.remove(client_id);
            !clients.is_empty()
        });
    }

    /// Deliver `raw` to the callbacks addressed by `(topic, client_id)`.
    ///
    /// Returns how many callbacks were invoked.
    pub async fn dispatch(&self, topic: &str, client_id: &str, raw: Bytes) -> usize {
        let targets: Vec<DeliveryCallback> = match self.topics.get(topic) {
            Some(clients) if client_id == BROADCAST_CLIENT => clients.values().cloned().collect(),
            Some(clients) => clients.get(client_id).cloned().into_iter().collect(),
            None => Vec::new(),
        };

        let delivered = targets.len();
        match targets.as_slice() {
            [] => debug!("No subscriber for {:?} / {}", topic, client_id),
            [single] => single(raw).await,
            many => {
                join_all(many.iter().map(|callback| callback(raw.clone()))).await;
            }
        }
        delivered
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.topics.iter().map(|entry| entry.value().len()).sum()
    }
}
