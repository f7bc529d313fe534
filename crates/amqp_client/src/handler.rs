//! Message handler trait for broker subscriptions.

use async_trait::async_trait;

/// Trait that subscribers implement to receive broker deliveries.
///
/// The consumption task calls [`handle`](MessageHandler::handle) once per
/// delivered message, sequentially, in broker order. A slow handler holds back
/// the rest of that subscription's deliveries.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Called with the raw body of each delivered message.
    async fn handle(&self, body: Vec<u8>);
}
