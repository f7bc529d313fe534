//! Per-connection control-message handling.
//!
//! Runs after the WebSocket upgrade: claims the client identity, then turns
//! each inbound frame into a publish, subscribe or unsubscribe until the
//! connection closes. On exit every trace of the client is removed.

use crate::connection::DuplexConnection;
use crate::protocol::{Action, ControlMessage};
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::subscription::DeliveryCallback;
use bytes::Bytes;
use futures::FutureExt;
use metrics::counter;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Serve one admitted client until its connection closes.
pub async fn serve_client(
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    client_id: String,
    conn: Arc<DuplexConnection>,
) {
    if let Err(e) = registry.register(&client_id, conn.clone()) {
        info!("Rejecting connection: {}", e);
        counter!("gateway_connections_rejected_total").increment(1);
        conn.close();
        return;
    }
    counter!("gateway_connections_total").increment(1);
    info!("Client {} connected", client_id);

    while let Ok(frame) = conn.receive().await {
        let mut msg = match ControlMessage::parse(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping malformed frame from {}: {}", client_id, e);
                counter!("gateway_malformed_frames_total").increment(1);
                continue;
            }
        };
        msg.stamp(&client_id);

        match msg.action {
            Action::Publish => {
                if let Err(e) = router.publish(&msg).await {
                    warn!("Publish from {} failed: {}", client_id, e);
                    break;
                }
            }
            Action::Subscribe => {
                router.subscriptions().add_subscription(
                    msg.topic(),
                    &client_id,
                    deliver_to(&conn),
                );
            }
            Action::Unsubscribe => {
                router
                    .subscriptions()
                    .remove_subscription(msg.topic(), &client_id);
            }
            Action::Heartbeat | Action::Unknown => {}
        }
    }

    router.subscriptions().remove_client(&client_id);
    registry.unregister_connection(&client_id, &conn);
    counter!("gateway_disconnections_total").increment(1);
    info!("Client {} disconnected", client_id);
}

/// Callback writing raw broker payloads onto `conn`.
fn deliver_to(conn: &Arc<DuplexConnection>) -> DeliveryCallback {
    let conn: Weak<DuplexConnection> = Arc::downgrade(conn);
    Arc::new(move |raw: Bytes| {
        let conn = conn.clone();
        async move {
            if let Some(conn) = conn.upgrade() {
                if let Err(e) = conn.send(raw).await {
                    debug!("Delivery to {} dropped: {}", conn.id(), e);
                }
            }
        }
        .boxed()
    })
}
