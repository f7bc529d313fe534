//! Registry of live client connections.
//!
//! Holds at most one [`DuplexConnection`] per client identity. Admission uses
//! DashMap's entry API so two concurrent registrations of the same identity
//! cannot both succeed.

use crate::connection::DuplexConnection;
use crate::error::{GatewayError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::gauge;
use std::sync::Arc;
use tracing::info;

/// Client identity → live connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<DuplexConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `client_id` for `conn`.
    pub fn register(&self, client_id: &str, conn: Arc<DuplexConnection>) -> Result<()> {
        match self.connections.entry(client_id.to_string()) {
            Entry::Occupied(_) => Err(GatewayError::AlreadyRegistered(client_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(conn);
                gauge!("gateway_active_connections").set(self.connections.len() as f64);
                info!("Client {} registered", client_id);
                Ok(())
            }
        }
    }

    pub fn exists(&self, client_id: &str) -> Result<()> {
        if self.connections.contains_key(client_id) {
            Ok(())
        } else {
            Err(GatewayError::NotRegistered(client_id.to_string()))
        }
    }

    pub fn lookup(&self, client_id: &str) -> Result<Arc<DuplexConnection>> {
        self.connections
            .get(client_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::NotRegistered(client_id.to_string()))
    }

    /// Remove `client_id` and close its connection. No-op when absent.
    pub fn unregister(&self, client_id: &str) {
        if let Some((_, conn)) = self.connections.remove(client_id) {
            conn.close();
            gauge!("gateway_active_connections").set(self.connections.len() as f64);
            info!("Client {} unregistered", client_id);
        }
    }

    /// Only removes the entry if it still belongs to `conn`.
    pub(crate) fn unregister_connection(&self, client_id: &str, conn: &Arc<DuplexConnection>) {
        let removed = self
            .connections
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, conn));
        conn.close();
        if removed.is_some() {
            gauge!("gateway_active_connections").set(self.connections.len() as f64);
            info!("Client {} unregistered", client_id);
        }
    }

    /// Unregister every client.
    pub fn clear(&self) {
        let ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.unregister(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
