//! Control-message wire format.
//!
//! The same JSON envelope travels between clients and the gateway and between
//! the gateway and the broker:
//!
//! ```json
//! {"action":"publish","clientId":"*","topic":"news","message":"hi"}
//! ```

use serde::{Deserialize, Serialize};

/// Client identity that addresses every subscriber of a topic.
pub const BROADCAST_CLIENT: &str = "*";

/// Control-message action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Heartbeat,
    Publish,
    Subscribe,
    Unsubscribe,
    /// Any action string the gateway does not know; handled as a no-op.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Control message exchanged with clients and the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(default)]
    pub action: Action,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlMessage {
    /// Heartbeat frame carrying the current miss count.
    pub fn heartbeat(count: u32) -> Self {
        Self {
            action: Action::Heartbeat,
            message: Some(format!("{} times", count)),
            ..Default::default()
        }
    }

    pub fn parse(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Topic, with a missing topic read as the empty topic.
    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or_default()
    }

    /// Stamp the sender's identity.
    ///
    /// Subscribe and unsubscribe always act on the sender's own identity.
    /// Publish keeps a client-supplied recipient and defaults to the sender.
    pub fn stamp(&mut self, sender: &str) {
        match self.action {
            Action::Subscribe | Action::Unsubscribe => {
                self.client_id = Some(sender.to_string());
            }
            Action::Publish => {
                if self.client_id.as_deref().map_or(true, str::is_empty) {
                    self.client_id = Some(sender.to_string());
                }
            }
            Action::Heartbeat | Action::Unknown => {}
        }
    }
}
