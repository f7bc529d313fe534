//! Declarative broker topology: queues, exchanges and the bindings between them.
//!
//! A topology is a tree. Every child is declared after its parent and bound to
//! it with each of its routing keys (or a single empty key when none are given).
//!
//! ```json
//! [
//!   {
//!     "name": "events",
//!     "kind": "topic",
//!     "children": [
//!       { "name": "events.audit", "kind": "fanout", "keys": ["audit.#"] },
//!       { "name": "gateway.in", "kind": "queue", "keys": ["gateway.*"] }
//!     ]
//!   }
//! ]
//! ```

use crate::error::{AmqpError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Kind of a topology node.
///
/// `Queue` is a plain named queue addressed through the default exchange; the
/// remaining kinds are AMQP exchange types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExchangeKind {
    Queue,
    Direct,
    Fanout,
    Headers,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Queue => "queue",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Topic => "topic",
        }
    }

    /// True for the plain queue kind.
    pub fn is_queue(&self) -> bool {
        matches!(self, ExchangeKind::Queue)
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            // "channel" is the historical name for a plain queue.
            "queue" | "channel" => Ok(ExchangeKind::Queue),
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(AmqpError::InvalidTopologyKind(other.to_string())),
        }
    }
}

impl TryFrom<String> for ExchangeKind {
    type Error = AmqpError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ExchangeKind> for String {
    fn from(kind: ExchangeKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One node of the topology tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    pub kind: ExchangeKind,
    /// Routing keys binding this node to its parent.
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub children: Vec<Topology>,
}

impl Topology {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            keys: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_child(mut self, child: Topology) -> Self {
        self.children.push(child);
        self
    }

    /// Routing keys used when binding to the parent; never empty.
    pub fn binding_keys(&self) -> Vec<String> {
        binding_keys(&self.keys)
    }

    /// Parse a JSON array of topology nodes.
    pub fn parse_list(json: &str) -> Result<Vec<Topology>> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON array of topology nodes from disk.
    pub fn load_list(path: impl AsRef<Path>) -> Result<Vec<Topology>> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse_list(&raw)
    }
}

/// Keys to bind with: the given keys, or a single empty key.
pub fn binding_keys(keys: &[String]) -> Vec<String> {
    if keys.is_empty() {
        vec![String::new()]
    } else {
        keys.to_vec()
    }
}

/// Check if an AMQP topic binding pattern matches a routing key.
///
/// - `*` matches exactly one word
/// - `#` matches zero or more words
/// - Literal words match exactly
#[cfg(any(test, feature = "memory"))]
pub(crate) fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let key_parts: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches_parts(&pattern_parts, &key_parts)
}

#[cfg(any(test, feature = "memory"))]
fn matches_parts(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_parts(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => matches_parts(rest, key_rest),
            _ => false,
        },
    }
}
