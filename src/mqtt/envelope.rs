//! Wire envelopes
//!
//! Inbound envelopes are flat JSON objects mapping a key to its payload.
//! Outbound messages are built as a single key/payload pair and stamped with
//! the session identity right before they are handed to the transport.

use std::fmt;

use chrono::NaiveDateTime;
use serde_json::{json, Map, Value};

use crate::config::SessionIdentity;
use crate::error::SessionError;
use crate::node::{Driver, NodeRegistration};

const PREVIEW_CHARS: usize = 60;

/// A message as it crossed the wire, kept for tracing
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(PREVIEW_CHARS).collect();
        if preview.len() < self.content.len() {
            write!(f, "{} - {}...", self.timestamp, preview)
        } else {
            write!(f, "{} - {}", self.timestamp, preview)
        }
    }
}

impl WireMessage {
    pub fn from_topic(topic: impl Into<String>, content: impl Into<String>) -> Self {
        WireMessage {
            topic: topic.into(),
            content: content.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.timestamp, self.topic, self.content)
    }
}

/// One outbound key/payload pair before identity stamping
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub key: String,
    pub payload: Value,
}

impl OutboundMessage {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// Full envelope with `userId`, `topic`, `profileNum` and `id`
    pub fn stamp(&self, identity: &SessionIdentity, topic: &str) -> Value {
        let mut envelope = Map::new();
        envelope.insert(self.key.clone(), self.payload.clone());
        envelope.insert("userId".into(), Value::from(identity.user_id()));
        envelope.insert("topic".into(), Value::from(topic));
        envelope.insert("profileNum".into(), Value::from(identity.profile_num));
        envelope.insert("id".into(), Value::from(identity.client_id()));
        Value::Object(envelope)
    }

    /// `{"connected": bool}`, also registered as last will
    pub fn presence(connected: bool) -> Self {
        Self::new("connected", Value::Bool(connected))
    }

    pub fn config_request() -> Self {
        Self::new("config", Value::Object(Map::new()))
    }

    pub fn add_node(registration: &NodeRegistration) -> Result<Self, SessionError> {
        let body = serde_json::to_value(registration)?;
        Ok(Self::new("addnode", Value::Array(vec![body])))
    }

    pub fn remove_node(address: &str) -> Self {
        Self::new("removenode", json!([{ "address": address }]))
    }

    pub fn status(address: &str, drivers: &[Driver]) -> Self {
        let entries = drivers
            .iter()
            .map(|d| {
                json!({
                    "address": address,
                    "driver": d.driver,
                    "value": d.value,
                    "uom": d.uom,
                })
            })
            .collect();
        Self::new("status", Value::Array(entries))
    }

    pub fn command(address: &str, cmd: &str, value: Option<&str>) -> Self {
        let mut entry = Map::new();
        entry.insert("address".into(), Value::from(address));
        entry.insert("cmd".into(), Value::from(cmd));
        if let Some(value) = value {
            entry.insert("value".into(), Value::from(value));
        }
        Self::new("command", Value::Array(vec![Value::Object(entry)]))
    }

    pub fn set(key: &str, value: Value) -> Self {
        Self::new("set", json!([{ "key": key, "value": value }]))
    }
}

/// A parsed inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub entries: Map<String, Value>,
    /// The envelope's `id`, carried along with every queued item
    pub correlation_id: Option<String>,
}

impl InboundEnvelope {
    pub fn parse(bytes: &[u8]) -> Result<Self, SessionError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| SessionError::Protocol(format!("envelope is not JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, SessionError> {
        let Value::Object(entries) = value else {
            return Err(SessionError::Protocol(format!(
                "envelope is not an object: {}",
                value
            )));
        };
        let correlation_id = match entries.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        Ok(Self {
            entries,
            correlation_id,
        })
    }
}
