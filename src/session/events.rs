use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use super::connection::ConnectionState;
use super::poll::PollClass;
use super::reconcile::Snapshot;
use super::registry::RegistryView;
use crate::mqtt::envelope::WireMessage;

/// Everything the session surfaces to collaborators
///
/// Delivered over a broadcast channel, so every subscriber sees events in
/// emission order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connection(ConnectionState),
    Config(Arc<ConfigAccepted>),
    Poll(PollClass),
    Stop,
    Delete,
    OAuth(Value),
    NodeAdded(String),
    NodeRemoved(String),
    Sent(WireMessage),
    Received(WireMessage),
}

/// Payload of an accepted snapshot
#[derive(Debug, Clone)]
pub struct ConfigAccepted {
    /// Merged registry after the snapshot was applied
    pub nodes: Arc<RegistryView>,
    pub snapshot: Arc<Snapshot>,
    pub is_initial: bool,
    pub params_changed: bool,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emits to current subscribers; an event with no subscriber is dropped
    pub fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event emitted with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}
