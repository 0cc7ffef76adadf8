//! # Broker Session
//!
//! One [`Session`] per process. It owns the connection tracker, the
//! correlation ledger, the command queue and the event bus, and hands the
//! transport two things: a channel of outbound messages and the
//! [`Session::handle_inbound`] / [`Session::on_connection_state`] entry points.
//!
//! ```text
//! transport ──state──► ConnectionTracker ──► events, presence, config request
//! transport ──bytes──► Dispatcher ──► result ──► CorrelationLedger
//!                                 └─► CommandQueue ──► SessionEngine ──► Reconciler
//!                                                                   └─► PollScheduler
//! Session::send / send_correlated ──► outbound channel ──► transport
//! ```
//!
//! Sends fail fast while the link is not usable. Nothing is buffered for a
//! later reconnect.

pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod poll;
pub mod queue;
pub mod reconcile;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SessionIdentity};
use crate::error::SessionError;
use crate::mqtt::envelope::OutboundMessage;
use crate::node::{Driver, Node, NodeDefRegistry};

use connection::{ConnectionState, ConnectionTracker};
use dispatcher::{result_key, Dispatcher};
use engine::SessionEngine;
use events::{EventBus, SessionEvent};
use ledger::CorrelationLedger;
use poll::PollClass;
use queue::{CommandQueue, QueueItem, QueueKey};
use registry::{bare_address, RegistryView};

/// Key/value stores the broker keeps on behalf of the session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CustomKind {
    Params,
    Data,
    Notices,
    TypedParams,
}

impl CustomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomKind::Params => "customparams",
            CustomKind::Data => "customdata",
            CustomKind::Notices => "notices",
            CustomKind::TypedParams => "customtypedparams",
        }
    }
}

/// State shared by every part of the session
#[derive(Debug)]
pub struct SessionContext {
    identity: SessionIdentity,
    outbound_topic: String,
    tracker: ConnectionTracker,
    shutdown: CancellationToken,
    events: EventBus,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    ledger: CorrelationLedger,
    request_timeout: Duration,
}

impl SessionContext {
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn outbound_topic(&self) -> &str {
        &self.outbound_topic
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ledger(&self) -> &CorrelationLedger {
        &self.ledger
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn ensure_usable(&self) -> Result<(), SessionError> {
        if self.is_shutting_down() {
            return Err(SessionError::ShuttingDown);
        }
        if !self.tracker.is_usable() {
            return Err(SessionError::NotConnected(self.tracker.current().to_string()));
        }
        Ok(())
    }

    /// Fire-and-forget send
    pub fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        self.ensure_usable()?;
        self.push(message)
    }

    /// Sends `message` and waits for the `result` paired with `key`
    pub async fn send_correlated(
        &self,
        key: &str,
        message: OutboundMessage,
    ) -> Result<String, SessionError> {
        self.ledger
            .send_correlated(
                key,
                self.request_timeout,
                || self.ensure_usable(),
                || self.push(message),
            )
            .await
    }

    /// Announces disconnection and flips the shutting-down flag
    ///
    /// Idempotent. Poll timers, the queue worker and the transport all watch
    /// the same token.
    pub fn stop(&self) {
        if self.is_shutting_down() {
            debug!("Session already stopping");
            return;
        }
        info!("Stopping session {}", self.identity.client_id());
        if self.tracker.is_usable() {
            if let Err(e) = self.push(OutboundMessage::presence(false)) {
                warn!("Could not announce disconnection: {}", e);
            }
        }
        self.shutdown.cancel();
    }

    fn push(&self, message: OutboundMessage) -> Result<(), SessionError> {
        debug!("Queueing outbound {}", message.key);
        self.outbound
            .send(message)
            .map_err(|e| SessionError::Transport(format!("outbound channel closed, lost {}", e.0.key)))
    }
}

/// Transport side of a freshly spawned session
#[derive(Debug)]
pub struct SessionRuntime {
    /// Messages to stamp and publish, in order
    pub outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    /// Queue worker; hands the engine back once the session stopped
    pub worker: JoinHandle<SessionEngine>,
}

/// Cloneable handle used by the transport and by collaborators
#[derive(Debug, Clone)]
pub struct Session {
    ctx: Arc<SessionContext>,
    dispatcher: Dispatcher,
    queue: CommandQueue,
    registry: watch::Receiver<Arc<RegistryView>>,
}

impl Session {
    pub fn spawn(config: &Config, nodedefs: NodeDefRegistry) -> (Self, SessionRuntime) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(SessionContext {
            identity: config.identity.clone(),
            outbound_topic: config.mqtt.outbound_topic(&config.identity),
            tracker: ConnectionTracker::new(),
            shutdown: CancellationToken::new(),
            events: EventBus::new(config.session.event_capacity),
            outbound,
            ledger: CorrelationLedger::new(),
            request_timeout: config.session.request_timeout(),
        });

        let (engine, registry) = SessionEngine::new(ctx.clone(), nodedefs, &config.session);
        let (queue, worker) = CommandQueue::spawn(engine, ctx.shutdown_token());
        let dispatcher = Dispatcher::new(ctx.clone(), queue.clone());

        info!(
            "Session {} ready, publishing to {}",
            ctx.identity.client_id(),
            ctx.outbound_topic
        );
        let session = Self {
            ctx,
            dispatcher,
            queue,
            registry,
        };
        let runtime = SessionRuntime {
            outbound: outbound_rx,
            worker,
        };
        (session, runtime)
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.ctx.identity
    }

    pub fn outbound_topic(&self) -> &str {
        &self.ctx.outbound_topic
    }

    pub fn is_usable(&self) -> bool {
        self.ctx.tracker.is_usable()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.ctx.tracker.current()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.is_shutting_down()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown_token()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    /// Read-only view of the registry, refreshed after every handler
    pub fn registry(&self) -> Arc<RegistryView> {
        self.registry.borrow().clone()
    }

    pub fn watch_registry(&self) -> watch::Receiver<Arc<RegistryView>> {
        self.registry.clone()
    }

    /// Entry point for every message received on the inbound topic
    pub fn handle_inbound(&self, topic: &str, bytes: &[u8]) {
        self.dispatcher.dispatch(topic, bytes);
    }

    /// Entry point for transport lifecycle signals
    pub fn on_connection_state(&self, state: ConnectionState) {
        let transition = self.ctx.tracker.transition(state);
        if !transition.changed() {
            return;
        }
        self.ctx.events.emit(SessionEvent::Connection(state));

        if !transition.entered_connected() {
            return;
        }
        if transition.first_connection {
            info!("First connection of session {}", self.ctx.identity.client_id());
        }
        if let Err(e) = self.ctx.send(OutboundMessage::presence(true)) {
            warn!("Could not announce presence: {}", e);
        }
        if let Err(e) = self.request_config() {
            warn!("Could not request configuration: {}", e);
        }
        let replay = QueueItem::new(QueueKey::Replay, Value::Null, None);
        if let Err(e) = self.queue.enqueue(replay) {
            warn!("Could not replay configuration: {}", e);
        }
    }

    pub fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        self.ctx.send(message)
    }

    pub async fn send_correlated(
        &self,
        key: &str,
        message: OutboundMessage,
    ) -> Result<String, SessionError> {
        self.ctx.send_correlated(key, message).await
    }

    /// Registers a node with the broker
    ///
    /// The registration, including the driver conversion, is taken from the
    /// node right before sending.
    pub async fn add_node(&self, node: &dyn Node) -> Result<String, SessionError> {
        let registration = node.registration();
        let key = result_key("addnode", Some(bare_address(&registration.address)));
        info!("Adding node {} ({})", registration.address, registration.nodedef_id);
        let message = OutboundMessage::add_node(&registration)?;
        self.ctx.send_correlated(&key, message).await
    }

    pub async fn remove_node(&self, address: &str) -> Result<String, SessionError> {
        let key = result_key("removenode", Some(bare_address(address)));
        info!("Removing node {}", address);
        self.ctx
            .send_correlated(&key, OutboundMessage::remove_node(address))
            .await
    }

    pub fn report_drivers(&self, address: &str, drivers: &[Driver]) -> Result<(), SessionError> {
        if drivers.is_empty() {
            return Ok(());
        }
        self.ctx.send(OutboundMessage::status(address, drivers))
    }

    pub fn report_command(
        &self,
        address: &str,
        cmd: &str,
        value: Option<&str>,
    ) -> Result<(), SessionError> {
        self.ctx.send(OutboundMessage::command(address, cmd, value))
    }

    pub fn save_custom(&self, kind: CustomKind, value: Value) -> Result<(), SessionError> {
        debug!("Saving {}", kind.as_str());
        self.ctx.send(OutboundMessage::set(kind.as_str(), value))
    }

    pub fn request_config(&self) -> Result<(), SessionError> {
        self.ctx.send(OutboundMessage::config_request())
    }

    /// Changes a poll period in order with queued snapshots
    pub fn set_poll_period(&self, class: PollClass, seconds: Option<u64>) -> Result<(), SessionError> {
        let mut payload = Map::new();
        payload.insert(class.to_string(), Value::from(seconds.unwrap_or(0)));
        self.queue.enqueue(QueueItem::new(QueueKey::Polls, Value::Object(payload), None))
    }

    pub fn stop(&self) {
        self.ctx.stop();
    }
}
