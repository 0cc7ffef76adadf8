//! Sequential command queue
//!
//! Broker commands and configuration updates must be applied in the order
//! the broker produced them. One worker task drains the queue and awaits each
//! handler, including anything the handler awaits itself, before it takes the
//! next item. A failing or panicking handler is logged and the queue moves
//! on.
//!
//! ```text
//! Dispatcher ──enqueue──► [unbounded mpsc] ──► worker ──► QueueHandler::handle
//!                                                  │
//!                                         shutting down? drop + log
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;

/// Keys routed through the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKey {
    Config,
    Query,
    Command,
    Status,
    Polls,
    OAuth,
    /// Re-application of the last accepted snapshot after a reconnect
    Replay,
}

impl QueueKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKey::Config => "config",
            QueueKey::Query => "query",
            QueueKey::Command => "command",
            QueueKey::Status => "status",
            QueueKey::Polls => "polls",
            QueueKey::OAuth => "oauth",
            QueueKey::Replay => "replay",
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueKey {
    type Err = SessionError;

    /// Parses wire keys only; `replay` is internal and never accepted
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(QueueKey::Config),
            "query" => Ok(QueueKey::Query),
            "command" => Ok(QueueKey::Command),
            "status" => Ok(QueueKey::Status),
            "polls" => Ok(QueueKey::Polls),
            "oauth" => Ok(QueueKey::OAuth),
            other => Err(SessionError::Protocol(format!("not a queued key: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub key: QueueKey,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub enqueued_at: Instant,
}

impl QueueItem {
    pub fn new(key: QueueKey, payload: Value, correlation_id: Option<String>) -> Self {
        Self {
            key,
            payload,
            correlation_id,
            enqueued_at: Instant::now(),
        }
    }
}

/// Executes dequeued items, one at a time
pub trait QueueHandler: Send + 'static {
    fn handle(&mut self, item: QueueItem) -> impl Future<Output = Result<(), SessionError>> + Send;
}

/// Producer side of the queue
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl CommandQueue {
    /// Starts the worker; it hands the handler back when it stops
    pub fn spawn<H: QueueHandler>(handler: H, shutdown: CancellationToken) -> (Self, JoinHandle<H>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(handler, rx, shutdown));
        info!("Command queue worker started");
        (Self { tx }, worker)
    }

    pub fn enqueue(&self, item: QueueItem) -> Result<(), SessionError> {
        debug!("Enqueueing {} item", item.key);
        self.tx
            .send(item)
            .map_err(|e| SessionError::Transport(format!("command queue closed, dropped {} item", e.0.key)))
    }
}

async fn run_worker<H: QueueHandler>(
    mut handler: H,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    shutdown: CancellationToken,
) -> H {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Command queue shutting down");
                break;
            }

            item = rx.recv() => {
                let Some(item) = item else {
                    debug!("All queue producers gone");
                    return handler;
                };
                let key = item.key;
                let waited = item.enqueued_at.elapsed();
                debug!("Handling {} item after {:?} in queue", key, waited);
                match AssertUnwindSafe(handler.handle(item)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Handler for {} failed: {}", key, e),
                    Err(panic) => error!("Handler for {} panicked: {}", key, panic_message(panic.as_ref())),
                }
            }
        }
    }

    rx.close();
    while let Ok(item) = rx.try_recv() {
        warn!(
            "Dropping {} item while shutting down: {}",
            item.key, item.payload
        );
    }
    handler
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
