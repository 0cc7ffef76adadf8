//! Message dispatcher
//!
//! Splits each inbound envelope into its keys. `stop`, `delete` and `result`
//! are handled on the spot, before anything from the same envelope reaches
//! the queue. Everything else known is queued with the envelope's `id`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::events::SessionEvent;
use super::queue::{CommandQueue, QueueItem, QueueKey};
use super::registry::bare_address;
use super::SessionContext;
use crate::mqtt::envelope::{InboundEnvelope, WireMessage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Immediate {
    Result,
    Delete,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Immediate(Immediate),
    Queued(QueueKey),
    Ignored,
    Unknown,
}

const IGNORED_KEYS: &[&str] = &["userId", "clientId", "id", "profileNum", "topic"];

pub fn classify(key: &str) -> Route {
    match key {
        "stop" => Route::Immediate(Immediate::Stop),
        "delete" => Route::Immediate(Immediate::Delete),
        "result" => Route::Immediate(Immediate::Result),
        k if IGNORED_KEYS.contains(&k) => Route::Ignored,
        k => k.parse().map(Route::Queued).unwrap_or(Route::Unknown),
    }
}

/// Ledger key of a correlated exchange, `<kind>-<address>` or `<kind>`
pub fn result_key(kind: &str, address: Option<&str>) -> String {
    match address {
        Some(address) if !address.is_empty() => format!("{}-{}", kind, address),
        _ => kind.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    ctx: Arc<SessionContext>,
    queue: CommandQueue,
}

impl Dispatcher {
    pub fn new(ctx: Arc<SessionContext>, queue: CommandQueue) -> Self {
        Self { ctx, queue }
    }

    pub fn dispatch(&self, topic: &str, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        self.ctx
            .events()
            .emit(SessionEvent::Received(WireMessage::from_topic(topic, text.as_ref())));

        match InboundEnvelope::parse(bytes) {
            Ok(envelope) => self.dispatch_envelope(envelope),
            Err(e) => warn!("Discarding inbound message on {}: {} | payload: {}", topic, e, text),
        }
    }

    pub fn dispatch_envelope(&self, envelope: InboundEnvelope) {
        let mut immediate = Vec::new();
        let mut queued = Vec::new();
        let mut unknown = Vec::new();

        for (key, payload) in &envelope.entries {
            match classify(key) {
                Route::Immediate(kind) => immediate.push((kind, payload)),
                Route::Queued(kind) => queued.push((kind, payload)),
                Route::Ignored => trace!("Ignoring envelope key {}", key),
                Route::Unknown => unknown.push(key.as_str()),
            }
        }
        if !unknown.is_empty() {
            let full = Value::Object(envelope.entries.clone());
            warn!("Unknown keys {:?} in envelope: {}", unknown, full);
        }

        immediate.sort_by_key(|(kind, _)| *kind);
        for (kind, payload) in immediate {
            match kind {
                Immediate::Result => self.settle_results(payload),
                Immediate::Delete => {
                    info!("Broker deleted this session");
                    self.ctx.events().emit(SessionEvent::Delete);
                    self.ctx.stop();
                }
                Immediate::Stop => {
                    info!("Broker requested stop");
                    self.ctx.events().emit(SessionEvent::Stop);
                    self.ctx.stop();
                }
            }
        }

        for (key, payload) in queued {
            let item = QueueItem::new(key, payload.clone(), envelope.correlation_id.clone());
            if let Err(e) = self.queue.enqueue(item) {
                warn!("Could not queue {}: {}", key, e);
            }
        }
    }

    fn settle_results(&self, payload: &Value) {
        let Value::Object(kinds) = payload else {
            warn!("Malformed result payload: {}", payload);
            return;
        };
        for (kind, outcomes) in kinds {
            let outcomes = match outcomes {
                Value::Array(list) => list.iter().collect::<Vec<_>>(),
                single => vec![single],
            };
            for outcome in outcomes {
                let address = outcome
                    .get("address")
                    .and_then(Value::as_str)
                    .map(bare_address);
                let success = outcome
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let reason = match outcome.get("reason") {
                    Some(Value::String(reason)) => reason.clone(),
                    None | Some(Value::Null) => String::new(),
                    Some(other) => other.to_string(),
                };
                let key = result_key(kind, address);
                debug!("Result {} success={}", key, success);
                self.ctx.ledger().settle(&key, success, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keys_are_classified() {
        assert_eq!(classify("stop"), Route::Immediate(Immediate::Stop));
        assert_eq!(classify("result"), Route::Immediate(Immediate::Result));
        assert_eq!(classify("config"), Route::Queued(QueueKey::Config));
        assert_eq!(classify("oauth"), Route::Queued(QueueKey::OAuth));
        assert_eq!(classify("profileNum"), Route::Ignored);
        assert_eq!(classify("replay"), Route::Unknown);
        assert_eq!(classify("bogus"), Route::Unknown);
    }

    #[test]
    fn result_keys_pair_kind_and_address() {
        assert_eq!(result_key("addnode", Some("a1")), "addnode-a1");
        assert_eq!(result_key("installprofile", None), "installprofile");
        assert_eq!(result_key("set", Some("")), "set");
    }
}
