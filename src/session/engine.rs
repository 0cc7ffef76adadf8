//! Queue handler for broker keys
//!
//! The engine is the only owner of the [`Reconciler`] and the
//! [`PollScheduler`]. After every item it republishes a read-only copy of
//! the registry for collaborators.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::events::{ConfigAccepted, SessionEvent};
use super::poll::{PollClass, PollScheduler};
use super::queue::{QueueHandler, QueueItem, QueueKey};
use super::reconcile::{parse_u64, ApplyOutcome, LoopGuard, Reconciler};
use super::registry::{bare_address, DriverState, RegistryView};
use super::SessionContext;
use crate::config::SessionSettings;
use crate::error::SessionError;
use crate::mqtt::envelope::OutboundMessage;
use crate::node::{Driver, NodeCommand, NodeDefRegistry};

#[derive(Debug)]
pub struct SessionEngine {
    ctx: Arc<SessionContext>,
    reconciler: Reconciler,
    polls: PollScheduler,
    view: watch::Sender<Arc<RegistryView>>,
}

impl QueueHandler for SessionEngine {
    async fn handle(&mut self, item: QueueItem) -> Result<(), SessionError> {
        let outcome = match item.key {
            QueueKey::Config => self.on_config(item.payload),
            QueueKey::Replay => {
                self.on_replay();
                Ok(())
            }
            QueueKey::Query => self.on_query(&item.payload),
            QueueKey::Command => self.on_command(&item.payload),
            QueueKey::Status => self.on_status(&item.payload),
            QueueKey::Polls => {
                self.on_polls(&item.payload);
                Ok(())
            }
            QueueKey::OAuth => {
                self.ctx.events().emit(SessionEvent::OAuth(item.payload));
                Ok(())
            }
        };
        self.publish_view();
        outcome
    }
}

impl SessionEngine {
    pub fn new(
        ctx: Arc<SessionContext>,
        nodedefs: NodeDefRegistry,
        settings: &SessionSettings,
    ) -> (Self, watch::Receiver<Arc<RegistryView>>) {
        let guard = LoopGuard::new(settings.loop_window(), settings.loop_threshold);
        let reconciler = Reconciler::new(nodedefs, guard, ctx.events().clone());
        let polls = PollScheduler::new(ctx.events().clone(), ctx.shutdown_token());
        let (view, view_rx) = watch::channel(Arc::new(RegistryView::new()));
        let engine = Self {
            ctx,
            reconciler,
            polls,
            view,
        };
        (engine, view_rx)
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn polls(&self) -> &PollScheduler {
        &self.polls
    }

    fn on_config(&mut self, payload: Value) -> Result<(), SessionError> {
        let is_initial = !self.reconciler.has_snapshot();
        match self
            .reconciler
            .apply_snapshot(payload, is_initial, &mut self.polls)?
        {
            ApplyOutcome::Accepted(accepted) => {
                debug!("Registry now holds {} nodes", accepted.nodes.len());
            }
            ApplyOutcome::Dropped => {}
        }
        Ok(())
    }

    /// Re-emits the last accepted snapshot after a reconnect
    fn on_replay(&mut self) {
        let Some(snapshot) = self.reconciler.current().cloned() else {
            debug!("Nothing to replay yet");
            return;
        };
        info!("Replaying last configuration ({} nodes)", self.reconciler.registry().len());
        let accepted = ConfigAccepted {
            nodes: Arc::new(self.reconciler.view()),
            snapshot,
            is_initial: false,
            params_changed: false,
        };
        self.ctx.events().emit(SessionEvent::Config(Arc::new(accepted)));
    }

    fn on_query(&mut self, payload: &Value) -> Result<(), SessionError> {
        for address in self.targets(payload)? {
            let Some(node) = self.reconciler.registry_mut().node_mut(&address) else {
                continue;
            };
            let drivers = node.query();
            self.record_drivers(&address, &drivers);
            self.report(&address, &drivers);
        }
        Ok(())
    }

    /// Runs each command in turn; a bad entry is skipped, not the batch
    fn on_command(&mut self, payload: &Value) -> Result<(), SessionError> {
        let entries = match payload {
            Value::Array(list) => list.iter().collect(),
            single => vec![single],
        };

        for entry in entries {
            let command = match parse_command(entry) {
                Ok(command) => command,
                Err(e) => {
                    warn!("Skipping command: {}", e);
                    continue;
                }
            };
            let Some(node) = self.reconciler.registry_mut().node_mut(&command.address) else {
                warn!("Skipping {} for unknown node {}", command.cmd, command.address);
                continue;
            };
            debug!("Running {} on {}", command.cmd, command.address);
            match node.run_command(&command) {
                Ok(drivers) => {
                    self.record_drivers(&command.address, &drivers);
                    self.report(&command.address, &drivers);
                }
                Err(e) => warn!("{} on {} failed: {}", command.cmd, command.address, e),
            }
        }
        Ok(())
    }

    fn on_status(&mut self, payload: &Value) -> Result<(), SessionError> {
        for address in self.targets(payload)? {
            let drivers = self
                .reconciler
                .registry()
                .record(&address)
                .map(|r| r.driver_list())
                .unwrap_or_default();
            self.report(&address, &drivers);
        }
        Ok(())
    }

    fn on_polls(&mut self, payload: &Value) {
        for class in [PollClass::Short, PollClass::Long] {
            if let Some(raw) = payload.get(class.to_string()) {
                self.polls.set_period(class, parse_u64(raw));
            }
        }
    }

    /// Address named in the payload, or every known address
    fn targets(&self, payload: &Value) -> Result<Vec<String>, SessionError> {
        let address = payload
            .get("address")
            .and_then(Value::as_str)
            .map(bare_address)
            .filter(|a| !a.is_empty());
        match address {
            Some(address) if self.reconciler.registry().contains(address) => {
                Ok(vec![address.to_string()])
            }
            Some(address) => Err(SessionError::UnknownNode(address.to_string())),
            None => Ok(self.reconciler.registry().addresses()),
        }
    }

    fn record_drivers(&mut self, address: &str, drivers: &[Driver]) {
        self.reconciler.registry_mut().update(address, |record| {
            for d in drivers {
                record.drivers.insert(
                    d.driver.clone(),
                    DriverState {
                        value: d.value.clone(),
                        uom: d.uom,
                    },
                );
            }
        });
    }

    fn report(&self, address: &str, drivers: &[Driver]) {
        if drivers.is_empty() {
            return;
        }
        if let Err(e) = self.ctx.send(OutboundMessage::status(address, drivers)) {
            warn!("Could not report drivers of {}: {}", address, e);
        }
    }

    fn publish_view(&self) {
        self.view.send_replace(Arc::new(self.reconciler.view()));
    }
}

fn parse_command(raw: &Value) -> Result<NodeCommand, SessionError> {
    let field = |name: &str| raw.get(name).filter(|v| !v.is_null());
    let address = field("address")
        .and_then(Value::as_str)
        .map(bare_address)
        .ok_or_else(|| SessionError::Protocol(format!("command without address: {}", raw)))?;
    let cmd = field("cmd")
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::Protocol(format!("command without cmd: {}", raw)))?;
    let value = field("value").map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    let uom = field("uom")
        .and_then(parse_u64)
        .and_then(|u| u16::try_from(u).ok());
    let query = match field("query") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    Ok(NodeCommand {
        address: address.to_string(),
        cmd: cmd.to_string(),
        value,
        uom,
        query,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn command_payload_is_normalised() {
        let command = parse_command(&json!({
            "address": "n003_a1",
            "cmd": "DON",
            "value": 75,
            "uom": "51",
            "query": {"ramp": "fast"},
        }))
        .expect("valid command");
        assert_eq!(command.address, "a1");
        assert_eq!(command.cmd, "DON");
        assert_eq!(command.value.as_deref(), Some("75"));
        assert_eq!(command.uom, Some(51));
        assert_eq!(command.query.get("ramp"), Some(&json!("fast")));

        assert!(parse_command(&json!({"cmd": "DON"})).is_err());
        assert!(parse_command(&json!({"address": "a1", "value": null})).is_err());
    }
}
