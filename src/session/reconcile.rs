//! # Config Reconciliation Engine
//!
//! Merges each authoritative snapshot pushed by the broker into the local
//! device registry.
//!
//! ## Steps per snapshot
//!
//! 1. Parse. A malformed snapshot is a protocol error and changes nothing.
//! 2. Loop guard. Every arrival is recorded in a sliding window; when the
//!    window holds more than the threshold the snapshot is dropped before
//!    any mutation and no event is emitted. The previous snapshot stays
//!    authoritative until the window decays.
//! 3. Create or update records. Unknown nodedef ids are logged and skipped.
//!    Only fields present in the entry are written, through the coercion
//!    table (timestamps, booleans, everything else as-is).
//! 4. Delete records whose address is absent from the snapshot.
//! 5. Compare custom parameters against the previous snapshot.
//! 6. Push the poll periods to the [`PollScheduler`].
//! 7. Store the snapshot and emit [`SessionEvent::Config`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::events::{ConfigAccepted, EventBus, SessionEvent};
use super::poll::{PollClass, PollScheduler};
use super::registry::{bare_address, DeviceRecord, DriverState, Registry, RegistryView};
use crate::error::SessionError;
use crate::node::NodeDefRegistry;

/// How a snapshot field is converted before it is merged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coercion {
    Identity,
    Timestamp,
    Boolean,
}

const COERCIONS: &[(&str, Coercion)] = &[
    ("timeAdded", Coercion::Timestamp),
    ("timeModified", Coercion::Timestamp),
    ("controller", Coercion::Boolean),
    ("isController", Coercion::Boolean),
    ("enabled", Coercion::Boolean),
    ("isPrimary", Coercion::Boolean),
];

pub fn coercion_for(field: &str) -> Coercion {
    COERCIONS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, rule)| *rule)
        .unwrap_or(Coercion::Identity)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Value(Value),
    Timestamp(DateTime<Utc>),
    Bool(bool),
}

pub fn coerce(field: &str, value: &Value) -> Result<Coerced, SessionError> {
    match coercion_for(field) {
        Coercion::Identity => Ok(Coerced::Value(value.clone())),
        Coercion::Timestamp => parse_timestamp(value).map(Coerced::Timestamp).ok_or_else(|| {
            SessionError::Protocol(format!("{} is not a timestamp: {}", field, value))
        }),
        Coercion::Boolean => parse_bool(value).map(Coerced::Bool).ok_or_else(|| {
            SessionError::Protocol(format!("{} is not a boolean: {}", field, value))
        }),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
        }
        _ => None,
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" | "" => Some(false),
            _ => None,
        },
        Value::Null => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Authoritative configuration as last pushed by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Entries keyed by bare address
    pub nodes: BTreeMap<String, Map<String, Value>>,
    pub custom_params: Map<String, Value>,
    pub custom_data: Map<String, Value>,
    pub notices: Map<String, Value>,
    pub typed_params: Value,
    pub short_poll: Option<u64>,
    pub long_poll: Option<u64>,
    pub received_at: DateTime<Utc>,
    pub raw: Value,
}

impl Snapshot {
    pub fn parse(payload: Value) -> Result<Self, SessionError> {
        let Value::Object(fields) = &payload else {
            return Err(SessionError::Protocol(format!(
                "config payload is not an object: {}",
                payload
            )));
        };

        let nodes = match fields.get("nodes") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(by_address)) => by_address
                .iter()
                .filter_map(|(address, entry)| node_entry(Some(address), entry))
                .collect(),
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(|entry| node_entry(None, entry))
                .collect(),
            Some(other) => {
                return Err(SessionError::Protocol(format!(
                    "nodes is neither a map nor a list: {}",
                    other
                )))
            }
        };

        Ok(Self {
            nodes,
            custom_params: key_value_field(fields, &["customParams", "customparams"]),
            custom_data: key_value_field(fields, &["customData", "customdata"]),
            notices: key_value_field(fields, &["notices"]),
            typed_params: fields
                .get("typedParams")
                .or_else(|| fields.get("typedparams"))
                .cloned()
                .unwrap_or(Value::Null),
            short_poll: fields.get("shortPoll").and_then(parse_u64),
            long_poll: fields.get("longPoll").and_then(parse_u64),
            received_at: Utc::now(),
            raw: payload,
        })
    }
}

fn node_entry(key: Option<&String>, entry: &Value) -> Option<(String, Map<String, Value>)> {
    let Value::Object(fields) = entry else {
        warn!("Skipping node entry that is not an object: {}", entry);
        return None;
    };
    let address = key
        .map(String::as_str)
        .or_else(|| fields.get("address").and_then(Value::as_str));
    match address {
        Some(address) if !address.is_empty() => {
            Some((bare_address(address).to_string(), fields.clone()))
        }
        _ => {
            warn!("Skipping node entry without address: {}", entry);
            None
        }
    }
}

/// Reads a key/value field that may arrive as an object or as JSON text
fn key_value_field(fields: &Map<String, Value>, names: &[&str]) -> Map<String, Value> {
    let Some(value) = names.iter().find_map(|name| fields.get(*name)) else {
        return Map::new();
    };
    match value {
        Value::Object(map) => map.clone(),
        Value::String(text) if !text.trim().is_empty() => match serde_json::from_str(text) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!("Ignoring key/value field that is not a JSON object: {}", text);
                Map::new()
            }
        },
        _ => Map::new(),
    }
}

/// True when the key sets differ or any shared key changed value
pub fn params_changed(previous: Option<&Map<String, Value>>, current: &Map<String, Value>) -> bool {
    let empty = Map::new();
    let previous = previous.unwrap_or(&empty);

    let old_keys: BTreeSet<&String> = previous.keys().collect();
    let new_keys: BTreeSet<&String> = current.keys().collect();
    if old_keys.symmetric_difference(&new_keys).next().is_some() {
        return true;
    }
    current
        .iter()
        .any(|(key, value)| previous.get(key) != Some(value))
}

/// Sliding-window counter against snapshot storms
#[derive(Debug)]
pub struct LoopGuard {
    window: Duration,
    threshold: usize,
    arrivals: VecDeque<Instant>,
}

impl LoopGuard {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            arrivals: VecDeque::with_capacity(threshold + 1),
        }
    }

    /// Records an arrival; false while the window holds too many
    pub fn admit(&mut self) -> bool {
        let now = Instant::now();
        while let Some(oldest) = self.arrivals.front() {
            if now.duration_since(*oldest) >= self.window {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
        self.arrivals.push_back(now);
        self.arrivals.len() <= self.threshold
    }

    pub fn in_window(&self) -> usize {
        self.arrivals.len()
    }
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Accepted(Arc<ConfigAccepted>),
    /// Dropped by the loop guard
    Dropped,
}

#[derive(Debug)]
pub struct Reconciler {
    registry: Registry,
    nodedefs: NodeDefRegistry,
    current: Option<Arc<Snapshot>>,
    guard: LoopGuard,
    events: EventBus,
}

impl Reconciler {
    pub fn new(nodedefs: NodeDefRegistry, guard: LoopGuard, events: EventBus) -> Self {
        Self {
            registry: Registry::new(),
            nodedefs,
            current: None,
            guard,
            events,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn current(&self) -> Option<&Arc<Snapshot>> {
        self.current.as_ref()
    }

    pub fn has_snapshot(&self) -> bool {
        self.current.is_some()
    }

    pub fn apply_snapshot(
        &mut self,
        payload: Value,
        is_initial: bool,
        polls: &mut PollScheduler,
    ) -> Result<ApplyOutcome, SessionError> {
        let snapshot = Snapshot::parse(payload)?;

        if !self.guard.admit() {
            error!(
                "Snapshot storm: {} snapshots within the loop window, dropping this one",
                self.guard.in_window()
            );
            return Ok(ApplyOutcome::Dropped);
        }

        self.merge_nodes(&snapshot);
        self.remove_absent(&snapshot);

        let params_changed = params_changed(
            self.current.as_ref().map(|s| &s.custom_params),
            &snapshot.custom_params,
        );
        if params_changed {
            info!("Custom parameters changed");
        }

        polls.set_period(PollClass::Short, snapshot.short_poll);
        polls.set_period(PollClass::Long, snapshot.long_poll);

        let snapshot = Arc::new(snapshot);
        self.current = Some(snapshot.clone());

        let accepted = Arc::new(ConfigAccepted {
            nodes: Arc::new(self.registry.view()),
            snapshot,
            is_initial,
            params_changed,
        });
        info!(
            "Snapshot accepted: {} nodes (initial: {}, params changed: {})",
            accepted.nodes.len(),
            is_initial,
            params_changed
        );
        self.events.emit(SessionEvent::Config(accepted.clone()));
        Ok(ApplyOutcome::Accepted(accepted))
    }

    pub fn view(&self) -> RegistryView {
        self.registry.view()
    }

    fn merge_nodes(&mut self, snapshot: &Snapshot) {
        for (address, entry) in &snapshot.nodes {
            if self.registry.contains(address) {
                self.registry.update(address, |record| merge_entry(record, entry));
                debug!("Updated node {}", address);
                continue;
            }

            let Some(nodedef) = entry
                .get("nodedefid")
                .or_else(|| entry.get("nodeDefId"))
                .and_then(Value::as_str)
            else {
                error!("Node {} has no nodedef id, skipping: {:?}", address, entry);
                continue;
            };
            if !self.nodedefs.contains(nodedef) {
                let e = SessionError::UnknownNodeDef {
                    address: address.clone(),
                    nodedef: nodedef.to_string(),
                };
                error!("{}", e);
                continue;
            }

            let mut record = DeviceRecord::new(address.clone(), nodedef);
            merge_entry(&mut record, entry);
            let Some(node) = self.nodedefs.construct(&record) else {
                continue;
            };
            info!("Created node {} ({})", address, nodedef);
            self.registry.insert(record, node);
            self.events.emit(SessionEvent::NodeAdded(address.clone()));
        }
    }

    fn remove_absent(&mut self, snapshot: &Snapshot) {
        for address in self.registry.addresses() {
            if snapshot.nodes.contains_key(&address) {
                continue;
            }
            if let Some(record) = self.registry.remove(&address) {
                info!("Removed node {} ({}) absent from snapshot", address, record.nodedef_id);
                self.events.emit(SessionEvent::NodeRemoved(address));
            }
        }
    }
}

/// Writes the fields present in `entry` into `record`
fn merge_entry(record: &mut DeviceRecord, entry: &Map<String, Value>) {
    for (field, raw) in entry {
        let coerced = match coerce(field, raw) {
            Ok(coerced) => coerced,
            Err(e) => {
                warn!("Node {}: {}, keeping previous value", record.address, e);
                continue;
            }
        };
        match (field.as_str(), coerced) {
            ("address", _) => {}
            ("primary", Coerced::Value(Value::String(primary))) => {
                record.primary = bare_address(&primary).to_string();
            }
            ("nodedefid" | "nodeDefId", Coerced::Value(Value::String(nodedef))) => {
                if nodedef != record.nodedef_id {
                    warn!(
                        "Node {} changed nodedef {} -> {}",
                        record.address, record.nodedef_id, nodedef
                    );
                }
                record.nodedef_id = nodedef;
            }
            ("name", Coerced::Value(Value::String(name))) => record.name = name,
            ("hint", Coerced::Value(Value::String(hint))) => record.hint = Some(hint),
            ("hint", Coerced::Value(Value::Null)) => record.hint = None,
            ("controller" | "isController", Coerced::Bool(flag)) => record.controller = flag,
            ("enabled", Coerced::Bool(flag)) => record.enabled = flag,
            ("timeAdded", Coerced::Timestamp(at)) => record.time_added = at,
            ("timeModified", Coerced::Timestamp(at)) => record.time_modified = Some(at),
            ("drivers", Coerced::Value(drivers)) => merge_drivers(record, &drivers),
            (_, Coerced::Bool(flag)) => {
                record.extra.insert(field.clone(), Value::Bool(flag));
            }
            (_, Coerced::Timestamp(at)) => {
                record.extra.insert(field.clone(), Value::String(at.to_rfc3339()));
            }
            (_, Coerced::Value(value)) => {
                record.extra.insert(field.clone(), value);
            }
        }
    }
}

fn merge_drivers(record: &mut DeviceRecord, drivers: &Value) {
    let named: Vec<(&str, &Value)> = match drivers {
        Value::Array(list) => list
            .iter()
            .filter_map(|state| match state.get("driver").and_then(Value::as_str) {
                Some(name) => Some((name, state)),
                None => {
                    warn!("Node {}: driver entry without name: {}", record.address, state);
                    None
                }
            })
            .collect(),
        Value::Object(by_name) => by_name.iter().map(|(name, state)| (name.as_str(), state)).collect(),
        other => {
            warn!("Node {}: drivers field ignored: {}", record.address, other);
            return;
        }
    };

    for (name, state) in named {
        record.drivers.insert(name.to_string(), driver_state(state));
    }
}

fn driver_state(state: &Value) -> DriverState {
    let value = match state.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let uom = state
        .get("uom")
        .and_then(parse_u64)
        .and_then(|u| u16::try_from(u).ok())
        .unwrap_or(0);
    DriverState { value, uom }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PassiveNode;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn reconciler(bus: &EventBus) -> Reconciler {
        let mut defs = NodeDefRegistry::new();
        defs.register("D1", PassiveNode::constructor());
        defs.register("controller", PassiveNode::constructor());
        Reconciler::new(defs, LoopGuard::new(Duration::from_secs(10), 30), bus.clone())
    }

    fn scheduler(bus: &EventBus) -> PollScheduler {
        PollScheduler::new(bus.clone(), CancellationToken::new())
    }

    fn accepted(outcome: ApplyOutcome) -> Arc<ConfigAccepted> {
        match outcome {
            ApplyOutcome::Accepted(accepted) => accepted,
            ApplyOutcome::Dropped => panic!("snapshot dropped"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn creates_then_removes_record() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let mut engine = reconciler(&bus);
        let mut polls = scheduler(&bus);

        let first = json!({"nodes": {"a1": {"nodedefid": "D1", "primary": "n001_a1", "name": "X"}}});
        let outcome = accepted(engine.apply_snapshot(first, true, &mut polls).expect("valid"));
        assert!(outcome.is_initial);
        let record = outcome.nodes.get("a1").expect("a1 created");
        assert_eq!(record.primary, "a1");
        assert_eq!(record.name, "X");
        assert!(record.is_primary());

        let second = json!({"nodes": {}});
        let outcome = accepted(engine.apply_snapshot(second, false, &mut polls).expect("valid"));
        assert!(outcome.nodes.is_empty());
        assert!(engine.registry().is_empty());

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::NodeAdded(a) => seen.push(format!("added:{}", a)),
                SessionEvent::NodeRemoved(a) => seen.push(format!("removed:{}", a)),
                SessionEvent::Config(_) => seen.push("config".to_string()),
                _ => {}
            }
        }
        assert_eq!(seen, vec!["added:a1", "config", "removed:a1", "config"]);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_touches_only_missing_address() {
        let bus = EventBus::new(64);
        let mut engine = reconciler(&bus);
        let mut polls = scheduler(&bus);

        let all = json!({"nodes": [
            {"address": "n002_a1", "nodedefid": "D1", "primary": "n002_ctl"},
            {"address": "n002_a2", "nodedefid": "D1", "primary": "n002_ctl"},
            {"address": "n002_ctl", "nodedefid": "controller", "primary": "n002_ctl", "isController": "true"},
        ]});
        engine.apply_snapshot(all, true, &mut polls).expect("valid");
        assert_eq!(engine.registry().addresses(), vec!["a1", "a2", "ctl"]);
        let before_a1 = engine.registry().record("a1").cloned();

        let without_a2 = json!({"nodes": [
            {"address": "n002_a1", "nodedefid": "D1", "primary": "n002_ctl"},
            {"address": "n002_ctl", "nodedefid": "controller", "primary": "n002_ctl"},
        ]});
        engine.apply_snapshot(without_a2, false, &mut polls).expect("valid");
        assert_eq!(engine.registry().addresses(), vec!["a1", "ctl"]);
        assert_eq!(engine.registry().record("a1").cloned(), before_a1);
        assert!(engine.registry().record("ctl").map(|r| r.controller).unwrap_or(false));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_nodedef_is_skipped() {
        let bus = EventBus::new(64);
        let mut engine = reconciler(&bus);
        let mut polls = scheduler(&bus);

        let snapshot = json!({"nodes": {
            "a1": {"nodedefid": "D1", "primary": "a1"},
            "b1": {"nodedefid": "MISSING", "primary": "b1"},
            "c1": {"primary": "c1"},
        }});
        let outcome = accepted(engine.apply_snapshot(snapshot, true, &mut polls).expect("valid"));
        assert_eq!(outcome.nodes.keys().collect::<Vec<_>>(), vec!["a1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn update_overwrites_only_present_fields_with_coercion() {
        let bus = EventBus::new(64);
        let mut engine = reconciler(&bus);
        let mut polls = scheduler(&bus);

        let first = json!({"nodes": {"a1": {
            "nodedefid": "D1",
            "primary": "a1",
            "name": "Lamp",
            "hint": "0x01020300",
            "timeAdded": "1700000000000",
            "drivers": [{"driver": "ST", "value": "0", "uom": 78}],
        }}});
        engine.apply_snapshot(first, true, &mut polls).expect("valid");

        let second = json!({"nodes": {"a1": {
            "enabled": "false",
            "timeModified": "2024-03-01T10:00:00Z",
            "drivers": {"ST": {"value": 100, "uom": "78"}, "GV1": {"value": "5", "uom": 56}},
            "custom": 7,
        }}});
        engine.apply_snapshot(second, false, &mut polls).expect("valid");

        let record = engine.registry().record("a1").expect("still present");
        assert_eq!(record.name, "Lamp");
        assert_eq!(record.hint.as_deref(), Some("0x01020300"));
        assert!(!record.enabled);
        assert_eq!(record.time_added.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(
            record.time_modified.map(|t| t.to_rfc3339()),
            Some("2024-03-01T10:00:00+00:00".to_string())
        );
        assert_eq!(
            record.drivers.get("ST"),
            Some(&DriverState { value: "100".into(), uom: 78 })
        );
        assert_eq!(record.drivers.len(), 2);
        assert_eq!(record.extra.get("custom"), Some(&json!(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_storm_is_dropped_until_window_decays() {
        let bus = EventBus::new(256);
        let mut rx = bus.subscribe();
        let mut engine = reconciler(&bus);
        let mut polls = scheduler(&bus);

        let snapshot = |n: usize| json!({"nodes": {"a1": {"nodedefid": "D1", "name": format!("v{}", n)}}});
        for n in 0..30 {
            assert!(matches!(
                engine.apply_snapshot(snapshot(n), n == 0, &mut polls).expect("valid"),
                ApplyOutcome::Accepted(_)
            ));
        }
        while rx.try_recv().is_ok() {}

        let dropped = engine.apply_snapshot(snapshot(30), false, &mut polls).expect("valid");
        assert!(matches!(dropped, ApplyOutcome::Dropped));
        assert_eq!(engine.registry().record("a1").map(|r| r.name.clone()), Some("v29".into()));
        assert!(rx.try_recv().is_err(), "dropped snapshot must not emit");
        assert_eq!(
            engine.current().and_then(|s| s.nodes["a1"].get("name").cloned()),
            Some(json!("v29"))
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(
            engine.apply_snapshot(snapshot(31), false, &mut polls).expect("valid"),
            ApplyOutcome::Accepted(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn params_change_detection_and_poll_periods() {
        let bus = EventBus::new(64);
        let mut engine = reconciler(&bus);
        let mut polls = scheduler(&bus);

        let first = json!({"customParams": {"user": "a"}, "shortPoll": 10, "longPoll": "60"});
        assert!(accepted(engine.apply_snapshot(first, true, &mut polls).expect("valid")).params_changed);
        assert_eq!(polls.period(PollClass::Short), Some(10));
        assert_eq!(polls.period(PollClass::Long), Some(60));

        let same = json!({"customparams": "{\"user\":\"a\"}", "shortPoll": 10, "longPoll": 60});
        assert!(!accepted(engine.apply_snapshot(same, false, &mut polls).expect("valid")).params_changed);

        let value_changed = json!({"customParams": {"user": "b"}});
        assert!(accepted(engine.apply_snapshot(value_changed, false, &mut polls).expect("valid")).params_changed);
        assert_eq!(polls.period(PollClass::Short), None);
    }

    #[tokio::test]
    async fn malformed_snapshot_is_protocol_error() {
        let bus = EventBus::new(8);
        let mut engine = reconciler(&bus);
        let mut polls = scheduler(&bus);
        assert!(matches!(
            engine.apply_snapshot(json!("nope"), true, &mut polls),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            engine.apply_snapshot(json!({"nodes": 5}), true, &mut polls),
            Err(SessionError::Protocol(_))
        ));
        assert!(!engine.has_snapshot());
    }

    #[test]
    fn params_diff_uses_keys_and_values() {
        let a: Map<String, Value> = serde_json::from_value(json!({"x": 1, "y": 2})).expect("map");
        let b: Map<String, Value> = serde_json::from_value(json!({"x": 1})).expect("map");
        let c: Map<String, Value> = serde_json::from_value(json!({"x": 1, "y": 3})).expect("map");
        assert!(!params_changed(Some(&a), &a.clone()));
        assert!(params_changed(Some(&a), &b));
        assert!(params_changed(Some(&b), &a));
        assert!(params_changed(Some(&a), &c));
        assert!(!params_changed(None, &Map::new()));
    }

    #[test]
    fn coercion_table_drives_conversion() {
        assert_eq!(coercion_for("timeAdded"), Coercion::Timestamp);
        assert_eq!(coercion_for("enabled"), Coercion::Boolean);
        assert_eq!(coercion_for("name"), Coercion::Identity);
        assert_eq!(coerce("enabled", &json!("1")).ok(), Some(Coerced::Bool(true)));
        assert_eq!(coerce("isPrimary", &json!("no")).ok(), Some(Coerced::Bool(false)));
        assert!(coerce("enabled", &json!("maybe")).is_err());
        assert!(coerce("timeAdded", &json!("yesterday")).is_err());
        assert!(matches!(
            coerce("timeAdded", &json!("2023-11-14 22:13:20")),
            Ok(Coerced::Timestamp(_))
        ));
    }
}
