use std::sync::Arc;
use std::time::Duration;

use nodelink::config::{Config, SessionIdentity, SessionSettings};
use nodelink::mqtt::config::MqttConfig;
use nodelink::mqtt::envelope::OutboundMessage;
use nodelink::session::connection::ConnectionState;
use nodelink::session::events::{ConfigAccepted, SessionEvent};
use nodelink::session::poll::PollClass;
use nodelink::session::SessionRuntime;
use nodelink::{NodeDefRegistry, PassiveNode, Session, SessionError};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

const TOPIC: &str = "udi/pg3/ns/clients/00:21:b9:02:5e:9e_3";
const WAIT: Duration = Duration::from_secs(2);

const SNAPSHOT: &[u8] = br#"{
    "config": {
        "nodes": [
            {"address": "n003_a1", "nodedefid": "D1", "primary": "n003_a1", "name": "Lamp",
             "drivers": [{"driver": "ST", "value": "0", "uom": 78}]}
        ],
        "customParams": {"host": "10.0.0.2"},
        "shortPoll": 30,
        "longPoll": 300
    },
    "id": "req-1"
}"#;

fn config() -> Config {
    Config {
        identity: SessionIdentity::new("00:21:b9:02:5e:9e", 3),
        mqtt: MqttConfig::default(),
        session: SessionSettings {
            request_timeout_secs: 5,
            ..SessionSettings::default()
        },
    }
}

fn start() -> (Session, SessionRuntime, broadcast::Receiver<SessionEvent>) {
    let mut nodedefs = NodeDefRegistry::new();
    nodedefs.register("D1", PassiveNode::constructor());
    let (session, runtime) = Session::spawn(&config(), nodedefs);
    let events = session.subscribe();
    (session, runtime, events)
}

async fn next_outbound(runtime: &mut SessionRuntime) -> OutboundMessage {
    timeout(WAIT, runtime.outbound.recv())
        .await
        .expect("outbound message in time")
        .expect("outbound channel open")
}

async fn wait_event<F>(events: &mut broadcast::Receiver<SessionEvent>, wanted: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

async fn next_config(events: &mut broadcast::Receiver<SessionEvent>) -> Arc<ConfigAccepted> {
    match wait_event(events, |e| matches!(e, SessionEvent::Config(_))).await {
        SessionEvent::Config(accepted) => accepted,
        _ => unreachable!(),
    }
}

async fn connect(session: &Session, runtime: &mut SessionRuntime) {
    session.on_connection_state(ConnectionState::Connected);
    assert_eq!(next_outbound(runtime).await, OutboundMessage::presence(true));
    assert_eq!(next_outbound(runtime).await, OutboundMessage::config_request());
}

#[tokio::test]
async fn connect_announces_presence_and_applies_snapshot() {
    let (session, mut runtime, mut events) = start();
    connect(&session, &mut runtime).await;

    session.handle_inbound(TOPIC, SNAPSHOT);
    let accepted = next_config(&mut events).await;
    assert!(accepted.is_initial);
    assert!(accepted.params_changed);
    assert_eq!(accepted.snapshot.short_poll, Some(30));
    let record = accepted.nodes.get("a1").expect("a1 created");
    assert_eq!(record.name, "Lamp");
    assert_eq!(record.primary, "a1");

    let mut view = session.watch_registry();
    timeout(WAIT, view.wait_for(|v| v.contains_key("a1")))
        .await
        .expect("view published")
        .expect("engine alive");
}

#[tokio::test]
async fn reconnect_replays_last_snapshot() {
    let (session, mut runtime, mut events) = start();
    connect(&session, &mut runtime).await;
    session.handle_inbound(TOPIC, SNAPSHOT);
    next_config(&mut events).await;

    session.on_connection_state(ConnectionState::Offline);
    assert!(!session.is_usable());
    connect(&session, &mut runtime).await;

    let replayed = next_config(&mut events).await;
    assert!(!replayed.is_initial);
    assert!(!replayed.params_changed);
    assert!(replayed.nodes.contains_key("a1"));
}

#[tokio::test]
async fn add_node_resolves_with_matching_result() {
    let (session, mut runtime, _events) = start();
    connect(&session, &mut runtime).await;

    let node = PassiveNode::unregistered("a2", "a2", "D1", "Porch").with_driver("ST", "0", 78);
    let adder = {
        let session = session.clone();
        tokio::spawn(async move { session.add_node(&node).await })
    };

    let sent = next_outbound(&mut runtime).await;
    assert_eq!(sent.key, "addnode");
    assert_eq!(sent.payload[0]["address"], "a2");
    assert_eq!(sent.payload[0]["nodedefid"], "D1");
    assert_eq!(
        sent.payload[0]["drivers"],
        json!([{"driver": "ST", "value": "0", "uom": 78}])
    );

    session.handle_inbound(
        TOPIC,
        br#"{"result": {"addnode": {"address": "n003_a2", "success": true, "reason": "added"}}}"#,
    );
    let reason = adder.await.expect("task finished").expect("resolved");
    assert_eq!(reason, "added");
}

#[tokio::test]
async fn rejected_result_surfaces_reason() {
    let (session, mut runtime, _events) = start();
    connect(&session, &mut runtime).await;

    let remover = {
        let session = session.clone();
        tokio::spawn(async move { session.remove_node("a9").await })
    };
    assert_eq!(next_outbound(&mut runtime).await.key, "removenode");

    session.handle_inbound(
        TOPIC,
        br#"{"result": {"removenode": [{"address": "a9", "success": false, "reason": "unknown"}]}}"#,
    );
    match remover.await.expect("task finished") {
        Err(SessionError::Rejected { key, reason }) => {
            assert_eq!(key, "removenode-a9");
            assert_eq!(reason, "unknown");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn sends_fail_fast_while_disconnected() {
    let (session, _runtime, _events) = start();
    assert!(session.request_config().expect_err("not connected").is_connectivity());
    let err = session.remove_node("a1").await.expect_err("not connected");
    assert!(err.is_connectivity());
    assert_eq!(session.context().ledger().pending_count(), 0);
}

#[tokio::test]
async fn commands_report_drivers_despite_unknown_keys() {
    let (session, mut runtime, mut events) = start();
    connect(&session, &mut runtime).await;
    session.handle_inbound(TOPIC, SNAPSHOT);
    next_config(&mut events).await;

    session.handle_inbound(TOPIC, br#"{"bogus": {"x": 1}}"#);
    session.handle_inbound(TOPIC, b"not json at all");
    session.handle_inbound(
        TOPIC,
        br#"{"command": {"address": "n003_a1", "cmd": "ST", "value": "100"}, "id": "c-7"}"#,
    );

    let report = next_outbound(&mut runtime).await;
    assert_eq!(
        report,
        OutboundMessage::new(
            "status",
            json!([{"address": "a1", "driver": "ST", "value": "100", "uom": 78}])
        )
    );

    let mut view = session.watch_registry();
    timeout(
        WAIT,
        view.wait_for(|v| v.get("a1").and_then(|r| r.drivers.get("ST")).map(|d| d.value.as_str()) == Some("100")),
    )
    .await
    .expect("driver recorded")
    .expect("engine alive");
}

#[tokio::test]
async fn stop_announces_disconnect_and_ends_worker() {
    let (session, mut runtime, mut events) = start();
    connect(&session, &mut runtime).await;

    session.handle_inbound(TOPIC, br#"{"stop": {}}"#);
    wait_event(&mut events, |e| matches!(e, SessionEvent::Stop)).await;
    assert_eq!(next_outbound(&mut runtime).await, OutboundMessage::presence(false));
    assert!(session.is_shutting_down());
    assert!(matches!(
        session.request_config(),
        Err(SessionError::ShuttingDown)
    ));

    timeout(WAIT, runtime.worker)
        .await
        .expect("worker stops")
        .expect("worker did not panic");
}

async fn configured() -> (Session, SessionRuntime, broadcast::Receiver<SessionEvent>) {
    let (session, mut runtime, mut events) = start();
    connect(&session, &mut runtime).await;
    session.handle_inbound(TOPIC, SNAPSHOT);
    next_config(&mut events).await;
    (session, runtime, events)
}

fn lamp_status(value: &str) -> OutboundMessage {
    OutboundMessage::new(
        "status",
        json!([{"address": "a1", "driver": "ST", "value": value, "uom": 78}]),
    )
}

#[tokio::test]
async fn query_reports_node_drivers() {
    let (session, mut runtime, _events) = configured().await;
    session.handle_inbound(TOPIC, br#"{"query": {"address": "n003_a1"}}"#);
    assert_eq!(next_outbound(&mut runtime).await, lamp_status("0"));
}

#[tokio::test]
async fn status_without_address_reports_every_node() {
    let (session, mut runtime, _events) = configured().await;
    session.handle_inbound(TOPIC, br#"{"status": {}}"#);
    assert_eq!(next_outbound(&mut runtime).await, lamp_status("0"));
}

#[tokio::test]
async fn command_batch_skips_unknown_node() {
    let (session, mut runtime, _events) = configured().await;
    session.handle_inbound(
        TOPIC,
        br#"{"command": [
            {"address": "zz", "cmd": "ST"},
            {"cmd": "ST"},
            {"address": "n003_a1", "cmd": "ST", "value": "100"}
        ]}"#,
    );
    assert_eq!(next_outbound(&mut runtime).await, lamp_status("100"));
}

#[tokio::test(start_paused = true)]
async fn polls_message_and_local_override_arm_timers() {
    let (session, mut runtime, mut events) = start();
    connect(&session, &mut runtime).await;

    session.handle_inbound(TOPIC, br#"{"polls": {"shortPoll": 1}}"#);
    wait_event(&mut events, |e| matches!(e, SessionEvent::Poll(PollClass::Short))).await;

    session
        .set_poll_period(PollClass::Long, Some(1))
        .expect("queue open");
    wait_event(&mut events, |e| matches!(e, SessionEvent::Poll(PollClass::Long))).await;
}

#[tokio::test]
async fn oauth_payload_is_forwarded() {
    let (session, mut runtime, mut events) = start();
    connect(&session, &mut runtime).await;

    session.handle_inbound(TOPIC, br#"{"oauth": {"token": "t"}}"#);
    match wait_event(&mut events, |e| matches!(e, SessionEvent::OAuth(_))).await {
        SessionEvent::OAuth(payload) => assert_eq!(payload, json!({"token": "t"})),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn delete_announces_disconnect_and_stops() {
    let (session, mut runtime, mut events) = start();
    connect(&session, &mut runtime).await;

    session.handle_inbound(TOPIC, br#"{"delete": {}}"#);
    wait_event(&mut events, |e| matches!(e, SessionEvent::Delete)).await;
    assert_eq!(next_outbound(&mut runtime).await, OutboundMessage::presence(false));
    assert!(session.is_shutting_down());
}

#[tokio::test]
async fn stop_wins_over_config_in_same_envelope() {
    let (session, mut runtime, mut events) = start();
    connect(&session, &mut runtime).await;

    session.handle_inbound(
        TOPIC,
        br#"{"config": {"nodes": [{"address": "n003_a1", "nodedefid": "D1", "primary": "n003_a1",
             "name": "Lamp", "drivers": []}]}, "stop": {}}"#,
    );
    wait_event(&mut events, |e| matches!(e, SessionEvent::Stop)).await;

    let engine = timeout(WAIT, runtime.worker)
        .await
        .expect("worker stops")
        .expect("worker did not panic");
    assert!(engine.reconciler().registry().is_empty());
    assert!(!engine.reconciler().has_snapshot());
}
