use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use nodelink::mqtt::mqtt_handler::{Configured, MqttLink};
use nodelink::session::events::SessionEvent;
use nodelink::{Config, NodeDefRegistry, PassiveNode, Session};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())
        .await
        .map_err(|e| eyre!("Failed to load configuration: {}", e))?;
    setup_logging_env(config.session.tracing_level());
    info!("Starting session {}", config.identity.client_id());

    let mut nodedefs = NodeDefRegistry::new();
    for nodedef in &config.session.node_defs {
        nodedefs.register(nodedef.clone(), PassiveNode::constructor());
    }
    if nodedefs.is_empty() {
        warn!("No node definitions configured, every snapshot entry will be skipped");
    }

    let (session, runtime) = Session::spawn(&config, nodedefs);
    let events_handle = tokio::spawn(log_events(session.subscribe()));

    let link = MqttLink::<Configured>::create(&config.mqtt, &config.identity)
        .await
        .map_err(|e| eyre!("Failed to configure MQTT link: {}", e))?
        .open(&session);
    let link_handle = tokio::spawn(link.run(session.clone(), runtime.outbound));

    let shutdown = session.shutdown_token();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Interrupt received, stopping");
            session.stop();
        }
        _ = shutdown.cancelled() => info!("Session stopped by broker"),
    }

    link_handle
        .await
        .map_err(|e| eyre!("MQTT link task failed: {}", e))?;
    let engine = runtime
        .worker
        .await
        .map_err(|e| eyre!("Queue worker failed: {}", e))?;
    info!(
        "Session ended with {} nodes registered",
        engine.reconciler().registry().len()
    );
    events_handle.abort();
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn setup_logging_env(configured: Level) {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|raw| raw.parse::<Level>().ok())
        .unwrap_or(configured);
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Config(accepted)) => info!(
                "Configuration accepted: {} nodes (initial: {}, params changed: {})",
                accepted.nodes.len(),
                accepted.is_initial,
                accepted.params_changed
            ),
            Ok(SessionEvent::Poll(class)) => debug!("{} tick", class),
            Ok(SessionEvent::Sent(message)) => trace!("-> {}", message),
            Ok(SessionEvent::Received(message)) => trace!("<- {}", message),
            Ok(other) => info!("Session event: {:?}", other),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Event logger lagged, {} events missed", missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
