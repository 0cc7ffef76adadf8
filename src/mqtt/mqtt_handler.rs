//! MQTT link lifecycle
//!
//! `Configured → Running → Closed`, modelled with statum like the other
//! long-running workers. The running link polls the rumqttc event loop,
//! reports lifecycle signals to the [`Session`] and feeds it inbound
//! publishes. A separate pump task stamps and publishes outbound messages.

use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use statum::{machine, state};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::MqttConfig;
use super::envelope::{OutboundMessage, WireMessage};
use crate::config::SessionIdentity;
use crate::error::ConfigError;
use crate::session::connection::ConnectionState;
use crate::session::events::SessionEvent;
use crate::session::Session;

/// Time granted to flush queued publishes and the disconnect packet
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Configured,
    Running,
    Closed,
}

#[machine]
pub struct MqttLink<S: LinkState> {
    client: AsyncClient,
    eventloop: EventLoop,
    inbound_topic: String,
    reconnect_delay: Duration,
}

impl MqttLink<Configured> {
    pub async fn create(config: &MqttConfig, identity: &SessionIdentity) -> Result<Self, ConfigError> {
        let client_id = identity.client_id();
        let mut options = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive());

        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }

        let presence_gone = OutboundMessage::presence(false).stamp(identity, &config.outbound_topic(identity));
        options.set_last_will(LastWill::new(
            config.outbound_topic(identity),
            presence_gone.to_string(),
            QoS::AtLeastOnce,
            false,
        ));

        if let Some(ca_file) = &config.ca_file {
            let ca = read_pem(ca_file).await?;
            let client_auth = match (&config.cert_file, &config.key_file) {
                (Some(cert), Some(key)) => Some((read_pem(cert).await?, read_pem(key).await?)),
                _ => None,
            };
            info!("TLS enabled (mutual: {})", client_auth.is_some());
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }

        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity.max(1));
        debug!(
            "MQTT link configured for {}:{} as {}",
            config.host, config.port, client_id
        );
        Ok(Self::new(
            client,
            eventloop,
            config.inbound_topic(identity),
            config.reconnect_delay(),
        ))
    }

    pub fn open(self, session: &Session) -> MqttLink<Running> {
        info!("Opening MQTT link, listening on {}", self.inbound_topic);
        session.on_connection_state(ConnectionState::Connecting);
        self.transition()
    }
}

impl MqttLink<Running> {
    /// Drives the link until the session shuts down or the client is gone
    pub async fn run(
        mut self,
        session: Session,
        outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    ) -> MqttLink<Closed> {
        let mut pump = tokio::spawn(pump_outbound(self.client.clone(), session.clone(), outbound));

        loop {
            tokio::select! {
                done = &mut pump => {
                    if let Err(e) = done {
                        error!("Outbound pump failed: {}", e);
                    }
                    break;
                }
                event = self.eventloop.poll() => {
                    if self.on_event(&session, event).await.is_break() {
                        pump.abort();
                        break;
                    }
                }
            }
        }

        self.flush_and_disconnect().await;
        session.on_connection_state(ConnectionState::Closed);
        info!("MQTT link closed");
        self.transition()
    }

    async fn on_event(
        &mut self,
        session: &Session,
        event: Result<Event, ConnectionError>,
    ) -> ControlFlow<()> {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    if let Err(e) = self.client.try_subscribe(&self.inbound_topic, QoS::AtLeastOnce) {
                        error!("Failed to subscribe to {}: {}", self.inbound_topic, e);
                    }
                    session.on_connection_state(ConnectionState::Connected);
                } else {
                    warn!("Broker refused connection: {:?}", ack.code);
                    session.on_connection_state(ConnectionState::Reconnecting);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!("Publish on {} ({} bytes)", publish.topic, publish.payload.len());
                session.handle_inbound(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!("Subscription acknowledged: {:?}", ack.return_codes);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker sent disconnect");
                session.on_connection_state(ConnectionState::Closed);
            }
            Ok(other) => trace!("MQTT event: {:?}", other),
            Err(ConnectionError::RequestsDone) => {
                info!("All MQTT request handles dropped");
                session.on_connection_state(ConnectionState::Ended);
                return ControlFlow::Break(());
            }
            Err(ConnectionError::Io(e)) => {
                warn!("MQTT connection lost: {}", e);
                session.on_connection_state(ConnectionState::Offline);
                back_off(self.reconnect_delay, session.shutdown_token()).await;
            }
            Err(e) => {
                warn!("MQTT error: {}", e);
                session.on_connection_state(ConnectionState::Reconnecting);
                back_off(self.reconnect_delay, session.shutdown_token()).await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn flush_and_disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Could not queue disconnect: {}", e);
            return;
        }
        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Event loop ended while flushing: {}", e);
                        break;
                    }
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("Timed out flushing MQTT link");
        }
    }
}

/// Waits out `delay` unless the session shuts down first
async fn back_off(delay: Duration, shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.cancelled() => {}
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    tokio::fs::read(path).await.map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Publishes outbound messages in order; drains what is left on shutdown
async fn pump_outbound(
    client: AsyncClient,
    session: Session,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    let topic = session.outbound_topic().to_string();
    let shutdown = session.shutdown_token();
    loop {
        tokio::select! {
            biased;

            message = outbound.recv() => match message {
                Some(message) => publish(&client, &session, &topic, message).await,
                None => return,
            },
            _ = shutdown.cancelled() => break,
        }
    }
    while let Ok(message) = outbound.try_recv() {
        publish(&client, &session, &topic, message).await;
    }
    debug!("Outbound pump drained");
}

async fn publish(client: &AsyncClient, session: &Session, topic: &str, message: OutboundMessage) {
    let envelope = message.stamp(session.identity(), topic);
    let content = envelope.to_string();
    match client
        .publish(topic, QoS::AtLeastOnce, false, content.clone().into_bytes())
        .await
    {
        Ok(()) => {
            debug!("Published {} to {}", message.key, topic);
            session
                .context()
                .events()
                .emit(SessionEvent::Sent(WireMessage::from_topic(topic, content)));
        }
        Err(e) => error!("Failed to publish {}: {}", message.key, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::node::NodeDefRegistry;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn running_link_can_be_spawned() {
        let config = Config {
            identity: SessionIdentity::new("00:21:b9:02:5e:9e", 3),
            ..Config::default()
        };
        let (session, runtime) = Session::spawn(&config, NodeDefRegistry::new());
        let link = MqttLink::<Configured>::create(&config.mqtt, &config.identity)
            .await
            .expect("plain TCP link")
            .open(&session);
        assert_eq!(session.connection_state(), ConnectionState::Connecting);

        let run = link.run(session.clone(), runtime.outbound);
        assert_send(&run);
        drop(run);
        session.stop();
    }
}
