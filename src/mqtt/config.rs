use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SessionIdentity;

pub const DEFAULT_TOPIC_PREFIX: &str = "udi/pg3/ns";

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// CA bundle; TLS is enabled when this is set
    pub ca_file: Option<PathBuf>,
    /// Client certificate and key for mutual TLS
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub topic_prefix: String,
    /// Capacity of the rumqttc request channel
    pub channel_capacity: usize,
    /// Pause between failed polls of the event loop
    pub reconnect_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 10,
            username: None,
            password: None,
            ca_file: None,
            cert_file: None,
            key_file: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            channel_capacity: 100,
            reconnect_delay_secs: 5,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Topic the broker publishes to for this client
    pub fn inbound_topic(&self, identity: &SessionIdentity) -> String {
        format!("{}/clients/{}", self.topic_prefix, identity.client_id())
    }

    /// Topic this client publishes to
    pub fn outbound_topic(&self, identity: &SessionIdentity) -> String {
        format!("{}/status/{}", self.topic_prefix, identity.client_id())
    }

    pub fn uses_tls(&self) -> bool {
        self.ca_file.is_some()
    }
}
