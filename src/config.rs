//! # Configuration
//!
//! Loads the TOML configuration that tells the session who it is and where
//! the broker lives. The file sits next to the user's other settings
//! (`~/.config/nodelink/config.toml`) unless a path is given, and a handful
//! of environment variables override the deployment coordinates so the same
//! file can be reused across installations.
//!
//! A missing or malformed identity is the one fatal misconfiguration: without
//! it there is no stable client id and no topic to listen on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::mqtt::config::MqttConfig;

const CONFIG_DIR: &str = ".config/nodelink";
const CONFIG_FILE: &str = "config.toml";

const ENV_UUID: &str = "NODELINK_UUID";
const ENV_PROFILE_NUM: &str = "NODELINK_PROFILE_NUM";
const ENV_USER_ID: &str = "NODELINK_USER_ID";
const ENV_MQTT_HOST: &str = "NODELINK_MQTT_HOST";
const ENV_MQTT_PORT: &str = "NODELINK_MQTT_PORT";

/// Deployment coordinates of this session
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Identifier of the controller installation
    pub uuid: String,
    /// Slot this session occupies on the controller (1-999)
    pub profile_num: u16,
    /// Account the session acts for; falls back to the uuid
    #[serde(default)]
    pub user_id: String,
}

impl SessionIdentity {
    pub fn new(uuid: impl Into<String>, profile_num: u16) -> Self {
        Self {
            uuid: uuid.into(),
            profile_num,
            user_id: String::new(),
        }
    }

    /// Stable MQTT client id, `<uuid>_<profileNum>`
    pub fn client_id(&self) -> String {
        format!("{}_{}", self.uuid, self.profile_num)
    }

    pub fn user_id(&self) -> &str {
        if self.user_id.is_empty() {
            &self.uuid
        } else {
            &self.user_id
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uuid.trim().is_empty() {
            return Err(ConfigError::Identity("uuid is empty".to_string()));
        }
        if self.uuid.chars().any(|c| c.is_whitespace() || c == '/' || c == '+' || c == '#') {
            return Err(ConfigError::Identity(format!(
                "uuid {:?} contains characters not allowed in a topic",
                self.uuid
            )));
        }
        if !(1..=999).contains(&self.profile_num) {
            return Err(ConfigError::Identity(format!(
                "profile_num {} outside 1..=999",
                self.profile_num
            )));
        }
        Ok(())
    }
}

/// Tunables of the session engine
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Deadline for correlated requests
    pub request_timeout_secs: u64,
    /// Width of the snapshot storm window
    pub loop_window_secs: u64,
    /// Snapshots tolerated inside one window
    pub loop_threshold: usize,
    /// Buffer of the broadcast event channel
    pub event_capacity: usize,
    /// Nodedef ids served by the passive node implementation
    pub node_defs: Vec<String>,
    /// One of trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            loop_window_secs: 10,
            loop_threshold: 30,
            event_capacity: 256,
            node_defs: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl SessionSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn loop_window(&self) -> Duration {
        Duration::from_secs(self.loop_window_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "session.request_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.loop_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "session.loop_threshold",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "session.event_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// Whole configuration file
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Config {
    pub identity: SessionIdentity,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub session: SessionSettings,
}

impl Config {
    /// Reads the file, applies environment overrides and validates
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };
        info!("Loading configuration from {}", path.display());

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;

        let mut config = Self::from_toml(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        debug!("Configuration loaded: client id {}", config.identity.client_id());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Applies overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uuid) = lookup(ENV_UUID) {
            debug!("Overriding identity uuid from {}", ENV_UUID);
            self.identity.uuid = uuid;
        }
        if let Some(raw) = lookup(ENV_PROFILE_NUM) {
            self.identity.profile_num = raw.trim().parse().map_err(|_| {
                ConfigError::Identity(format!("{} is not a profile number: {:?}", ENV_PROFILE_NUM, raw))
            })?;
        }
        if let Some(user_id) = lookup(ENV_USER_ID) {
            self.identity.user_id = user_id;
        }
        if let Some(host) = lookup(ENV_MQTT_HOST) {
            self.mqtt.host = host;
        }
        if let Some(raw) = lookup(ENV_MQTT_PORT) {
            self.mqtt.port = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "mqtt.port",
                reason: format!("{} is not a port: {:?}", ENV_MQTT_PORT, raw),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity.validate()?;
        self.session.validate()?;
        if self.mqtt.cert_file.is_some() != self.mqtt.key_file.is_some() {
            return Err(ConfigError::Invalid {
                field: "mqtt.cert_file",
                reason: "cert_file and key_file must be set together".to_string(),
            });
        }
        if self.mqtt.cert_file.is_some() && self.mqtt.ca_file.is_none() {
            warn!("Client certificate configured without ca_file, TLS stays disabled");
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let mut path = get_home_dir();
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
