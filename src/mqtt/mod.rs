//! # MQTT binding
//!
//! Connects the session to the broker over rumqttc.
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Broker address, credentials, TLS files, topic layout
//! ├── envelope.rs      - Inbound envelope parsing and outbound stamping
//! └── mqtt_handler.rs  - Link state machine, event loop and outbound pump
//! ```
//!
//! The session itself never touches rumqttc. It only sees bytes coming in,
//! lifecycle signals and a channel of [`envelope::OutboundMessage`]s going
//! out, so it can be driven without a broker in tests.

pub mod config;
pub mod envelope;
pub mod mqtt_handler;
