//! Client-side session layer between a device controller and a managed
//! MQTT broker service: connection tracking, ordered command handling,
//! request/result correlation, poll scheduling and registry reconciliation.

pub mod config;
pub mod error;
pub mod mqtt;
pub mod node;
pub mod session;

pub use config::{Config, SessionIdentity};
pub use error::{ConfigError, SessionError};
pub use node::{Node, NodeDefRegistry, PassiveNode};
pub use session::{Session, SessionRuntime};
