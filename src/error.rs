//! Error taxonomy for the session layer
//!
//! Every failure a collaborator can observe surfaces as a [`SessionError`],
//! either through a rejected correlated send or through a logged diagnostic
//! on the fire-and-forget paths. Nothing here is allowed to take the process
//! down on a single bad message.

use std::time::Duration;

use crate::node::NodeError;

/// Errors produced by the session, its queue and its ledger
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The transport is not in a usable state
    ///
    /// Sends fail fast instead of being buffered while the link is
    /// connecting, reconnecting, offline or closed.
    #[error("Session is not connected (state: {0})")]
    NotConnected(String),

    /// A correlated request got no result before its deadline
    ///
    /// Kept distinct from [`SessionError::Rejected`] so callers can decide to
    /// retry deliberately.
    #[error("Request {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    /// The broker answered a correlated request with `success: false`
    #[error("Request {key} rejected: {reason}")]
    Rejected { key: String, reason: String },

    /// An inbound envelope or payload violated the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A snapshot referenced a nodedef id with no local constructor
    #[error("No node definition registered for {nodedef} (address {address})")]
    UnknownNodeDef { address: String, nodedef: String },

    /// A command or query targeted an address missing from the registry
    #[error("Unknown node address: {0}")]
    UnknownNode(String),

    /// The session is shutting down and no longer accepts work
    #[error("Session is shutting down")]
    ShuttingDown,

    /// The outbound channel towards the transport is gone
    #[error("Transport error: {0}")]
    Transport(String),

    /// A node collaborator refused or failed a command
    #[error("Node error: {0}")]
    Node(#[from] NodeError),
}

impl SessionError {
    /// Whether the error is a correlated-send timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout { .. })
    }

    /// Whether the error means the link was unusable when sending
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SessionError::NotConnected(_))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

/// Errors raised while loading or validating the configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for the expected layout
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The startup identity is missing or malformed
    #[error("Invalid session identity: {0}")]
    Identity(String),

    /// A setting holds a value outside its allowed range
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
