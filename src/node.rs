//! Node domain seam
//!
//! The session never implements device behavior itself. Collaborators hand
//! it a [`NodeDefRegistry`] that maps nodedef ids to constructors, and each
//! constructed [`Node`] answers commands, queries and registration requests.
//! [`PassiveNode`] is the plain data holder used when no richer behavior is
//! needed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::session::registry::DeviceRecord;

/// One status channel value as reported to the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub driver: String,
    pub value: String,
    pub uom: u16,
}

impl Driver {
    pub fn new(driver: impl Into<String>, value: impl Into<String>, uom: u16) -> Self {
        Self {
            driver: driver.into(),
            value: value.into(),
            uom,
        }
    }
}

/// A command addressed to one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCommand {
    pub address: String,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uom: Option<u16>,
    /// Extra named parameters sent along with the command
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub query: Map<String, Value>,
}

/// Registration body sent with `addnode`
///
/// Produced by [`Node::registration`], which converts the node's driver set
/// into the list form the broker expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegistration {
    pub address: String,
    pub primary: String,
    #[serde(rename = "nodedefid")]
    pub nodedef_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub is_controller: bool,
    pub drivers: Vec<Driver>,
}

/// Errors a node collaborator may report back to the session
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The node has no handler for the command
    #[error("Command {cmd} not supported by node {address}")]
    UnsupportedCommand { address: String, cmd: String },

    /// The command was understood but failed
    #[error("Command failed on node {address}: {reason}")]
    CommandFailed { address: String, reason: String },
}

/// Behavior the session needs from a managed device
pub trait Node: Send + Sync + fmt::Debug {
    fn address(&self) -> &str;

    fn primary(&self) -> &str;

    fn nodedef_id(&self) -> &str;

    fn name(&self) -> &str;

    fn is_controller(&self) -> bool {
        false
    }

    fn hint(&self) -> Option<&str> {
        None
    }

    /// Current status channel values
    fn drivers(&self) -> Vec<Driver>;

    /// Driver conversion, invoked before every outbound registration
    fn registration(&self) -> NodeRegistration {
        NodeRegistration {
            address: self.address().to_string(),
            primary: self.primary().to_string(),
            nodedef_id: self.nodedef_id().to_string(),
            name: self.name().to_string(),
            hint: self.hint().map(str::to_string),
            is_controller: self.is_controller(),
            drivers: self.drivers(),
        }
    }

    /// Called after the registry merged a snapshot entry into the record
    fn sync_record(&mut self, _record: &DeviceRecord) {}

    /// Executes a broker command and returns drivers to report
    fn run_command(&mut self, command: &NodeCommand) -> Result<Vec<Driver>, NodeError>;

    /// Refreshes the node and returns drivers to report
    fn query(&mut self) -> Vec<Driver> {
        self.drivers()
    }
}

/// Builds a node from the record created for it during reconciliation
pub type NodeConstructor = Arc<dyn Fn(&DeviceRecord) -> Box<dyn Node> + Send + Sync>;

/// Known definition classes keyed by nodedef id
#[derive(Clone, Default)]
pub struct NodeDefRegistry {
    defs: HashMap<String, NodeConstructor>,
}

impl NodeDefRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, nodedef_id: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&DeviceRecord) -> Box<dyn Node> + Send + Sync + 'static,
    {
        let nodedef_id = nodedef_id.into();
        debug!("Registering node definition {}", nodedef_id);
        self.defs.insert(nodedef_id, Arc::new(constructor));
        self
    }

    pub fn contains(&self, nodedef_id: &str) -> bool {
        self.defs.contains_key(nodedef_id)
    }

    pub fn construct(&self, record: &DeviceRecord) -> Option<Box<dyn Node>> {
        self.defs.get(&record.nodedef_id).map(|build| build(record))
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

impl fmt::Debug for NodeDefRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.defs.keys().collect();
        ids.sort();
        f.debug_struct("NodeDefRegistry").field("defs", &ids).finish()
    }
}

/// A node that only mirrors its record
///
/// Commands are accepted only when they name one of the node's drivers, in
/// which case the driver takes the command value.
#[derive(Debug, Clone)]
pub struct PassiveNode {
    address: String,
    primary: String,
    nodedef_id: String,
    name: String,
    controller: bool,
    hint: Option<String>,
    drivers: BTreeMap<String, (String, u16)>,
}

impl PassiveNode {
    pub fn from_record(record: &DeviceRecord) -> Self {
        Self {
            address: record.address.clone(),
            primary: record.primary.clone(),
            nodedef_id: record.nodedef_id.clone(),
            name: record.name.clone(),
            controller: record.controller,
            hint: record.hint.clone(),
            drivers: record
                .drivers
                .iter()
                .map(|(name, state)| (name.clone(), (state.value.clone(), state.uom)))
                .collect(),
        }
    }

    pub fn constructor() -> impl Fn(&DeviceRecord) -> Box<dyn Node> + Send + Sync + 'static {
        |record: &DeviceRecord| -> Box<dyn Node> { Box::new(PassiveNode::from_record(record)) }
    }

    /// Builds a node that is not known to the broker yet
    pub fn unregistered(
        address: impl Into<String>,
        primary: impl Into<String>,
        nodedef_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            primary: primary.into(),
            nodedef_id: nodedef_id.into(),
            name: name.into(),
            controller: false,
            hint: None,
            drivers: BTreeMap::new(),
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>, value: impl Into<String>, uom: u16) -> Self {
        self.drivers.insert(driver.into(), (value.into(), uom));
        self
    }

    pub fn as_controller(mut self) -> Self {
        self.controller = true;
        self
    }
}

impl Node for PassiveNode {
    fn address(&self) -> &str {
        &self.address
    }

    fn primary(&self) -> &str {
        &self.primary
    }

    fn nodedef_id(&self) -> &str {
        &self.nodedef_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_controller(&self) -> bool {
        self.controller
    }

    fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    fn drivers(&self) -> Vec<Driver> {
        self.drivers
            .iter()
            .map(|(name, (value, uom))| Driver::new(name.clone(), value.clone(), *uom))
            .collect()
    }

    fn sync_record(&mut self, record: &DeviceRecord) {
        *self = PassiveNode::from_record(record);
    }

    fn run_command(&mut self, command: &NodeCommand) -> Result<Vec<Driver>, NodeError> {
        let Some((value, uom)) = self.drivers.get_mut(&command.cmd) else {
            return Err(NodeError::UnsupportedCommand {
                address: self.address.clone(),
                cmd: command.cmd.clone(),
            });
        };
        if let Some(new_value) = &command.value {
            *value = new_value.clone();
        }
        if let Some(new_uom) = command.uom {
            *uom = new_uom;
        }
        Ok(vec![Driver::new(command.cmd.clone(), value.clone(), *uom)])
    }
}
