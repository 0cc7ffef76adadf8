use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::node::{Driver, Node};

/// Read-only copy of the registry handed to collaborators
pub type RegistryView = BTreeMap<String, DeviceRecord>;

/// Value and unit of one status channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverState {
    pub value: String,
    pub uom: u16,
}

/// Locally cached identity and status of one managed device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub address: String,
    /// Own address or the address of the parent device
    pub primary: String,
    pub nodedef_id: String,
    pub name: String,
    pub controller: bool,
    pub enabled: bool,
    pub hint: Option<String>,
    pub drivers: BTreeMap<String, DriverState>,
    pub time_added: DateTime<Utc>,
    pub time_modified: Option<DateTime<Utc>>,
    /// Snapshot fields without a typed slot, kept as received
    pub extra: Map<String, Value>,
}

impl DeviceRecord {
    pub fn new(address: impl Into<String>, nodedef_id: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            primary: address.clone(),
            name: address.clone(),
            address,
            nodedef_id: nodedef_id.into(),
            controller: false,
            enabled: true,
            hint: None,
            drivers: BTreeMap::new(),
            time_added: Utc::now(),
            time_modified: None,
            extra: Map::new(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.primary == self.address
    }

    pub fn driver_list(&self) -> Vec<Driver> {
        self.drivers
            .iter()
            .map(|(name, state)| Driver::new(name.clone(), state.value.clone(), state.uom))
            .collect()
    }
}

/// Strips the broker's `n<profile>_` prefix from an address
pub fn bare_address(address: &str) -> &str {
    let bytes = address.as_bytes();
    let prefixed = bytes.len() > 5
        && bytes[0] == b'n'
        && bytes[1..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'_';
    if prefixed {
        &address[5..]
    } else {
        address
    }
}

struct Entry {
    record: DeviceRecord,
    node: Box<dyn Node>,
}

/// Device records and their node objects, keyed by bare address
#[derive(Default)]
pub struct Registry {
    entries: BTreeMap<String, Entry>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("addresses", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    pub fn record(&self, address: &str) -> Option<&DeviceRecord> {
        self.entries.get(address).map(|e| &e.record)
    }

    pub fn node_mut(&mut self, address: &str) -> Option<&mut (dyn Node + 'static)> {
        self.entries.get_mut(address).map(|e| e.node.as_mut())
    }

    pub fn insert(&mut self, record: DeviceRecord, node: Box<dyn Node>) {
        self.entries
            .insert(record.address.clone(), Entry { record, node });
    }

    /// Applies `update` to the record, then lets the node observe the result
    pub fn update<F>(&mut self, address: &str, update: F) -> bool
    where
        F: FnOnce(&mut DeviceRecord),
    {
        let Some(entry) = self.entries.get_mut(address) else {
            return false;
        };
        update(&mut entry.record);
        entry.node.sync_record(&entry.record);
        true
    }

    pub fn remove(&mut self, address: &str) -> Option<DeviceRecord> {
        self.entries.remove(address).map(|e| e.record)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn view(&self) -> RegistryView {
        self.entries
            .iter()
            .map(|(address, e)| (address.clone(), e.record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PassiveNode;

    #[test]
    fn strips_profile_prefix_only() {
        assert_eq!(bare_address("n001_a1"), "a1");
        assert_eq!(bare_address("n123_controller"), "controller");
        assert_eq!(bare_address("a1"), "a1");
        assert_eq!(bare_address("n01_a1"), "n01_a1");
        assert_eq!(bare_address("nabc_a1"), "nabc_a1");
        assert_eq!(bare_address("n001_"), "n001_");
    }

    #[test]
    fn update_syncs_node() {
        let mut registry = Registry::new();
        let record = DeviceRecord::new("a1", "D1");
        let node = Box::new(PassiveNode::from_record(&record));
        registry.insert(record, node);

        assert!(registry.update("a1", |r| r.name = "Porch".to_string()));
        assert_eq!(registry.record("a1").map(|r| r.name.as_str()), Some("Porch"));
        assert_eq!(registry.node_mut("a1").map(|n| n.name().to_string()), Some("Porch".to_string()));
        assert!(!registry.update("zz", |_| {}));
    }
}
