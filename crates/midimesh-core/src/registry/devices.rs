use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use midimesh_proto::{DeviceKey, NodeId};

/// Direction of a MIDI endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    /// Produces MIDI data (keyboards, controllers).
    Input,
    /// Consumes MIDI data (synths, outboard gear).
    Output,
}

/// Catalog entry for a device known to the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Globally unique key; local devices carry the local-sentinel owner.
    pub key: DeviceKey,
    /// Human-readable name as reported by the owner.
    pub name: String,
    /// Input or output.
    pub direction: DeviceDirection,
    /// Manufacturer, when the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
}

/// Thread-safe catalog of local and remote MIDI devices.
///
/// Local records are created by port enumeration at startup; remote records
/// by peer announcements. Everything owned by a peer is purged in one
/// operation when that peer disconnects.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceKey, DeviceRecord>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locally attached device.
    pub fn add_local(
        &self,
        device_id: u16,
        name: impl Into<String>,
        direction: DeviceDirection,
        manufacturer: Option<String>,
    ) -> DeviceKey {
        let key = DeviceKey::local(device_id);
        self.insert(DeviceRecord {
            key,
            name: name.into(),
            direction,
            manufacturer,
        });
        key
    }

    /// Register a device announced by a remote peer.
    pub fn add_remote(
        &self,
        owner: NodeId,
        device_id: u16,
        name: impl Into<String>,
        direction: DeviceDirection,
        manufacturer: Option<String>,
    ) -> DeviceKey {
        let key = DeviceKey::remote(owner, device_id);
        self.insert(DeviceRecord {
            key,
            name: name.into(),
            direction,
            manufacturer,
        });
        key
    }

    /// Insert or replace a record.
    pub fn insert(&self, record: DeviceRecord) {
        self.devices.lock().insert(record.key, record);
    }

    /// Remove one device; returns whether it existed.
    pub fn remove(&self, key: &DeviceKey) -> bool {
        self.devices.lock().remove(key).is_some()
    }

    /// Purge every device owned by `owner` under a single lock.
    /// Returns the number removed.
    pub fn remove_all_for_owner(&self, owner: &NodeId) -> usize {
        let mut devices = self.devices.lock();
        let before = devices.len();
        devices.retain(|key, _| key.owner != *owner);
        before - devices.len()
    }

    /// Look a device up.
    pub fn get(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        self.devices.lock().get(key).cloned()
    }

    /// Whether the key is registered.
    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.devices.lock().contains_key(key)
    }

    /// Whether `device_id` is free for the given owner.
    pub fn is_id_available(&self, owner: &NodeId, device_id: u16) -> bool {
        !self.devices.lock().contains_key(&DeviceKey {
            owner: *owner,
            device_id,
        })
    }

    /// All devices, sorted by key.
    pub fn list(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.devices.lock().values().cloned().collect();
        records.sort_by_key(|record| record.key);
        records
    }

    /// Devices attached to this process.
    pub fn list_local(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self
            .devices
            .lock()
            .values()
            .filter(|record| record.key.is_local())
            .cloned()
            .collect();
        records.sort_by_key(|record| record.key);
        records
    }

    /// Devices owned by any remote peer.
    pub fn list_remote(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self
            .devices
            .lock()
            .values()
            .filter(|record| !record.key.is_local())
            .cloned()
            .collect();
        records.sort_by_key(|record| record.key);
        records
    }

    /// Devices owned by a specific node.
    pub fn list_for_owner(&self, owner: &NodeId) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self
            .devices
            .lock()
            .values()
            .filter(|record| record.key.owner == *owner)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.key);
        records
    }

    /// Total device count.
    pub fn count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Local device count.
    pub fn local_count(&self) -> usize {
        self.devices
            .lock()
            .keys()
            .filter(|key| key.is_local())
            .count()
    }

    /// Remote device count.
    pub fn remote_count(&self) -> usize {
        self.devices
            .lock()
            .keys()
            .filter(|key| !key.is_local())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_and_remote_records_coexist() {
        let registry = DeviceRegistry::new();
        let peer = NodeId::generate();
        registry.add_local(0, "Keys", DeviceDirection::Input, None);
        registry.add_remote(peer, 0, "Peer Synth", DeviceDirection::Output, Some("Moog".into()));

        assert_eq!(registry.count(), 2);
        assert_eq!(registry.local_count(), 1);
        assert_eq!(registry.remote_count(), 1);
        assert!(registry.contains(&DeviceKey::local(0)));
        assert!(registry.contains(&DeviceKey::remote(peer, 0)));
        assert!(!registry.is_id_available(&NodeId::LOCAL, 0));
        assert!(registry.is_id_available(&NodeId::LOCAL, 1));
    }

    #[test]
    fn owner_purge_is_complete() {
        let registry = DeviceRegistry::new();
        let peer = NodeId::generate();
        let other = NodeId::generate();
        registry.add_remote(peer, 0, "A", DeviceDirection::Input, None);
        registry.add_remote(peer, 1, "B", DeviceDirection::Output, None);
        registry.add_remote(other, 0, "C", DeviceDirection::Output, None);
        registry.add_local(5, "Local", DeviceDirection::Input, None);

        assert_eq!(registry.remove_all_for_owner(&peer), 2);
        assert!(registry.list_for_owner(&peer).is_empty());
        assert_eq!(registry.count(), 2);
        assert!(registry.contains(&DeviceKey::remote(other, 0)));
    }

    #[test]
    fn listing_is_sorted_and_cloned() {
        let registry = DeviceRegistry::new();
        registry.add_local(3, "C", DeviceDirection::Output, None);
        registry.add_local(1, "A", DeviceDirection::Input, None);
        let listed = registry.list_local();
        assert_eq!(listed[0].key.device_id, 1);
        assert_eq!(listed[1].key.device_id, 3);
    }
}
