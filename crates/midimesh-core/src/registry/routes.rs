use std::collections::BTreeMap;

use parking_lot::Mutex;

use midimesh_proto::{DeviceKey, NodeId};

use super::DeviceDirection;

/// Routing entry: where a device lives and what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Device key, including the owning node.
    pub key: DeviceKey,
    /// Human-readable name carried for diagnostics.
    pub name: String,
    /// Input or output.
    pub direction: DeviceDirection,
}

/// Device-to-owner map behind routing decisions.
///
/// Kept ordered so lookups stay `O(log n)` and listings come out sorted.
/// Maintained in lock-step with the device registry by the mesh boundary;
/// the separation keeps display metadata out of the dispatch path.
#[derive(Default)]
pub struct RoutingTable {
    routes: Mutex<BTreeMap<DeviceKey, RouteEntry>>,
}

impl RoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local device route.
    pub fn add_local(&self, device_id: u16, name: impl Into<String>, direction: DeviceDirection) {
        self.insert(RouteEntry {
            key: DeviceKey::local(device_id),
            name: name.into(),
            direction,
        });
    }

    /// Register a remote device route.
    pub fn add_remote(
        &self,
        owner: NodeId,
        device_id: u16,
        name: impl Into<String>,
        direction: DeviceDirection,
    ) {
        self.insert(RouteEntry {
            key: DeviceKey::remote(owner, device_id),
            name: name.into(),
            direction,
        });
    }

    /// Insert or replace an entry.
    pub fn insert(&self, entry: RouteEntry) {
        self.routes.lock().insert(entry.key, entry);
    }

    /// Remove one route; returns whether it existed.
    pub fn remove(&self, key: &DeviceKey) -> bool {
        self.routes.lock().remove(key).is_some()
    }

    /// Purge every route owned by `owner`; returns the number removed.
    pub fn remove_all_for_owner(&self, owner: &NodeId) -> usize {
        let mut routes = self.routes.lock();
        let before = routes.len();
        routes.retain(|key, _| key.owner != *owner);
        before - routes.len()
    }

    /// Atomically replace all routes owned by `owner` with `entries`.
    ///
    /// Used on peer reconnect so the table never shows a mix of stale and
    /// fresh routes.
    pub fn replace_for_owner(&self, owner: &NodeId, entries: Vec<RouteEntry>) {
        let mut routes = self.routes.lock();
        routes.retain(|key, _| key.owner != *owner);
        for entry in entries {
            debug_assert_eq!(entry.key.owner, *owner);
            routes.insert(entry.key, entry);
        }
    }

    /// Look a route up.
    pub fn get(&self, key: &DeviceKey) -> Option<RouteEntry> {
        self.routes.lock().get(key).cloned()
    }

    /// The owner of a device, if routed.
    pub fn owner_of(&self, key: &DeviceKey) -> Option<NodeId> {
        self.routes.lock().get(key).map(|entry| entry.key.owner)
    }

    /// Whether the device is routed locally.
    pub fn is_local_device(&self, key: &DeviceKey) -> bool {
        matches!(self.owner_of(key), Some(owner) if owner.is_local())
    }

    /// All routes in key order.
    pub fn list(&self) -> Vec<RouteEntry> {
        self.routes.lock().values().cloned().collect()
    }

    /// Routes owned by `owner`, in key order.
    pub fn list_for_owner(&self, owner: &NodeId) -> Vec<RouteEntry> {
        self.routes
            .lock()
            .values()
            .filter(|entry| entry.key.owner == *owner)
            .cloned()
            .collect()
    }

    /// Total route count.
    pub fn count(&self) -> usize {
        self.routes.lock().len()
    }
}
