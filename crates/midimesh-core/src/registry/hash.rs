use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use midimesh_proto::{node_hash, NodeId};

/// Bidirectional map between 32-bit wire hashes and full node identifiers.
///
/// The hash fold is lossy; on a collision the first registration
/// wins, the hash is remembered in the collision set and the event is
/// logged. Callers deserializing forwarding context must be prepared for a
/// collided hash to resolve to the wrong node and treat the context as
/// unusable.
#[derive(Default)]
pub struct HashRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_hash: HashMap<u32, NodeId>,
    by_node: HashMap<NodeId, u32>,
    collisions: HashSet<u32>,
}

impl HashRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, returning its wire hash.
    ///
    /// Idempotent for repeated registrations of the same node. A different
    /// node folding to an occupied hash is rejected: the existing mapping is
    /// retained and the hash is marked collided.
    pub fn register(&self, node: NodeId) -> u32 {
        let hash = node_hash(&node);
        let mut inner = self.inner.lock();
        match inner.by_hash.get(&hash) {
            None => {
                inner.by_hash.insert(hash, node);
                inner.by_node.insert(node, hash);
            }
            Some(existing) if *existing == node => {}
            Some(existing) => {
                tracing::warn!(
                    hash = format_args!("{hash:#010x}"),
                    kept = %existing,
                    rejected = %node,
                    "node hash collision; first registration wins"
                );
                inner.collisions.insert(hash);
            }
        }
        hash
    }

    /// Remove a node's mapping; returns whether it was registered.
    pub fn unregister(&self, node: &NodeId) -> bool {
        let mut inner = self.inner.lock();
        let Some(hash) = inner.by_node.remove(node) else {
            return false;
        };
        if inner.by_hash.get(&hash) == Some(node) {
            inner.by_hash.remove(&hash);
        }
        true
    }

    /// Resolve a wire hash to the full node identifier.
    pub fn lookup(&self, hash: u32) -> Option<NodeId> {
        self.inner.lock().by_hash.get(&hash).copied()
    }

    /// The wire hash of a registered node.
    pub fn hash_of(&self, node: &NodeId) -> Option<u32> {
        self.inner.lock().by_node.get(node).copied()
    }

    /// Whether this hash has seen conflicting registrations.
    pub fn has_collision(&self, hash: u32) -> bool {
        self.inner.lock().collisions.contains(&hash)
    }

    /// Every registered (hash, node) pair.
    pub fn all(&self) -> Vec<(u32, NodeId)> {
        self.inner
            .lock()
            .by_hash
            .iter()
            .map(|(&hash, &node)| (hash, node))
            .collect()
    }

    /// Registered node count.
    pub fn len(&self) -> usize {
        self.inner.lock().by_hash.len()
    }

    /// Whether no nodes are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_hash.is_empty()
    }

    /// Drop every mapping and the collision set.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_hash.clear();
        inner.by_node.clear();
        inner.collisions.clear();
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn register_and_lookup_roundtrip() {
        let registry = HashRegistry::new();
        let node = NodeId::generate();
        let hash = registry.register(node);
        assert_eq!(registry.lookup(hash), Some(node));
        assert_eq!(registry.hash_of(&node), Some(hash));
        assert!(!registry.has_collision(hash));
    }

    #[test]
    fn duplicate_registration_is_idempotent() {
        let registry = HashRegistry::new();
        let node = NodeId::generate();
        let first = registry.register(node);
        let second = registry.register(node);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn collision_keeps_first_registration() {
        let registry = HashRegistry::new();
        // Two ids engineered to fold to the same 32-bit hash: the second
        // half cancels out the difference in the first.
        let a = NodeId::from_uuid(Uuid::from_u128(0x0000_0000_0000_0001_0000_0000_0000_0000));
        let b = NodeId::from_uuid(Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0001));
        assert_eq!(node_hash(&a), node_hash(&b));
        assert_ne!(a, b);

        let hash = registry.register(a);
        registry.register(b);
        assert_eq!(registry.lookup(hash), Some(a));
        assert!(registry.has_collision(hash));
        assert_eq!(registry.hash_of(&b), None);
    }

    #[test]
    fn unregister_removes_both_directions() {
        let registry = HashRegistry::new();
        let node = NodeId::generate();
        let hash = registry.register(node);
        assert!(registry.unregister(&node));
        assert_eq!(registry.lookup(hash), None);
        assert!(!registry.unregister(&node));
    }

    #[test]
    fn clear_empties_everything() {
        let registry = HashRegistry::new();
        registry.register(NodeId::generate());
        registry.register(NodeId::generate());
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.all().is_empty());
    }
}
