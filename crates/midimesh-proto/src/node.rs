use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 128-bit identifier of a mesh node, stable for the lifetime of its process.
///
/// The nil value stands for "the local node" inside the registries; it never
/// appears as a source or destination on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// The local-node sentinel.
    pub const LOCAL: NodeId = NodeId(Uuid::nil());

    /// Generate a fresh random node identifier.
    pub fn generate() -> Self {
        NodeId(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        NodeId(id)
    }

    /// Whether this is the local-node sentinel.
    pub fn is_local(&self) -> bool {
        self.0.is_nil()
    }

    /// The identifier as a raw 128-bit integer.
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(NodeId(Uuid::parse_str(s)?))
    }
}

/// Folds a 128-bit node identifier into the 32-bit hash used on the wire.
///
/// Each 64-bit half is folded with itself shifted right by 32, then the two
/// folds are combined with XOR. Sender, receiver and the hash registry must
/// all use this exact function; it is part of the wire contract.
#[inline]
pub fn node_hash(id: &NodeId) -> u32 {
    let value = id.as_u128();
    fold64((value >> 64) as u64) ^ fold64(value as u64)
}

#[inline]
fn fold64(half: u64) -> u32 {
    (half ^ (half >> 32)) as u32
}

/// Globally unique identifier of a MIDI endpoint in the mesh.
///
/// Two nodes may both expose device id 0; the owner disambiguates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DeviceKey {
    /// Owning node; [`NodeId::LOCAL`] for devices attached to this process.
    #[serde(rename = "nodeId")]
    pub owner: NodeId,
    /// Device id within the owning node.
    #[serde(rename = "deviceId")]
    pub device_id: u16,
}

impl DeviceKey {
    /// Key of a locally attached device.
    pub fn local(device_id: u16) -> Self {
        DeviceKey {
            owner: NodeId::LOCAL,
            device_id,
        }
    }

    /// Key of a device owned by a remote peer.
    pub fn remote(owner: NodeId, device_id: u16) -> Self {
        DeviceKey { owner, device_id }
    }

    /// Whether the device is attached to this process.
    pub fn is_local(&self) -> bool {
        self.owner.is_local()
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "local/{}", self.device_id)
        } else {
            write!(f, "{}/{}", self.owner, self.device_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_folds_both_halves() {
        let id = NodeId::from_uuid(Uuid::from_u128(0x0123_4567_89AB_CDEF_0011_2233_4455_6677));
        let hi = 0x0123_4567_89AB_CDEFu64;
        let lo = 0x0011_2233_4455_6677u64;
        let expected = ((hi ^ (hi >> 32)) as u32) ^ ((lo ^ (lo >> 32)) as u32);
        assert_eq!(node_hash(&id), expected);
    }

    #[test]
    fn local_sentinel_hashes_to_zero() {
        assert_eq!(node_hash(&NodeId::LOCAL), 0);
        assert!(NodeId::LOCAL.is_local());
    }

    #[test]
    fn node_id_string_roundtrip() {
        let id = NodeId::generate();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn device_keys_disambiguate_by_owner() {
        let peer = NodeId::generate();
        assert_ne!(DeviceKey::local(0), DeviceKey::remote(peer, 0));
        assert_eq!(DeviceKey::local(3), DeviceKey::local(3));
    }
}
