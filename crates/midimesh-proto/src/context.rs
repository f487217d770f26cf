//! Forwarding context: the loop-prevention state a message carries across
//! nodes. On the wire it is a compact block of (owner hash, device id) pairs;
//! in process it is a set of [`DeviceKey`]s plus a hop count.

use std::collections::HashSet;

use thiserror::Error;

use crate::node::{node_hash, DeviceKey, NodeId};

/// Maximum number of hops a message may take through the mesh.
pub const MAX_HOPS: u8 = 8;

/// Errors from resolving a wire context back to full device keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// A visited-device owner hash has no registered node.
    #[error("no node registered for hash {0:#010x}")]
    UnknownHash(u32),
}

/// Wire form of the forwarding context.
///
/// Layout: 1-byte hop count, 1-byte entry count, then one
/// (4-byte big-endian owner hash, 2-byte big-endian device id) pair per
/// visited device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireContext {
    /// Hops taken so far.
    pub hop_count: u8,
    /// Visited devices as (owner hash, device id).
    pub visited: Vec<(u32, u16)>,
}

impl WireContext {
    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        2 + 6 * self.visited.len()
    }

    /// Append the wire encoding to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.hop_count);
        buf.push(self.visited.len() as u8);
        for &(owner_hash, device_id) in &self.visited {
            buf.extend_from_slice(&owner_hash.to_be_bytes());
            buf.extend_from_slice(&device_id.to_be_bytes());
        }
    }

    /// Decode a context block from the front of `bytes`.
    ///
    /// Returns the context and the number of bytes consumed, or `None` when
    /// the block is truncated.
    pub fn decode(bytes: &[u8]) -> Option<(WireContext, usize)> {
        if bytes.len() < 2 {
            return None;
        }
        let hop_count = bytes[0];
        let count = bytes[1] as usize;
        let len = 2 + 6 * count;
        if bytes.len() < len {
            return None;
        }
        let mut visited = Vec::with_capacity(count);
        for chunk in bytes[2..len].chunks_exact(6) {
            let owner_hash = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let device_id = u16::from_be_bytes([chunk[4], chunk[5]]);
            visited.push((owner_hash, device_id));
        }
        Some((WireContext { hop_count, visited }, len))
    }
}

/// In-process forwarding context attached to a message while it is routed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardingContext {
    /// Hops taken so far; forwarding stops at [`MAX_HOPS`].
    pub hop_count: u8,
    /// Devices the message has already been forwarded from.
    pub visited: HashSet<DeviceKey>,
}

impl ForwardingContext {
    /// Whether the message already passed through `key`.
    pub fn has_visited(&self, key: &DeviceKey) -> bool {
        self.visited.contains(key)
    }

    /// Whether the hop cap has been reached.
    pub fn at_hop_limit(&self) -> bool {
        self.hop_count >= MAX_HOPS
    }

    /// Record a pass through `key` and count the hop.
    pub fn visit(&mut self, key: DeviceKey) {
        self.visited.insert(key);
        self.hop_count = self.hop_count.saturating_add(1);
    }

    /// Compress to the wire form.
    ///
    /// Local-sentinel owners are rewritten to `local_node`, the sender's
    /// real identifier: the sentinel is meaningless on another node. Entries
    /// are emitted in sorted order so the encoding is deterministic.
    pub fn to_wire(&self, local_node: &NodeId) -> WireContext {
        let mut visited: Vec<(u32, u16)> = self
            .visited
            .iter()
            .map(|key| {
                let owner = if key.owner.is_local() {
                    local_node
                } else {
                    &key.owner
                };
                (node_hash(owner), key.device_id)
            })
            .collect();
        visited.sort_unstable();
        WireContext {
            hop_count: self.hop_count,
            visited,
        }
    }

    /// Resolve a wire context back to full device keys.
    ///
    /// `resolve` maps an owner hash to the full node id, typically backed by
    /// the hash registry. The caller's closure is expected to map the
    /// receiving node's own hash back to [`NodeId::LOCAL`] so revisits of
    /// local devices compare equal.
    pub fn from_wire(
        wire: &WireContext,
        resolve: impl Fn(u32) -> Option<NodeId>,
    ) -> Result<Self, ContextError> {
        let mut visited = HashSet::with_capacity(wire.visited.len());
        for &(owner_hash, device_id) in &wire.visited {
            let owner = resolve(owner_hash).ok_or(ContextError::UnknownHash(owner_hash))?;
            visited.insert(DeviceKey { owner, device_id });
        }
        Ok(ForwardingContext {
            hop_count: wire.hop_count,
            visited,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let wire = WireContext {
            hop_count: 3,
            visited: vec![(0xDEAD_BEEF, 7), (0x0000_0001, 0)],
        };
        let mut buf = Vec::new();
        wire.encode(&mut buf);
        assert_eq!(buf.len(), wire.encoded_len());

        let (decoded, consumed) = WireContext::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, wire);
    }

    #[test]
    fn truncated_block_is_rejected() {
        let wire = WireContext {
            hop_count: 1,
            visited: vec![(42, 1)],
        };
        let mut buf = Vec::new();
        wire.encode(&mut buf);
        assert!(WireContext::decode(&buf[..buf.len() - 1]).is_none());
        assert!(WireContext::decode(&[]).is_none());
    }

    #[test]
    fn visit_tracks_devices_and_hops() {
        let mut ctx = ForwardingContext::default();
        let key = DeviceKey::local(4);
        assert!(!ctx.has_visited(&key));
        ctx.visit(key);
        assert!(ctx.has_visited(&key));
        assert_eq!(ctx.hop_count, 1);

        for id in 0..MAX_HOPS {
            ctx.visit(DeviceKey::local(100 + id as u16));
        }
        assert!(ctx.at_hop_limit());
    }

    #[test]
    fn crossing_the_wire_rewrites_the_local_sentinel() {
        let me = NodeId::generate();
        let peer = NodeId::generate();
        let my_hash = node_hash(&me);
        let peer_hash = node_hash(&peer);

        let mut ctx = ForwardingContext::default();
        ctx.visit(DeviceKey::remote(peer, 9));
        ctx.visit(DeviceKey::local(2));

        let wire = ctx.to_wire(&me);
        assert!(wire.visited.contains(&(my_hash, 2)));
        assert!(wire.visited.contains(&(peer_hash, 9)));

        // A remote node sees the sender's device under its real id.
        let at_remote = ForwardingContext::from_wire(&wire, |hash| {
            if hash == peer_hash {
                Some(peer)
            } else if hash == my_hash {
                Some(me)
            } else {
                None
            }
        })
        .unwrap();
        assert!(at_remote.has_visited(&DeviceKey::remote(me, 2)));

        // Back at the sender, its own hash resolves to the sentinel again.
        let at_home = ForwardingContext::from_wire(&wire, |hash| {
            if hash == my_hash {
                Some(NodeId::LOCAL)
            } else if hash == peer_hash {
                Some(peer)
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(at_home, ctx);
    }

    #[test]
    fn unknown_hash_fails_resolution() {
        let wire = WireContext {
            hop_count: 1,
            visited: vec![(0x1234_5678, 1)],
        };
        let err = ForwardingContext::from_wire(&wire, |_| None).unwrap_err();
        assert_eq!(err, ContextError::UnknownHash(0x1234_5678));
    }
}
