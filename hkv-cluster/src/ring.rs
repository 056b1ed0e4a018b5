//! # Consistent-Hash Ring
//!
//! Purpose: map keys onto peers so the cluster can grow or shrink without
//! reshuffling every key. Each peer gets 100 virtual replicas hashed by
//! CRC32 of `replica_index||peer_addr`, and a key's owner is the first
//! replica at or after the key's own hash, wrapping around the ring.
//!
//! ## Design Principles
//! 1. **Hashtag Routing**: a key wrapped in `{...}` hashes only on the
//!    bracketed substring, so related keys can be pinned to the same peer.

use std::collections::BTreeMap;

const VIRTUAL_REPLICAS: u32 = 100;

fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Extracts the hashtag (`{...}`) from `key` if present and non-empty,
/// otherwise hashes the whole key.
pub fn hash_key(key: &[u8]) -> u32 {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close_rel) = key[open + 1..].iter().position(|&b| b == b'}') {
            let tag = &key[open + 1..open + 1 + close_rel];
            if !tag.is_empty() {
                return crc32(tag);
            }
        }
    }
    crc32(key)
}

#[derive(Debug, Clone)]
pub struct HashRing {
    ring: BTreeMap<u32, String>,
}

impl HashRing {
    pub fn new() -> Self {
        HashRing { ring: BTreeMap::new() }
    }

    pub fn from_peers(peers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut ring = HashRing::new();
        for peer in peers {
            ring.add_peer(peer.into());
        }
        ring
    }

    pub fn add_peer(&mut self, peer_addr: String) {
        for replica in 0..VIRTUAL_REPLICAS {
            let mut buf = Vec::with_capacity(peer_addr.len() + 4);
            buf.extend_from_slice(&replica.to_le_bytes());
            buf.extend_from_slice(peer_addr.as_bytes());
            self.ring.insert(crc32(&buf), peer_addr.clone());
        }
    }

    pub fn remove_peer(&mut self, peer_addr: &str) {
        self.ring.retain(|_, v| v != peer_addr);
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Owning peer for `key`, honoring `{hashtag}` braces. `None` if the
    /// ring has no peers.
    pub fn owner(&self, key: &[u8]) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, addr)| addr.as_str())
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashtag_keys_share_an_owner() {
        let ring = HashRing::from_peers(["a:1", "b:2", "c:3"]);
        let owner1 = ring.owner(b"{user}profile");
        let owner2 = ring.owner(b"{user}settings");
        assert_eq!(owner1, owner2);
    }

    #[test]
    fn every_key_maps_to_a_known_peer() {
        let peers = ["a:1", "b:2", "c:3"];
        let ring = HashRing::from_peers(peers);
        for i in 0..200 {
            let key = format!("key-{i}");
            let owner = ring.owner(key.as_bytes()).unwrap();
            assert!(peers.contains(&owner));
        }
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = HashRing::new();
        assert_eq!(ring.owner(b"k"), None);
    }

    #[test]
    fn wraps_around_past_the_highest_replica() {
        let mut ring = HashRing::new();
        ring.add_peer("only:1".to_string());
        assert_eq!(ring.owner(b"anything"), Some("only:1"));
    }
}
