//! Kademlia routing table implementation

use std::collections::VecDeque;
use torrentium_core::{Digest, PeerId, PeerInfo};

/// XOR distance between two keys
pub fn xor_distance(a: &Digest, b: &Digest) -> Digest {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.iter().zip(b.iter())) {
        *out = x ^ y;
    }
    result
}

/// Find the index of the most significant bit that differs
pub fn bucket_index(distance: &Digest) -> usize {
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as usize;
            return 255 - (i * 8 + leading);
        }
    }
    0
}

/// Information about a node in the routing table
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: Digest,
    pub peer: PeerInfo,
    pub last_seen: u64,
}

impl NodeInfo {
    pub fn new(peer: PeerInfo, last_seen: u64) -> Self {
        Self {
            node_id: peer.id.dht_key(),
            peer,
            last_seen,
        }
    }
}

/// A k-bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Maximum number of nodes in this bucket
    k: usize,
    /// Nodes in this bucket, ordered by last seen (most recent at back)
    nodes: VecDeque<NodeInfo>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            nodes: VecDeque::with_capacity(k),
        }
    }

    /// Add or update a node in the bucket
    /// Returns true if the node was added/updated, false if bucket is full
    pub fn upsert(&mut self, node: NodeInfo) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.node_id == node.node_id) {
            // Move to back (most recently seen)
            self.nodes.remove(pos);
            self.nodes.push_back(node);
            return true;
        }

        if self.nodes.len() < self.k {
            self.nodes.push_back(node);
            return true;
        }

        false
    }

    /// Remove a node; returns whether it was present
    pub fn remove(&mut self, node_id: &Digest) -> bool {
        match self.nodes.iter().position(|n| &n.node_id == node_id) {
            Some(pos) => {
                self.nodes.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Get all nodes in the bucket
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter()
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.k
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Kademlia routing table
pub struct RoutingTable {
    /// Our node ID
    local_id: Digest,
    /// K-buckets (256 buckets for 256-bit IDs)
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: Digest, k: usize) -> Self {
        Self {
            local_id,
            buckets: (0..256).map(|_| KBucket::new(k)).collect(),
        }
    }

    /// Add or update a node in the routing table.
    /// Returns false for our own id or when the bucket is full.
    pub fn upsert(&mut self, node: NodeInfo) -> bool {
        if node.node_id == self.local_id {
            return false;
        }
        let distance = xor_distance(&self.local_id, &node.node_id);
        let bucket_idx = bucket_index(&distance);
        self.buckets[bucket_idx].upsert(node)
    }

    /// Drop an unresponsive node
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let node_id = peer.dht_key();
        let distance = xor_distance(&self.local_id, &node_id);
        self.buckets[bucket_index(&distance)].remove(&node_id)
    }

    /// Find the `count` closest nodes to a target
    pub fn closest_nodes(&self, target: &Digest, count: usize) -> Vec<NodeInfo> {
        let mut all_nodes: Vec<_> = self.all_nodes();

        // Sort by distance to target
        all_nodes.sort_by(|a, b| {
            let dist_a = xor_distance(&a.node_id, target);
            let dist_b = xor_distance(&b.node_id, target);
            dist_a.cmp(&dist_b)
        });

        all_nodes.truncate(count);
        all_nodes
    }

    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        self.buckets.iter().flat_map(|b| b.nodes()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeInfo {
        NodeInfo::new(PeerInfo::new(name, format!("mem://{}", name)), 1)
    }

    #[test]
    fn test_xor_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[31] = 1;

        let dist = xor_distance(&a, &b);
        assert_eq!(dist[31], 1);
    }

    #[test]
    fn test_bucket_index() {
        let mut dist = [0u8; 32];
        dist[31] = 1;
        assert_eq!(bucket_index(&dist), 0);

        dist[31] = 0x80;
        assert_eq!(bucket_index(&dist), 7);

        dist[0] = 0x80;
        dist[31] = 0;
        assert_eq!(bucket_index(&dist), 255);
    }

    #[test]
    fn test_upsert_remove_and_self_exclusion() {
        let local = PeerId::new("me");
        let mut table = RoutingTable::new(local.dht_key(), 20);

        assert!(!table.upsert(NodeInfo::new(PeerInfo::new("me", "mem://me"), 1)));
        assert!(table.upsert(node("a")));
        assert!(table.upsert(node("b")));
        assert!(table.upsert(node("a")));
        assert_eq!(table.len(), 2);

        assert!(table.remove(&PeerId::new("a")));
        assert!(!table.remove(&PeerId::new("a")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_closest_nodes_ordering() {
        let mut table = RoutingTable::new(PeerId::new("me").dht_key(), 20);
        for name in ["a", "b", "c", "d", "e"] {
            table.upsert(node(name));
        }

        let target = PeerId::new("c").dht_key();
        let closest = table.closest_nodes(&target, 3);
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].peer.id.as_str(), "c");

        let d0 = xor_distance(&closest[1].node_id, &target);
        let d1 = xor_distance(&closest[2].node_id, &target);
        assert!(d0 <= d1);
    }

    #[test]
    fn test_full_bucket_rejects() {
        let mut bucket = KBucket::new(1);
        assert!(bucket.upsert(node("a")));
        assert!(bucket.is_full());
        assert!(!bucket.upsert(node("b")));
    }
}
