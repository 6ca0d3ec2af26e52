//! The k-bucket routing table.
//!
//! Buckets partition the id space by shared-prefix length with the root
//! (our own) id: bucket `i` holds contacts whose ids share exactly `i`
//! leading bits with the root, and the final bucket holds everything
//! deeper, root range included. The table starts as a single bucket
//! covering the whole space and grows by splitting that final bucket when
//! it fills.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::id::NodeId;
use crate::node::Node;

/// Bucket capacity (BEP 5's k).
pub const K: usize = 8;

/// One bucket per bit of the id, at most.
const MAX_BUCKETS: usize = 160;

/// Outcome of an insertion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Added,
    /// The target bucket is full of nodes the caller may not displace.
    Full,
}

#[derive(Debug, Default)]
struct Bucket {
    nodes: VecDeque<Node>,
}

impl Bucket {
    fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }
}

pub struct RoutingTable {
    root: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(root: NodeId) -> Self {
        Self {
            root,
            buckets: vec![Bucket::default()],
        }
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.root.common_prefix_len(id).min(self.buckets.len() - 1)
    }

    /// Exact lookup on the composite `(addr, id)` identity.
    pub fn get(&self, addr: &SocketAddr, id: &NodeId) -> Option<&Node> {
        self.buckets[self.bucket_index(id)]
            .nodes
            .iter()
            .find(|n| n.id == *id && n.addr == *addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr, id: &NodeId) -> Option<&mut Node> {
        let idx = self.bucket_index(id);
        self.buckets[idx]
            .nodes
            .iter_mut()
            .find(|n| n.id == *id && n.addr == *addr)
    }

    /// Inserts a node. The caller is responsible for pre-validating the
    /// id (non-zero, not the root). When the target bucket is full, the
    /// bucket containing the root range splits; other buckets displace
    /// the first node the `is_bad` predicate condemns, or report
    /// [`AddResult::Full`] so good nodes are never pushed out.
    pub fn add(&mut self, node: Node, is_bad: impl Fn(&Node) -> bool) -> AddResult {
        debug_assert!(!node.id.is_zero());
        debug_assert_ne!(node.id, self.root);
        loop {
            let idx = self.bucket_index(&node.id);
            if !self.buckets[idx].is_full() {
                self.buckets[idx].nodes.push_back(node);
                return AddResult::Added;
            }
            if idx == self.buckets.len() - 1 && self.buckets.len() < MAX_BUCKETS {
                self.split_root_bucket();
                continue;
            }
            let bucket = &mut self.buckets[idx];
            if let Some(pos) = bucket.nodes.iter().position(&is_bad) {
                bucket.nodes.remove(pos);
                bucket.nodes.push_back(node);
                return AddResult::Added;
            }
            return AddResult::Full;
        }
    }

    /// Splits the final bucket: contacts at exactly the old boundary
    /// depth stay, deeper ones move into the new final bucket.
    fn split_root_bucket(&mut self) {
        let last = self.buckets.len() - 1;
        let old = std::mem::take(&mut self.buckets[last]);
        self.buckets.push(Bucket::default());
        for node in old.nodes {
            let idx = self.bucket_index(&node.id);
            self.buckets[idx].nodes.push_back(node);
        }
    }

    /// Removes a node by identity.
    pub fn remove(&mut self, addr: &SocketAddr, id: &NodeId) -> Option<Node> {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        let pos = bucket
            .nodes
            .iter()
            .position(|n| n.id == *id && n.addr == *addr)?;
        bucket.nodes.remove(pos)
    }

    /// All nodes registered at an address, any id.
    pub fn nodes_at_mut(&mut self, addr: SocketAddr) -> impl Iterator<Item = &mut Node> {
        self.buckets
            .iter_mut()
            .flat_map(|b| b.nodes.iter_mut())
            .filter(move |n| n.addr == addr)
    }

    /// Up to `k` nodes passing `filter`, closest to `target` by XOR
    /// distance.
    pub fn closest(&self, k: usize, target: &NodeId, filter: impl Fn(&Node) -> bool) -> Vec<Node> {
        let mut nodes: Vec<(NodeId, Node)> = self
            .iter()
            .filter(|n| filter(n))
            .map(|n| (n.id.distance(target), n.clone()))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        nodes.truncate(k);
        nodes.into_iter().map(|(_, n)| n).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }

    /// Visits every node until the visitor returns `false`.
    pub fn for_each(&self, mut visitor: impl FnMut(&Node) -> bool) {
        for node in self.iter() {
            if !visitor(node) {
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
