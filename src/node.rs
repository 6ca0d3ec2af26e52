use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::id::NodeId;

/// Consecutive unanswered queries before a node is considered bad.
pub(crate) const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// BEP 5 freshness window for the good-node classification.
const ACTIVITY_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Compact v4 node record: 20-byte id + 4-byte IP + 2-byte port.
pub(crate) const COMPACT_V4_LEN: usize = 26;
/// Compact v6 node record: 20-byte id + 16-byte IP + 2-byte port.
pub(crate) const COMPACT_V6_LEN: usize = 38;

/// A contact in the routing table, identified by `(id, addr)`.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// When we last received a query from this node. `None` means never.
    pub last_got_query: Option<Instant>,
    /// When we last received a response from this node. `None` means never.
    pub last_got_response: Option<Instant>,
    pub last_sent_query: Option<Instant>,
    /// Unanswered outbound queries in a row; reset by any response.
    pub consecutive_failures: u32,
    /// Token from this node's last `get_peers` reply, echoed back in
    /// `announce_peer`.
    pub announce_token: Option<Bytes>,
    /// The node advertised the BEP 43 read-only flag.
    pub read_only: bool,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_got_query: None,
            last_got_response: None,
            last_sent_query: None,
            consecutive_failures: 0,
            announce_token: None,
            read_only: false,
        }
    }

    /// BEP 5: a node is good if it has responded within the activity
    /// window, or has ever responded and queried us within the window.
    pub fn is_good(&self) -> bool {
        let fresh = |t: Option<Instant>| t.is_some_and(|t| t.elapsed() < ACTIVITY_WINDOW);
        fresh(self.last_got_response)
            || (self.last_got_response.is_some() && fresh(self.last_got_query))
    }

    /// Too many unanswered queries in a row. The full bad-node test also
    /// covers id and address checks, which need server context.
    pub fn failed_out(&self) -> bool {
        self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
    }

    pub fn is_questionable(&self) -> bool {
        !self.is_good() && !self.failed_out()
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id,
            addr: self.addr,
        }
    }
}

/// The `(id, addr)` pair exchanged in `nodes`/`nodes6` reply fields and
/// used to import or export the node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeInfo {
    /// Parses a 26-byte compact v4 record.
    pub fn from_compact_v4(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_V4_LEN {
            return None;
        }
        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);
        Some(Self {
            id,
            addr: SocketAddr::new(IpAddr::V4(ip), port),
        })
    }

    /// Parses a 38-byte compact v6 record.
    pub fn from_compact_v6(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_V6_LEN {
            return None;
        }
        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[20..36]);
        let port = u16::from_be_bytes([data[36], data[37]]);
        Some(Self {
            id,
            addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
        })
    }

    pub fn to_compact_v4(&self) -> Option<[u8; COMPACT_V4_LEN]> {
        match self.addr {
            SocketAddr::V4(v4) => {
                let mut compact = [0u8; COMPACT_V4_LEN];
                compact[..20].copy_from_slice(self.id.as_bytes());
                compact[20..24].copy_from_slice(&v4.ip().octets());
                compact[24..26].copy_from_slice(&v4.port().to_be_bytes());
                Some(compact)
            }
            SocketAddr::V6(_) => None,
        }
    }

    pub fn to_compact_v6(&self) -> Option<[u8; COMPACT_V6_LEN]> {
        match self.addr {
            SocketAddr::V6(v6) => {
                let mut compact = [0u8; COMPACT_V6_LEN];
                compact[..20].copy_from_slice(self.id.as_bytes());
                compact[20..36].copy_from_slice(&v6.ip().octets());
                compact[36..38].copy_from_slice(&v6.port().to_be_bytes());
                Some(compact)
            }
            SocketAddr::V4(_) => None,
        }
    }
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        node.info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn fresh_node_is_questionable() {
        let node = Node::new(NodeId::random(), addr(6881));
        assert!(!node.is_good());
        assert!(!node.failed_out());
        assert!(node.is_questionable());
    }

    #[test]
    fn responded_node_is_good() {
        let mut node = Node::new(NodeId::random(), addr(6881));
        node.last_got_response = Some(Instant::now());
        assert!(node.is_good());
    }

    #[test]
    fn query_alone_is_not_good() {
        let mut node = Node::new(NodeId::random(), addr(6881));
        node.last_got_query = Some(Instant::now());
        assert!(!node.is_good());

        // A past response plus a recent query is good.
        node.last_got_response = Some(Instant::now());
        assert!(node.is_good());
    }

    #[test]
    fn failures_mark_node_failed_out() {
        let mut node = Node::new(NodeId::random(), addr(6881));
        node.consecutive_failures = MAX_CONSECUTIVE_FAILURES;
        assert!(node.failed_out());
        assert!(!node.is_questionable());
    }

    #[test]
    fn compact_v4_roundtrip() {
        let info = NodeInfo {
            id: NodeId::from([1u8; 20]),
            addr: addr(6881),
        };
        let compact = info.to_compact_v4().unwrap();
        assert_eq!(NodeInfo::from_compact_v4(&compact), Some(info));
        assert!(info.to_compact_v6().is_none());
    }

    #[test]
    fn compact_v6_roundtrip() {
        let info = NodeInfo {
            id: NodeId::from([2u8; 20]),
            addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 6881),
        };
        let compact = info.to_compact_v6().unwrap();
        assert_eq!(NodeInfo::from_compact_v6(&compact), Some(info));
        assert!(info.to_compact_v4().is_none());
    }
}
