//! mdht - a BitTorrent Mainline DHT node
//!
//! This library implements the Kademlia-based DHT used by BitTorrent for
//! trackerless peer discovery ([BEP-5]), with the security extension
//! ([BEP-42]) and the read-only flag ([BEP-43]).
//!
//! A [`Server`] is a full DHT participant: it answers queries from the
//! network while issuing its own `ping`, `find_node`, `get_peers`, and
//! `announce_peer` queries, and it maintains a k-bucket routing table of
//! reachable nodes.
//!
//! # Getting Started
//!
//! ```no_run
//! use mdht::{Server, ServerConfig};
//! use tokio::net::UdpSocket;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = UdpSocket::bind("0.0.0.0:6881").await?;
//! let mut config = ServerConfig::new(conn);
//! config.starting_nodes = Some(Box::new(|| {
//!     Ok(vec!["67.215.246.10:6881".parse().unwrap()])
//! }));
//! let dht = Server::new(config)?;
//!
//! let stats = dht.bootstrap().await?;
//! println!(
//!     "tried {} addresses, {} answered",
//!     stats.addrs_tried, stats.responses_received
//! );
//!
//! // Ask a node for peers of a torrent.
//! let info_hash = [0u8; 20];
//! if let Some(node) = dht.nodes().first() {
//!     let reply = dht.get_peers(node.addr, info_hash).await?;
//!     println!("{:?}", reply.r.map(|r| r.values));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`Server`] - socket loop, query engine, inbound protocol handler
//! - [`RoutingTable`] - k-bucket storage for known nodes
//! - [`TokenServer`] - rotating announce tokens
//! - [`Msg`] - the KRPC wire shape
//! - [`bencode`] - the underlying codec
//!
//! Collaborators that live outside this crate plug in through traits on
//! [`ServerConfig`]: an IP blocklist ([`IpBlocklist`]), a connection
//! tracker gating outbound flows ([`ConnTracker`]), and a metrics sink
//! ([`MetricsSink`]).
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html
//! [BEP-42]: http://bittorrent.org/beps/bep_0042.html
//! [BEP-43]: http://bittorrent.org/beps/bep_0043.html

pub mod bencode;

mod bootstrap;
mod error;
mod id;
mod krpc;
mod node;
mod routing;
mod security;
mod server;
mod token;
mod transaction;

pub use bootstrap::TraversalStats;
pub use error::DhtError;
pub use id::{NodeId, ID_LEN};
pub use krpc::{
    decode_compact_addr, encode_compact_addr, KrpcError, Msg, MsgArgs, MsgKind, Return, Want,
    ERROR_CODE_GENERIC, ERROR_CODE_METHOD_UNKNOWN, ERROR_CODE_PROTOCOL,
};
pub use node::{Node, NodeInfo};
pub use routing::{AddResult, RoutingTable, K};
pub use security::{is_local_network, node_id_is_secure, secure_node_id};
pub use server::{
    Admission, ConnTracker, IpBlocklist, MetricsSink, OnAnnouncePeerFn, OnQueryFn, Peer,
    ResendDelayFn, Server, ServerConfig, ServerStats, StartingNodesFn,
    DEFAULT_QUERY_RESEND_DELAY,
};
pub use token::{TokenServer, DEFAULT_MAX_INTERVAL_DELTA, DEFAULT_TOKEN_INTERVAL};
