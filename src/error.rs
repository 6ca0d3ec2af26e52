use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors surfaced by the DHT node.
///
/// Reply-level KRPC errors (`y = "e"`) are not represented here; they are
/// delivered to the caller as a normal [`Msg`](crate::Msg) with the `e`
/// field set.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    /// No response after the maximum number of sends.
    #[error("query timed out")]
    Timeout,

    /// The datagram could not be written. Distinct from [`DhtError::Timeout`];
    /// a failed send terminates the query without further attempts.
    #[error("error sending query: {0}")]
    Send(String),

    /// The server shut down while the query was outstanding.
    #[error("server closed")]
    Closed,

    #[error("no initial nodes")]
    NoStartingNodes,
}
