//! KRPC message shapes ([BEP-5]).
//!
//! Every datagram on the wire is one bencoded dictionary with a
//! transaction id `t`, a type `y` (`q`, `r`, or `e`), and a payload dict
//! keyed by type: `a` for query arguments, `r` for return values, `e` for
//! error code and message. [`Msg`] models that dictionary directly;
//! queries and replies are built and inspected through it.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use crate::bencode::{self, Value};
use crate::error::DhtError;
use crate::id::NodeId;
use crate::node::{NodeInfo, COMPACT_V4_LEN, COMPACT_V6_LEN};

pub const ERROR_CODE_GENERIC: i64 = 201;
pub const ERROR_CODE_PROTOCOL: i64 = 203;
pub const ERROR_CODE_METHOD_UNKNOWN: i64 = 204;

/// Address families a querier asks for via the `want` argument (BEP 32).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// `n4`: compact IPv4 `nodes`.
    Nodes,
    /// `n6`: compact IPv6 `nodes6`.
    Nodes6,
}

impl Want {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            Want::Nodes => b"n4",
            Want::Nodes6 => b"n6",
        }
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"n4" => Some(Want::Nodes),
            b"n6" => Some(Want::Nodes6),
            _ => None,
        }
    }
}

/// The `a` dictionary of a query.
#[derive(Debug, Clone)]
pub struct MsgArgs {
    /// Sender's node id. Zero when the sender omitted or mangled it.
    pub id: NodeId,
    pub target: Option<NodeId>,
    pub info_hash: Option<[u8; 20]>,
    pub port: Option<u16>,
    pub token: Option<Bytes>,
    pub implied_port: bool,
    pub want: Vec<Want>,
    pub noseed: bool,
    pub scrape: bool,
}

impl Default for MsgArgs {
    fn default() -> Self {
        Self {
            id: NodeId::ZERO,
            target: None,
            info_hash: None,
            port: None,
            token: None,
            implied_port: false,
            want: Vec::new(),
            noseed: false,
            scrape: false,
        }
    }
}

/// The `r` dictionary of a reply.
#[derive(Debug, Clone)]
pub struct Return {
    pub id: NodeId,
    pub nodes: Vec<NodeInfo>,
    pub nodes6: Vec<NodeInfo>,
    pub token: Option<Bytes>,
    /// Compact peer addresses (`values`).
    pub values: Vec<SocketAddr>,
}

impl Default for Return {
    fn default() -> Self {
        Self {
            id: NodeId::ZERO,
            nodes: Vec::new(),
            nodes6: Vec::new(),
            token: None,
            values: Vec::new(),
        }
    }
}

impl Return {
    /// All node records of either family.
    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter().chain(self.nodes6.iter())
    }
}

/// The `e` payload of an error reply: `[code, message]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcError {
    pub code: i64,
    pub message: String,
}

impl KrpcError {
    pub fn protocol(message: &str) -> Self {
        Self {
            code: ERROR_CODE_PROTOCOL,
            message: message.to_string(),
        }
    }

    pub fn method_unknown() -> Self {
        Self {
            code: ERROR_CODE_METHOD_UNKNOWN,
            message: "Method Unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Query,
    Response,
    Error,
}

impl MsgKind {
    fn as_str(self) -> &'static str {
        match self {
            MsgKind::Query => "q",
            MsgKind::Response => "r",
            MsgKind::Error => "e",
        }
    }
}

/// One KRPC message, either direction.
#[derive(Debug, Clone)]
pub struct Msg {
    pub t: Bytes,
    pub y: MsgKind,
    /// Method name; queries only.
    pub q: Option<String>,
    pub a: Option<MsgArgs>,
    pub r: Option<Return>,
    pub e: Option<KrpcError>,
    /// BEP 43: the sender is read-only.
    pub ro: bool,
    /// The responder's view of the requester's external address.
    pub ip: Option<SocketAddr>,
}

impl Msg {
    pub fn query(t: Bytes, q: &str, a: MsgArgs, read_only: bool) -> Self {
        Self {
            t,
            y: MsgKind::Query,
            q: Some(q.to_string()),
            a: Some(a),
            r: None,
            e: None,
            ro: read_only,
            ip: None,
        }
    }

    pub fn response(t: Bytes, r: Return, ip: Option<SocketAddr>) -> Self {
        Self {
            t,
            y: MsgKind::Response,
            q: None,
            a: None,
            r: Some(r),
            e: None,
            ro: false,
            ip,
        }
    }

    pub fn error(t: Bytes, e: KrpcError) -> Self {
        Self {
            t,
            y: MsgKind::Error,
            q: None,
            a: None,
            r: None,
            e: Some(e),
            ro: false,
            ip: None,
        }
    }

    /// The sender's id from whichever payload dict is present. `None` if
    /// absent or zero.
    pub fn sender_id(&self) -> Option<NodeId> {
        let id = match (&self.a, &self.r) {
            (Some(a), _) => a.id,
            (_, Some(r)) => r.id,
            _ => return None,
        };
        (!id.is_zero()).then_some(id)
    }

    /// The error payload, if this is an error reply.
    pub fn reply_error(&self) -> Option<&KrpcError> {
        self.e.as_ref()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DhtError> {
        let value = bencode::decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::InvalidMessage("not a dict".into()))?;

        let t = dict
            .get(b"t".as_slice())
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let y = match dict.get(b"y".as_slice()).and_then(Value::as_str) {
            Some("q") => MsgKind::Query,
            Some("r") => MsgKind::Response,
            Some("e") => MsgKind::Error,
            Some(other) => {
                return Err(DhtError::InvalidMessage(format!(
                    "unknown message type: {other}"
                )))
            }
            None => return Err(DhtError::InvalidMessage("missing message type".into())),
        };

        let q = dict
            .get(b"q".as_slice())
            .and_then(Value::as_str)
            .map(str::to_string);
        if y == MsgKind::Query && q.is_none() {
            return Err(DhtError::InvalidMessage("query without method name".into()));
        }

        let a = dict.get(b"a".as_slice()).and_then(Value::as_dict).map(parse_args);
        let r = dict
            .get(b"r".as_slice())
            .and_then(Value::as_dict)
            .map(parse_return);

        let e = match y {
            MsgKind::Error => Some(parse_error(dict)?),
            _ => None,
        };

        let ro = dict
            .get(b"ro".as_slice())
            .and_then(Value::as_integer)
            .is_some_and(|v| v == 1);

        let ip = dict
            .get(b"ip".as_slice())
            .and_then(Value::as_bytes)
            .and_then(|b| decode_compact_addr(b));

        Ok(Self {
            t,
            y,
            q,
            a,
            r,
            e,
            ro,
            ip,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"t"), Value::Bytes(self.t.clone()));
        dict.insert(Bytes::from_static(b"y"), Value::string(self.y.as_str()));

        if let Some(q) = &self.q {
            dict.insert(Bytes::from_static(b"q"), Value::string(q));
        }
        if let Some(a) = &self.a {
            dict.insert(Bytes::from_static(b"a"), encode_args(a));
        }
        if let Some(r) = &self.r {
            dict.insert(Bytes::from_static(b"r"), encode_return(r));
        }
        if let Some(e) = &self.e {
            dict.insert(
                Bytes::from_static(b"e"),
                Value::List(vec![Value::Integer(e.code), Value::string(&e.message)]),
            );
        }
        if self.ro {
            dict.insert(Bytes::from_static(b"ro"), Value::Integer(1));
        }
        if let Some(ip) = self.ip {
            dict.insert(
                Bytes::from_static(b"ip"),
                Value::Bytes(Bytes::from(encode_compact_addr(ip))),
            );
        }

        bencode::encode(&Value::Dict(dict))
    }
}

fn node_id_or_zero(value: Option<&Value>) -> NodeId {
    value
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::from_bytes(b).ok())
        .unwrap_or(NodeId::ZERO)
}

fn parse_args(dict: &BTreeMap<Bytes, Value>) -> MsgArgs {
    let info_hash = dict
        .get(b"info_hash".as_slice())
        .and_then(Value::as_bytes)
        .filter(|b| b.len() == 20)
        .map(|b| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(b);
            hash
        });

    let want = dict
        .get(b"want".as_slice())
        .and_then(Value::as_list)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_bytes)
                .filter_map(|b| Want::parse(b))
                .collect()
        })
        .unwrap_or_default();

    let flag = |key: &[u8]| {
        dict.get(key)
            .and_then(Value::as_integer)
            .is_some_and(|v| v != 0)
    };

    MsgArgs {
        id: node_id_or_zero(dict.get(b"id".as_slice())),
        target: dict
            .get(b"target".as_slice())
            .and_then(Value::as_bytes)
            .and_then(|b| NodeId::from_bytes(b).ok()),
        info_hash,
        port: dict
            .get(b"port".as_slice())
            .and_then(Value::as_integer)
            .map(|p| p as u16),
        token: dict.get(b"token".as_slice()).and_then(Value::as_bytes).cloned(),
        implied_port: flag(b"implied_port"),
        want,
        noseed: flag(b"noseed"),
        scrape: flag(b"scrape"),
    }
}

fn parse_return(dict: &BTreeMap<Bytes, Value>) -> Return {
    let nodes = dict
        .get(b"nodes".as_slice())
        .and_then(Value::as_bytes)
        .map(|data| {
            data.chunks_exact(COMPACT_V4_LEN)
                .filter_map(NodeInfo::from_compact_v4)
                .collect()
        })
        .unwrap_or_default();

    let nodes6 = dict
        .get(b"nodes6".as_slice())
        .and_then(Value::as_bytes)
        .map(|data| {
            data.chunks_exact(COMPACT_V6_LEN)
                .filter_map(NodeInfo::from_compact_v6)
                .collect()
        })
        .unwrap_or_default();

    let values = dict
        .get(b"values".as_slice())
        .and_then(Value::as_list)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_bytes)
                .filter_map(|b| decode_compact_addr(b))
                .collect()
        })
        .unwrap_or_default();

    Return {
        id: node_id_or_zero(dict.get(b"id".as_slice())),
        nodes,
        nodes6,
        token: dict.get(b"token".as_slice()).and_then(Value::as_bytes).cloned(),
        values,
    }
}

fn parse_error(dict: &BTreeMap<Bytes, Value>) -> Result<KrpcError, DhtError> {
    let list = dict
        .get(b"e".as_slice())
        .and_then(Value::as_list)
        .ok_or_else(|| DhtError::InvalidMessage("missing error payload".into()))?;
    Ok(KrpcError {
        code: list.first().and_then(Value::as_integer).unwrap_or(0),
        message: list
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    })
}

fn encode_args(a: &MsgArgs) -> Value {
    let mut dict = BTreeMap::new();
    dict.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(a.id.as_bytes())),
    );
    if let Some(target) = &a.target {
        dict.insert(
            Bytes::from_static(b"target"),
            Value::Bytes(Bytes::copy_from_slice(target.as_bytes())),
        );
    }
    if let Some(info_hash) = &a.info_hash {
        dict.insert(
            Bytes::from_static(b"info_hash"),
            Value::Bytes(Bytes::copy_from_slice(info_hash)),
        );
    }
    if let Some(port) = a.port {
        dict.insert(Bytes::from_static(b"port"), Value::Integer(port as i64));
    }
    if let Some(token) = &a.token {
        dict.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
    }
    if a.implied_port {
        dict.insert(Bytes::from_static(b"implied_port"), Value::Integer(1));
    }
    if !a.want.is_empty() {
        dict.insert(
            Bytes::from_static(b"want"),
            Value::List(
                a.want
                    .iter()
                    .map(|w| Value::Bytes(Bytes::from_static(w.as_bytes())))
                    .collect(),
            ),
        );
    }
    Value::Dict(dict)
}

fn encode_return(r: &Return) -> Value {
    let mut dict = BTreeMap::new();
    dict.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(r.id.as_bytes())),
    );
    if !r.nodes.is_empty() {
        let compact: Vec<u8> = r
            .nodes
            .iter()
            .filter_map(NodeInfo::to_compact_v4)
            .flatten()
            .collect();
        dict.insert(Bytes::from_static(b"nodes"), Value::Bytes(Bytes::from(compact)));
    }
    if !r.nodes6.is_empty() {
        let compact: Vec<u8> = r
            .nodes6
            .iter()
            .filter_map(NodeInfo::to_compact_v6)
            .flatten()
            .collect();
        dict.insert(
            Bytes::from_static(b"nodes6"),
            Value::Bytes(Bytes::from(compact)),
        );
    }
    if let Some(token) = &r.token {
        dict.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
    }
    if !r.values.is_empty() {
        dict.insert(
            Bytes::from_static(b"values"),
            Value::List(
                r.values
                    .iter()
                    .map(|addr| Value::Bytes(Bytes::from(encode_compact_addr(*addr))))
                    .collect(),
            ),
        );
    }
    Value::Dict(dict)
}

/// Compact address: 4-byte IPv4 or 16-byte IPv6, then a big-endian port.
pub fn encode_compact_addr(addr: SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut buf = Vec::with_capacity(6);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
            buf
        }
        SocketAddr::V6(v6) => {
            let mut buf = Vec::with_capacity(18);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
            buf
        }
    }
}

pub fn decode_compact_addr(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        6 => {
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> Bytes {
        Bytes::from_static(b"aa")
    }

    #[test]
    fn ping_roundtrip() {
        let id = NodeId::random();
        let msg = Msg::query(
            tid(),
            "ping",
            MsgArgs {
                id,
                ..Default::default()
            },
            false,
        );
        let parsed = Msg::decode(&msg.encode()).unwrap();
        assert_eq!(parsed.t, tid());
        assert_eq!(parsed.y, MsgKind::Query);
        assert_eq!(parsed.q.as_deref(), Some("ping"));
        assert_eq!(parsed.sender_id(), Some(id));
        assert!(!parsed.ro);
    }

    #[test]
    fn find_node_carries_target_and_want() {
        let target = NodeId::random();
        let msg = Msg::query(
            tid(),
            "find_node",
            MsgArgs {
                id: NodeId::random(),
                target: Some(target),
                want: vec![Want::Nodes, Want::Nodes6],
                ..Default::default()
            },
            false,
        );
        let parsed = Msg::decode(&msg.encode()).unwrap();
        let args = parsed.a.unwrap();
        assert_eq!(args.target, Some(target));
        assert_eq!(args.want, vec![Want::Nodes, Want::Nodes6]);
    }

    #[test]
    fn announce_peer_roundtrip() {
        let msg = Msg::query(
            tid(),
            "announce_peer",
            MsgArgs {
                id: NodeId::random(),
                info_hash: Some([0xAB; 20]),
                port: Some(6881),
                token: Some(Bytes::from_static(b"tok")),
                implied_port: true,
                ..Default::default()
            },
            false,
        );
        let parsed = Msg::decode(&msg.encode()).unwrap();
        let args = parsed.a.unwrap();
        assert_eq!(args.info_hash, Some([0xAB; 20]));
        assert_eq!(args.port, Some(6881));
        assert_eq!(args.token.as_deref(), Some(b"tok".as_slice()));
        assert!(args.implied_port);
    }

    #[test]
    fn response_with_nodes_roundtrip() {
        let responder = NodeId::random();
        let info = NodeInfo {
            id: NodeId::from([7u8; 20]),
            addr: "1.2.3.4:6881".parse().unwrap(),
        };
        let msg = Msg::response(
            tid(),
            Return {
                id: responder,
                nodes: vec![info],
                token: Some(Bytes::from_static(b"tok")),
                ..Default::default()
            },
            Some("5.6.7.8:1234".parse().unwrap()),
        );
        let parsed = Msg::decode(&msg.encode()).unwrap();
        assert_eq!(parsed.y, MsgKind::Response);
        assert_eq!(parsed.sender_id(), Some(responder));
        let r = parsed.r.unwrap();
        assert_eq!(r.nodes, vec![info]);
        assert_eq!(r.token.as_deref(), Some(b"tok".as_slice()));
        assert_eq!(parsed.ip, Some("5.6.7.8:1234".parse().unwrap()));
    }

    #[test]
    fn error_roundtrip() {
        let msg = Msg::error(tid(), KrpcError::method_unknown());
        let parsed = Msg::decode(&msg.encode()).unwrap();
        assert_eq!(parsed.y, MsgKind::Error);
        let e = parsed.e.unwrap();
        assert_eq!(e.code, ERROR_CODE_METHOD_UNKNOWN);
        assert_eq!(e.message, "Method Unknown");
    }

    #[test]
    fn read_only_flag_roundtrip() {
        let msg = Msg::query(tid(), "ping", MsgArgs::default(), true);
        let parsed = Msg::decode(&msg.encode()).unwrap();
        assert!(parsed.ro);
    }

    #[test]
    fn decode_rejects_query_without_method() {
        // y=q but no q key.
        let raw = b"d1:t2:aa1:y1:qe";
        assert!(Msg::decode(raw).is_err());
    }

    #[test]
    fn decode_rejects_non_dict() {
        assert!(Msg::decode(b"i42e").is_err());
        assert!(Msg::decode(b"le").is_err());
    }

    #[test]
    fn compact_addr_roundtrip() {
        let v4: SocketAddr = "192.168.1.1:6881".parse().unwrap();
        assert_eq!(decode_compact_addr(&encode_compact_addr(v4)), Some(v4));

        let v6: SocketAddr = "[2001:db8::1]:6881".parse().unwrap();
        assert_eq!(decode_compact_addr(&encode_compact_addr(v6)), Some(v6));

        assert_eq!(decode_compact_addr(&[1, 2, 3]), None);
    }
}
