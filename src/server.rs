//! The DHT node server.
//!
//! A [`Server`] is both client and server: it answers `ping`,
//! `find_node`, `get_peers`, and `announce_peer` queries from the
//! network while issuing its own, all over one UDP socket. A receive
//! loop dispatches each inbound datagram either to the inbound query
//! handler or, for replies, to the outbound transaction awaiting them.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bootstrap::{TraversalFilter, TraversalStats};
use crate::error::DhtError;
use crate::id::NodeId;
use crate::krpc::{KrpcError, Msg, MsgArgs, MsgKind, Return, Want};
use crate::node::{Node, NodeInfo};
use crate::routing::{AddResult, RoutingTable, K};
use crate::security;
use crate::token::TokenServer;
use crate::transaction::{
    encode_tid, Attempt, QueryOutcome, Transaction, TransactionKey, TransactionTable,
};

/// Receive buffer size. A datagram that fills it is assumed truncated
/// and dropped.
const RECV_BUF_LEN: usize = 0x10000;

/// Delay between send attempts of one query, unless overridden.
pub const DEFAULT_QUERY_RESEND_DELAY: Duration = Duration::from_secs(5);

/// Looks up addresses that must not be talked to. The lookup structure
/// is built elsewhere; the server only consults it.
pub trait IpBlocklist: Send + Sync {
    fn contains(&self, ip: IpAddr) -> bool;
}

/// An admission slot for one outbound flow. Exactly one of [`done`] or
/// [`forget`] is called after the send; dropping the handle without
/// either must behave like `forget`.
///
/// [`done`]: Admission::done
/// [`forget`]: Admission::forget
pub trait Admission: Send {
    /// The datagram went out; the flow is live.
    fn done(self: Box<Self>);
    /// The send failed; release the slot.
    fn forget(self: Box<Self>);
}

/// Rate-admits novel outbound flows by `(local, remote)` pair. Queries
/// wait here before each socket write.
#[async_trait]
pub trait ConnTracker: Send + Sync {
    async fn admit(&self, local: SocketAddr, remote: SocketAddr) -> Box<dyn Admission>;
}

struct NoAdmission;

impl Admission for NoAdmission {
    fn done(self: Box<Self>) {}
    fn forget(self: Box<Self>) {}
}

struct NoTracking;

#[async_trait]
impl ConnTracker for NoTracking {
    async fn admit(&self, _local: SocketAddr, _remote: SocketAddr) -> Box<dyn Admission> {
        Box::new(NoAdmission)
    }
}

/// Receives named event counts. Implementations must be cheap and must
/// not block; counts arrive from the packet path.
pub trait MetricsSink: Send + Sync {
    fn count(&self, counter: &'static str, n: u64);
}

struct NoMetrics;

impl MetricsSink for NoMetrics {
    fn count(&self, _counter: &'static str, _n: u64) {}
}

/// An announced peer, as handed to the `on_announce_peer` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// Inbound query hook. Return false to suppress the default handling.
/// Runs on the receive path; must not block.
pub type OnQueryFn = Box<dyn Fn(&Msg, SocketAddr) -> bool + Send + Sync>;
/// Called for each `announce_peer` accepted with a valid token. Must
/// not block.
pub type OnAnnouncePeerFn = Box<dyn Fn([u8; 20], Peer) + Send + Sync>;
/// Produces bootstrap addresses when the table is empty, typically by
/// resolving well-known hosts.
pub type StartingNodesFn = Box<dyn Fn() -> Result<Vec<SocketAddr>, DhtError> + Send + Sync>;
pub type ResendDelayFn = Box<dyn Fn() -> Duration + Send + Sync>;

/// Parameters for a [`Server`]. Only the socket is mandatory.
pub struct ServerConfig {
    /// The UDP socket the node lives on.
    pub conn: UdpSocket,
    /// Fixed node id; generated randomly when absent.
    pub node_id: Option<NodeId>,
    /// Our external IP, used to harden the id per BEP 42.
    pub public_ip: Option<IpAddr>,
    /// Disables BEP 42 id validation and hardening.
    pub no_security: bool,
    pub starting_nodes: Option<StartingNodesFn>,
    pub ip_blocklist: Option<Box<dyn IpBlocklist>>,
    pub on_query: Option<OnQueryFn>,
    pub on_announce_peer: Option<OnAnnouncePeerFn>,
    /// BEP 43: do not answer queries, and advertise `ro` in our own.
    pub passive: bool,
    /// Per-attempt resend interval for outbound queries.
    pub query_resend_delay: Option<ResendDelayFn>,
    pub conn_tracker: Option<Box<dyn ConnTracker>>,
    pub metrics: Option<Box<dyn MetricsSink>>,
}

impl ServerConfig {
    pub fn new(conn: UdpSocket) -> Self {
        Self {
            conn,
            node_id: None,
            public_ip: None,
            no_security: false,
            starting_nodes: None,
            ip_blocklist: None,
            on_query: None,
            on_announce_peer: None,
            passive: false,
            query_resend_delay: None,
            conn_tracker: None,
            metrics: None,
        }
    }
}

/// Counters and gauges describing a server.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerStats {
    pub nodes: usize,
    pub good_nodes: usize,
    pub outstanding_transactions: usize,
    pub outbound_queries_attempted: u64,
    pub successful_announces: u64,
}

/// A Mainline DHT node ([BEP-5]).
///
/// # Examples
///
/// ```no_run
/// use mdht::Server;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = Server::bind("0.0.0.0:6881".parse()?).await?;
/// let stats = dht.bootstrap().await?;
/// println!("tried {} addrs", stats.addrs_tried);
/// # Ok(())
/// # }
/// ```
///
/// Dropping or [`close`](Server::close)-ing the server stops the receive
/// loop and fails outstanding queries with [`DhtError::Closed`].
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    socket: UdpSocket,
    local_addr: SocketAddr,
    id: NodeId,
    passive: bool,
    no_security: bool,
    on_query: Option<OnQueryFn>,
    on_announce_peer: Option<OnAnnouncePeerFn>,
    starting_nodes: Option<StartingNodesFn>,
    resend_delay: ResendDelayFn,
    blocklist: Option<Box<dyn IpBlocklist>>,
    conn_tracker: Box<dyn ConnTracker>,
    metrics: Box<dyn MetricsSink>,
    tokens: Mutex<TokenServer>,
    state: Mutex<ServerState>,
}

/// Everything behind the server lock. Held for short critical sections
/// only; never across I/O or user callbacks.
struct ServerState {
    transactions: TransactionTable,
    table: RoutingTable,
    next_tid: u64,
    closed: bool,
    stats: ServerStats,
    recv_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds a fresh socket and starts a server with default options.
    pub async fn bind(addr: SocketAddr) -> Result<Self, DhtError> {
        let conn = UdpSocket::bind(addr).await?;
        Self::new(ServerConfig::new(conn))
    }

    /// Starts a server on the configured socket. The receive loop runs
    /// until the server is closed or the socket fails.
    pub fn new(config: ServerConfig) -> Result<Self, DhtError> {
        let local_addr = config.conn.local_addr()?;
        let mut id = config.node_id.unwrap_or_else(NodeId::random);
        if !config.no_security {
            if let Some(ip) = config.public_ip {
                security::secure_node_id(&mut id, ip);
            }
        }
        info!(%local_addr, %id, "dht server starting");

        let inner = Arc::new(ServerInner {
            socket: config.conn,
            local_addr,
            id,
            passive: config.passive,
            no_security: config.no_security,
            on_query: config.on_query,
            on_announce_peer: config.on_announce_peer,
            starting_nodes: config.starting_nodes,
            resend_delay: config
                .query_resend_delay
                .unwrap_or_else(|| Box::new(|| DEFAULT_QUERY_RESEND_DELAY)),
            blocklist: config.ip_blocklist,
            conn_tracker: config.conn_tracker.unwrap_or_else(|| Box::new(NoTracking)),
            metrics: config.metrics.unwrap_or_else(|| Box::new(NoMetrics)),
            tokens: Mutex::new(TokenServer::default()),
            state: Mutex::new(ServerState {
                transactions: TransactionTable::default(),
                table: RoutingTable::new(id),
                next_tid: 0,
                closed: false,
                stats: ServerStats::default(),
                recv_task: None,
            }),
        });
        let task = tokio::spawn(receive_loop(Arc::clone(&inner)));
        inner.state.lock().recv_task = Some(task);
        Ok(Self { inner })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn stats(&self) -> ServerStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats;
        stats.nodes = state.table.len();
        stats.good_nodes = state.table.iter().filter(|n| n.is_good()).count();
        stats.outstanding_transactions = state.transactions.len();
        stats
    }

    pub fn num_nodes(&self) -> usize {
        self.inner.state.lock().table.len()
    }

    /// Exports the node table for external persistence.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.inner
            .state
            .lock()
            .table
            .iter()
            .map(NodeInfo::from)
            .collect()
    }

    /// Visits every table node until the visitor returns false.
    pub fn for_each_node(&self, visitor: impl FnMut(&Node) -> bool) {
        self.inner.state.lock().table.for_each(visitor);
    }

    /// Seeds the table directly. An info with a zero id is pinged
    /// instead, to learn its id from the reply. Returns whether the
    /// node is now in the table.
    pub fn add_node(&self, info: NodeInfo) -> bool {
        if info.id.is_zero() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let _ = inner.query(info.addr, "ping", MsgArgs::default()).await;
            });
            return false;
        }
        let mut state = self.inner.state.lock();
        self.inner
            .get_or_insert_node(&mut state, info.addr, info.id, true)
    }

    /// Issues a raw query and awaits the reply. Error replies (`y = "e"`)
    /// resolve as `Ok` with the `e` field set; timeouts and send failures
    /// resolve as [`DhtError::Timeout`] and [`DhtError::Send`]. Dropping
    /// the returned future cancels the query and deregisters its
    /// transaction.
    pub async fn query(
        &self,
        addr: SocketAddr,
        method: &str,
        args: MsgArgs,
    ) -> Result<Msg, DhtError> {
        self.inner.query(addr, method, args).await
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<Msg, DhtError> {
        self.inner.query(addr, "ping", MsgArgs::default()).await
    }

    /// `find_node` toward `target`. Nodes in the reply are folded into
    /// the routing table before it is returned.
    pub async fn find_node(&self, addr: SocketAddr, target: NodeId) -> Result<Msg, DhtError> {
        self.inner.find_node(addr, target).await
    }

    /// `get_peers` for an infohash. Reply nodes are folded into the
    /// table, and the reply token is remembered on the responding node
    /// for a later [`announce_peer`](Server::announce_peer).
    pub async fn get_peers(
        &self,
        addr: SocketAddr,
        info_hash: [u8; 20],
    ) -> Result<Msg, DhtError> {
        let args = MsgArgs {
            info_hash: Some(info_hash),
            want: vec![Want::Nodes, Want::Nodes6],
            ..Default::default()
        };
        let msg = self.inner.query(addr, "get_peers", args).await?;
        self.inner.add_response_nodes(&msg);
        let token = msg.r.as_ref().and_then(|r| r.token.clone());
        if let (Some(id), Some(token)) = (msg.sender_id(), token) {
            let mut state = self.inner.state.lock();
            if let Some(node) = state.table.get_mut(&addr, &id) {
                node.announce_token = Some(token);
            }
        }
        Ok(msg)
    }

    pub async fn announce_peer(
        &self,
        addr: SocketAddr,
        info_hash: [u8; 20],
        port: u16,
        token: Bytes,
        implied_port: bool,
    ) -> Result<Msg, DhtError> {
        if port == 0 && !implied_port {
            return Err(DhtError::InvalidMessage("nothing to announce".into()));
        }
        let args = MsgArgs {
            info_hash: Some(info_hash),
            port: Some(port),
            token: Some(token),
            implied_port,
            ..Default::default()
        };
        let msg = self.inner.query(addr, "announce_peer", args).await?;
        if msg.e.is_none() {
            self.inner.state.lock().stats.successful_announces += 1;
        }
        Ok(msg)
    }

    /// Populates the routing table by fanning `find_node(self)` out over
    /// the starting addresses and every node they report, until no
    /// untried address remains.
    pub async fn bootstrap(&self) -> Result<TraversalStats, DhtError> {
        self.inner.bootstrap().await
    }

    /// Stops network activity. Outstanding queries fail with
    /// [`DhtError::Closed`].
    pub fn close(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl ServerInner {
    fn ip_blocked(&self, ip: IpAddr) -> bool {
        self.blocklist.as_ref().is_some_and(|b| b.contains(ip))
    }

    /// Rejections that make a node untrackable, independent of bucket
    /// pressure.
    fn node_err(&self, node: &Node) -> Option<&'static str> {
        if node.id.is_zero() {
            return Some("zero id");
        }
        if node.id == self.id {
            return Some("is self");
        }
        if !self.no_security && !security::node_id_is_secure(&node.id, node.addr.ip()) {
            return Some("fails bep42");
        }
        if self.ip_blocked(node.addr.ip()) {
            return Some("blocklisted");
        }
        if node.is_good() {
            return None;
        }
        if node.failed_out() {
            return Some("too many failures");
        }
        None
    }

    fn node_is_bad(&self, node: &Node) -> bool {
        self.node_err(node).is_some()
    }

    /// Returns whether the node is in the table afterwards, inserting it
    /// if absent, admissible, and `try_add`. Insertion may displace a bad
    /// node; full buckets of good nodes win.
    fn get_or_insert_node(
        &self,
        state: &mut ServerState,
        addr: SocketAddr,
        id: NodeId,
        try_add: bool,
    ) -> bool {
        if state.table.get(&addr, &id).is_some() {
            return true;
        }
        let node = Node::new(id, addr);
        if let Some(reason) = self.node_err(&node) {
            self.metrics.count("node_rejected", 1);
            debug!(%addr, %id, reason, "not tracking node");
            return false;
        }
        if !try_add {
            return false;
        }
        match state.table.add(node, |n| self.node_is_bad(n)) {
            AddResult::Added => true,
            AddResult::Full => {
                self.metrics.count("table_bucket_full", 1);
                false
            }
        }
    }

    fn add_response_nodes(&self, msg: &Msg) {
        let Some(r) = &msg.r else { return };
        let mut state = self.state.lock();
        for info in r.all_nodes() {
            self.get_or_insert_node(&mut state, info.addr, info.id, true);
        }
    }

    async fn send_datagram(&self, payload: &[u8], addr: SocketAddr) -> Result<(), DhtError> {
        if self.ip_blocked(addr.ip()) {
            self.metrics.count("writes_blocked", 1);
            return Err(DhtError::Send(format!("write to {addr} blocked")));
        }
        match self.socket.send_to(payload, addr).await {
            Ok(written) if written == payload.len() => {
                self.metrics.count("writes", 1);
                Ok(())
            }
            Ok(_) => {
                self.metrics.count("write_errors", 1);
                Err(DhtError::Send("short write".into()))
            }
            Err(e) => {
                self.metrics.count("write_errors", 1);
                Err(DhtError::Send(e.to_string()))
            }
        }
    }

    async fn process_packet(&self, data: &[u8], addr: SocketAddr) {
        // KRPC messages are bencoded dicts.
        if data.first() != Some(&b'd') {
            self.metrics.count("read_non_krpc_dict", 1);
            return;
        }
        let msg = match Msg::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics.count("read_decode_error", 1);
                debug!(%addr, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        match msg.y {
            MsgKind::Query => self.handle_query(addr, msg).await,
            MsgKind::Response | MsgKind::Error => self.deliver_reply(addr, msg),
        }
    }

    /// Matches a reply against the transaction table. Untracked replies
    /// are logged and dropped without touching any node state.
    fn deliver_reply(&self, addr: SocketAddr, msg: Msg) {
        let transaction = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            match state.transactions.find(addr, &msg.t) {
                Some(transaction) => {
                    if let Some(id) = msg.sender_id() {
                        if self.get_or_insert_node(&mut state, addr, id, !msg.ro) {
                            if let Some(node) = state.table.get_mut(&addr, &id) {
                                node.last_got_response = Some(Instant::now());
                                node.consecutive_failures = 0;
                                if msg.ro {
                                    node.read_only = true;
                                }
                            }
                        }
                    }
                    transaction
                }
                None => {
                    self.metrics.count("received_untracked_response", 1);
                    debug!(%addr, tid = ?msg.t, "response for untracked transaction");
                    return;
                }
            }
        };
        debug!(%addr, query = transaction.query(), "received response");
        if let Some(task) = transaction.take_resend_task() {
            task.abort();
        }
        transaction.complete(Ok(msg));
    }

    async fn handle_query(&self, source: SocketAddr, msg: Msg) {
        self.metrics.count("received_queries", 1);
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            // Read-only senders are heard but not routed to.
            if let Some(id) = msg.sender_id() {
                if self.get_or_insert_node(&mut state, source, id, !msg.ro) {
                    if let Some(node) = state.table.get_mut(&source, &id) {
                        node.last_got_query = Some(Instant::now());
                        if msg.ro {
                            node.read_only = true;
                        }
                    }
                }
            }
        }
        if let Some(hook) = &self.on_query {
            if !hook(&msg, source) {
                return;
            }
        }
        if self.passive {
            return;
        }

        let Some(method) = msg.q.as_deref() else { return };
        debug!(%source, method, "received query");
        match method {
            "ping" => self.reply(source, msg.t.clone(), Return::default()).await,
            "find_node" => {
                let Some(args) = &msg.a else {
                    return self
                        .send_error(
                            source,
                            msg.t.clone(),
                            KrpcError::protocol("missing arguments dict"),
                        )
                        .await;
                };
                let Some(target) = args.target else {
                    return self
                        .send_error(source, msg.t.clone(), KrpcError::protocol("missing target"))
                        .await;
                };
                let mut ret = Return::default();
                self.set_return_nodes(&mut ret, &args.want, source, &target);
                self.reply(source, msg.t.clone(), ret).await;
            }
            "get_peers" => {
                let Some(args) = &msg.a else {
                    return self
                        .send_error(
                            source,
                            msg.t.clone(),
                            KrpcError::protocol("missing arguments dict"),
                        )
                        .await;
                };
                let Some(info_hash) = args.info_hash else {
                    return self
                        .send_error(
                            source,
                            msg.t.clone(),
                            KrpcError::protocol("missing info_hash"),
                        )
                        .await;
                };
                if args.noseed {
                    self.metrics.count("received_argument_noseed", 1);
                }
                if args.scrape {
                    self.metrics.count("received_argument_scrape", 1);
                }
                let target = NodeId::from(info_hash);
                let mut ret = Return::default();
                self.set_return_nodes(&mut ret, &args.want, source, &target);
                ret.token = Some(self.tokens.lock().create(source.ip()));
                self.reply(source, msg.t.clone(), ret).await;
            }
            "announce_peer" => {
                let Some(args) = &msg.a else {
                    return self
                        .send_error(
                            source,
                            msg.t.clone(),
                            KrpcError::protocol("missing arguments dict"),
                        )
                        .await;
                };
                let valid = args
                    .token
                    .as_ref()
                    .is_some_and(|token| self.tokens.lock().validate(token, source.ip()));
                if !valid {
                    // BEP 5: announces with a stale or forged token are
                    // dropped without a reply.
                    self.metrics.count("received_announce_bad_token", 1);
                    debug!(%source, "dropping announce_peer with invalid token");
                    return;
                }
                let Some(info_hash) = args.info_hash else {
                    return self
                        .send_error(
                            source,
                            msg.t.clone(),
                            KrpcError::protocol("missing info_hash"),
                        )
                        .await;
                };
                let port = if args.implied_port {
                    source.port()
                } else {
                    match args.port {
                        Some(port) => port,
                        None => {
                            return self
                                .send_error(
                                    source,
                                    msg.t.clone(),
                                    KrpcError::protocol("missing port"),
                                )
                                .await;
                        }
                    }
                };
                self.metrics.count("received_announce_valid_token", 1);
                if let Some(hook) = &self.on_announce_peer {
                    hook(
                        info_hash,
                        Peer {
                            ip: source.ip(),
                            port,
                        },
                    );
                }
                self.reply(source, msg.t.clone(), Return::default()).await;
            }
            _ => {
                self.send_error(source, msg.t.clone(), KrpcError::method_unknown())
                    .await;
            }
        }
    }

    /// Fills `nodes`/`nodes6` with the closest good nodes per the
    /// querier's `want` list, or its own address family when it sent
    /// none.
    fn set_return_nodes(
        &self,
        ret: &mut Return,
        want: &[Want],
        source: SocketAddr,
        target: &NodeId,
    ) {
        let want_v4 = if want.is_empty() {
            source.is_ipv4()
        } else {
            want.contains(&Want::Nodes)
        };
        let want_v6 = if want.is_empty() {
            source.is_ipv6()
        } else {
            want.contains(&Want::Nodes6)
        };
        let state = self.state.lock();
        if want_v4 {
            ret.nodes = state
                .table
                .closest(K, target, |n| n.is_good() && n.addr.is_ipv4())
                .iter()
                .map(NodeInfo::from)
                .collect();
        }
        if want_v6 {
            ret.nodes6 = state
                .table
                .closest(K, target, |n| n.is_good() && n.addr.is_ipv6())
                .iter()
                .map(NodeInfo::from)
                .collect();
        }
    }

    async fn reply(&self, addr: SocketAddr, t: Bytes, mut ret: Return) {
        ret.id = self.id;
        self.metrics.count("replies_sent", 1);
        let msg = Msg::response(t, ret, Some(addr));
        if let Err(e) = self.send_datagram(&msg.encode(), addr).await {
            debug!(%addr, error = %e, "error replying");
        }
    }

    async fn send_error(&self, addr: SocketAddr, t: Bytes, e: KrpcError) {
        self.metrics.count("errors_sent", 1);
        debug!(%addr, code = e.code, "sending error reply");
        let msg = Msg::error(t, e);
        if let Err(e) = self.send_datagram(&msg.encode(), addr).await {
            debug!(%addr, error = %e, "error replying");
        }
    }

    /// Allocates a transaction, registers it, and spawns its send
    /// driver. The returned receiver resolves with the query outcome.
    fn begin_query(
        self: &Arc<Self>,
        addr: SocketAddr,
        method: &str,
        mut args: MsgArgs,
    ) -> Result<(TransactionKey, oneshot::Receiver<QueryOutcome>), DhtError> {
        args.id = self.id;
        let (transaction, receiver) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(DhtError::Closed);
            }
            let tid = encode_tid(state.next_tid);
            state.next_tid += 1;
            let (transaction, receiver) = Transaction::new(addr, tid, method);
            state.transactions.insert(Arc::clone(&transaction));
            state.stats.outbound_queries_attempted += 1;
            let now = Instant::now();
            for node in state.table.nodes_at_mut(addr) {
                node.last_sent_query = Some(now);
            }
            (transaction, receiver)
        };
        let msg = Msg::query(transaction.key().tid.clone(), method, args, self.passive);
        let payload = Bytes::from(msg.encode());
        let key = transaction.key().clone();
        let driver = tokio::spawn(drive_transaction(
            Arc::downgrade(self),
            Arc::clone(&transaction),
            payload,
            addr,
        ));
        transaction.set_resend_task(driver);
        Ok((key, receiver))
    }

    async fn query(
        self: &Arc<Self>,
        addr: SocketAddr,
        method: &str,
        args: MsgArgs,
    ) -> Result<Msg, DhtError> {
        let (key, receiver) = self.begin_query(addr, method, args)?;
        // Cancellation safety: if this future is dropped mid-await, the
        // guard deregisters the transaction so a late reply cannot match.
        let _guard = DeregisterGuard {
            server: Arc::downgrade(self),
            key,
        };
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DhtError::Closed),
        }
    }

    async fn find_node(self: &Arc<Self>, addr: SocketAddr, target: NodeId) -> Result<Msg, DhtError> {
        let args = MsgArgs {
            target: Some(target),
            want: vec![Want::Nodes, Want::Nodes6],
            ..Default::default()
        };
        let msg = self.query(addr, "find_node", args).await?;
        self.add_response_nodes(&msg);
        Ok(msg)
    }

    /// Removes the transaction and books the outcome: failures bump
    /// `consecutive_failures` on every node at the address. The outcome
    /// is delivered outside both locks.
    fn finish_transaction(&self, transaction: &Transaction, outcome: QueryOutcome) {
        {
            let mut state = self.state.lock();
            state.transactions.remove(transaction.key());
            if outcome.is_err() {
                for node in state.table.nodes_at_mut(transaction.remote()) {
                    node.consecutive_failures += 1;
                }
            }
        }
        transaction.complete(outcome);
    }

    fn traversal_starting_addrs(&self) -> Result<Vec<SocketAddr>, DhtError> {
        let addrs: Vec<SocketAddr> = {
            let state = self.state.lock();
            state.table.iter().map(|n| n.addr).collect()
        };
        if !addrs.is_empty() {
            return Ok(addrs);
        }
        if let Some(starting) = &self.starting_nodes {
            let addrs = starting()?;
            if !addrs.is_empty() {
                return Ok(addrs);
            }
        }
        Err(DhtError::NoStartingNodes)
    }

    async fn bootstrap(self: &Arc<Self>) -> Result<TraversalStats, DhtError> {
        let mut stats = TraversalStats::default();
        let mut tried = TraversalFilter::new();
        let mut pending = FuturesUnordered::new();

        for addr in self.traversal_starting_addrs()? {
            if tried.test_and_insert(addr.to_string().as_bytes()) {
                continue;
            }
            stats.addrs_tried += 1;
            pending.push(bootstrap_probe(Arc::clone(self), addr));
        }
        while let Some(result) = pending.next().await {
            let Ok(msg) = result else { continue };
            stats.responses_received += 1;
            let Some(r) = &msg.r else { continue };
            for info in r.all_nodes() {
                if tried.test_and_insert(info.addr.to_string().as_bytes()) {
                    continue;
                }
                stats.addrs_tried += 1;
                pending.push(bootstrap_probe(Arc::clone(self), info.addr));
            }
        }
        info!(
            tried = stats.addrs_tried,
            responses = stats.responses_received,
            "bootstrap traversal finished"
        );
        Ok(stats)
    }

    /// Terminal state: stops the receive loop and fails everything
    /// outstanding. Idempotent.
    fn shutdown(&self) {
        let (transactions, recv_task) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.transactions.drain(), state.recv_task.take())
        };
        info!(local_addr = %self.local_addr, "dht server closing");
        for transaction in transactions {
            if let Some(task) = transaction.take_resend_task() {
                task.abort();
            }
            transaction.complete(Err(DhtError::Closed));
        }
        if let Some(task) = recv_task {
            task.abort();
        }
    }
}

/// Deregisters a transaction whose awaiting task went away, whether it
/// completed normally (the entry is already gone) or was cancelled.
struct DeregisterGuard {
    server: Weak<ServerInner>,
    key: TransactionKey,
}

impl Drop for DeregisterGuard {
    fn drop(&mut self) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let transaction = server.state.lock().transactions.remove(&self.key);
        if let Some(transaction) = transaction {
            if let Some(task) = transaction.take_resend_task() {
                task.abort();
            }
        }
    }
}

/// One query's `find_node(self)` step of the bootstrap fan-out.
async fn bootstrap_probe(server: Arc<ServerInner>, addr: SocketAddr) -> Result<Msg, DhtError> {
    let target = server.id;
    server.find_node(addr, target).await
}

/// The send side of one transaction: immediate first send, resends on
/// the configured delay, then timeout. The first send failure ends the
/// transaction without further attempts.
async fn drive_transaction(
    server: Weak<ServerInner>,
    transaction: Arc<Transaction>,
    payload: Bytes,
    addr: SocketAddr,
) {
    loop {
        match transaction.next_attempt() {
            Attempt::Done => return,
            Attempt::TimedOut => {
                if let Some(server) = server.upgrade() {
                    server.metrics.count("query_timeouts", 1);
                    server.finish_transaction(&transaction, Err(DhtError::Timeout));
                } else {
                    transaction.complete(Err(DhtError::Closed));
                }
                return;
            }
            Attempt::Send(attempt) => {
                let Some(server) = server.upgrade() else {
                    transaction.complete(Err(DhtError::Closed));
                    return;
                };
                debug!(%addr, query = transaction.query(), attempt, "sending query");
                let admission = server.conn_tracker.admit(server.local_addr, addr).await;
                match server.send_datagram(&payload, addr).await {
                    Ok(()) => {
                        admission.done();
                        transaction.note_sent();
                    }
                    Err(e) => {
                        admission.forget();
                        server.metrics.count("query_send_errors", 1);
                        server.finish_transaction(&transaction, Err(e));
                        return;
                    }
                }
                let delay = (server.resend_delay)();
                drop(server);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn receive_loop(server: Arc<ServerInner>) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let (len, addr) = match server.socket.recv_from(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                // Receive errors are terminal; the server moves to its
                // closed state and outstanding queries observe it.
                warn!(error = %e, "receive loop terminating");
                server.shutdown();
                return;
            }
        };
        server.metrics.count("packets_read", 1);
        if len == buf.len() {
            server.metrics.count("read_oversized", 1);
            continue;
        }
        if addr.port() == 0 {
            server.metrics.count("read_zero_port", 1);
            continue;
        }
        if server.ip_blocked(addr.ip()) {
            server.metrics.count("read_blocked", 1);
            continue;
        }
        server.process_packet(&buf[..len], addr).await;
    }
}
