//! Outbound query transactions.
//!
//! Every outbound query registers a [`Transaction`] keyed by the remote
//! address and the `t` field, so an inbound reply can be matched back to
//! its waiting task. The transaction owns the send/resend state machine:
//! an immediate first send, up to [`MAX_TRANSACTION_SENDS`] attempts
//! spaced by the resend delay, then a timeout. Exactly one outcome
//! (response, timeout, or send error) is ever delivered, over a oneshot
//! channel the querying task awaits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::DhtError;
use crate::krpc::Msg;

/// Datagrams sent per query before it times out.
pub(crate) const MAX_TRANSACTION_SENDS: u32 = 3;

pub(crate) type QueryOutcome = Result<Msg, DhtError>;

/// `(remote address, transaction id)`. Addresses key by their stable
/// string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TransactionKey {
    pub addr: String,
    pub tid: Bytes,
}

impl TransactionKey {
    pub fn new(addr: SocketAddr, tid: Bytes) -> Self {
        Self {
            addr: addr.to_string(),
            tid,
        }
    }
}

/// What the resend driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    /// Perform send number `n` (1-based).
    Send(u32),
    /// A response arrived or the outcome was already delivered.
    Done,
    /// All sends are spent; deliver the timeout.
    TimedOut,
}

pub(crate) struct Transaction {
    key: TransactionKey,
    remote: SocketAddr,
    query: String,
    state: Mutex<TransactionState>,
}

struct TransactionState {
    got_response: bool,
    sends: u32,
    last_send: Option<Instant>,
    outcome: Option<oneshot::Sender<QueryOutcome>>,
    resend_task: Option<JoinHandle<()>>,
}

impl Transaction {
    pub fn new(
        remote: SocketAddr,
        tid: Bytes,
        query: &str,
    ) -> (Arc<Self>, oneshot::Receiver<QueryOutcome>) {
        let (sender, receiver) = oneshot::channel();
        let transaction = Arc::new(Self {
            key: TransactionKey::new(remote, tid),
            remote,
            query: query.to_string(),
            state: Mutex::new(TransactionState {
                got_response: false,
                sends: 0,
                last_send: None,
                outcome: Some(sender),
                resend_task: None,
            }),
        });
        (transaction, receiver)
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Decides the next step of the send loop, claiming a send slot when
    /// one is granted. A response that raced in wins here: the driver
    /// observes `got_response` and stands down.
    pub fn next_attempt(&self) -> Attempt {
        let mut state = self.state.lock();
        if state.got_response || state.outcome.is_none() {
            return Attempt::Done;
        }
        if state.sends >= MAX_TRANSACTION_SENDS {
            return Attempt::TimedOut;
        }
        state.sends += 1;
        Attempt::Send(state.sends)
    }

    pub fn note_sent(&self) {
        self.state.lock().last_send = Some(Instant::now());
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.state.lock().last_send
    }

    pub fn sends(&self) -> u32 {
        self.state.lock().sends
    }

    /// Delivers the outcome. Returns false if one was already delivered;
    /// the sender is taken under the lock, so delivery happens at most
    /// once, and the channel send itself runs unlocked.
    pub fn complete(&self, outcome: QueryOutcome) -> bool {
        let sender = {
            let mut state = self.state.lock();
            if outcome.is_ok() {
                state.got_response = true;
            }
            state.outcome.take()
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn set_resend_task(&self, task: JoinHandle<()>) {
        self.state.lock().resend_task = Some(task);
    }

    pub fn take_resend_task(&self) -> Option<JoinHandle<()>> {
        self.state.lock().resend_task.take()
    }
}

/// The live transactions of one server.
#[derive(Default)]
pub(crate) struct TransactionTable {
    map: HashMap<TransactionKey, Arc<Transaction>>,
}

impl TransactionTable {
    /// Registers a transaction. A duplicate key means the id allocator
    /// broke its never-repeats contract; that is a programming error and
    /// aborts.
    pub fn insert(&mut self, transaction: Arc<Transaction>) {
        let previous = self
            .map
            .insert(transaction.key().clone(), transaction);
        assert!(previous.is_none(), "transaction not unique");
    }

    pub fn remove(&mut self, key: &TransactionKey) -> Option<Arc<Transaction>> {
        self.map.remove(key)
    }

    /// Matches an inbound reply. Both the source address and the echoed
    /// `t` must match; a known `t` from the wrong address is untracked.
    pub fn find(&mut self, addr: SocketAddr, tid: &[u8]) -> Option<Arc<Transaction>> {
        self.map
            .remove(&TransactionKey::new(addr, Bytes::copy_from_slice(tid)))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn drain(&mut self) -> Vec<Arc<Transaction>> {
        self.map.drain().map(|(_, t)| t).collect()
    }
}

/// Encodes a transaction counter as an unsigned varint, LEB128 style.
/// The counter is 64-bit and monotonic, so ids never repeat within a
/// server's lifetime.
pub(crate) fn encode_tid(mut n: u64) -> Bytes {
    let mut buf = [0u8; 10];
    let mut i = 0;
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            buf[i] = byte;
            break;
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
    Bytes::copy_from_slice(&buf[..=i])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn tid_encoding_matches_uvarint() {
        assert_eq!(encode_tid(0).as_ref(), &[0x00]);
        assert_eq!(encode_tid(1).as_ref(), &[0x01]);
        assert_eq!(encode_tid(127).as_ref(), &[0x7f]);
        assert_eq!(encode_tid(128).as_ref(), &[0x80, 0x01]);
        assert_eq!(encode_tid(300).as_ref(), &[0xac, 0x02]);
    }

    #[test]
    fn tids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for n in 0..10_000u64 {
            assert!(seen.insert(encode_tid(n)));
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let (transaction, _receiver) = Transaction::new(remote(), encode_tid(0), "ping");
        assert!(transaction.last_send().is_none());
        for n in 1..=MAX_TRANSACTION_SENDS {
            assert_eq!(transaction.next_attempt(), Attempt::Send(n));
            transaction.note_sent();
        }
        assert!(transaction.last_send().is_some());
        assert_eq!(transaction.next_attempt(), Attempt::TimedOut);
        assert_eq!(transaction.sends(), MAX_TRANSACTION_SENDS);
    }

    #[test]
    fn response_stops_the_send_loop() {
        let (transaction, _receiver) = Transaction::new(remote(), encode_tid(0), "ping");
        assert_eq!(transaction.next_attempt(), Attempt::Send(1));
        assert!(transaction.complete(Err(DhtError::Timeout)));
        assert_eq!(transaction.next_attempt(), Attempt::Done);
    }

    #[tokio::test]
    async fn outcome_is_delivered_once() {
        let (transaction, receiver) = Transaction::new(remote(), encode_tid(7), "ping");
        assert!(transaction.complete(Err(DhtError::Timeout)));
        assert!(!transaction.complete(Err(DhtError::Closed)));
        assert!(matches!(receiver.await, Ok(Err(DhtError::Timeout))));
    }

    #[test]
    #[should_panic(expected = "transaction not unique")]
    fn duplicate_key_panics() {
        let mut table = TransactionTable::default();
        let (a, _ra) = Transaction::new(remote(), encode_tid(3), "ping");
        let (b, _rb) = Transaction::new(remote(), encode_tid(3), "ping");
        table.insert(a);
        table.insert(b);
    }

    #[test]
    fn find_requires_matching_address() {
        let mut table = TransactionTable::default();
        let (transaction, _receiver) = Transaction::new(remote(), encode_tid(5), "ping");
        table.insert(transaction);

        let other: SocketAddr = "127.0.0.2:6881".parse().unwrap();
        assert!(table.find(other, &encode_tid(5)).is_none());
        assert!(table.find(remote(), &encode_tid(5)).is_some());
        // find removes the entry.
        assert_eq!(table.len(), 0);
    }
}
