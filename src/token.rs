//! Announce tokens ([BEP-5]).
//!
//! A `get_peers` reply carries an opaque token bound to the querier's IP.
//! The querier must echo it in a later `announce_peer`, proving it can
//! receive datagrams at that address. Tokens are derived from rotating
//! secrets; validation accepts any secret still inside the retention
//! window, so a token stays usable for a bounded time after issue.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng as _;
use sha1::{Digest, Sha1};

const SECRET_LEN: usize = 20;
const TOKEN_LEN: usize = 8;

pub const DEFAULT_TOKEN_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How many rotations back a token stays valid.
pub const DEFAULT_MAX_INTERVAL_DELTA: usize = 2;

pub struct TokenServer {
    /// Most recent secret first.
    secrets: VecDeque<[u8; SECRET_LEN]>,
    interval: Duration,
    max_interval_delta: usize,
    last_rotation: Instant,
}

impl Default for TokenServer {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_INTERVAL, DEFAULT_MAX_INTERVAL_DELTA)
    }
}

impl TokenServer {
    pub fn new(interval: Duration, max_interval_delta: usize) -> Self {
        let mut secrets = VecDeque::with_capacity(max_interval_delta + 1);
        secrets.push_front(new_secret());
        Self {
            secrets,
            interval,
            max_interval_delta,
            last_rotation: Instant::now(),
        }
    }

    /// Issues a token for the querier's IP under the current secret.
    pub fn create(&mut self, ip: IpAddr) -> Bytes {
        self.create_at(ip, Instant::now())
    }

    /// True iff the token matches any retained secret for this IP.
    pub fn validate(&mut self, token: &[u8], ip: IpAddr) -> bool {
        self.validate_at(token, ip, Instant::now())
    }

    pub(crate) fn create_at(&mut self, ip: IpAddr, now: Instant) -> Bytes {
        self.rotate_if_due(now);
        derive(&self.secrets[0], ip)
    }

    pub(crate) fn validate_at(&mut self, token: &[u8], ip: IpAddr, now: Instant) -> bool {
        self.rotate_if_due(now);
        self.secrets.iter().any(|s| derive(s, ip).as_ref() == token)
    }

    /// Rotation is driven lazily from create/validate rather than by a
    /// timer.
    fn rotate_if_due(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_rotation);
        if elapsed < self.interval {
            return;
        }
        let steps = (elapsed.as_nanos() / self.interval.as_nanos()) as usize;
        let retained = self.max_interval_delta + 1;
        for _ in 0..steps.min(retained) {
            self.secrets.push_front(new_secret());
        }
        self.secrets.truncate(retained);
        self.last_rotation += self.interval * steps as u32;
    }
}

fn new_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::rng().fill(&mut secret);
    secret
}

fn derive(secret: &[u8; SECRET_LEN], ip: IpAddr) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    Bytes::copy_from_slice(&hasher.finalize()[..TOKEN_LEN])
}
