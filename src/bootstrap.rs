//! Bootstrap traversal support.
//!
//! The traversal itself lives in [`Server::bootstrap`](crate::Server::bootstrap);
//! this module holds its result type and the probabilistic set that keeps
//! the fan-out from revisiting addresses.

use bitvec::prelude::*;
use sha1::{Digest, Sha1};

/// What a bootstrap traversal accomplished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TraversalStats {
    pub addrs_tried: usize,
    pub responses_received: usize,
}

/// Filter size in bits. With 7 hash positions this keeps the false
/// positive rate under 1% out to roughly ten thousand addresses, the
/// breadth a bootstrap traversal reaches.
const FILTER_BITS: usize = 1 << 17;
const FILTER_HASHES: u64 = 7;

/// A fixed-size bloom filter over address strings.
pub(crate) struct TraversalFilter {
    bits: BitVec<u8, Lsb0>,
}

impl TraversalFilter {
    pub fn new() -> Self {
        Self {
            bits: bitvec![u8, Lsb0; 0; FILTER_BITS],
        }
    }

    /// Inserts the key and reports whether it may have been seen before.
    /// False positives skip an address; false negatives cannot occur.
    pub fn test_and_insert(&mut self, key: &[u8]) -> bool {
        let digest = Sha1::digest(key);
        let mut h1_bytes = [0u8; 8];
        h1_bytes.copy_from_slice(&digest[..8]);
        let mut h2_bytes = [0u8; 8];
        h2_bytes.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_be_bytes(h1_bytes);
        let h2 = u64::from_be_bytes(h2_bytes) | 1;

        let mut seen = true;
        for i in 0..FILTER_HASHES {
            let pos = (h1.wrapping_add(i.wrapping_mul(h2)) % FILTER_BITS as u64) as usize;
            seen &= self.bits[pos];
            self.bits.set(pos, true);
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_keys_are_unseen() {
        let mut filter = TraversalFilter::new();
        assert!(!filter.test_and_insert(b"1.2.3.4:6881"));
        assert!(!filter.test_and_insert(b"1.2.3.5:6881"));
    }

    #[test]
    fn no_false_negatives() {
        let mut filter = TraversalFilter::new();
        let keys: Vec<String> = (0..1000).map(|i| format!("10.0.{}.{}:6881", i / 256, i % 256)).collect();
        for key in &keys {
            filter.test_and_insert(key.as_bytes());
        }
        for key in &keys {
            assert!(filter.test_and_insert(key.as_bytes()));
        }
    }

    #[test]
    fn false_positive_rate_is_low() {
        let mut filter = TraversalFilter::new();
        for i in 0..5000 {
            filter.test_and_insert(format!("host-{i}").as_bytes());
        }
        let false_positives = (0..5000)
            .filter(|i| filter.test_and_insert(format!("other-{i}").as_bytes()))
            .count();
        // Expected well under 1% at this load; allow slack for hash luck.
        assert!(false_positives < 100, "{false_positives} false positives");
    }
}
