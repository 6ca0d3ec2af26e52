use std::fmt;

use rand::Rng as _;

use crate::error::DhtError;

/// Length of a node id in bytes.
pub const ID_LEN: usize = 20;

/// A 160-bit node identifier.
///
/// Node ids share the keyspace with torrent infohashes. Distance between
/// ids is the XOR metric; the derived ordering compares ids as big-endian
/// unsigned integers, so distances sort numerically.
///
/// The all-zero id is reserved and never belongs to a live node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0; ID_LEN]);

    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != ID_LEN {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; ID_LEN] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; ID_LEN]
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        NodeId(dist)
    }

    /// Number of leading bits shared with `other`, in `0..=160`.
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return i * 8 + diff.leading_zeros() as usize;
            }
        }
        ID_LEN * 8
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn from_bytes_rejects_bad_length() {
        assert!(NodeId::from_bytes(&[1u8; 10]).is_err());
        assert!(NodeId::from_bytes(&[1u8; 21]).is_err());
        assert_eq!(NodeId::from_bytes(&[1u8; 20]).unwrap().as_bytes(), &[1u8; 20]);
    }

    #[test]
    fn distance_is_xor() {
        let zero = NodeId::ZERO;
        let ones = NodeId::from([0xFF; ID_LEN]);
        assert_eq!(zero.distance(&ones), ones);
        assert!(zero.distance(&zero).is_zero());
    }

    #[test]
    fn common_prefix() {
        let a = NodeId::ZERO;
        let mut b = [0u8; ID_LEN];
        b[0] = 0x80;
        assert_eq!(a.common_prefix_len(&NodeId::from(b)), 0);

        let mut c = [0u8; ID_LEN];
        c[2] = 0x10;
        assert_eq!(a.common_prefix_len(&NodeId::from(c)), 19);

        assert_eq!(a.common_prefix_len(&a), 160);
    }

    #[test]
    fn ordering_is_big_endian() {
        let mut lo = [0u8; ID_LEN];
        lo[19] = 0xFF;
        let mut hi = [0u8; ID_LEN];
        hi[0] = 0x01;
        assert!(NodeId::from(lo) < NodeId::from(hi));
    }
}
