//! DHT security extension ([BEP-42]).
//!
//! Node ids are bound to the node's external IP: the top 21 bits must
//! match a CRC32C over the masked IP and a small random value `r` carried
//! in the id's last byte. Nodes on local networks are exempt.
//!
//! [BEP-42]: http://bittorrent.org/beps/bep_0042.html

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::id::NodeId;

/// Bits of the IPv4 address that participate in the CRC.
const IPV4_MASK: u32 = 0x030f_3fff;

/// Bits of the high 64 bits of the IPv6 address that participate.
const IPV6_MASK: u64 = 0x0103_070f_1f3f_7fff;

/// Hardens an id for `ip` in place. The id's last byte supplies `r`, and
/// the top 21 bits are overwritten with the CRC so the result validates
/// against the same IP. Other bytes keep their entropy.
pub fn secure_node_id(id: &mut NodeId, ip: IpAddr) {
    if is_local_network(ip) {
        return;
    }
    let mut bytes = id.to_bytes();
    let r = bytes[19] & 0x07;
    let crc = ip_crc(ip, r);

    bytes[0] = (crc >> 24) as u8;
    bytes[1] = (crc >> 16) as u8;
    bytes[2] = (bytes[2] & 0x07) | ((crc >> 8) as u8 & 0xf8);
    bytes[19] = r;

    *id = NodeId::from(bytes);
}

/// True iff the id's top 21 bits match the CRC for `ip` and the `r`
/// recovered from its last byte. Local networks always pass.
pub fn node_id_is_secure(id: &NodeId, ip: IpAddr) -> bool {
    if is_local_network(ip) {
        return true;
    }
    let bytes = id.as_bytes();
    let r = bytes[19] & 0x07;
    let expected = ip_crc(ip, r);

    let actual =
        ((bytes[0] as u32) << 24) | ((bytes[1] as u32) << 16) | ((bytes[2] as u32) << 8);
    actual & 0xffff_f800 == expected & 0xffff_f800
}

fn ip_crc(ip: IpAddr, r: u8) -> u32 {
    match ip {
        IpAddr::V4(v4) => {
            let masked = (u32::from(v4) & IPV4_MASK) | ((r as u32) << 29);
            crc32c::crc32c(&masked.to_be_bytes())
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut high = [0u8; 8];
            high.copy_from_slice(&octets[..8]);
            let masked = (u64::from_be_bytes(high) & IPV6_MASK) | ((r as u64) << 61);
            crc32c::crc32c(&masked.to_be_bytes())
        }
    }
}

/// Private, link-local, and loopback ranges are exempt from BEP 42.
pub fn is_local_network(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_local_ipv4(v4),
        IpAddr::V6(v6) => is_local_ipv6(v6),
    }
}

fn is_local_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
        || (octets[0] == 169 && octets[1] == 254)
        || octets[0] == 127
}

fn is_local_ipv6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()
        || segments[0] & 0xffc0 == 0xfe80
        || segments[0] & 0xfe00 == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ranges_are_exempt() {
        for ip in ["10.0.0.1", "172.16.0.1", "192.168.1.1", "169.254.0.1", "127.0.0.1"] {
            let ip: Ipv4Addr = ip.parse().unwrap();
            assert!(is_local_network(IpAddr::V4(ip)), "{ip}");
            assert!(node_id_is_secure(&NodeId::random(), IpAddr::V4(ip)));
        }
        assert!(!is_local_network(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn local_v6_ranges_are_exempt() {
        assert!(is_local_network(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_local_network(IpAddr::V6(
            "fe80::1".parse::<Ipv6Addr>().unwrap()
        )));
        assert!(is_local_network(IpAddr::V6(
            "fd00::1".parse::<Ipv6Addr>().unwrap()
        )));
        assert!(!is_local_network(IpAddr::V6(
            "2001:4860:4860::8888".parse::<Ipv6Addr>().unwrap()
        )));
    }

    #[test]
    fn mangled_id_validates() {
        let ip = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
        let mut id = NodeId::random();
        secure_node_id(&mut id, ip);
        assert!(node_id_is_secure(&id, ip));
    }

    #[test]
    fn mangling_is_idempotent() {
        let ip = IpAddr::V4(Ipv4Addr::new(21, 75, 31, 124));
        let mut id = NodeId::random();
        secure_node_id(&mut id, ip);
        let once = id;
        secure_node_id(&mut id, ip);
        assert_eq!(id, once);
    }

    #[test]
    fn wrong_ip_fails_validation() {
        let ip = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
        let other = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let mut id = NodeId::random();
        secure_node_id(&mut id, ip);
        assert!(node_id_is_secure(&id, ip));
        assert!(!node_id_is_secure(&id, other));
    }

    #[test]
    fn v6_mangled_id_validates() {
        let ip: IpAddr = "2001:4860:4860::8888".parse::<Ipv6Addr>().unwrap().into();
        let mut id = NodeId::random();
        secure_node_id(&mut id, ip);
        assert!(node_id_is_secure(&id, ip));
    }
}
