//! The symmetric Toeplitz hash NICs use for receive-side scaling (spec.md
//! §3, §4.5, §4.7, C12). The GK flow table's `lookup`/`insert` and the
//! policy-routing computation in `gk::policy::route_to_worker` both hash
//! through this module so a flow's packets and its policy commands always
//! resolve to the same owning core.

/// The widely used Microsoft RSS default symmetric key (40 bytes), chosen so
/// that a flow hashes identically regardless of which endpoint sent the
/// packet -- the same property the real NIC's programmed key provides.
pub const DEFAULT_RSS_KEY: [u8; 40] = [
    0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3, 0x8f, 0xb0,
    0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30, 0xf2, 0x0c,
    0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac, 0x01, 0xfa,
];

/// Computes the Toeplitz hash of `data` under `key`, matching the algorithm
/// programmed into the NIC's RSS engine. `key` must be at least
/// `data.len() + 3` bytes (it is a sliding 32-bit window over the key).
pub fn toeplitz_hash(key: &[u8], data: &[u8]) -> u32 {
    assert!(
        key.len() * 8 >= data.len() * 8 + 32 - 8,
        "rss key too short for input"
    );

    let mut result: u32 = 0;
    for (byte_idx, &byte) in data.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                result ^= key_window(key, byte_idx * 8 + bit);
            }
        }
    }
    result
}

/// Returns the 32-bit big-endian window of `key` starting at `bit_offset`.
fn key_window(key: &[u8], bit_offset: usize) -> u32 {
    let byte_offset = bit_offset / 8;
    let bit_shift = bit_offset % 8;

    let mut window: u64 = 0;
    for i in 0..5 {
        let b = *key.get(byte_offset + i).unwrap_or(&0);
        window = (window << 8) | b as u64;
    }
    ((window >> (8 - bit_shift)) & 0xFFFF_FFFF) as u32
}

use crate::flow_key::FlowKey;

/// Serializes a flow key in the canonical NIC hash order (source address,
/// destination address) and hashes it under `key`.
pub fn flow_key_hash(key: &[u8; 40], flow: &FlowKey) -> u32 {
    let mut buf = [0u8; 32];
    let len = flow.write_hash_bytes(&mut buf);
    toeplitz_hash(key, &buf[..len])
}

/// Reduces an RSS hash to an RX-queue index via the NIC's redirection
/// table, exactly mirroring the hardware's own `hash mod table_size` lookup
/// so the policy feeder's routing decision matches the NIC's.
pub fn redirection_table_index(hash: u32, table_size: u32) -> u32 {
    hash % table_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_key::FlowKey;
    use std::net::IpAddr;

    #[test]
    fn hash_is_deterministic() {
        let flow = FlowKey::new(
            "10.0.0.1".parse::<IpAddr>().unwrap(),
            "93.184.216.34".parse::<IpAddr>().unwrap(),
        );
        let a = flow_key_hash(&DEFAULT_RSS_KEY, &flow);
        let b = flow_key_hash(&DEFAULT_RSS_KEY, &flow);
        assert_eq!(a, b);
    }

    #[test]
    fn different_flows_usually_hash_differently() {
        let a = FlowKey::new(
            "10.0.0.1".parse::<IpAddr>().unwrap(),
            "93.184.216.34".parse::<IpAddr>().unwrap(),
        );
        let b = FlowKey::new(
            "10.0.0.2".parse::<IpAddr>().unwrap(),
            "93.184.216.34".parse::<IpAddr>().unwrap(),
        );
        assert_ne!(
            flow_key_hash(&DEFAULT_RSS_KEY, &a),
            flow_key_hash(&DEFAULT_RSS_KEY, &b)
        );
    }

    #[test]
    fn redirection_index_is_bounded() {
        let idx = redirection_table_index(0xFFFF_FFFF, 128);
        assert!(idx < 128);
    }
}
