//! The IP flow key (spec.md §3): address family, source address,
//! destination address, and a reserved L4 descriptor slot. Compared for
//! bitwise equality; hashed with the NIC-compatible RSS hash in `rss`, not
//! with `std::hash::Hash` (the GK flow table's hash must match hardware
//! RSS, which `Hash`/`Hasher` cannot express).

use std::net::IpAddr;

/// Reserved for future per-flow L4 granularity (spec.md marks this
/// "reserved for later use"). Carried today so `FlowKey` equality and
/// hashing are already defined over the eventual full shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct L4Descriptor {
    pub protocol: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub l4: L4Descriptor,
}

impl FlowKey {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        FlowKey {
            src,
            dst,
            l4: L4Descriptor::default(),
        }
    }

    pub fn with_protocol(src: IpAddr, dst: IpAddr, protocol: u8) -> Self {
        FlowKey {
            src,
            dst,
            l4: L4Descriptor { protocol },
        }
    }

    /// Serializes the address pair into `buf` in the canonical order NICs
    /// hash over (source then destination, each in network byte order),
    /// returning the number of bytes written. `buf` must be at least 32
    /// bytes (two IPv6 addresses).
    pub fn write_hash_bytes(&self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        n += write_addr(&self.src, &mut buf[n..]);
        n += write_addr(&self.dst, &mut buf[n..]);
        n
    }
}

fn write_addr(addr: &IpAddr, buf: &mut [u8]) -> usize {
    match addr {
        IpAddr::V4(v4) => {
            buf[..4].copy_from_slice(&v4.octets());
            4
        }
        IpAddr::V6(v6) => {
            buf[..16].copy_from_slice(&v6.octets());
            16
        }
    }
}
