//! Address derivations shared by the interface manager and the bootstrap.

use std::net::Ipv6Addr;

/// The node's short (16-bit) mesh address: the low 16 bits of its global
/// IPv6 address.
pub fn short_address(global: &Ipv6Addr) -> u16 {
    global.segments()[7]
}

/// Link-local address whose interface identifier is the short address,
/// i.e. `fe80::<short>`.
pub fn link_local(global: &Ipv6Addr) -> Ipv6Addr {
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, short_address(global))
}
