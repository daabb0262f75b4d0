//! lowpand — 6LoWPAN IPv6 gateway daemon.
//!
//! Bridges a TUN interface to a constrained wireless mesh: IPv6 datagrams
//! from the host are fragmented into checksummed chunks for the mesh, and
//! chunks from the mesh are reassembled and injected back into the host.

pub mod gateway;
pub mod mesh;
pub mod routing;
pub mod stats;
pub mod tun;
