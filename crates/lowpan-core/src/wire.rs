//! lowpan wire format — the on-wire types the gateway reads and writes.
//!
//! Three layouts live here:
//!   - the TUN packet-information prefix that frames every datagram on the
//!     virtual interface,
//!   - the fixed 40-byte IPv6 header,
//!   - the chunk header that precedes every fragment sent over the mesh.
//!
//! All multi-byte fields are network byte order. Types use zerocopy derives
//! so they can be read from and written to byte slices without unsafe code.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Packet information prefix ─────────────────────────────────────────────────

/// Framing prefix the kernel puts in front of every frame on a TUN
/// descriptor opened without `IFF_NO_PI`.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PacketInfo {
    /// `TUN_PKT_STRIP` and friends. Always zero on write.
    pub flags: U16<NetworkEndian>,
    /// Ethertype of the encapsulated datagram.
    pub proto: U16<NetworkEndian>,
}

assert_eq_size!(PacketInfo, [u8; 4]);

impl PacketInfo {
    /// Prefix for an IPv6 datagram.
    pub fn ipv6() -> Self {
        Self {
            flags: U16::new(0),
            proto: U16::new(ETH_P_IPV6),
        }
    }
}

// ── IPv6 fixed header ─────────────────────────────────────────────────────────

/// The fixed IPv6 header as it appears on the wire.
///
/// Wire size: 40 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct RawIpv6Header {
    /// version (4 bits) | traffic class (8 bits) | flow label (20 bits)
    pub vtc_flow: U32<NetworkEndian>,
    /// Length of everything after this header.
    pub payload_len: U16<NetworkEndian>,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: [u8; 16],
    pub dst: [u8; 16],
}

assert_eq_size!(RawIpv6Header, [u8; 40]);

impl RawIpv6Header {
    pub fn version(&self) -> u8 {
        (self.vtc_flow.get() >> 28) as u8
    }

    pub fn traffic_class(&self) -> u8 {
        (self.vtc_flow.get() >> 20) as u8
    }

    pub fn flow_label(&self) -> u32 {
        self.vtc_flow.get() & 0x000f_ffff
    }
}

// ── Chunk header ──────────────────────────────────────────────────────────────

/// Header of one fragment carried over the mesh.
///
/// A receiver can find the chunk boundary, place the chunk in its operation,
/// and verify the payload from this header alone.
///
/// Wire size: 10 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkHeader {
    /// Position of this chunk within the original buffer, starting at zero.
    pub sequence: U16<NetworkEndian>,
    /// Identifier of the fragmentation operation this chunk belongs to.
    pub ordering: U16<NetworkEndian>,
    /// Total number of chunks produced by the operation.
    pub parts: U16<NetworkEndian>,
    /// Internet checksum over the payload bytes only.
    pub checksum: U16<NetworkEndian>,
    /// Payload length in bytes, not including this header.
    pub length: U16<NetworkEndian>,
}

assert_eq_size!(ChunkHeader, [u8; 10]);

// ── Constants ─────────────────────────────────────────────────────────────────

/// Ethertype tag for IPv6 in the packet-information prefix.
pub const ETH_P_IPV6: u16 = 0x86dd;

pub const PACKET_INFO_LEN: usize = 4;
pub const IPV6_HEADER_LEN: usize = 40;
pub const CHUNK_HEADER_LEN: usize = 10;

/// Default link MTU of the virtual interface. IPv6 requires every link to
/// carry at least this much.
pub const DEFAULT_MTU: u32 = 1280;

/// Largest frame the kernel can hand us on a TUN descriptor.
pub const MAX_FRAME_LEN: usize = 65536 + PACKET_INFO_LEN;

/// Default fragment payload size for the mesh link.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Default UDP port of the mesh-side socket.
pub const MESH_PORT: u16 = 9002;

/// IPv6 link-local all-nodes group, used when no mesh peer is configured.
pub const MULTICAST_ADDR: &str = "ff02::1";

/// IPv6 next-header values for the extension headers the gateway understands.
pub mod next_header {
    pub const HOP_BY_HOP: u8 = 0;
    pub const ROUTING: u8 = 43;
    pub const FRAGMENT: u8 = 44;
    pub const AUTHENTICATION: u8 = 51;
    pub const NO_NEXT_HEADER: u8 = 59;
    pub const DESTINATION_OPTIONS: u8 = 60;
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated input: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid extension header {protocol}: {reason}")]
    InvalidExtension { protocol: u8, reason: &'static str },

    #[error("unexpected ethertype 0x{0:04x} in packet information")]
    UnknownProtocol(u16),

    #[error("{field} of {len} bytes does not fit a 16-bit length field")]
    Oversized { field: &'static str, len: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
