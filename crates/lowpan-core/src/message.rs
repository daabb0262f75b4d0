//! Outbound IPv6 messages: a fixed header, an ordered chain of extension
//! headers, and a payload.
//!
//! The chain is a plain `Vec` of tagged records. Next-header values are
//! filled in at serialization time from the record order, so a message can
//! never carry a chain that points somewhere it does not go.

use std::net::Ipv6Addr;

use bytes::Bytes;
use zerocopy::byteorder::{U16, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::wire::{next_header, RawIpv6Header, WireError, IPV6_HEADER_LEN};

/// Fields of the fixed IPv6 header that the caller controls.
///
/// Version is always 6; payload length and next-header are derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6Header {
    pub fn new(src: Ipv6Addr, dst: Ipv6Addr) -> Self {
        Self {
            traffic_class: 0,
            flow_label: 0,
            hop_limit: 64,
            src,
            dst,
        }
    }
}

/// One extension header in the chain.
///
/// `body` is everything after the two leading bytes (next header and length).
/// For a Fragment header the second byte is reserved and written as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionHeader {
    protocol: u8,
    body: Bytes,
}

impl ExtensionHeader {
    /// Build an extension header of type `protocol`.
    ///
    /// Fails if `protocol` is not an extension header, or if `body` gives a
    /// total length the header's own length field cannot describe.
    pub fn new(protocol: u8, body: impl Into<Bytes>) -> Result<Self, WireError> {
        let body = body.into();
        let total = body.len() + 2;
        let invalid = |reason| WireError::InvalidExtension { protocol, reason };

        match protocol {
            next_header::HOP_BY_HOP | next_header::ROUTING | next_header::DESTINATION_OPTIONS => {
                if total % 8 != 0 {
                    return Err(invalid("length is not a multiple of 8 octets"));
                }
                if total / 8 - 1 > u8::MAX as usize {
                    return Err(invalid("header too long"));
                }
            }
            next_header::FRAGMENT => {
                if total != 8 {
                    return Err(invalid("fragment header must be 8 octets"));
                }
            }
            next_header::AUTHENTICATION => {
                if total % 8 != 0 || total < 12 {
                    return Err(invalid("authentication header length is invalid"));
                }
                if total / 4 - 2 > u8::MAX as usize {
                    return Err(invalid("header too long"));
                }
            }
            _ => return Err(invalid("not an extension header")),
        }

        Ok(Self { protocol, body })
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Encoded length in bytes, including the two leading bytes.
    pub fn len(&self) -> usize {
        self.body.len() + 2
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn length_field(&self) -> u8 {
        let total = self.len();
        match self.protocol {
            next_header::FRAGMENT => 0,
            next_header::AUTHENTICATION => (total / 4 - 2) as u8,
            _ => (total / 8 - 1) as u8,
        }
    }

    fn encode_into(&self, next: u8, out: &mut Vec<u8>) {
        out.push(next);
        out.push(self.length_field());
        out.extend_from_slice(&self.body);
    }
}

fn is_extension(protocol: u8) -> bool {
    matches!(
        protocol,
        next_header::HOP_BY_HOP
            | next_header::ROUTING
            | next_header::FRAGMENT
            | next_header::AUTHENTICATION
            | next_header::DESTINATION_OPTIONS
    )
}

/// A complete IPv6 datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Ipv6Header,
    pub extensions: Vec<ExtensionHeader>,
    /// Upper-layer protocol of `payload` (17 for UDP, 58 for ICMPv6, ...).
    pub protocol: u8,
    pub payload: Bytes,
}

impl Message {
    pub fn new(header: Ipv6Header, protocol: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            extensions: Vec::new(),
            protocol,
            payload: payload.into(),
        }
    }

    /// Append an extension header to the end of the chain.
    pub fn with_extension(mut self, ext: ExtensionHeader) -> Self {
        self.extensions.push(ext);
        self
    }

    /// Bytes following the fixed header.
    pub fn payload_len(&self) -> usize {
        self.extensions.iter().map(ExtensionHeader::len).sum::<usize>() + self.payload.len()
    }

    /// Total serialized size: fixed header, extensions, payload.
    pub fn encoded_len(&self) -> usize {
        IPV6_HEADER_LEN + self.payload_len()
    }

    /// Serialize onto the end of `out`. Nothing is written when the
    /// extensions and payload overflow the 16-bit payload length.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        let payload_len = u16::try_from(self.payload_len()).map_err(|_| WireError::Oversized {
            field: "IPv6 payload",
            len: self.payload_len(),
        })?;
        let first_next = self
            .extensions
            .first()
            .map(ExtensionHeader::protocol)
            .unwrap_or(self.protocol);

        let raw = RawIpv6Header {
            vtc_flow: U32::new(
                (6 << 28)
                    | ((self.header.traffic_class as u32) << 20)
                    | (self.header.flow_label & 0x000f_ffff),
            ),
            payload_len: U16::new(payload_len),
            next_header: first_next,
            hop_limit: self.header.hop_limit,
            src: self.header.src.octets(),
            dst: self.header.dst.octets(),
        };

        out.reserve(self.encoded_len());
        out.extend_from_slice(raw.as_bytes());
        for (i, ext) in self.extensions.iter().enumerate() {
            let next = self
                .extensions
                .get(i + 1)
                .map(ExtensionHeader::protocol)
                .unwrap_or(self.protocol);
            ext.encode_into(next, out);
        }
        out.extend_from_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Decode a datagram, walking the extension chain until an upper-layer
    /// protocol is reached. Bytes past the declared payload length are ignored.
    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        let raw = RawIpv6Header::read_from_prefix(datagram).ok_or(WireError::Truncated {
            needed: IPV6_HEADER_LEN,
            got: datagram.len(),
        })?;
        if raw.version() != 6 {
            return Err(WireError::UnsupportedVersion(raw.version()));
        }

        let end = IPV6_HEADER_LEN + raw.payload_len.get() as usize;
        if datagram.len() < end {
            return Err(WireError::Truncated {
                needed: end,
                got: datagram.len(),
            });
        }

        let mut extensions = Vec::new();
        let mut protocol = raw.next_header;
        let mut offset = IPV6_HEADER_LEN;

        while is_extension(protocol) {
            if end - offset < 2 {
                return Err(WireError::Truncated {
                    needed: offset + 2,
                    got: end,
                });
            }
            let next = datagram[offset];
            let length_field = datagram[offset + 1] as usize;
            let total = match protocol {
                next_header::FRAGMENT => 8,
                next_header::AUTHENTICATION => (length_field + 2) * 4,
                _ => (length_field + 1) * 8,
            };
            if offset + total > end {
                return Err(WireError::Truncated {
                    needed: offset + total,
                    got: end,
                });
            }

            let body = Bytes::copy_from_slice(&datagram[offset + 2..offset + total]);
            extensions.push(ExtensionHeader::new(protocol, body)?);
            offset += total;
            protocol = next;
        }

        Ok(Self {
            header: Ipv6Header {
                traffic_class: raw.traffic_class(),
                flow_label: raw.flow_label(),
                hop_limit: raw.hop_limit,
                src: Ipv6Addr::from(raw.src),
                dst: Ipv6Addr::from(raw.dst),
            },
            extensions,
            protocol,
            payload: Bytes::copy_from_slice(&datagram[offset..end]),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
