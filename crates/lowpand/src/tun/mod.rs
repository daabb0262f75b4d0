//! Virtual interface manager. Owns the TUN device the gateway injects
//! mesh traffic through.
//!
//! Every frame on the descriptor is a 4-byte packet-information prefix
//! followed by one raw IPv6 datagram. The descriptor is opened non-blocking
//! so the event loop can wait on it with `AsyncFd`; the blocking-style
//! `write`/`read` helpers below return `WouldBlock` as an `Io` error when
//! the kernel has nothing for us.

mod sys;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use socket2::{Domain, Socket, Type};
use zerocopy::{AsBytes, FromBytes};

use lowpan_core::address::link_local;
use lowpan_core::registry::InterfaceRegistry;
use lowpan_core::wire::{PacketInfo, WireError, DEFAULT_MTU, ETH_P_IPV6, PACKET_INFO_LEN};
use lowpan_core::Message;

use sys::{IfReq, In6IfReq};

const TUN_DEVICE: &str = "/dev/net/tun";

#[derive(Debug, thiserror::Error)]
pub enum TunError {
    #[error("virtual interface {name:?} unavailable: {source}")]
    InterfaceUnavailable {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bring {name} up: {source}")]
    LinkUpFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to set MTU {mtu} on {name}: {source}")]
    MtuSetFailed {
        name: String,
        mtu: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to assign {address} to {name}: {source}")]
    AddressAssignFailed {
        name: String,
        address: Ipv6Addr,
        #[source]
        source: io::Error,
    },

    #[error("frame of {size} bytes exceeds the {limit}-byte limit")]
    OversizedMessage { size: usize, limit: usize },

    #[error("short read: {got} bytes is less than the framing prefix")]
    ShortRead { got: usize },

    #[error("short write: kernel took {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// OS index of a named interface.
pub fn if_index(name: &str) -> io::Result<u32> {
    nix::net::if_::if_nametoindex(name).map_err(io::Error::from)
}

/// Prefix `message` with packet information, refusing anything larger than
/// `mtu` plus the prefix.
pub fn encode_frame(message: &Message, mtu: u32) -> Result<Vec<u8>, TunError> {
    let limit = mtu as usize + PACKET_INFO_LEN;
    let size = PACKET_INFO_LEN + message.encoded_len();
    if size > limit {
        return Err(TunError::OversizedMessage { size, limit });
    }

    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(PacketInfo::ipv6().as_bytes());
    message.encode_into(&mut frame)?;
    Ok(frame)
}

/// Strip the packet-information prefix from one frame.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], TunError> {
    let info = PacketInfo::read_from_prefix(frame).ok_or(TunError::ShortRead { got: frame.len() })?;
    let proto = info.proto.get();
    if proto != ETH_P_IPV6 {
        return Err(WireError::UnknownProtocol(proto).into());
    }
    Ok(&frame[PACKET_INFO_LEN..])
}

/// One open TUN interface.
#[derive(Debug)]
pub struct VirtualInterface {
    file: File,
    name: String,
    address: Option<Ipv6Addr>,
    mtu: u32,
    link_up: bool,
}

impl AsRawFd for VirtualInterface {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl VirtualInterface {
    /// Attach to a new TUN interface. An empty `requested` name lets the
    /// kernel choose; the chosen name is available from [`name`](Self::name).
    pub fn open(requested: &str) -> Result<Self, TunError> {
        let unavailable = |source: io::Error| TunError::InterfaceUnavailable {
            name: requested.to_string(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(TUN_DEVICE)
            .map_err(unavailable)?;

        let mut req = IfReq::new(requested).map_err(unavailable)?;
        req.data.flags = sys::IFF_TUN;
        unsafe { sys::ioctl(file.as_raw_fd(), sys::TUNSETIFF, &mut req) }.map_err(unavailable)?;

        let name = req.name();
        tracing::info!(interface = %name, fd = file.as_raw_fd(), "virtual interface opened");

        Ok(Self {
            file,
            name,
            address: None,
            mtu: DEFAULT_MTU,
            link_up: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn address(&self) -> Option<Ipv6Addr> {
        self.address
    }

    pub fn is_up(&self) -> bool {
        self.link_up
    }

    /// Bring the link up, set its MTU, then assign `address` and its
    /// link-local counterpart.
    ///
    /// Steps run in that order and stop at the first failure. Steps that
    /// already succeeded are left in place.
    pub fn configure(&mut self, address: Ipv6Addr, mtu: u32) -> Result<(), TunError> {
        let control = Socket::new(Domain::IPV6, Type::DGRAM, None).map_err(|source| {
            TunError::LinkUpFailed {
                name: self.name.clone(),
                source,
            }
        })?;

        self.bring_up(&control).map_err(|source| TunError::LinkUpFailed {
            name: self.name.clone(),
            source,
        })?;
        self.link_up = true;

        self.set_mtu(&control, mtu).map_err(|source| TunError::MtuSetFailed {
            name: self.name.clone(),
            mtu,
            source,
        })?;
        self.mtu = mtu;

        let ifindex = if_index(&self.name).map_err(|source| TunError::AddressAssignFailed {
            name: self.name.clone(),
            address,
            source,
        })?;
        for (addr, prefixlen) in [(address, 128), (link_local(&address), 64)] {
            self.add_address(&control, ifindex, addr, prefixlen)
                .map_err(|source| TunError::AddressAssignFailed {
                    name: self.name.clone(),
                    address: addr,
                    source,
                })?;
        }
        self.address = Some(address);

        tracing::info!(
            interface = %self.name,
            %address,
            link_local = %link_local(&address),
            mtu,
            "virtual interface configured"
        );
        Ok(())
    }

    fn bring_up(&self, control: &Socket) -> io::Result<()> {
        let mut req = IfReq::new(&self.name)?;
        unsafe {
            sys::ioctl(control.as_raw_fd(), sys::SIOCGIFFLAGS, &mut req)?;
            req.data.flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
            sys::ioctl(control.as_raw_fd(), sys::SIOCSIFFLAGS, &mut req)
        }
    }

    fn set_mtu(&self, control: &Socket, mtu: u32) -> io::Result<()> {
        if mtu < DEFAULT_MTU {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("IPv6 links need an MTU of at least {DEFAULT_MTU}"),
            ));
        }
        let mtu = libc::c_int::try_from(mtu)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut req = IfReq::new(&self.name)?;
        req.data.mtu = mtu;
        unsafe { sys::ioctl(control.as_raw_fd(), sys::SIOCSIFMTU, &mut req) }
    }

    fn add_address(
        &self,
        control: &Socket,
        ifindex: u32,
        address: Ipv6Addr,
        prefixlen: u32,
    ) -> io::Result<()> {
        let mut req = In6IfReq {
            addr: libc::in6_addr {
                s6_addr: address.octets(),
            },
            prefixlen,
            ifindex: ifindex as libc::c_int,
        };
        match unsafe { sys::ioctl(control.as_raw_fd(), sys::SIOCSIFADDR, &mut req) } {
            // Reconfiguring an interface that already carries the address.
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                tracing::debug!(interface = %self.name, %address, "address already assigned");
                Ok(())
            }
            other => other,
        }
    }

    /// Hand one already-framed buffer to the kernel.
    pub fn send_frame(&self, frame: &[u8]) -> io::Result<usize> {
        (&self.file).write(frame)
    }

    /// Take one frame from the kernel, prefix included.
    pub fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    /// Serialize `message` and write it as a single frame.
    ///
    /// Oversized messages are rejected before anything reaches the kernel.
    pub fn write(&self, message: &Message) -> Result<usize, TunError> {
        let frame = encode_frame(message, self.mtu)?;
        let written = self.send_frame(&frame)?;
        if written != frame.len() {
            return Err(TunError::ShortWrite {
                written,
                expected: frame.len(),
            });
        }
        tracing::trace!(interface = %self.name, len = written, "frame written");
        Ok(written)
    }

    /// Read one frame into `buf` and return the IPv6 datagram inside it.
    pub fn read<'a>(&self, buf: &'a mut [u8]) -> Result<&'a [u8], TunError> {
        let n = self.recv_frame(buf)?;
        decode_frame(&buf[..n])
    }

    /// Release the descriptor and forget the interface in `registry`.
    pub fn close(self, registry: &InterfaceRegistry) {
        let name = self.name;
        drop(self.file);
        registry.reset();
        tracing::info!(interface = %name, "virtual interface closed");
    }

    #[cfg(test)]
    pub(crate) fn from_file(file: File, name: &str) -> Self {
        Self {
            file,
            name: name.to_string(),
            address: None,
            mtu: DEFAULT_MTU,
            link_up: false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use lowpan_core::Ipv6Header;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixDatagram;

    const UDP: u8 = 17;

    /// Interface backed by a datagram socket pair. The returned socket is the
    /// "kernel" side.
    pub(crate) fn socket_backed(name: &str) -> (VirtualInterface, UnixDatagram) {
        let (ours, kernel) = UnixDatagram::pair().unwrap();
        let file = File::from(OwnedFd::from(ours));
        (VirtualInterface::from_file(file, name), kernel)
    }

    pub(crate) fn message(payload_len: usize) -> Message {
        Message::new(
            Ipv6Header::new("fd00::1".parse().unwrap(), "fd00::2".parse().unwrap()),
            UDP,
            vec![0x5a; payload_len],
        )
    }

    #[test]
    fn write_prefixes_ipv6_packet_info() {
        let (iface, kernel) = socket_backed("tun-test");
        let msg = message(32);

        let written = iface.write(&msg).unwrap();
        assert_eq!(written, 4 + 40 + 32);

        let mut buf = [0u8; 2048];
        let n = kernel.recv(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0x00, 0x00, 0x86, 0xdd]);
        assert_eq!(&buf[4..n], &msg.to_bytes().unwrap()[..]);
    }

    #[test]
    fn message_filling_the_mtu_is_accepted() {
        let (iface, _kernel) = socket_backed("tun-test");
        let msg = message(DEFAULT_MTU as usize - 40);
        assert_eq!(iface.write(&msg).unwrap(), DEFAULT_MTU as usize + 4);
    }

    #[test]
    fn oversized_message_is_rejected_without_writing() {
        let (iface, kernel) = socket_backed("tun-test");
        let msg = message(DEFAULT_MTU as usize - 39);

        match iface.write(&msg) {
            Err(TunError::OversizedMessage { size, limit }) => {
                assert_eq!(size, 1285);
                assert_eq!(limit, 1284);
            }
            other => panic!("expected OversizedMessage, got {other:?}"),
        }

        kernel.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 16];
        let err = kernel.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn read_strips_packet_info() {
        let (iface, kernel) = socket_backed("tun-test");
        let datagram = message(10).to_bytes().unwrap();
        let mut frame = vec![0x00, 0x00, 0x86, 0xdd];
        frame.extend_from_slice(&datagram);
        kernel.send(&frame).unwrap();

        let mut buf = [0u8; 2048];
        let got = iface.read(&mut buf).unwrap();
        assert_eq!(got, &datagram[..]);
        assert_eq!(Message::parse(got).unwrap().payload, Bytes::from(vec![0x5a; 10]));
    }

    #[test]
    fn frame_shorter_than_prefix_is_short_read() {
        let (iface, kernel) = socket_backed("tun-test");
        kernel.send(&[0x00, 0x00]).unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(iface.read(&mut buf), Err(TunError::ShortRead { got: 2 })));
    }

    #[test]
    fn non_ipv6_frame_is_rejected() {
        let (iface, kernel) = socket_backed("tun-test");
        kernel.send(&[0x00, 0x00, 0x08, 0x00, 0x45, 0x00]).unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(
            iface.read(&mut buf),
            Err(TunError::Malformed(WireError::UnknownProtocol(0x0800)))
        ));
    }

    #[test]
    fn close_clears_registry() {
        let (iface, _kernel) = socket_backed("tun-test");
        let registry = InterfaceRegistry::new();
        registry.set_descriptor(iface.as_raw_fd()).unwrap();
        registry.set_name(iface.name()).unwrap();

        iface.close(&registry);
        assert_eq!(registry.descriptor(), None);
        assert_eq!(registry.name(), None);
        registry.set_descriptor(7).unwrap();
    }

    #[test]
    fn unknown_interface_has_no_index() {
        assert!(if_index("no-such-if0").is_err());
    }

    #[test]
    fn configure_on_missing_interface_fails_at_link_up() {
        let (mut iface, _kernel) = socket_backed("no-such-if0");

        match iface.configure("fd00::1".parse().unwrap(), DEFAULT_MTU) {
            Err(TunError::LinkUpFailed { name, .. }) => assert_eq!(name, "no-such-if0"),
            other => panic!("expected LinkUpFailed, got {other:?}"),
        }
        assert!(!iface.is_up());
        assert_eq!(iface.address(), None);
    }
}
