//! Raw ioctl surface of the Linux TUN driver and the interface
//! configuration requests used on it.

use std::io;
use std::os::fd::RawFd;

#[cfg(target_env = "musl")]
pub type IoctlRequest = libc::c_int;
#[cfg(not(target_env = "musl"))]
pub type IoctlRequest = libc::c_ulong;

pub const TUNSETIFF: IoctlRequest = 0x400454ca;
pub const SIOCGIFFLAGS: IoctlRequest = 0x8913;
pub const SIOCSIFFLAGS: IoctlRequest = 0x8914;
pub const SIOCSIFADDR: IoctlRequest = 0x8916;
pub const SIOCSIFMTU: IoctlRequest = 0x8922;

/// Point-to-point IP device. `IFF_NO_PI` is left clear so every frame
/// carries the packet-information prefix.
pub const IFF_TUN: libc::c_short = 0x0001;

#[repr(C)]
#[derive(Clone, Copy)]
pub union IfReqData {
    pub flags: libc::c_short,
    pub mtu: libc::c_int,
    pad: [u8; 24],
}

/// `struct ifreq`, restricted to the members we touch.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IfReq {
    pub name: [libc::c_char; libc::IFNAMSIZ],
    pub data: IfReqData,
}

impl IfReq {
    /// Request addressed to interface `name`. An empty name asks the
    /// kernel to pick one on `TUNSETIFF`.
    pub fn new(name: &str) -> io::Result<Self> {
        if name.len() >= libc::IFNAMSIZ || name.bytes().any(|b| b == 0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name {name:?}"),
            ));
        }

        let mut req = Self {
            name: [0; libc::IFNAMSIZ],
            data: IfReqData { pad: [0; 24] },
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        Ok(req)
    }

    /// Interface name as filled in by the kernel.
    pub fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// `struct in6_ifreq` from `<linux/ipv6.h>`.
#[repr(C)]
pub struct In6IfReq {
    pub addr: libc::in6_addr,
    pub prefixlen: u32,
    pub ifindex: libc::c_int,
}

/// Issue `request` on `fd`.
///
/// # Safety
/// `arg` must be the structure the kernel expects for `request`.
pub unsafe fn ioctl<T>(fd: RawFd, request: IoctlRequest, arg: &mut T) -> io::Result<()> {
    if libc::ioctl(fd, request, arg as *mut T) < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifreq_layout_matches_kernel() {
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
        assert_eq!(std::mem::size_of::<In6IfReq>(), 24);
    }

    #[test]
    fn name_round_trips_through_request() {
        let req = IfReq::new("lowpan0").unwrap();
        assert_eq!(req.name(), "lowpan0");
        assert_eq!(IfReq::new("").unwrap().name(), "");
    }

    #[test]
    fn overlong_or_nul_names_are_rejected() {
        assert!(IfReq::new("a-very-long-ifname").is_err());
        assert!(IfReq::new("tun\0x").is_err());
    }
}
