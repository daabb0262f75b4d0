//! lowpan integration test harness.
//!
//! The TUN tests here create real kernel interfaces. They need root and
//! /dev/net/tun:
//!
//!   sudo cargo test --test integration
//!
//! Tests skip gracefully when either is missing. Each test uses its own
//! interface name so they can run in parallel.

use std::net::{Ipv6Addr, SocketAddr};
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use lowpan_core::message::{ExtensionHeader, Ipv6Header, Message};
use lowpan_core::wire::next_header;
use lowpan_core::{split, InterfaceRegistry, Progress, Reassembler};
use lowpand::mesh::MeshLink;
use lowpand::tun::{TunError, VirtualInterface};

// ── Harness ───────────────────────────────────────────────────────────────────

/// True when this process can create TUN interfaces.
pub fn tun_available() -> bool {
    let root = unsafe { libc::geteuid() } == 0;
    root && std::path::Path::new("/dev/net/tun").exists()
}

/// Run `ip` with `args`. Returns stdout on success.
pub fn ip(args: &[&str]) -> Result<String> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .with_context(|| format!("failed to run: ip {args:?}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        bail!(
            "ip {args:?} failed\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    }
}

fn udp_message(len: usize) -> Message {
    Message::new(
        Ipv6Header::new("fd00::beef".parse().unwrap(), "fd00::1".parse().unwrap()),
        17,
        vec![0xab; len],
    )
}

// ── TUN tests ─────────────────────────────────────────────────────────────────

#[test]
fn test_open_lets_kernel_pick_name() {
    if !tun_available() {
        eprintln!("SKIP: needs root and /dev/net/tun");
        return;
    }

    let registry = InterfaceRegistry::new();
    let tun = VirtualInterface::open("").expect("open should succeed");
    println!("kernel assigned {}", tun.name());
    assert!(tun.name().starts_with("tun"), "unexpected name {}", tun.name());
    assert!(!tun.is_up());
    tun.close(&registry);
}

#[test]
fn test_configure_assigns_global_and_link_local() {
    if !tun_available() {
        eprintln!("SKIP: needs root and /dev/net/tun");
        return;
    }

    let address: Ipv6Addr = "fd00::beef".parse().unwrap();
    let mut tun = VirtualInterface::open("lowpantest0").expect("open should succeed");
    assert_eq!(tun.name(), "lowpantest0");

    tun.configure(address, 1280).expect("configure should succeed");
    assert!(tun.is_up());
    assert_eq!(tun.address(), Some(address));

    let link = ip(&["link", "show", "dev", "lowpantest0"]).unwrap();
    assert!(link.contains("mtu 1280"), "MTU not applied:\n{link}");
    assert!(link.contains("UP"), "link not up:\n{link}");

    let addrs = ip(&["-6", "addr", "show", "dev", "lowpantest0"]).unwrap();
    assert!(addrs.contains("fd00::beef/128"), "global address missing:\n{addrs}");
    assert!(addrs.contains("fe80::beef/64"), "link-local address missing:\n{addrs}");

    // A second configure finds the addresses already there.
    tun.configure(address, 1400).expect("reconfigure should succeed");
    assert_eq!(tun.mtu(), 1400);

    tun.close(&InterfaceRegistry::new());
    assert!(ip(&["link", "show", "dev", "lowpantest0"]).is_err());
}

#[test]
fn test_mtu_below_ipv6_minimum_is_rejected() {
    if !tun_available() {
        eprintln!("SKIP: needs root and /dev/net/tun");
        return;
    }

    let mut tun = VirtualInterface::open("lowpantest1").unwrap();
    match tun.configure("fd00::1:1".parse().unwrap(), 576) {
        Err(TunError::MtuSetFailed { mtu, .. }) => assert_eq!(mtu, 576),
        other => panic!("expected MtuSetFailed, got {other:?}"),
    }
    // link-up ran before the MTU step and is not rolled back
    assert!(tun.is_up());
    tun.close(&InterfaceRegistry::new());
}

#[test]
fn test_multicast_address_is_refused() {
    if !tun_available() {
        eprintln!("SKIP: needs root and /dev/net/tun");
        return;
    }

    let group: Ipv6Addr = "ff02::1:64".parse().unwrap();
    let mut tun = VirtualInterface::open("lowpantest5").unwrap();
    match tun.configure(group, 1280) {
        Err(TunError::AddressAssignFailed { address, .. }) => assert_eq!(address, group),
        other => panic!("expected AddressAssignFailed, got {other:?}"),
    }
    // link-up and MTU ran first and stay in place
    assert!(tun.is_up());
    assert_eq!(tun.mtu(), 1280);
    assert_eq!(tun.address(), None);
    tun.close(&InterfaceRegistry::new());
}

#[test]
fn test_write_respects_mtu() {
    if !tun_available() {
        eprintln!("SKIP: needs root and /dev/net/tun");
        return;
    }

    let mut tun = VirtualInterface::open("lowpantest2").unwrap();
    tun.configure("fd00::2:1".parse().unwrap(), 1280).unwrap();

    let hop = ExtensionHeader::new(next_header::HOP_BY_HOP, vec![1, 4, 0, 0, 0, 0]).unwrap();
    let msg = udp_message(64).with_extension(hop);
    assert_eq!(tun.write(&msg).unwrap(), 4 + msg.encoded_len());

    let too_big = udp_message(1300);
    assert!(matches!(
        tun.write(&too_big),
        Err(TunError::OversizedMessage { .. })
    ));

    tun.close(&InterfaceRegistry::new());
}

#[test]
fn test_registry_tracks_one_interface() {
    if !tun_available() {
        eprintln!("SKIP: needs root and /dev/net/tun");
        return;
    }

    use std::os::fd::AsRawFd;

    let registry = InterfaceRegistry::new();
    let tun = VirtualInterface::open("lowpantest3").unwrap();
    registry.set_descriptor(tun.as_raw_fd()).unwrap();
    registry.set_name(tun.name()).unwrap();

    let other = VirtualInterface::open("lowpantest4").unwrap();
    assert!(registry.set_descriptor(other.as_raw_fd()).is_err());
    assert_eq!(registry.name().as_deref(), Some("lowpantest3"));
    other.close(&InterfaceRegistry::new());

    tun.close(&registry);
    assert_eq!(registry.descriptor(), None);
}

// ── Mesh tests (no root needed) ───────────────────────────────────────────────

#[tokio::test]
async fn test_mesh_loopback_reassembles_datagram() {
    let loopback: SocketAddr = "[::1]:0".parse().unwrap();
    let receiver = match MeshLink::bind(loopback, loopback).await {
        Ok(link) => link,
        Err(e) => {
            eprintln!("SKIP: no IPv6 loopback ({e})");
            return;
        }
    };
    let sender = MeshLink::bind(loopback, receiver.local_addr().unwrap())
        .await
        .unwrap();

    let datagram = udp_message(900).to_bytes().unwrap();
    let chunks = split(&datagram, 100, 500).unwrap();
    assert_eq!(chunks.len(), 10);
    sender.send_chunks(&chunks).await.unwrap();

    let mut reassembler = Reassembler::default();
    let mut buf = [0u8; 512];
    let rebuilt = loop {
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .expect("timed out waiting for chunk")
            .unwrap();
        let chunk = lowpan_core::Chunk::decode(&buf[..n]).unwrap();
        if let Progress::Complete { datagram, .. } = reassembler.add(chunk).unwrap() {
            break datagram;
        }
    };

    assert_eq!(rebuilt, Bytes::from(datagram));
    let msg = Message::parse(&rebuilt).unwrap();
    assert_eq!(msg.payload.len(), 900);
}
