//! Mesh-side UDP link.
//!
//! Chunks leave through one socket, either to a configured unicast bridge
//! address or to the link-local all-nodes group ff02::1 on the mesh
//! interface, and chunks from the mesh arrive on the same socket.

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use lowpan_core::config::MeshConfig;
use lowpan_core::wire::MULTICAST_ADDR;
use lowpan_core::Chunk;

use crate::tun::if_index;

pub struct MeshLink {
    socket: UdpSocket,
    destination: SocketAddr,
    pacing: Duration,
}

impl MeshLink {
    /// Open the mesh socket described by `config`. Must be called from
    /// inside a Tokio runtime.
    pub fn open(config: &MeshConfig) -> Result<Self> {
        let interface_index = if config.interface.is_empty() {
            0
        } else {
            if_index(&config.interface)
                .with_context(|| format!("mesh interface '{}' not found", config.interface))?
        };

        let destination: SocketAddr = match config.peer_addr()? {
            Some(peer) => peer,
            None => {
                let group: Ipv6Addr = MULTICAST_ADDR.parse()?;
                SocketAddrV6::new(group, config.port, 0, interface_index).into()
            }
        };

        let socket = make_mesh_socket(config.port, interface_index)
            .context("failed to create mesh socket")?;
        let socket = UdpSocket::from_std(socket.into()).context("failed to register mesh socket")?;

        tracing::info!(
            local = %socket.local_addr()?,
            %destination,
            interface_index,
            "mesh link open"
        );

        Ok(Self {
            socket,
            destination,
            pacing: Duration::from_micros(config.pacing_us),
        })
    }

    /// Bind a plain unicast link, without multicast membership.
    pub async fn bind(local: SocketAddr, destination: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(local).await?,
            destination,
            pacing: Duration::ZERO,
        })
    }

    pub fn set_destination(&mut self, destination: SocketAddr) {
        self.destination = destination;
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send every chunk of one operation, in sequence order.
    pub async fn send_chunks(&self, chunks: &[Chunk]) -> io::Result<usize> {
        let mut sent = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
            let wire = chunk
                .encode()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            self.socket.send_to(&wire, self.destination).await?;
            sent += 1;
            tracing::trace!(
                ordering = chunk.ordering,
                sequence = chunk.sequence,
                len = chunk.len(),
                "chunk sent"
            );
        }
        Ok(sent)
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Create the dual-purpose mesh socket: bound to `port` on all addresses,
/// and joined to ff02::1 when an interface is given.
fn make_mesh_socket(port: u16, interface_index: u32) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("O_NONBLOCK")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("bind [::]:{port}"))?;

    if interface_index != 0 {
        let group: Ipv6Addr = MULTICAST_ADDR.parse()?;
        socket
            .join_multicast_v6(&group, interface_index)
            .context("IPV6_JOIN_GROUP")?;
        socket.set_multicast_if_v6(interface_index).context("IPV6_MULTICAST_IF")?;
        // link-local only
        socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
        socket.set_multicast_loop_v6(false).context("IPV6_MULTICAST_LOOP")?;
    }

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lowpan_core::config::ConfigError;
    use lowpan_core::split;

    fn loopback() -> SocketAddr {
        "[::1]:0".parse().unwrap()
    }

    #[tokio::test]
    async fn chunks_arrive_in_order_on_peer() {
        let receiver = MeshLink::bind(loopback(), loopback()).await.unwrap();
        let sender = MeshLink::bind(loopback(), receiver.local_addr().unwrap())
            .await
            .unwrap();

        let chunks = split(&[7u8; 250], 100, 9).unwrap();
        assert_eq!(sender.send_chunks(&chunks).await.unwrap(), 3);

        let mut buf = [0u8; 256];
        for expected in &chunks {
            let (n, from) = receiver.recv_from(&mut buf).await.unwrap();
            assert_eq!(from, sender.local_addr().unwrap());
            assert_eq!(&Chunk::decode(&buf[..n]).unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn open_without_peer_or_interface_fails() {
        let config = MeshConfig {
            port: 0,
            ..MeshConfig::default()
        };
        let err = MeshLink::open(&config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Invalid { key: "mesh", .. })
        ));
    }

    #[tokio::test]
    async fn open_with_unicast_peer() {
        let config = MeshConfig {
            port: 0,
            peer: "[::1]:9".into(),
            ..MeshConfig::default()
        };
        let link = MeshLink::open(&config).unwrap();
        assert_ne!(link.local_addr().unwrap().port(), 0);
    }
}
