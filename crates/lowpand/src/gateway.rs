//! Steady-state gateway loop.
//!
//! One task waits on two sources:
//!   - the TUN descriptor: each IPv6 frame is split into chunks under the
//!     next ordering number and sent to the mesh,
//!   - the mesh socket: each chunk goes to the reassembler, and completed
//!     datagrams are parsed and written back through the TUN.
//!
//! A bad frame or chunk is logged and skipped. The loop ends on shutdown,
//! or with an error once the TUN descriptor is unusable.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::io::unix::AsyncFd;
use tokio::sync::broadcast;
use tokio::time::{self, Interval, MissedTickBehavior};

use lowpan_core::config::GatewayConfig;
use lowpan_core::wire::{CHUNK_HEADER_LEN, MAX_FRAME_LEN};
use lowpan_core::{split, Chunk, Message, Progress, Reassembler};

use crate::mesh::MeshLink;
use crate::routing::RoutingContext;
use crate::stats::GatewayStats;
use crate::tun::{decode_frame, encode_frame, TunError, VirtualInterface};

pub struct Gateway {
    tun: AsyncFd<VirtualInterface>,
    mesh: MeshLink,
    routing: RoutingContext,
    reassembler: Reassembler,
    chunk_size: usize,
    idle: Option<Duration>,
    stats: GatewayStats,
    reported: GatewayStats,
}

impl Gateway {
    /// Must be called from inside a Tokio runtime.
    pub fn new(
        tun: VirtualInterface,
        mesh: MeshLink,
        routing: RoutingContext,
        config: &GatewayConfig,
    ) -> Result<Self> {
        let chunk_size = config.mesh.chunk_size;
        if chunk_size == 0 || chunk_size > u16::MAX as usize {
            bail!("mesh chunk size {chunk_size} out of range");
        }
        let idle = match config.gateway.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            tun: AsyncFd::new(tun)?,
            mesh,
            routing,
            reassembler: Reassembler::default(),
            chunk_size,
            idle,
            stats: GatewayStats::default(),
            reported: GatewayStats::default(),
        })
    }

    /// Run until `shutdown` fires. Fails when the virtual interface can no
    /// longer be read; teardown goes through [`into_parts`](Self::into_parts)
    /// either way.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut frame = vec![0u8; MAX_FRAME_LEN];
        let mut datagram = vec![0u8; u16::MAX as usize + CHUNK_HEADER_LEN];
        let mut ticker = self.idle.map(|period| {
            let mut t = time::interval(period);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });

        tracing::info!(
            interface = %self.tun.get_ref().name(),
            mesh = ?self.mesh.local_addr().ok(),
            chunk_size = self.chunk_size,
            "gateway loop running"
        );

        let outcome = loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("gateway loop stopping");
                    break Ok(());
                }

                ready = self.tun.readable() => {
                    let mut guard = match ready {
                        Ok(guard) => guard,
                        Err(e) => {
                            break Err(anyhow::Error::new(e).context("virtual interface no longer pollable"));
                        }
                    };
                    let received = match guard.try_io(|inner| inner.get_ref().recv_frame(&mut frame)) {
                        Ok(result) => result,
                        Err(_would_block) => continue,
                    };
                    drop(guard);
                    match received {
                        Ok(0) => {
                            break Err(anyhow!("virtual interface {} reached end of file", self.tun.get_ref().name()));
                        }
                        Ok(n) => self.handle_frame(&frame[..n]).await,
                        Err(e) => tracing::warn!(error = %e, "virtual interface read failed"),
                    }
                }

                received = self.mesh.recv_from(&mut datagram) => {
                    match received {
                        Ok((n, from)) => self.handle_chunk(&datagram[..n], from).await,
                        Err(e) => tracing::warn!(error = %e, "mesh receive failed"),
                    }
                }

                _ = tick(&mut ticker) => self.on_idle(),
            }
        };

        self.stats.report(&mut self.reported, self.reassembler.pending());
        outcome
    }

    /// Hand the interface and routing state back for teardown.
    pub fn into_parts(self) -> (VirtualInterface, RoutingContext) {
        (self.tun.into_inner(), self.routing)
    }

    /// Outbound path: TUN → chunks → mesh.
    async fn handle_frame(&mut self, frame: &[u8]) {
        let interface = self.tun.get_ref().name().to_string();
        let datagram = match decode_frame(frame) {
            Ok(d) => d,
            Err(e) => {
                self.stats.frames_dropped += 1;
                tracing::warn!(%interface, error = %e, "dropping frame from virtual interface");
                return;
            }
        };
        self.stats.frames_in += 1;

        let ordering = self.routing.sequence.advance();
        self.routing.sequence.persist_if_due();

        let chunks = match split(datagram, self.chunk_size, ordering) {
            Ok(chunks) => chunks,
            Err(e) => {
                self.stats.frames_dropped += 1;
                tracing::warn!(%interface, ordering, error = %e, "cannot fragment frame");
                return;
            }
        };

        match self.mesh.send_chunks(&chunks).await {
            Ok(sent) => {
                self.stats.chunks_sent += sent as u64;
                tracing::debug!(ordering, len = datagram.len(), parts = chunks.len(), "frame forwarded to mesh");
            }
            Err(e) => tracing::warn!(ordering, error = %e, "mesh send failed"),
        }
    }

    /// Inbound path: mesh chunk → reassembler → TUN.
    async fn handle_chunk(&mut self, buf: &[u8], from: SocketAddr) {
        let chunk = match Chunk::decode(buf) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.stats.chunks_rejected += 1;
                tracing::warn!(
                    %from,
                    head = hex::encode(&buf[..buf.len().min(16)]),
                    error = %e,
                    "undecodable chunk"
                );
                return;
            }
        };
        self.stats.chunks_received += 1;

        let (ordering, sequence) = (chunk.ordering, chunk.sequence);
        match self.reassembler.add(chunk) {
            Ok(Progress::Pending { received, parts }) => {
                tracing::trace!(ordering, sequence, received, parts, "chunk buffered");
            }
            Ok(Progress::Duplicate) => {
                tracing::debug!(ordering, sequence, %from, "duplicate chunk ignored");
            }
            Ok(Progress::Complete { ordering, datagram }) => {
                self.stats.reassembled += 1;
                self.deliver(ordering, &datagram).await;
            }
            Err(e) => {
                self.stats.chunks_rejected += 1;
                self.stats.reassembly_discarded += 1;
                tracing::warn!(ordering, sequence, %from, error = %e, "discarding reassembly");
            }
        }
    }

    async fn deliver(&mut self, ordering: u16, datagram: &[u8]) {
        let message = match Message::parse(datagram) {
            Ok(m) => m,
            Err(e) => {
                self.stats.frames_dropped += 1;
                tracing::warn!(ordering, len = datagram.len(), error = %e, "reassembled datagram is not valid IPv6");
                return;
            }
        };

        let result = match encode_frame(&message, self.tun.get_ref().mtu()) {
            Ok(frame) => self.write_frame(&frame).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.stats.frames_out += 1;
                tracing::debug!(ordering, src = %message.header.src, dst = %message.header.dst, "datagram delivered to virtual interface");
            }
            Err(e) => {
                self.stats.frames_dropped += 1;
                tracing::warn!(
                    interface = %self.tun.get_ref().name(),
                    ordering,
                    error = %e,
                    "dropping reassembled datagram"
                );
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), TunError> {
        loop {
            let mut guard = self.tun.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_frame(frame)) {
                Ok(Ok(n)) if n == frame.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(TunError::ShortWrite {
                        written: n,
                        expected: frame.len(),
                    })
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    fn on_idle(&mut self) {
        for e in self.reassembler.expire_stale() {
            self.stats.reassembly_discarded += 1;
            tracing::warn!(error = %e, "reassembly timed out");
        }
        self.stats.report(&mut self.reported, self.reassembler.pending());
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
