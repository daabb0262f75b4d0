//! Routing bootstrap: one-shot kernel preparation run before the tunnel
//! is opened.
//!
//! Uninitialized → ForwardingEnabled → ProxyConfigured → SequenceRecovered → Ready
//!
//! Forwarding is required; the gateway is useless without it. Neighbor
//! discovery proxying and the persisted sequence counter are best effort.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use lowpan_core::address::short_address;
use lowpan_core::config::RoutingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapState {
    Uninitialized,
    ForwardingEnabled,
    ProxyConfigured,
    SequenceRecovered,
    Ready,
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to enable IPv6 forwarding via {path}: {source}")]
    ForwardingEnableFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ── Kernel switches ───────────────────────────────────────────────────────────

/// Boolean switches under the IPv6 sysctl tree.
#[derive(Debug, Clone)]
pub struct KernelControls {
    root: PathBuf,
}

impl KernelControls {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn forwarding_path(&self) -> PathBuf {
        self.root.join("all").join("forwarding")
    }

    pub fn proxy_ndp_path(&self, interface: &str) -> PathBuf {
        self.root.join(interface).join("proxy_ndp")
    }

    pub fn enable_forwarding(&self) -> io::Result<()> {
        enable(&self.forwarding_path())
    }

    pub fn enable_proxy_ndp(&self, interface: &str) -> io::Result<()> {
        enable(&self.proxy_ndp_path(interface))
    }
}

// Sysctl entries exist or they don't; never create one.
fn enable(path: &Path) -> io::Result<()> {
    OpenOptions::new().write(true).truncate(true).open(path)?.write_all(b"1")
}

// ── Sequence counter ──────────────────────────────────────────────────────────

/// Last-used packet sequence number, kept in a small text file across
/// restarts. Every fragmentation operation takes the next value as its
/// ordering number.
#[derive(Debug)]
pub struct SequenceCounter {
    path: PathBuf,
    value: u16,
    persist_every: u16,
    unsaved: u16,
}

impl SequenceCounter {
    /// Read the counter back from `path`. A missing or unparsable file
    /// starts the counter at zero.
    pub fn recover(path: impl Into<PathBuf>, persist_every: u16) -> Self {
        let path = path.into();
        let value = match std::fs::read_to_string(&path) {
            Ok(text) => text.trim().parse::<u16>().unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "unparsable sequence file, starting at 0");
                0
            }),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no sequence file, starting at 0");
                0
            }
        };

        Self {
            path,
            value,
            persist_every,
            unsaved: 0,
        }
    }

    pub fn current(&self) -> u16 {
        self.value
    }

    /// Move to the next sequence number and return it.
    pub fn advance(&mut self) -> u16 {
        self.value = self.value.wrapping_add(1);
        self.unsaved = self.unsaved.saturating_add(1);
        self.value
    }

    pub fn persist(&mut self) -> io::Result<()> {
        std::fs::write(&self.path, self.value.to_string())?;
        self.unsaved = 0;
        Ok(())
    }

    /// Persist once `persist_every` advances have accumulated. Failures are
    /// logged; the in-memory counter keeps going.
    pub fn persist_if_due(&mut self) {
        if self.persist_every == 0 || self.unsaved < self.persist_every {
            return;
        }
        if let Err(e) = self.persist() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist sequence counter");
        }
    }
}

// ── Routing context ───────────────────────────────────────────────────────────

/// Process-wide routing state produced by bootstrap.
#[derive(Debug)]
pub struct RoutingContext {
    short_address: u16,
    proxy_interface: String,
    tunnel_interface: Option<String>,
    pub sequence: SequenceCounter,
}

impl RoutingContext {
    pub fn short_address(&self) -> u16 {
        self.short_address
    }

    pub fn proxy_interface(&self) -> &str {
        &self.proxy_interface
    }

    pub fn tunnel_interface(&self) -> Option<&str> {
        self.tunnel_interface.as_deref()
    }

    /// Record the tunnel name once the interface exists.
    pub fn attach_tunnel(&mut self, name: &str) {
        self.tunnel_interface = Some(name.to_string());
    }
}

// ── Bootstrap ─────────────────────────────────────────────────────────────────

pub struct Bootstrap {
    controls: KernelControls,
    state: BootstrapState,
}

impl Bootstrap {
    pub fn new(controls: KernelControls) -> Self {
        Self {
            controls,
            state: BootstrapState::Uninitialized,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub fn run(
        &mut self,
        address: Ipv6Addr,
        routing: &RoutingConfig,
    ) -> Result<RoutingContext, BootstrapError> {
        let short_address = short_address(&address);
        tracing::info!(
            %address,
            short_address = %format!("{short_address:#06x}"),
            "routing bootstrap starting"
        );

        if let Err(source) = self.controls.enable_forwarding() {
            let path = self.controls.forwarding_path();
            tracing::error!(path = %path.display(), error = %source, "cannot enable IPv6 forwarding");
            return Err(BootstrapError::ForwardingEnableFailed { path, source });
        }
        self.state = BootstrapState::ForwardingEnabled;
        tracing::info!("IPv6 forwarding enabled");

        match self.controls.enable_proxy_ndp(&routing.proxy_interface) {
            Ok(()) => tracing::info!(interface = %routing.proxy_interface, "ND proxy enabled"),
            Err(e) => tracing::warn!(
                interface = %routing.proxy_interface,
                error = %e,
                "unable to enable IPv6 ND proxy, continuing"
            ),
        }
        self.state = BootstrapState::ProxyConfigured;

        let sequence = SequenceCounter::recover(&routing.sequence_file, routing.persist_every);
        self.state = BootstrapState::SequenceRecovered;
        tracing::info!(sequence = sequence.current(), "sequence counter recovered");

        self.state = BootstrapState::Ready;
        Ok(RoutingContext {
            short_address,
            proxy_interface: routing.proxy_interface.clone(),
            tunnel_interface: None,
            sequence,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
