//! lowpand — 6LoWPAN IPv6 gateway daemon.
//!
//! Usage: lowpand [proxy_interface]

use std::os::fd::AsRawFd;

use anyhow::{Context, Result};

use lowpan_core::config::GatewayConfig;
use lowpan_core::InterfaceRegistry;
use lowpand::gateway::Gateway;
use lowpand::mesh::MeshLink;
use lowpand::routing::{Bootstrap, KernelControls};
use lowpand::tun::VirtualInterface;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = GatewayConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = GatewayConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GatewayConfig::default()
    });

    if let Some(proxy) = std::env::args().nth(1) {
        config.routing.proxy_interface = proxy;
    }
    config
        .validate()
        .with_context(|| format!("check {}", GatewayConfig::file_path().display()))?;
    tracing::info!(
        address = %config.tunnel.address,
        proxy_interface = %config.routing.proxy_interface,
        "lowpand starting"
    );

    // ── Mesh link ────────────────────────────────────────────────────────────

    // Opened before bootstrap, which changes kernel state.
    let mesh = MeshLink::open(&config.mesh).context("failed to open mesh link")?;

    // ── Routing bootstrap ────────────────────────────────────────────────────

    let mut routing = Bootstrap::new(KernelControls::new(&config.routing.proc_root))
        .run(config.tunnel.address, &config.routing)
        .context("routing bootstrap failed")?;

    // ── Virtual interface ────────────────────────────────────────────────────

    let registry = InterfaceRegistry::new();
    let mut tun = VirtualInterface::open(&config.tunnel.name)
        .context("failed to open virtual interface")?;
    registry.set_descriptor(tun.as_raw_fd())?;
    registry.set_name(tun.name())?;
    routing.attach_tunnel(tun.name());

    tun.configure(config.tunnel.address, config.tunnel.mtu)
        .with_context(|| format!("failed to configure {}", tun.name()))?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_rx = shutdown_tx.subscribe();
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Run ──────────────────────────────────────────────────────────────────

    let mut gateway = Gateway::new(tun, mesh, routing, &config)?;
    let outcome = gateway.run(shutdown_rx).await;
    let (tun, mut routing) = gateway.into_parts();

    if let Err(e) = routing.sequence.persist() {
        tracing::warn!(
            path = %config.routing.sequence_file.display(),
            error = %e,
            "failed to persist sequence counter"
        );
    }
    tun.close(&registry);

    outcome.context("gateway loop failed")?;
    tracing::info!("lowpand stopped");
    Ok(())
}
