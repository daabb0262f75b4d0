//! Configuration for the gateway.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LOWPAN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/lowpan/config.toml
//!   3. ~/.config/lowpan/config.toml

use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use crate::wire::{DEFAULT_CHUNK_SIZE, DEFAULT_MTU, MESH_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub tunnel: TunnelConfig,
    pub routing: RoutingConfig,
    pub mesh: MeshConfig,
    pub gateway: LoopConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Requested TUN interface name. Empty = let the kernel pick.
    pub name: String,
    /// Global IPv6 address of the gateway on the mesh.
    pub address: Ipv6Addr,
    /// Link MTU. Must be at least 1280.
    pub mtu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Uplink interface on which neighbor discovery is proxied.
    pub proxy_interface: String,
    /// Root of the per-interface IPv6 sysctl tree.
    pub proc_root: PathBuf,
    /// State file holding the last-used packet sequence number.
    pub sequence_file: PathBuf,
    /// Write the sequence counter back every N advances. 0 = only on shutdown.
    pub persist_every: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// UDP port of the mesh-side socket. 0 = OS-assigned.
    pub port: u16,
    /// Interface on which to join ff02::1. Empty = no multicast.
    pub interface: String,
    /// Unicast address of the mesh bridge, e.g. "[fd00::2]:9002".
    /// Empty = send chunks to ff02::1 on `interface`.
    pub peer: String,
    /// Fragment payload size in bytes.
    pub chunk_size: usize,
    /// Delay between consecutive chunk sends, in microseconds.
    pub pacing_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Bounded readiness wait used for statistics and stale-assembly
    /// expiry. 0 = block without timeout.
    pub idle_timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x64),
            mtu: DEFAULT_MTU,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            proxy_interface: "eth0".to_string(),
            proc_root: PathBuf::from("/proc/sys/net/ipv6/conf"),
            sequence_file: PathBuf::from("/var/run/lowpand.seq"),
            persist_every: 16,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            port: MESH_PORT,
            interface: String::new(),
            peer: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            pacing_us: 0,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
        }
    }
}

impl MeshConfig {
    /// Unicast peer, when one is configured. `None` means chunks go to
    /// ff02::1 on `interface`, so one of the two has to be set.
    pub fn peer_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if !self.peer.is_empty() {
            return self.peer.parse().map(Some).map_err(|e| ConfigError::Invalid {
                key: "mesh.peer",
                reason: format!("{:?}: {e}", self.peer),
            });
        }
        if self.interface.is_empty() {
            return Err(ConfigError::Invalid {
                key: "mesh",
                reason: "set mesh.peer or mesh.interface".to_string(),
            });
        }
        Ok(None)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("lowpan")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            GatewayConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LOWPAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&GatewayConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the daemon cannot start with. Run before touching
    /// any kernel state.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel.mtu < DEFAULT_MTU {
            return Err(ConfigError::Invalid {
                key: "tunnel.mtu",
                reason: format!("{} is below the IPv6 minimum of {DEFAULT_MTU}", self.tunnel.mtu),
            });
        }
        if self.mesh.chunk_size == 0 || self.mesh.chunk_size > u16::MAX as usize {
            return Err(ConfigError::Invalid {
                key: "mesh.chunk_size",
                reason: format!("{} is outside 1..={}", self.mesh.chunk_size, u16::MAX),
            });
        }
        self.mesh.peer_addr()?;
        Ok(())
    }

    /// Apply LOWPAN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("LOWPAN_TUNNEL__NAME") {
            self.tunnel.name = v;
        }
        if let Some(v) = var("LOWPAN_TUNNEL__ADDRESS") {
            if let Ok(a) = v.parse() {
                self.tunnel.address = a;
            }
        }
        if let Some(v) = var("LOWPAN_TUNNEL__MTU") {
            if let Ok(m) = v.parse() {
                self.tunnel.mtu = m;
            }
        }
        if let Some(v) = var("LOWPAN_ROUTING__PROXY_INTERFACE") {
            self.routing.proxy_interface = v;
        }
        if let Some(v) = var("LOWPAN_MESH__PORT") {
            if let Ok(p) = v.parse() {
                self.mesh.port = p;
            }
        }
        if let Some(v) = var("LOWPAN_MESH__INTERFACE") {
            self.mesh.interface = v;
        }
        if let Some(v) = var("LOWPAN_MESH__PEER") {
            self.mesh.peer = v;
        }
        if let Some(v) = var("LOWPAN_MESH__CHUNK_SIZE") {
            if let Ok(s) = v.parse() {
                self.mesh.chunk_size = s;
            }
        }
    }
}
