//! lowpan-core — wire format, fragmentation, and shared state for the
//! 6LoWPAN gateway. Nothing in this crate performs network I/O.

pub mod address;
pub mod config;
pub mod fragment;
pub mod message;
pub mod reassembly;
pub mod registry;
pub mod wire;

pub use fragment::{checksum, rebuild, split, Chunk, FragmentError};
pub use message::{ExtensionHeader, Ipv6Header, Message};
pub use reassembly::{Progress, Reassembler};
pub use registry::{InterfaceRegistry, RegistryError};
