pub mod client;
pub mod config;
pub mod peer;
pub mod protocol;
pub mod registry;

pub use client::P2PClient;
pub use config::{ClientConfig, ServerConfig};
pub use peer::{Peer, PeerRegistry};
pub use protocol::{FetchResult, Packet, SearchResponse, Tag};
pub use registry::RegistryServer;
