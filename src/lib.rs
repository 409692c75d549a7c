//! Mini Registry
//!
//! A central registry indexes which peer publishes which file; peers look
//! files up over a long-lived control connection and then fetch the bytes
//! directly from each other.

pub mod core;
pub mod network;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export main types
pub use crate::core::{ClientConfig, P2PClient, Packet, RegistryServer, SearchResponse, ServerConfig};
pub use crate::network::ConnectionMultiplexer;
pub use crate::storage::FileManager;
pub use crate::utils::{
    error::{P2PError, Result},
    setup_logging,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
