use log::{debug, info};
use std::net::SocketAddr;

use crate::core::protocol::{FetchResult, Packet, SearchResponse};
use crate::network::Transport;
use crate::storage::HashUtils;
use crate::utils::{P2PError, Result};

/// Data phase of a fetch: a fresh connection straight to the peer the
/// registry named.
pub struct Downloader;

impl Downloader {
    /// Connect to the peer in `location`, ask for `filename` and drain the
    /// connection until the peer closes it.
    pub async fn fetch(location: &SearchResponse, filename: &str) -> Result<FetchResult> {
        if !location.is_found() {
            return Err(P2PError::FileNotFound(filename.to_string()));
        }

        let addr = SocketAddr::V4(location.socket_addr());
        info!(
            "Fetching {:?} from peer {} at {}",
            filename, location.peer_id, addr
        );

        let mut stream = Transport::connect(addr).await?;
        let request = Packet::Fetch {
            filename: filename.to_string(),
        };
        Transport::send_data(&mut stream, &request.encode()).await?;

        let raw = Transport::receive_to_end(&mut stream).await?;
        debug!("Received {} raw byte(s) from {}", raw.len(), addr);

        let result = FetchResult::from_stream(raw);
        if !result.error {
            info!(
                "Fetched {:?}: {} bytes, sha256 {}",
                filename,
                result.bytes.len(),
                HashUtils::hash_data(&result.bytes)
            );
        }
        Ok(result)
    }
}
