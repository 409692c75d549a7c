use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::net::{SocketAddr, SocketAddrV4};

use crate::core::protocol::SearchResponse;
use crate::network::ConnectionId;
use crate::utils::{P2PError, Result};

/// Registry-side record of a joined peer.
///
/// `addr` is a snapshot taken from the socket layer when the peer joined and
/// is never re-resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: u32,
    pub connection: ConnectionId,
    pub addr: SocketAddrV4,
    pub published_files: BTreeSet<String>,
}

impl Peer {
    pub fn new(id: u32, connection: ConnectionId, addr: SocketAddrV4) -> Self {
        Self {
            id,
            connection,
            addr,
            published_files: BTreeSet::new(),
        }
    }

    pub fn search_response(&self) -> SearchResponse {
        SearchResponse::found(self.id, self.addr)
    }
}

/// In-memory index of joined peers and the files they publish.
///
/// When two peers publish the same filename the later one owns it; there
/// is no conflict detection.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<ConnectionId, Peer>,
    file_index: HashMap<String, ConnectionId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a Join from `connection`. `remote_addr` must come from the
    /// socket itself at the time of the Join.
    ///
    /// Joining again on the same connection replaces the earlier record and
    /// withdraws its files.
    pub fn join(
        &mut self,
        connection: ConnectionId,
        peer_id: u32,
        remote_addr: SocketAddr,
    ) -> Result<&Peer> {
        let addr = match remote_addr {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => SocketAddrV4::new(ip, v6.port()),
                None => {
                    return Err(P2PError::AddressUnavailable(format!(
                        "{} is not reachable over IPv4",
                        v6
                    )));
                }
            },
        };

        if let Some(previous) = self.disconnect(connection) {
            warn!(
                "{} joined again as peer {} (was peer {})",
                connection, peer_id, previous.id
            );
        }

        info!("Peer {} joined from {} on {}", peer_id, addr, connection);
        let peer = self
            .peers
            .entry(connection)
            .or_insert_with(|| Peer::new(peer_id, connection, addr));
        Ok(peer)
    }

    /// Add `filenames` to the peer on `connection`, taking ownership of each
    /// name in the index. Returns how many names were published.
    pub fn publish(&mut self, connection: ConnectionId, filenames: &[String]) -> Result<usize> {
        let peer = self
            .peers
            .get_mut(&connection)
            .ok_or(P2PError::NotJoined(connection.as_u64()))?;

        for filename in filenames {
            peer.published_files.insert(filename.clone());
            if let Some(previous) = self.file_index.insert(filename.clone(), connection) {
                if previous != connection {
                    debug!(
                        "{:?} moves from {} to {} (last publish wins)",
                        filename, previous, connection
                    );
                }
            }
        }

        info!("Peer {} published {} file(s)", peer.id, filenames.len());
        Ok(filenames.len())
    }

    pub fn search(&self, filename: &str) -> Option<&Peer> {
        self.file_index
            .get(filename)
            .and_then(|connection| self.peers.get(connection))
    }

    /// Drop the peer on `connection` along with every filename it still
    /// owns. A connection that never joined is a no-op.
    pub fn disconnect(&mut self, connection: ConnectionId) -> Option<Peer> {
        let peer = self.peers.remove(&connection)?;

        let mut withdrawn = 0;
        for filename in &peer.published_files {
            // Names republished by someone else stay with the new owner.
            if self.file_index.get(filename) == Some(&connection) {
                self.file_index.remove(filename);
                withdrawn += 1;
            }
        }

        info!(
            "Peer {} left; withdrew {} of {} file(s)",
            peer.id,
            withdrawn,
            peer.published_files.len()
        );
        Some(peer)
    }

    pub fn peer(&self, connection: ConnectionId) -> Option<&Peer> {
        self.peers.get(&connection)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn file_count(&self) -> usize {
        self.file_index.len()
    }
}
